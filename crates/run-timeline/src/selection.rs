//! The `active` URL parameter: the only persisted state of run observation.

use url::Url;

pub const ACTIVE_PARAM: &str = "active";

/// Read the persisted target id. A blank value counts as absent.
#[must_use]
pub fn active_target(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == ACTIVE_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Return `url` with the `active` parameter replaced (or removed when `target`
/// is `None`), keeping every other parameter in order.
#[must_use]
pub fn with_active_target(url: &Url, target: Option<&str>) -> Url {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != ACTIVE_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if let Some(target) = target {
        pairs.push((ACTIVE_PARAM.to_string(), target.to_string()));
    }

    let mut updated = url.clone();
    if pairs.is_empty() {
        updated.set_query(None);
    } else {
        updated.query_pairs_mut().clear().extend_pairs(pairs);
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Url {
        Url::parse(raw).expect("valid url")
    }

    #[test]
    fn reads_active_parameter() {
        let url = parse("https://app.example.com/runs/wr_1?tab=overview&active=a_42");
        assert_eq!(active_target(&url), Some("a_42".to_string()));
        assert_eq!(active_target(&parse("https://app.example.com/runs/wr_1")), None);
        assert_eq!(
            active_target(&parse("https://app.example.com/runs/wr_1?active=")),
            None
        );
    }

    #[test]
    fn writing_replaces_and_preserves_other_parameters() {
        let url = parse("https://app.example.com/runs/wr_1?active=old&tab=overview");
        let updated = with_active_target(&url, Some("stream"));
        assert_eq!(
            updated.as_str(),
            "https://app.example.com/runs/wr_1?tab=overview&active=stream"
        );
        assert_eq!(active_target(&updated), Some("stream".to_string()));
    }

    #[test]
    fn clearing_drops_empty_query() {
        let url = parse("https://app.example.com/runs/wr_1?active=a_1");
        let cleared = with_active_target(&url, None);
        assert_eq!(cleared.as_str(), "https://app.example.com/runs/wr_1");
    }
}
