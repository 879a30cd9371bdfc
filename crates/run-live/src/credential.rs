//! Credential resolution for socket handshakes.
//!
//! Sockets authenticate through a query parameter, resolved asynchronously
//! right before the socket is constructed.

use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use run_query::Credential;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credential(&self) -> Result<Credential>;
}

/// Async source of short-lived bearer tokens. `Ok(None)` means signed out.
#[async_trait]
pub trait TokenGetter: Send + Sync {
    async fn token(&self) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct StaticCredential(Credential);

impl StaticCredential {
    #[must_use]
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn credential(&self) -> Result<Credential> {
        Ok(self.0.clone())
    }
}

/// Token getter first, static API key second.
#[derive(Clone, Default)]
pub struct FallbackCredentials {
    getter: Option<Arc<dyn TokenGetter>>,
    api_key: Option<String>,
}

impl FallbackCredentials {
    #[must_use]
    pub fn new(getter: Option<Arc<dyn TokenGetter>>, api_key: Option<String>) -> Self {
        Self {
            getter,
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
        }
    }
}

impl fmt::Debug for FallbackCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackCredentials")
            .field("has_token_getter", &self.getter.is_some())
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

#[async_trait]
impl CredentialSource for FallbackCredentials {
    async fn credential(&self) -> Result<Credential> {
        if let Some(getter) = &self.getter {
            match getter.token().await {
                Ok(Some(token)) if !token.trim().is_empty() => {
                    return Ok(Credential::Bearer(token.trim().to_string()));
                }
                Ok(_) => {}
                Err(error) => warn!("token getter failed, trying api key: {}", error),
            }
        }
        self.api_key
            .clone()
            .map(Credential::ApiKey)
            .ok_or_else(|| ChannelError::Credential("no token or api key available".to_string()))
    }
}

/// Query parameter carrying `credential` on a socket URL.
#[must_use]
pub fn credential_query_pair(credential: &Credential) -> (&'static str, String) {
    match credential {
        Credential::Bearer(token) => ("token", format!("Bearer {token}")),
        Credential::ApiKey(key) => ("apikey", key.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedToken(Result<Option<String>>);

    #[async_trait]
    impl TokenGetter for FixedToken {
        async fn token(&self) -> Result<Option<String>> {
            match &self.0 {
                Ok(token) => Ok(token.clone()),
                Err(_) => Err(ChannelError::Credential("expired".to_string())),
            }
        }
    }

    fn with_getter(token: Result<Option<String>>, api_key: Option<&str>) -> FallbackCredentials {
        FallbackCredentials::new(
            Some(Arc::new(FixedToken(token))),
            api_key.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn token_takes_precedence_over_api_key() {
        let source = with_getter(Ok(Some("tok".to_string())), Some("key"));
        let credential = source.credential().await.expect("credential");
        assert_eq!(credential, Credential::Bearer("tok".to_string()));
    }

    #[tokio::test]
    async fn falls_back_to_api_key() {
        for token in [
            Ok(None),
            Ok(Some("  ".to_string())),
            Err(ChannelError::NotConnected),
        ] {
            let source = with_getter(token, Some("key"));
            let credential = source.credential().await.expect("credential");
            assert_eq!(credential, Credential::ApiKey("key".to_string()));
        }
    }

    #[tokio::test]
    async fn nothing_available_is_an_error() {
        let source = with_getter(Ok(None), Some(" "));
        assert!(matches!(
            source.credential().await,
            Err(ChannelError::Credential(_))
        ));
        assert!(
            FallbackCredentials::default()
                .credential()
                .await
                .is_err()
        );
    }

    #[test]
    fn query_pair_matches_credential_kind() {
        assert_eq!(
            credential_query_pair(&Credential::Bearer("abc".to_string())),
            ("token", "Bearer abc".to_string())
        );
        assert_eq!(
            credential_query_pair(&Credential::ApiKey("sk".to_string())),
            ("apikey", "sk".to_string())
        );
    }
}
