use std::{env, time::Duration};

use run_live::Endpoints;
use run_query::{Credential, DEFAULT_TIMEOUT_MS};
use thiserror::Error;

pub const ENV_API_BASE_URL: &str = "RUN_WATCH_API_BASE_URL";
pub const ENV_WSS_BASE_URL: &str = "RUN_WATCH_WSS_BASE_URL";
pub const ENV_API_KEY: &str = "RUN_WATCH_API_KEY";
pub const ENV_BEARER_TOKEN: &str = "RUN_WATCH_BEARER_TOKEN";
pub const ENV_POLL_INTERVAL_MS: &str = "RUN_WATCH_POLL_INTERVAL_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "RUN_WATCH_REQUEST_TIMEOUT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "RUN_WATCH_CONNECT_TIMEOUT_MS";

const MIN_REQUEST_TIMEOUT_MS: u64 = 250;

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub wss_base_url: Option<String>,
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout_ms: u64,
    pub connect_timeout: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid RUN_WATCH_API_BASE_URL: {0}")]
    InvalidApiBaseUrl(String),
    #[error("invalid RUN_WATCH_WSS_BASE_URL: {0}")]
    InvalidWssBaseUrl(String),
    #[error("invalid RUN_WATCH_POLL_INTERVAL_MS: {0}")]
    InvalidPollIntervalMs(String),
    #[error("invalid RUN_WATCH_REQUEST_TIMEOUT_MS: {0}")]
    InvalidRequestTimeoutMs(String),
    #[error("invalid RUN_WATCH_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeoutMs(String),
    #[error("missing credential: set RUN_WATCH_BEARER_TOKEN or RUN_WATCH_API_KEY")]
    MissingCredential,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_base_url = non_empty(ENV_API_BASE_URL)
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string())
            .trim_end_matches('/')
            .to_string();
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidApiBaseUrl(api_base_url));
        }
        let wss_base_url = non_empty(ENV_WSS_BASE_URL);

        let api_key = non_empty(ENV_API_KEY);
        let bearer_token = non_empty(ENV_BEARER_TOKEN);
        if api_key.is_none() && bearer_token.is_none() {
            return Err(ConfigError::MissingCredential);
        }

        let poll_interval_ms = non_empty(ENV_POLL_INTERVAL_MS)
            .unwrap_or_else(|| "5000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidPollIntervalMs(error.to_string()))?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollIntervalMs(
                "must be greater than zero".to_string(),
            ));
        }
        let request_timeout_ms = non_empty(ENV_REQUEST_TIMEOUT_MS)
            .unwrap_or_else(|| DEFAULT_TIMEOUT_MS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidRequestTimeoutMs(error.to_string()))?
            .max(MIN_REQUEST_TIMEOUT_MS);
        let connect_timeout_ms = non_empty(ENV_CONNECT_TIMEOUT_MS)
            .unwrap_or_else(|| "10000".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidConnectTimeoutMs(error.to_string()))?;

        Ok(Self {
            api_base_url,
            wss_base_url,
            api_key,
            bearer_token,
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout_ms,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        })
    }

    /// Credential for HTTP queries; a bearer token wins over the API key.
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        self.bearer_token
            .clone()
            .map(Credential::Bearer)
            .or_else(|| self.api_key.clone().map(Credential::ApiKey))
            .ok_or(ConfigError::MissingCredential)
    }

    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        match &self.wss_base_url {
            Some(raw) => {
                Endpoints::new(raw).map_err(|error| ConfigError::InvalidWssBaseUrl(error.to_string()))
            }
            None => Endpoints::from_api_base(&self.api_base_url)
                .map_err(|error| ConfigError::InvalidApiBaseUrl(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(values: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values: HashMap<&str, &str> = values.iter().copied().collect();
        Config::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_apply_with_only_a_credential() {
        let config = config_from(&[(ENV_API_KEY, "sk-local")]).expect("config");
        assert_eq!(config.api_base_url, "http://127.0.0.1:8000");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout_ms, 1_500);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(
            config.endpoints().expect("endpoints").base().as_str(),
            "ws://127.0.0.1:8000/"
        );
        assert_eq!(
            config.credential(),
            Ok(Credential::ApiKey("sk-local".to_string()))
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            (ENV_API_BASE_URL, "https://api.example.com/api/v1/"),
            (ENV_BEARER_TOKEN, "tok"),
            (ENV_API_KEY, "sk"),
            (ENV_POLL_INTERVAL_MS, "750"),
            (ENV_REQUEST_TIMEOUT_MS, "10"),
            (ENV_CONNECT_TIMEOUT_MS, "2500"),
        ])
        .expect("config");
        assert_eq!(config.api_base_url, "https://api.example.com/api/v1");
        assert_eq!(config.poll_interval, Duration::from_millis(750));
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.connect_timeout, Duration::from_millis(2_500));
        assert_eq!(config.credential(), Ok(Credential::Bearer("tok".to_string())));
        assert_eq!(
            config.endpoints().expect("endpoints").base().as_str(),
            "wss://api.example.com/api/v1"
        );
    }

    #[test]
    fn explicit_socket_base_wins() {
        let config = config_from(&[
            (ENV_API_KEY, "sk"),
            (ENV_WSS_BASE_URL, "wss://stream.example.com"),
        ])
        .expect("config");
        assert_eq!(
            config.endpoints().expect("endpoints").base().host_str(),
            Some("stream.example.com")
        );

        let broken = config_from(&[(ENV_API_KEY, "sk"), (ENV_WSS_BASE_URL, "https://x")])
            .expect("config");
        assert!(matches!(
            broken.endpoints(),
            Err(ConfigError::InvalidWssBaseUrl(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_eq!(
            config_from(&[]).expect_err("no credential"),
            ConfigError::MissingCredential
        );
        assert_eq!(
            config_from(&[(ENV_API_KEY, "  ")]).expect_err("blank credential"),
            ConfigError::MissingCredential
        );
        assert!(matches!(
            config_from(&[(ENV_API_KEY, "sk"), (ENV_POLL_INTERVAL_MS, "soon")]),
            Err(ConfigError::InvalidPollIntervalMs(_))
        ));
        assert!(matches!(
            config_from(&[(ENV_API_KEY, "sk"), (ENV_POLL_INTERVAL_MS, "0")]),
            Err(ConfigError::InvalidPollIntervalMs(_))
        ));
        assert!(matches!(
            config_from(&[(ENV_API_KEY, "sk"), (ENV_API_BASE_URL, "api.example.com")]),
            Err(ConfigError::InvalidApiBaseUrl(_))
        ));
    }
}
