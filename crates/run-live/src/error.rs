//! Channel error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed stream message: {0}")]
    MalformedMessage(String),

    #[error("credential unavailable: {0}")]
    Credential(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("run query failed: {0}")]
    Query(#[from] run_query::RunQueryError),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
