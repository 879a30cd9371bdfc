use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use run_timeline::{RunStatus, TimelineItem, decode_timeline};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

/// What kind of run an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    WorkflowRun,
    Task,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunRef {
    pub kind: RunKind,
    pub id: String,
}

impl RunRef {
    #[must_use]
    pub fn workflow_run(id: impl Into<String>) -> Self {
        Self {
            kind: RunKind::WorkflowRun,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn task(id: impl Into<String>) -> Self {
        Self {
            kind: RunKind::Task,
            id: id.into(),
        }
    }
}

impl fmt::Display for RunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Bearer token or static API key, used for HTTP headers and socket query parameters.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Credential::Bearer(<redacted>)"),
            Self::ApiKey(_) => f.write_str("Credential::ApiKey(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunApiClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl RunApiClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunApiClient {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    credential: Option<Credential>,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum RunQueryError {
    #[error("run_query_base_url_missing")]
    BaseUrlMissing,
    #[error("run_query_invalid_path")]
    InvalidPath,
    #[error("run_query_request_failed:{message}")]
    Request { message: String },
    #[error("run_query_read_failed:{message}")]
    Read { message: String },
    #[error("run_query_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("run_query_json_decode_failed:{message}")]
    Decode { message: String },
}

/// Run status as reported by the run registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(alias = "workflow_run_id", alias = "task_id")]
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunApiClient {
    pub fn new(config: RunApiClientConfig) -> Result<Self, RunQueryError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            credential: None,
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn run_path(run: &RunRef) -> String {
        match run.kind {
            RunKind::WorkflowRun => format!("/api/v1/workflows/runs/{}", run.id),
            RunKind::Task => format!("/api/v1/tasks/{}", run.id),
        }
    }

    /// Task runs have no block tree of their own.
    #[must_use]
    pub fn timeline_path(run: &RunRef) -> Option<String> {
        match run.kind {
            RunKind::WorkflowRun => Some(format!("/api/v1/workflows/runs/{}/timeline", run.id)),
            RunKind::Task => None,
        }
    }

    pub async fn get_run(&self, run: &RunRef) -> Result<RunRecord, RunQueryError> {
        self.get_json(Self::run_path(run).as_str()).await
    }

    pub async fn get_timeline(&self, run: &RunRef) -> Result<Vec<TimelineItem>, RunQueryError> {
        let Some(path) = Self::timeline_path(run) else {
            return Ok(Vec::new());
        };
        let value: serde_json::Value = self.get_json(path.as_str()).await?;
        Ok(decode_timeline(value))
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, RunQueryError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send_get(path).await?;
        decode_json_response(response).await
    }

    async fn send_get(&self, path: &str) -> Result<reqwest::Response, RunQueryError> {
        let url = self.endpoint(path).ok_or(RunQueryError::InvalidPath)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let mut request = self
                .http
                .get(url.as_str())
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);
            request = match &self.credential {
                Some(Credential::Bearer(token)) => request.bearer_auth(token),
                Some(Credential::ApiKey(key)) => request.header("x-api-key", key),
                None => request,
            };

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    debug!("run query attempt {} for {} failed: {}", attempt + 1, path, error);
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(RunQueryError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> RunQueryError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    RunQueryError::Http { status, body }
}

fn normalize_base_url(base_url: &str) -> Result<String, RunQueryError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(RunQueryError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, RunQueryError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| RunQueryError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| RunQueryError::Decode {
        message: error.to_string(),
    })
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_builder_normalizes_paths() {
        let client = RunApiClient::new(RunApiClientConfig::new("https://api.example.com/"))
            .expect("run client");

        assert_eq!(
            client.endpoint("/api/v1/tasks/tsk_1"),
            Some("https://api.example.com/api/v1/tasks/tsk_1".to_string())
        );
        assert_eq!(
            client.endpoint("api/v1/tasks/tsk_1"),
            Some("https://api.example.com/api/v1/tasks/tsk_1".to_string())
        );
        assert_eq!(client.endpoint(""), None);
    }

    #[test]
    fn path_helpers_are_deterministic() {
        let workflow_run = RunRef::workflow_run("wr_123");
        let task = RunRef::task("tsk_9");
        assert_eq!(
            RunApiClient::run_path(&workflow_run),
            "/api/v1/workflows/runs/wr_123"
        );
        assert_eq!(RunApiClient::run_path(&task), "/api/v1/tasks/tsk_9");
        assert_eq!(
            RunApiClient::timeline_path(&workflow_run),
            Some("/api/v1/workflows/runs/wr_123/timeline".to_string())
        );
        assert_eq!(RunApiClient::timeline_path(&task), None);
    }

    #[test]
    fn run_record_accepts_either_id_field() {
        let workflow: RunRecord = serde_json::from_str(
            r#"{"workflow_run_id":"wr_1","status":"running","workflow_id":"w_1"}"#,
        )
        .expect("workflow run record");
        assert_eq!(workflow.run_id, "wr_1");
        assert_eq!(workflow.status, RunStatus::Running);
        assert!(workflow.extra.contains_key("workflow_id"));

        let task: RunRecord =
            serde_json::from_str(r#"{"task_id":"tsk_1","status":"timed_out"}"#)
                .expect("task record");
        assert_eq!(task.status, RunStatus::TimedOut);
    }

    #[test]
    fn http_error_mapping_preserves_shape() {
        let error = format_http_error(StatusCode::BAD_GATEWAY, b" gateway failed ");
        assert_eq!(
            error.to_string(),
            "run_query_http_502 Bad Gateway:gateway failed"
        );

        let empty_body = format_http_error(StatusCode::SERVICE_UNAVAILABLE, b" ");
        assert_eq!(
            empty_body.to_string(),
            "run_query_http_503 Service Unavailable:<empty>"
        );
    }

    #[test]
    fn credential_debug_is_redacted() {
        let rendered = format!("{:?}", Credential::ApiKey("sk-secret".to_string()));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn base_url_missing_is_rejected() {
        let result = RunApiClient::new(RunApiClientConfig::new("   "));
        assert!(matches!(result, Err(RunQueryError::BaseUrlMissing)));
    }
}
