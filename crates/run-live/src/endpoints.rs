//! Socket endpoint construction.

use crate::credential::credential_query_pair;
use crate::error::{ChannelError, Result};
use run_query::{Credential, RunKind, RunRef};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    /// Socket base such as `wss://api.example.com/api/v1`.
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ChannelError::InvalidUrl("empty socket base url".to_string()));
        }
        let base = Url::parse(trimmed)?;
        if base.scheme() != "ws" && base.scheme() != "wss" {
            return Err(ChannelError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                base.scheme()
            )));
        }
        Ok(Self { base })
    }

    /// Derive the socket base from an HTTP API base (`http` -> `ws`, `https` -> `wss`).
    pub fn from_api_base(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let derived = if let Some(rest) = trimmed.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ChannelError::InvalidUrl(format!(
                "API base must use http:// or https://, got: {trimmed}"
            )));
        };
        Self::new(&derived)
    }

    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// One-way status and screenshot stream.
    pub fn frame_stream(&self, run: &RunRef, credential: &Credential) -> Result<Url> {
        let collection = match run.kind {
            RunKind::WorkflowRun => "workflow_runs",
            RunKind::Task => "tasks",
        };
        self.build(&["stream", collection, &run.id], &[], credential)
    }

    /// Control-intent command channel; `client_id` is unique per connection.
    pub fn command(&self, run: &RunRef, client_id: Uuid, credential: &Credential) -> Result<Url> {
        self.build(
            &["stream", "commands", kind_segment(run.kind), &run.id],
            &[("client_id", client_id.to_string())],
            credential,
        )
    }

    /// Interactive frame-buffer channel.
    pub fn frame_buffer(&self, run: &RunRef, credential: &Credential) -> Result<Url> {
        self.build(
            &["stream", "vnc", kind_segment(run.kind), &run.id],
            &[],
            credential,
        )
    }

    fn build(
        &self,
        segments: &[&str],
        params: &[(&str, String)],
        credential: &Credential,
    ) -> Result<Url> {
        if segments.iter().any(|segment| segment.trim().is_empty()) {
            return Err(ChannelError::InvalidUrl("empty path segment".to_string()));
        }
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ChannelError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        let (key, value) = credential_query_pair(credential);
        {
            let mut query = url.query_pairs_mut();
            for (name, param) in params {
                query.append_pair(name, param);
            }
            query.append_pair(key, &value);
        }
        Ok(url)
    }
}

fn kind_segment(kind: RunKind) -> &'static str {
    match kind {
        RunKind::WorkflowRun => "workflow_run",
        RunKind::Task => "task",
    }
}
