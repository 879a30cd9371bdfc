//! One-way status and screenshot stream for a live run.
//!
//! At most one socket is open per channel. The socket's identity is the run
//! plus the credential source; when either changes (or streaming is no
//! longer wanted) the old socket is closed before a new one is opened.

use crate::cache::{QueryInvalidator, QueryKey};
use crate::credential::CredentialSource;
use crate::endpoints::Endpoints;
use crate::error::{ChannelError, Result};
use crate::notify::{Notification, Notifier};
use crate::transport::{EventSink, Transport, TransportEvent, redacted};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use run_query::RunRef;
use run_timeline::RunStatus;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_FORMAT: &str = "png";
const MAX_FORMAT_LEN: usize = 8;

/// Most recent screenshot received on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub format: String,
    pub received_at: DateTime<Utc>,
}

impl Frame {
    /// File extension for this frame: `format` when it is a short
    /// alphanumeric token, `png` otherwise.
    #[must_use]
    pub fn extension(&self) -> &str {
        if is_plain_format(&self.format) {
            &self.format
        } else {
            DEFAULT_FORMAT
        }
    }
}

fn is_plain_format(format: &str) -> bool {
    !format.is_empty()
        && format.len() <= MAX_FORMAT_LEN
        && format.bytes().all(|byte| byte.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Connecting,
    /// Credential resolution failed; no socket was constructed.
    NotStarted,
    Open,
    /// Socket dropped or failed to open without a terminal status.
    Closed,
    /// Server reported a terminal status and the socket was closed.
    Finished(RunStatus),
}

/// What one inbound message changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamUpdate {
    pub frame: Option<Frame>,
    pub finished: Option<RunStatus>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    screenshot: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

/// Decode one stream message. Errors leave the caller's current frame as it is.
pub fn parse_stream_message(text: &str) -> Result<StreamUpdate> {
    let message: StreamMessage = serde_json::from_str(text)?;

    let finished = message
        .status
        .as_deref()
        .and_then(|status| status.parse::<RunStatus>().ok())
        .filter(|status| status.is_finalized());

    let frame = match message.screenshot.as_deref().map(str::trim) {
        Some(encoded) if !encoded.is_empty() => {
            let data = STANDARD
                .decode(encoded)
                .map_err(|error| ChannelError::MalformedMessage(error.to_string()))?;
            let format = message
                .format
                .map(|format| format.trim().to_ascii_lowercase())
                .filter(|format| is_plain_format(format))
                .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
            Some(Frame {
                data,
                format,
                received_at: Utc::now(),
            })
        }
        _ => None,
    };

    Ok(StreamUpdate { frame, finished })
}

/// Inputs the stream's lifetime depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInputs {
    pub run: RunRef,
    pub finalized: bool,
    /// Keep streaming after finalization.
    pub always_show: bool,
}

impl StreamInputs {
    #[must_use]
    pub fn should_stream(&self) -> bool {
        self.always_show || !self.finalized
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamKey {
    run: RunRef,
    credentials_epoch: u64,
}

struct ActiveStream {
    key: StreamKey,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct FrameStreamChannel {
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    credentials_epoch: u64,
    invalidator: Arc<dyn QueryInvalidator>,
    notifier: Arc<dyn Notifier>,
    frame: Arc<watch::Sender<Option<Arc<Frame>>>>,
    phase: Arc<watch::Sender<StreamPhase>>,
    active: Option<ActiveStream>,
}

impl FrameStreamChannel {
    #[must_use]
    pub fn new(
        endpoints: Endpoints,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        invalidator: Arc<dyn QueryInvalidator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (frame, _) = watch::channel(None);
        let (phase, _) = watch::channel(StreamPhase::Idle);
        Self {
            endpoints,
            transport,
            credentials,
            credentials_epoch: 0,
            invalidator,
            notifier,
            frame: Arc::new(frame),
            phase: Arc::new(phase),
            active: None,
        }
    }

    /// Replace the credential source. Takes effect on the next [`Self::sync`],
    /// which reopens any open socket.
    pub fn set_credentials(&mut self, credentials: Arc<dyn CredentialSource>) {
        self.credentials = credentials;
        self.credentials_epoch += 1;
    }

    #[must_use]
    pub fn frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frame.subscribe()
    }

    #[must_use]
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.frame.borrow().clone()
    }

    #[must_use]
    pub fn phases(&self) -> watch::Receiver<StreamPhase> {
        self.phase.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> StreamPhase {
        *self.phase.borrow()
    }

    /// Reconcile the socket with `inputs`; `None` means nobody is watching.
    ///
    /// Unchanged inputs keep the current socket. A socket that dropped without
    /// a terminal status is reopened on the next call that still wants it.
    pub async fn sync(&mut self, inputs: Option<&StreamInputs>) {
        let desired = inputs
            .filter(|inputs| inputs.should_stream())
            .map(|inputs| StreamKey {
                run: inputs.run.clone(),
                credentials_epoch: self.credentials_epoch,
            });

        if let Some(active) = &self.active
            && desired.as_ref() == Some(&active.key)
        {
            // Closed is only published by a task that is about to exit.
            if self.phase() != StreamPhase::Closed {
                return;
            }
            debug!("reopening dropped frame stream for {}", active.key.run);
        }

        let previous_run = self.stop_active().await;
        if let Some(key) = desired {
            if previous_run.as_ref() != Some(&key.run) {
                self.frame.send_replace(None);
            }
            self.start(key);
        }
    }

    /// Close the socket, if any. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.stop_active().await;
    }

    fn start(&mut self, key: StreamKey) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = StreamTask {
            run: key.run.clone(),
            endpoints: self.endpoints.clone(),
            transport: Arc::clone(&self.transport),
            credentials: Arc::clone(&self.credentials),
            invalidator: Arc::clone(&self.invalidator),
            notifier: Arc::clone(&self.notifier),
            frame: Arc::clone(&self.frame),
            phase: Arc::clone(&self.phase),
        };
        self.phase.send_replace(StreamPhase::Connecting);
        let handle = tokio::spawn(task.run(stop_rx));
        self.active = Some(ActiveStream {
            key,
            stop: Some(stop_tx),
            task: handle,
        });
    }

    async fn stop_active(&mut self) -> Option<RunRef> {
        let mut active = self.active.take()?;
        if let Some(stop) = active.stop.take() {
            // The task may already have ended on its own.
            let _ = stop.send(());
        }
        if timeout(STOP_GRACE, &mut active.task).await.is_err() {
            warn!("frame stream for {} did not stop in time", active.key.run);
            active.task.abort();
        }
        Some(active.key.run)
    }
}

impl Drop for FrameStreamChannel {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take()
            && let Some(stop) = active.stop.take()
        {
            let _ = stop.send(());
        }
    }
}

struct StreamTask {
    run: RunRef,
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    invalidator: Arc<dyn QueryInvalidator>,
    notifier: Arc<dyn Notifier>,
    frame: Arc<watch::Sender<Option<Arc<Frame>>>>,
    phase: Arc<watch::Sender<StreamPhase>>,
}

impl StreamTask {
    async fn run(self, mut stop: oneshot::Receiver<()>) {
        let credential = tokio::select! {
            _ = &mut stop => {
                self.phase.send_replace(StreamPhase::Idle);
                return;
            }
            result = self.credentials.credential() => match result {
                Ok(credential) => credential,
                Err(error) => {
                    warn!("frame stream for {} not started: {}", self.run, error);
                    self.phase.send_replace(StreamPhase::NotStarted);
                    return;
                }
            }
        };

        let url = match self.endpoints.frame_stream(&self.run, &credential) {
            Ok(url) => url,
            Err(error) => {
                warn!("frame stream for {} not started: {}", self.run, error);
                self.phase.send_replace(StreamPhase::NotStarted);
                return;
            }
        };
        let label = redacted(&url);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sink: EventSink = Arc::new(move |event| {
            let _ = events_tx.send(event);
        });

        let socket = tokio::select! {
            _ = &mut stop => {
                self.phase.send_replace(StreamPhase::Idle);
                return;
            }
            result = self.transport.open(url, sink) => match result {
                Ok(socket) => socket,
                Err(error) => {
                    warn!("frame stream connect to {} failed: {}", label, error);
                    self.phase.send_replace(StreamPhase::Closed);
                    return;
                }
            }
        };

        loop {
            tokio::select! {
                _ = &mut stop => {
                    socket.close().await;
                    self.phase.send_replace(StreamPhase::Idle);
                    return;
                }
                event = events_rx.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        debug!("frame stream connected to {}", label);
                        self.phase.send_replace(StreamPhase::Open);
                    }
                    Some(TransportEvent::Text(text)) => {
                        if let Some(status) = self.apply(&text) {
                            socket.close().await;
                            self.finish(status);
                            return;
                        }
                    }
                    Some(TransportEvent::Binary(payload)) => {
                        debug!("ignoring {} byte binary frame on {}", payload.len(), label);
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        info!("frame stream for {} closed", self.run);
                        self.phase.send_replace(StreamPhase::Closed);
                        return;
                    }
                }
            }
        }
    }

    /// Apply a message; returns the terminal status if the run has ended.
    fn apply(&self, text: &str) -> Option<RunStatus> {
        match parse_stream_message(text) {
            Ok(update) => {
                if let Some(frame) = update.frame {
                    self.frame.send_replace(Some(Arc::new(frame)));
                }
                update.finished
            }
            Err(error) => {
                warn!("dropping malformed stream message for {}: {}", self.run, error);
                None
            }
        }
    }

    fn finish(&self, status: RunStatus) {
        info!("run {} reached {} on the frame stream", self.run, status);
        self.invalidator
            .invalidate_all(&QueryKey::run_state(&self.run.id));
        if let Some(notification) = Notification::for_outcome(&self.run.id, status) {
            self.notifier.notify(notification);
        }
        self.phase.send_replace(StreamPhase::Finished(status));
    }
}
