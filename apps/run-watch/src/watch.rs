use std::future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use run_live::{
    ControlEvent, ControlInputs, CredentialSource, FallbackCredentials, Frame, FrameStreamChannel,
    IntentOutcome, Notifier, QueryCache, RemoteControlChannel, RunPoller, RunSnapshot,
    StreamInputs, TokenGetter, TracingNotifier, Transport, WsConfig, WsTransport,
};
use run_query::{DEFAULT_REQUEST_ATTEMPTS, RunApiClient, RunApiClientConfig, RunRef};
use run_timeline::ActiveSelection;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{Config, ENV_BEARER_TOKEN};

#[derive(Debug)]
pub struct WatchOptions {
    pub run: RunRef,
    pub active: Option<String>,
    pub always_stream: bool,
    pub take_control: bool,
    pub output_dir: Option<PathBuf>,
}

/// Re-reads the bearer token on every socket open so a rotated token is picked up.
struct EnvToken;

#[async_trait]
impl TokenGetter for EnvToken {
    async fn token(&self) -> run_live::Result<Option<String>> {
        Ok(std::env::var(ENV_BEARER_TOKEN)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }
}

pub async fn run(config: Config, options: WatchOptions) -> Result<()> {
    let client = RunApiClient::new(RunApiClientConfig {
        base_url: config.api_base_url.clone(),
        timeout_ms: config.request_timeout_ms,
        request_attempts: DEFAULT_REQUEST_ATTEMPTS,
    })
    .context("build run query client")?
    .with_credential(config.credential()?);
    let endpoints = config.endpoints()?;
    let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(WsConfig {
        connect_timeout: config.connect_timeout,
    }));
    let credentials: Arc<dyn CredentialSource> = Arc::new(FallbackCredentials::new(
        Some(Arc::new(EnvToken)),
        config.api_key.clone(),
    ));
    let cache = Arc::new(QueryCache::new());
    let (notify_tx, mut notifications) = mpsc::unbounded_channel();

    let poller = RunPoller::new(Arc::new(client), options.run.clone(), config.poll_interval)
        .with_cache(Arc::clone(&cache));
    let mut snapshots = poller.subscribe();
    let poll_task = poller.spawn();

    let mut stream = FrameStreamChannel::new(
        endpoints.clone(),
        Arc::clone(&transport),
        Arc::clone(&credentials),
        Arc::clone(&cache) as Arc<dyn run_live::QueryInvalidator>,
        Arc::new(notify_tx),
    );
    let mut frames = stream.frames();

    let mut control = options.take_control.then(|| {
        RemoteControlChannel::new(
            endpoints,
            transport,
            credentials,
            Arc::clone(&cache) as Arc<dyn run_live::QueryInvalidator>,
        )
    });
    let mut frame_buffer = control
        .as_ref()
        .map(RemoteControlChannel::subscribe_frame_buffer);

    info!(run = %options.run, "watching run");
    let notifier = TracingNotifier;
    let mut polling = true;
    let mut last_status = None;
    let mut last_active: Option<String> = None;
    let mut saved_frames = 0u64;
    let mut frame_buffer_bytes = 0usize;
    let mut control_requested = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = snapshots.changed(), if polling => {
                if changed.is_err() {
                    debug!("poller stopped");
                    polling = false;
                    if !options.always_stream {
                        break;
                    }
                    continue;
                }
                let Some(snapshot) = snapshots.borrow_and_update().clone() else {
                    continue;
                };
                if last_status != Some(snapshot.status()) {
                    info!(
                        run = %options.run,
                        status = %snapshot.status(),
                        actions = snapshot.action_count(),
                        "run status"
                    );
                    last_status = Some(snapshot.status());
                }
                report_active(&snapshot, options.active.as_deref(), &mut last_active);

                let finalized = snapshot.is_finalized();
                stream
                    .sync(Some(&StreamInputs {
                        run: options.run.clone(),
                        finalized,
                        always_show: options.always_stream,
                    }))
                    .await;
                if let Some(control) = control.as_mut() {
                    control
                        .sync(Some(ControlInputs {
                            run: options.run.clone(),
                            finalized,
                            render_target: true,
                        }))
                        .await;
                }
                if finalized && !options.always_stream {
                    break;
                }
            }
            Ok(()) = frames.changed() => {
                let frame = frames.borrow_and_update().clone();
                if let (Some(frame), Some(dir)) = (frame, options.output_dir.as_deref()) {
                    match save_frame(dir, saved_frames + 1, &frame).await {
                        Ok(()) => saved_frames += 1,
                        Err(error) => warn!("frame not saved: {:#}", error),
                    }
                }
            }
            Some(event) = next_control_event(&mut control) => {
                if let Some(control) = control.as_mut() {
                    control.handle_event(event).await;
                    // Intent only reaches the server while the command socket is up.
                    if !control_requested && control.state().command_connected {
                        control_requested = true;
                        match control.set_control_intent(true).await {
                            IntentOutcome::Sent => info!("remote control requested"),
                            outcome => warn!("remote control request not sent: {:?}", outcome),
                        }
                    }
                }
            }
            Some(payload) = next_frame_buffer_payload(&mut frame_buffer) => {
                frame_buffer_bytes += payload.len();
            }
            Some(notification) = notifications.recv() => {
                notifier.notify(notification);
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Some(control) = control.as_mut() {
        if control_requested {
            control.set_control_intent(false).await;
        }
        control.close().await;
    }
    stream.close().await;
    while let Ok(notification) = notifications.try_recv() {
        notifier.notify(notification);
    }
    poll_task.abort();
    info!(
        run = %options.run,
        saved_frames,
        frame_buffer_bytes,
        "stopped watching run"
    );
    Ok(())
}

async fn next_control_event(control: &mut Option<RemoteControlChannel>) -> Option<ControlEvent> {
    match control {
        Some(control) => control.next_event().await,
        None => future::pending().await,
    }
}

async fn next_frame_buffer_payload(
    payloads: &mut Option<broadcast::Receiver<Vec<u8>>>,
) -> Option<Vec<u8>> {
    let Some(payloads) = payloads else {
        return future::pending().await;
    };
    loop {
        match payloads.recv().await {
            Ok(payload) => return Some(payload),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("skipped {} frame buffer payloads", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return future::pending().await,
        }
    }
}

fn report_active(snapshot: &RunSnapshot, target: Option<&str>, last: &mut Option<String>) {
    let described = match snapshot.active_selection(target) {
        Some(selection) => describe(&selection),
        None => match target {
            Some(target) => format!("missing ({target} is not in the timeline)"),
            None => "nothing".to_string(),
        },
    };
    if last.as_deref() != Some(described.as_str()) {
        info!(active = %described, "active item");
        *last = Some(described);
    }
}

fn describe(selection: &ActiveSelection<'_>) -> String {
    match selection {
        ActiveSelection::Stream => "live stream".to_string(),
        ActiveSelection::Block(block) => format!("block {} ({:?})", block.id, block.kind),
        ActiveSelection::Action(action) => {
            format!("action {} (#{})", action.id, action.ordinal)
        }
        ActiveSelection::Thought(thought) => format!("thought {}", thought.id),
    }
}

fn frame_path(dir: &Path, sequence: u64, frame: &Frame) -> PathBuf {
    dir.join(format!("frame-{sequence:05}.{}", frame.extension()))
}

async fn save_frame(dir: &Path, sequence: u64, frame: &Frame) -> Result<()> {
    let path = frame_path(dir, sequence, frame);
    tokio::fs::write(&path, &frame.data)
        .await
        .with_context(|| format!("write frame {}", path.display()))?;
    debug!("saved {}", path.display());
    Ok(())
}
