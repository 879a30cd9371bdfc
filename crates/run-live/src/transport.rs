//! Socket transport for live channels.

use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Lifecycle and payload events reported by an open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Text(String),
    Binary(Vec<u8>),
    Disconnected,
}

/// Callback receiving every event of one socket, in order.
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Opens sockets for the channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket to `url`. `Connected` is reported through `events` once the
    /// handshake completes and `Disconnected` exactly once when it ends for any
    /// reason other than [`SocketHandle::close`].
    async fn open(&self, url: Url, events: EventSink) -> Result<Box<dyn SocketHandle>>;
}

#[async_trait]
pub trait SocketHandle: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;

    /// Close the socket. Calling it more than once is a no-op.
    async fn close(&self);
}

/// Websocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub connect_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    config: WsConfig,
}

impl WsTransport {
    #[must_use]
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: Url, events: EventSink) -> Result<Box<dyn SocketHandle>> {
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ChannelError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (stream, _response) = timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ChannelError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|error| ChannelError::WebSocket(error.to_string()))?;

        let (writer, mut reader) = stream.split();
        let label = redacted(&url);
        events(TransportEvent::Connected);

        let recv_events = Arc::clone(&events);
        let recv_label = label.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        recv_events(TransportEvent::Text(text.as_str().to_owned()));
                    }
                    Ok(Message::Binary(payload)) => {
                        recv_events(TransportEvent::Binary(payload.to_vec()));
                    }
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", recv_label, payload.len());
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Pong(_) | Message::Frame(_)) => {}
                    Err(error) => {
                        warn!("websocket read error on {}: {}", recv_label, error);
                        break;
                    }
                }
            }
            recv_events(TransportEvent::Disconnected);
        });

        Ok(Box::new(WsSocket {
            label,
            writer: Mutex::new(Some(writer)),
            recv_task: Mutex::new(Some(task)),
        }))
    }
}

struct WsSocket {
    label: String,
    writer: Mutex<Option<WsWriter>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SocketHandle for WsSocket {
    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ChannelError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ChannelError::WebSocket(error.to_string()))
    }

    async fn close(&self) {
        // Stop the reader first so a deliberate close never reports Disconnected.
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!("close frame to {} not delivered: {}", self.label, error);
        }
    }
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        if let Ok(mut task) = self.recv_task.try_lock()
            && let Some(task) = task.take()
        {
            task.abort();
        }
    }
}

/// Socket URL with credential parameters stripped, for logs.
#[must_use]
pub fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
