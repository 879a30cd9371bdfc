//! Remote control of a live run's browser.
//!
//! Two sockets per run: an interactive frame-buffer socket (only while the
//! run is live and something can render it) and a command socket carrying
//! control-intent messages. Each socket's setup is keyed on the run, the
//! credential source and a falling-edge counter of its own connected flag,
//! so a drop causes exactly one reconnect.
//!
//! Handshakes run on spawned tasks and report back through the channel's
//! event queue, so neither socket waits on the other and the owner is never
//! blocked by a slow connect.
//!
//! Intent changes are sent once, and only while the command socket is
//! connected. Nothing is queued or replayed across reconnects.

use crate::cache::{QueryInvalidator, QueryKey};
use crate::credential::CredentialSource;
use crate::edge::FallingEdge;
use crate::endpoints::Endpoints;
use crate::error::{ChannelError, Result};
use crate::transport::{EventSink, SocketHandle, Transport, TransportEvent};
use run_query::RunRef;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frame-buffer payloads kept for a slow subscriber before the oldest are dropped.
pub const FRAME_BUFFER_BACKLOG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    FrameBuffer,
    Command,
}

/// Message on the command socket, e.g. `{"kind":"take-control"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlCommand {
    TakeControl,
    CedeControl,
}

impl ControlCommand {
    #[must_use]
    pub fn for_intent(controlling: bool) -> Self {
        if controlling {
            Self::TakeControl
        } else {
            Self::CedeControl
        }
    }
}

enum SlotEvent {
    Opened(Box<dyn SocketHandle>),
    OpenFailed(ChannelError),
    Transport(TransportEvent),
}

impl fmt::Debug for SlotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened(_) => f.write_str("Opened"),
            Self::OpenFailed(error) => f.debug_tuple("OpenFailed").field(error).finish(),
            Self::Transport(event) => f.debug_tuple("Transport").field(event).finish(),
        }
    }
}

/// Socket event tagged with the socket it came from.
#[derive(Debug)]
pub struct ControlEvent {
    pub socket: SocketKind,
    event: SlotEvent,
    epoch: u64,
}

impl ControlEvent {
    /// The socket lifecycle or payload event, when this is not a handshake result.
    #[must_use]
    pub fn transport_event(&self) -> Option<&TransportEvent> {
        match &self.event {
            SlotEvent::Transport(event) => Some(event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInputs {
    pub run: RunRef,
    pub finalized: bool,
    /// Something is available to draw the frame buffer into.
    pub render_target: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlState {
    pub frame_buffer_connected: bool,
    pub command_connected: bool,
    pub user_controlling: bool,
    pub frame_buffer_reconnects: u64,
    pub command_reconnects: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentOutcome {
    Sent,
    /// Not connected (or the send failed); the change stays local.
    Dropped,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SlotKey {
    run: RunRef,
    credentials_epoch: u64,
    reconnects: u64,
}

struct SocketSlot {
    kind: SocketKind,
    connected: bool,
    edge: FallingEdge,
    key: Option<SlotKey>,
    epoch: u64,
    opening: Option<JoinHandle<()>>,
    socket: Option<Box<dyn SocketHandle>>,
}

impl SocketSlot {
    fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            connected: false,
            edge: FallingEdge::new(),
            key: None,
            epoch: 0,
            opening: None,
            socket: None,
        }
    }

    /// Connected and the handshake result has been taken over.
    fn is_live(&self) -> bool {
        self.connected && self.socket.is_some()
    }

    async fn shut(&mut self) {
        if let Some(opening) = self.opening.take() {
            debug!("abandoning {:?} handshake", self.kind);
            opening.abort();
        }
        if let Some(socket) = self.socket.take() {
            debug!("closing {:?} socket", self.kind);
            socket.close().await;
        }
        self.key = None;
        if self.connected {
            self.connected = false;
            self.edge.reset(false);
        }
    }
}

pub struct RemoteControlChannel {
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    credentials_epoch: u64,
    invalidator: Arc<dyn QueryInvalidator>,
    frame_buffer_tx: broadcast::Sender<Vec<u8>>,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,
    next_epoch: u64,
    inputs: Option<ControlInputs>,
    frame_buffer: SocketSlot,
    command: SocketSlot,
    user_controlling: bool,
}

impl RemoteControlChannel {
    #[must_use]
    pub fn new(
        endpoints: Endpoints,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        invalidator: Arc<dyn QueryInvalidator>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frame_buffer_tx, _) = broadcast::channel(FRAME_BUFFER_BACKLOG);
        Self {
            endpoints,
            transport,
            credentials,
            credentials_epoch: 0,
            invalidator,
            frame_buffer_tx,
            events_tx,
            events_rx,
            next_epoch: 1,
            inputs: None,
            frame_buffer: SocketSlot::new(SocketKind::FrameBuffer),
            command: SocketSlot::new(SocketKind::Command),
            user_controlling: false,
        }
    }

    /// Raw frame-buffer payloads, never interpreted here. A subscriber that
    /// falls more than [`FRAME_BUFFER_BACKLOG`] payloads behind loses the oldest.
    #[must_use]
    pub fn subscribe_frame_buffer(&self) -> broadcast::Receiver<Vec<u8>> {
        self.frame_buffer_tx.subscribe()
    }

    /// Replace the credential source; both sockets reopen on the next reconcile.
    pub fn set_credentials(&mut self, credentials: Arc<dyn CredentialSource>) {
        self.credentials = credentials;
        self.credentials_epoch += 1;
    }

    #[must_use]
    pub fn state(&self) -> ControlState {
        ControlState {
            frame_buffer_connected: self.frame_buffer.is_live(),
            command_connected: self.command.is_live(),
            user_controlling: self.user_controlling,
            frame_buffer_reconnects: self.frame_buffer.edge.count(),
            command_reconnects: self.command.edge.count(),
        }
    }

    /// A handshake has been started and its result not yet handled.
    #[must_use]
    pub fn is_opening(&self) -> bool {
        self.frame_buffer.opening.is_some() || self.command.opening.is_some()
    }

    /// Update the inputs and reconcile both sockets; `None` closes everything.
    ///
    /// Returns once the desired handshakes are started, not finished.
    pub async fn sync(&mut self, inputs: Option<ControlInputs>) {
        self.inputs = inputs;
        self.reconcile().await;
    }

    pub async fn close(&mut self) {
        self.inputs = None;
        self.frame_buffer.shut().await;
        self.command.shut().await;
    }

    /// Wait for the next socket event. Pass it to [`Self::handle_event`].
    pub async fn next_event(&mut self) -> Option<ControlEvent> {
        self.events_rx.recv().await
    }

    /// Handle every event that is already queued; returns how many there were.
    pub async fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Handle events until no handshake is in flight.
    pub async fn settle(&mut self) {
        while self.is_opening() {
            let Some(event) = self.events_rx.recv().await else {
                return;
            };
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&mut self, event: ControlEvent) {
        let ControlEvent {
            socket: kind,
            event,
            epoch,
        } = event;
        let slot = match kind {
            SocketKind::FrameBuffer => &mut self.frame_buffer,
            SocketKind::Command => &mut self.command,
        };
        if slot.key.is_none() || slot.epoch != epoch {
            match event {
                SlotEvent::Opened(socket) => {
                    debug!("closing superseded {:?} socket", kind);
                    tokio::spawn(async move { socket.close().await });
                }
                event => debug!("ignoring stale {:?} event {:?}", kind, event),
            }
            return;
        }

        match event {
            SlotEvent::Opened(socket) => {
                slot.opening = None;
                slot.socket = Some(socket);
                return;
            }
            SlotEvent::OpenFailed(error) => {
                slot.opening = None;
                // Stays keyed: no retry until the inputs change.
                warn!("{:?} socket failed to open: {}", kind, error);
                return;
            }
            SlotEvent::Transport(TransportEvent::Connected) => {
                info!("{:?} socket connected", kind);
                slot.connected = true;
            }
            SlotEvent::Transport(TransportEvent::Disconnected) => {
                warn!("{:?} socket disconnected", kind);
                slot.connected = false;
                slot.socket = None;
                if let Some(key) = &slot.key {
                    let keys = QueryKey::run_state(&key.run.id);
                    self.invalidator.invalidate_all(&keys);
                }
            }
            SlotEvent::Transport(TransportEvent::Binary(payload)) => {
                debug!("ignoring {} byte payload on {:?} socket", payload.len(), kind);
                return;
            }
            SlotEvent::Transport(TransportEvent::Text(text)) => {
                debug!("ignoring {} byte text on {:?} socket", text.len(), kind);
                return;
            }
        }

        self.reconcile().await;
    }

    /// Record the local control intent; sends exactly one command when it
    /// changes while the command socket is connected.
    pub async fn set_control_intent(&mut self, controlling: bool) -> IntentOutcome {
        if self.user_controlling == controlling {
            return IntentOutcome::Unchanged;
        }
        self.user_controlling = controlling;
        let command = ControlCommand::for_intent(controlling);

        let socket = match &self.command.socket {
            Some(socket) if self.command.connected => socket,
            _ => {
                debug!("command socket not connected, {:?} stays local", command);
                return IntentOutcome::Dropped;
            }
        };
        let text = match serde_json::to_string(&command) {
            Ok(text) => text,
            Err(error) => {
                warn!("failed to encode {:?}: {}", command, error);
                return IntentOutcome::Dropped;
            }
        };
        match socket.send_text(text).await {
            Ok(()) => {
                info!("sent {:?}", command);
                IntentOutcome::Sent
            }
            Err(error) => {
                warn!("failed to send {:?}: {}", command, error);
                IntentOutcome::Dropped
            }
        }
    }

    async fn reconcile(&mut self) {
        self.frame_buffer.edge.observe(self.frame_buffer.connected);
        self.command.edge.observe(self.command.connected);

        let frame_buffer = self
            .inputs
            .as_ref()
            .filter(|inputs| !inputs.finalized && inputs.render_target)
            .map(|inputs| self.key_for(inputs, &self.frame_buffer));
        self.apply(SocketKind::FrameBuffer, frame_buffer).await;

        let command = self
            .inputs
            .as_ref()
            .map(|inputs| self.key_for(inputs, &self.command));
        self.apply(SocketKind::Command, command).await;
    }

    fn key_for(&self, inputs: &ControlInputs, slot: &SocketSlot) -> SlotKey {
        SlotKey {
            run: inputs.run.clone(),
            credentials_epoch: self.credentials_epoch,
            reconnects: slot.edge.count(),
        }
    }

    async fn apply(&mut self, kind: SocketKind, desired: Option<SlotKey>) {
        if self.slot_mut(kind).key == desired {
            return;
        }
        self.slot_mut(kind).shut().await;
        let Some(key) = desired else {
            return;
        };

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let handshake = Handshake {
            kind,
            run: key.run.clone(),
            epoch,
            endpoints: self.endpoints.clone(),
            transport: Arc::clone(&self.transport),
            credentials: Arc::clone(&self.credentials),
            events: self.events_tx.clone(),
            frame_buffer: self.frame_buffer_tx.clone(),
        };

        let slot = self.slot_mut(kind);
        slot.key = Some(key);
        slot.epoch = epoch;
        slot.opening = Some(tokio::spawn(handshake.run()));
    }

    fn slot_mut(&mut self, kind: SocketKind) -> &mut SocketSlot {
        match kind {
            SocketKind::FrameBuffer => &mut self.frame_buffer,
            SocketKind::Command => &mut self.command,
        }
    }
}

impl Drop for RemoteControlChannel {
    fn drop(&mut self) {
        for slot in [&mut self.frame_buffer, &mut self.command] {
            if let Some(opening) = slot.opening.take() {
                opening.abort();
            }
            if let Some(socket) = slot.socket.take()
                && let Ok(runtime) = tokio::runtime::Handle::try_current()
            {
                runtime.spawn(async move { socket.close().await });
            }
        }
    }
}

/// One socket open, run off the owner's task.
struct Handshake {
    kind: SocketKind,
    run: RunRef,
    epoch: u64,
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    events: mpsc::UnboundedSender<ControlEvent>,
    frame_buffer: broadcast::Sender<Vec<u8>>,
}

impl Handshake {
    async fn run(self) {
        let events = self.events.clone();
        let (kind, epoch) = (self.kind, self.epoch);
        let event = match self.open().await {
            Ok(socket) => SlotEvent::Opened(socket),
            Err(error) => SlotEvent::OpenFailed(error),
        };
        // The channel may be gone; the socket is then dropped with the event.
        let _ = events.send(ControlEvent {
            socket: kind,
            event,
            epoch,
        });
    }

    async fn open(self) -> Result<Box<dyn SocketHandle>> {
        let credential = self.credentials.credential().await?;
        let url = match self.kind {
            SocketKind::FrameBuffer => self.endpoints.frame_buffer(&self.run, &credential)?,
            SocketKind::Command => self.endpoints.command(&self.run, Uuid::new_v4(), &credential)?,
        };

        let (kind, epoch) = (self.kind, self.epoch);
        let events = self.events;
        let frame_buffer = self.frame_buffer;
        let sink: EventSink = Arc::new(move |event| match event {
            // Payloads skip the owner's queue so a slow owner cannot pile them up.
            TransportEvent::Binary(payload) if kind == SocketKind::FrameBuffer => {
                let _ = frame_buffer.send(payload);
            }
            event => {
                let _ = events.send(ControlEvent {
                    socket: kind,
                    event: SlotEvent::Transport(event),
                    epoch,
                });
            }
        });
        self.transport.open(url, sink).await
    }
}
