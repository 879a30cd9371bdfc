//! Live observation and control of a running automation.
//!
//! Three independently scoped resources per observed run:
//! - a status-driven poller for run and timeline queries
//! - a one-way frame stream socket
//! - a remote control pair (frame-buffer socket + command socket)
//!
//! Channels only ever invalidate the shared query cache; refetching belongs
//! to the poller.

pub mod cache;
pub mod control;
pub mod credential;
pub mod edge;
pub mod endpoints;
pub mod error;
pub mod frame_stream;
pub mod notify;
pub mod poller;
pub mod transport;

pub use cache::{QueryCache, QueryInvalidator, QueryKey};
pub use control::{
    ControlCommand, ControlEvent, ControlInputs, ControlState, FRAME_BUFFER_BACKLOG,
    IntentOutcome, RemoteControlChannel, SocketKind,
};
pub use credential::{CredentialSource, FallbackCredentials, StaticCredential, TokenGetter};
pub use edge::FallingEdge;
pub use endpoints::Endpoints;
pub use error::{ChannelError, Result};
pub use frame_stream::{
    Frame, FrameStreamChannel, StreamInputs, StreamPhase, StreamUpdate, parse_stream_message,
};
pub use notify::{Notification, NotificationKind, Notifier, TracingNotifier};
pub use poller::{RunPoller, RunSnapshot, RunSource};
pub use run_query::{Credential, RunKind, RunRef};
pub use transport::{EventSink, SocketHandle, Transport, TransportEvent, WsConfig, WsTransport};
