use async_trait::async_trait;
use run_live::{
    ChannelError, EventSink, QueryInvalidator, QueryKey, Result, SocketHandle, Transport,
    TransportEvent,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// In-memory transport: records every open and lets tests drive socket events.
#[derive(Clone, Default)]
pub struct FakeTransport {
    sockets: Arc<Mutex<Vec<FakeSocket>>>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
}

#[derive(Clone)]
struct FakeSocket {
    url: Url,
    sink: EventSink,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

struct FakeHandle {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, url: Url, events: EventSink) -> Result<Box<dyn SocketHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChannelError::WebSocket("connection refused".to_string()));
        }
        let socket = FakeSocket {
            url,
            sink: events,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let handle = FakeHandle {
            sent: Arc::clone(&socket.sent),
            closed: Arc::clone(&socket.closed),
        };
        self.sockets.lock().expect("lock").push(socket);
        Ok(Box::new(handle))
    }
}

#[async_trait]
impl SocketHandle for FakeHandle {
    async fn send_text(&self, text: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.sent.lock().expect("lock").push(text);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl FakeTransport {
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make every later handshake take `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock") = Some(delay);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.sockets.lock().expect("lock").len()
    }

    /// Indices of sockets whose path contains `fragment`, in open order.
    pub fn matching(&self, fragment: &str) -> Vec<usize> {
        self.sockets
            .lock()
            .expect("lock")
            .iter()
            .enumerate()
            .filter(|(_, socket)| socket.url.path().contains(fragment))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn url(&self, index: usize) -> Url {
        self.sockets.lock().expect("lock")[index].url.clone()
    }

    pub fn emit(&self, index: usize, event: TransportEvent) {
        let sink = Arc::clone(&self.sockets.lock().expect("lock")[index].sink);
        sink(event);
    }

    pub fn sent(&self, index: usize) -> Vec<String> {
        self.sockets.lock().expect("lock")[index]
            .sent
            .lock()
            .expect("lock")
            .clone()
    }

    pub fn all_sent(&self) -> Vec<String> {
        (0..self.opened()).flat_map(|index| self.sent(index)).collect()
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.sockets.lock().expect("lock")[index]
            .closed
            .load(Ordering::SeqCst)
    }

    pub fn live(&self, fragment: &str) -> Vec<usize> {
        self.matching(fragment)
            .into_iter()
            .filter(|index| !self.is_closed(*index))
            .collect()
    }
}

/// Records invalidations in order.
#[derive(Default)]
pub struct RecordingInvalidator {
    keys: Mutex<Vec<QueryKey>>,
}

impl RecordingInvalidator {
    pub fn keys(&self) -> Vec<QueryKey> {
        self.keys.lock().expect("lock").clone()
    }
}

impl QueryInvalidator for RecordingInvalidator {
    fn invalidate(&self, key: &QueryKey) {
        self.keys.lock().expect("lock").push(key.clone());
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
