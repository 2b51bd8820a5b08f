//! Transport layer abstraction.

use crate::error::{SyncError, SyncResult};
use canopy_sync_protocol::{ClientMessage, HandshakeRequest, HandshakeResponse, ServerMessage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;
use tokio::sync::Notify;

/// A transport carries protocol messages to and from the server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (socket, in-process loopback, mock for testing).
/// Outbound calls are synchronous hand-offs; messages from the server are
/// pushed into the [`InboundSink`] given at connect time and processed
/// when the database pumps.
pub trait Transport: Send + Sync {
    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    fn connect(
        &self,
        request: &HandshakeRequest,
        inbound: Arc<InboundSink>,
    ) -> SyncResult<HandshakeResponse>;

    /// Sends a message on the open session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is gone.
    fn send(&self, message: &ClientMessage) -> SyncResult<()>;

    /// Closes the session.
    fn disconnect(&self);

    /// Checks if a session is open.
    fn is_connected(&self) -> bool;
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A message from the server.
    Message(ServerMessage),
    /// The session ended without the client asking.
    ConnectionLost,
}

/// Queue of inbound events, drained by the database.
#[derive(Debug, Default)]
pub struct InboundSink {
    queue: Mutex<VecDeque<InboundEvent>>,
    notify: Notify,
    wakers: Mutex<Vec<Waker>>,
}

impl InboundSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event and wakes the inbound loop.
    pub fn push(&self, event: InboundEvent) {
        self.queue.lock().push_back(event);
        self.wake();
    }

    /// Queues a server message.
    pub fn push_message(&self, message: ServerMessage) {
        self.push(InboundEvent::Message(message));
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn pop(&self) -> Option<InboundEvent> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
        for waker in std::mem::take(&mut *self.wakers.lock()) {
            waker.wake();
        }
    }

    /// Wakes `waker` on the next inbound event.
    pub(crate) fn register_waker(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// A mock transport for testing.
///
/// Records every message sent and answers handshakes with a configurable
/// response. Tests inject server messages through [`MockTransport::deliver`].
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    reachable: AtomicBool,
    handshake_response: Mutex<HandshakeResponse>,
    handshakes: Mutex<Vec<HandshakeRequest>>,
    sent: Mutex<Vec<ClientMessage>>,
    inbound: Mutex<Option<Arc<InboundSink>>>,
}

impl MockTransport {
    /// Creates a mock that accepts every handshake.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            handshake_response: Mutex::new(HandshakeResponse::success(0)),
            handshakes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
        }
    }

    /// Sets the handshake response.
    pub fn set_handshake_response(&self, response: HandshakeResponse) {
        *self.handshake_response.lock() = response;
    }

    /// Makes the server (un)reachable for later connects.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Handshakes received so far.
    pub fn handshakes(&self) -> Vec<HandshakeRequest> {
        self.handshakes.lock().clone()
    }

    /// Messages sent so far.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// Returns and forgets the messages sent so far.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Pushes a server message to the connected client.
    pub fn deliver(&self, message: ServerMessage) {
        if let Some(sink) = self.inbound.lock().as_ref() {
            sink.push_message(message);
        }
    }

    /// Simulates the connection dropping.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(sink) = self.inbound.lock().as_ref() {
            sink.push(InboundEvent::ConnectionLost);
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        request: &HandshakeRequest,
        inbound: Arc<InboundSink>,
    ) -> SyncResult<HandshakeResponse> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("server unreachable"));
        }
        self.handshakes.lock().push(request.clone());
        let response = self.handshake_response.lock().clone();
        if response.success {
            *self.inbound.lock() = Some(inbound);
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(response)
    }

    fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
