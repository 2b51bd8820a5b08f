//! In-process transport to a [`TreeServer`].
//!
//! Every message crosses the CBOR codec in both directions, so the wire
//! format is exercised even though nothing leaves the process.

use canopy_sync_engine::{InboundEvent, InboundSink, SyncError, SyncResult, Transport};
use canopy_sync_protocol::{
    decode_message, encode_message, ClientMessage, HandshakeRequest, HandshakeResponse,
    ServerMessage,
};
use canopy_sync_server::{ServerError, SessionId, TreeServer};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

fn round_trip<T: Serialize + DeserializeOwned>(message: &T) -> SyncResult<T> {
    let bytes = encode_message(message)?;
    Ok(decode_message(&bytes)?)
}

/// A transport whose far end is a [`TreeServer`] in the same process.
pub struct LoopbackTransport {
    server: Arc<TreeServer>,
    session: Mutex<Option<SessionId>>,
    sink: Mutex<Option<Arc<InboundSink>>>,
    reachable: AtomicBool,
    sent: Mutex<Vec<ClientMessage>>,
}

impl LoopbackTransport {
    /// Creates a transport to `server`.
    pub fn new(server: Arc<TreeServer>) -> Self {
        Self {
            server,
            session: Mutex::new(None),
            sink: Mutex::new(None),
            reachable: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Makes the server (un)reachable for later connects.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Ends the session as if the network failed: the server runs the
    /// session's disconnect actions and the client learns of the loss.
    pub fn drop_connection(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        self.server.close_session(session);
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.push(InboundEvent::ConnectionLost);
        }
    }

    /// Server session id, if connected.
    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    /// Every message the client has sent.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// Returns and forgets the messages sent so far.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for LoopbackTransport {
    fn connect(
        &self,
        request: &HandshakeRequest,
        inbound: Arc<InboundSink>,
    ) -> SyncResult<HandshakeResponse> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("server unreachable"));
        }
        self.disconnect();
        let request = round_trip(request)?;
        let deliver = Arc::clone(&inbound);
        let sink = Arc::new(move |message: ServerMessage| match round_trip(&message) {
            Ok(message) => deliver.push_message(message),
            Err(e) => warn!(error = %e, "dropping undecodable server message"),
        });
        let (response, session) = self.server.open_session(&request, sink);
        if let Some(session) = session {
            *self.session.lock() = Some(session);
            *self.sink.lock() = Some(inbound);
        }
        round_trip(&response)
    }

    fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        let session = self.session().ok_or(SyncError::Disconnected)?;
        let decoded = round_trip(message)?;
        self.sent.lock().push(decoded.clone());
        self.server
            .handle_message(session, decoded)
            .map_err(|e| match e {
                ServerError::UnknownSession(_) => SyncError::Disconnected,
                other => SyncError::ServerError(other.to_string()),
            })
    }

    fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.server.close_session(session);
        }
    }

    fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_sync_server::ServerConfig;
    use serde_json::json;

    #[test]
    fn messages_cross_the_codec() {
        let server = Arc::new(TreeServer::new(ServerConfig::default()));
        let transport = LoopbackTransport::new(Arc::clone(&server));
        let sink = Arc::new(InboundSink::new());
        let response = transport
            .connect(&HandshakeRequest::new("c", None), Arc::clone(&sink))
            .unwrap();
        assert!(response.success);
        assert!(transport.is_connected());

        transport
            .send(&ClientMessage::Put {
                request_id: 1,
                path: "/a".into(),
                data: json!({"b": [1, 2]}),
                hash: None,
            })
            .unwrap();
        assert_eq!(server.value("/a/b/1").unwrap(), json!(2));
        assert_eq!(sink.len(), 1);
        assert_eq!(transport.take_sent().len(), 1);
    }

    #[test]
    fn dropped_connection_closes_session() {
        let server = Arc::new(TreeServer::new(ServerConfig::default()));
        let transport = LoopbackTransport::new(Arc::clone(&server));
        let sink = Arc::new(InboundSink::new());
        transport
            .connect(&HandshakeRequest::new("c", None), Arc::clone(&sink))
            .unwrap();
        assert_eq!(server.session_count(), 1);

        transport.drop_connection();
        assert_eq!(server.session_count(), 0);
        assert_eq!(sink.len(), 1);
        assert!(matches!(
            transport.send(&ClientMessage::Unlisten {
                path: "/".into(),
                query: "default".into()
            }),
            Err(SyncError::Disconnected)
        ));
    }

    #[test]
    fn unreachable_server() {
        let server = Arc::new(TreeServer::new(ServerConfig::default()));
        let transport = LoopbackTransport::new(server);
        transport.set_reachable(false);
        let err = transport
            .connect(&HandshakeRequest::new("c", None), Arc::new(InboundSink::new()))
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
