//! Main reference server.

use crate::auth::{now_millis, AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{Outgoing, RequestHandler, ServerState, Session};
use crate::rules::Rules;
use canopy_core::Path;
use canopy_sync_protocol::{ClientMessage, HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION};
use parking_lot::Mutex;
use serde_json::Value as Json;

pub use crate::handler::{SessionId, SessionSink};

/// The reference server.
///
/// Holds one tree in memory and serves any number of sessions. All state
/// changes happen under one lock; outgoing messages are delivered to the
/// session sinks after it is released, in the order they were produced.
///
/// # Example
///
/// ```
/// use canopy_sync_protocol::{ClientMessage, HandshakeRequest, ServerMessage};
/// use canopy_sync_server::{ServerConfig, TreeServer};
/// use std::sync::{Arc, Mutex};
///
/// let server = TreeServer::new(ServerConfig::default());
/// let inbox = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&inbox);
/// let (response, session) = server
///     .open_session(&HandshakeRequest::new("s1", None), Arc::new(move |m: ServerMessage| {
///         sink.lock().unwrap().push(m)
///     }));
/// assert!(response.success);
///
/// let put = ClientMessage::Put {
///     request_id: 1,
///     path: "/greeting".into(),
///     data: serde_json::json!("hello"),
///     hash: None,
/// };
/// server.handle_message(session.unwrap(), put).unwrap();
/// assert_eq!(server.value("/greeting").unwrap(), serde_json::json!("hello"));
/// assert_eq!(inbox.lock().unwrap().len(), 1);
/// ```
pub struct TreeServer {
    validator: Option<TokenValidator>,
    state: Mutex<ServerState>,
}

impl TreeServer {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let validator = config.auth_secret.as_ref().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret.clone()).with_expiry(config.token_expiry))
        });
        Self {
            validator,
            state: Mutex::new(ServerState::new(config.rules, config.require_auth)),
        }
    }

    /// Issues a token for `uid`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AuthenticationFailed`] if the server has no
    /// auth secret.
    pub fn issue_token(&self, uid: [u8; 16]) -> ServerResult<String> {
        self.validator
            .as_ref()
            .ok_or_else(|| ServerError::AuthenticationFailed("authentication not configured".into()))?
            .create_token(uid)
    }

    /// Opens a session.
    ///
    /// Returns the handshake answer and, if it succeeded, the new session id.
    /// `sink` receives every message pushed to the session.
    pub fn open_session(
        &self,
        request: &HandshakeRequest,
        sink: SessionSink,
    ) -> (HandshakeResponse, Option<SessionId>) {
        if request.protocol_version != PROTOCOL_VERSION {
            return (
                HandshakeResponse::error(format!(
                    "unsupported protocol version: {}",
                    request.protocol_version
                )),
                None,
            );
        }

        let mut state = self.state.lock();
        let claims = match (&request.auth_token, &self.validator) {
            (Some(token), Some(validator)) => match validator.claims(token) {
                Ok(claims) if claims.issued_at >= state.auth_not_before => Some(claims),
                Ok(_) => {
                    return (HandshakeResponse::error("token revoked"), None);
                }
                Err(e) => return (HandshakeResponse::error(e.to_string()), None),
            },
            _ => None,
        };
        if state.require_auth && claims.is_none() {
            return (HandshakeResponse::error("authentication required"), None);
        }

        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id, Session::new(sink, claims));
        tracing::info!(session = id, client = %request.session_id, "session opened");
        (HandshakeResponse::success(now_millis() as i64), Some(id))
    }

    /// Handles a message from an open session.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownSession`] if `session` is not open.
    pub fn handle_message(&self, session: SessionId, message: ClientMessage) -> ServerResult<()> {
        let outgoing = {
            let mut state = self.state.lock();
            let mut handler = RequestHandler::new(&mut state);
            handler.handle(session, message)?;
            handler.finish()
        };
        deliver(outgoing);
        Ok(())
    }

    /// Closes a session and runs its disconnect actions.
    pub fn close_session(&self, session: SessionId) {
        let outgoing = {
            let mut state = self.state.lock();
            let Some(closed) = state.sessions.remove(&session) else {
                return;
            };
            tracing::info!(session, "session closed");
            let mut handler = RequestHandler::new(&mut state);
            handler.run_disconnect(closed);
            handler.finish()
        };
        deliver(outgoing);
    }

    /// Replaces the rules and revokes listens they no longer allow.
    pub fn set_rules(&self, rules: Rules) {
        let outgoing = {
            let mut state = self.state.lock();
            state.rules = rules;
            let mut handler = RequestHandler::new(&mut state);
            handler.revoke_unreadable();
            handler.finish()
        };
        deliver(outgoing);
    }

    /// Invalidates all issued tokens and notifies authenticated sessions.
    pub fn revoke_auth(&self, reason: &str) {
        let outgoing = {
            let mut state = self.state.lock();
            let mut handler = RequestHandler::new(&mut state);
            handler.revoke_auth(reason);
            handler.finish()
        };
        deliver(outgoing);
    }

    /// Writes a value directly, notifying listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if the path or value is invalid.
    pub fn set_value(&self, path: &str, value: Json) -> ServerResult<()> {
        let path = Path::parse(path)?;
        let outgoing = {
            let mut state = self.state.lock();
            let mut handler = RequestHandler::new(&mut state);
            handler.set_value(&path, &value)?;
            handler.finish()
        };
        deliver(outgoing);
        Ok(())
    }

    /// Returns the value at `path` in exported form.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid.
    pub fn value(&self, path: &str) -> ServerResult<Json> {
        let path = Path::parse(path)?;
        Ok(self.state.lock().root.get(&path).export())
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of listens held by `session`.
    pub fn listen_count(&self, session: SessionId) -> usize {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map_or(0, |s| s.listens.len())
    }
}

fn deliver(outgoing: Vec<Outgoing>) {
    for (sink, message) in outgoing {
        sink(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_sync_protocol::{AckStatus, ServerMessage};
    use serde_json::json;
    use std::sync::Arc;

    struct Client {
        id: SessionId,
        inbox: Arc<Mutex<Vec<ServerMessage>>>,
    }

    impl Client {
        fn take(&self) -> Vec<ServerMessage> {
            std::mem::take(&mut *self.inbox.lock())
        }
    }

    fn connect(server: &TreeServer, token: Option<String>) -> Client {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let (response, id) = server.open_session(
            &HandshakeRequest::new("test", token),
            Arc::new(move |m: ServerMessage| sink.lock().push(m)),
        );
        assert!(response.success, "{:?}", response.error);
        Client {
            id: id.unwrap(),
            inbox,
        }
    }

    fn listen(server: &TreeServer, client: &Client, path: &str) {
        server
            .handle_message(
                client.id,
                ClientMessage::Listen {
                    request_id: 0,
                    path: path.into(),
                    query: "default".into(),
                },
            )
            .unwrap();
    }

    fn put(path: &str, data: Json) -> ClientMessage {
        ClientMessage::Put {
            request_id: 1,
            path: path.into(),
            data,
            hash: None,
        }
    }

    fn data(path: &str, value: Json) -> ServerMessage {
        ServerMessage::Data {
            path: path.into(),
            data: value,
            merge: false,
        }
    }

    #[test]
    fn listen_sends_data_then_ack() {
        let server = TreeServer::new(ServerConfig::default());
        server.set_value("/a", json!({"b": 1})).unwrap();
        let client = connect(&server, None);
        listen(&server, &client, "/a");
        assert_eq!(
            client.take(),
            vec![data("/a", json!({"b": 1})), ServerMessage::ok(0)]
        );
        assert_eq!(server.listen_count(client.id), 1);
    }

    #[test]
    fn writes_broadcast_before_ack() {
        let server = TreeServer::new(ServerConfig::default());
        let watcher = connect(&server, None);
        let writer = connect(&server, None);
        listen(&server, &watcher, "/");
        listen(&server, &writer, "/a/b");
        watcher.take();
        writer.take();

        server.handle_message(writer.id, put("/a", json!({"b": 2, "c": 3}))).unwrap();
        assert_eq!(
            writer.take(),
            vec![data("/a/b", json!(2)), ServerMessage::ok(1)]
        );
        assert_eq!(watcher.take(), vec![data("/a", json!({"b": 2, "c": 3}))]);
    }

    #[test]
    fn unrelated_listens_are_quiet() {
        let server = TreeServer::new(ServerConfig::default());
        let client = connect(&server, None);
        listen(&server, &client, "/x");
        client.take();
        server.handle_message(client.id, put("/y", json!(1))).unwrap();
        assert_eq!(client.take(), vec![ServerMessage::ok(1)]);
    }

    #[test]
    fn merge_uses_relative_keys() {
        let server = TreeServer::new(ServerConfig::default());
        let client = connect(&server, None);
        listen(&server, &client, "/");
        client.take();
        server
            .handle_message(
                client.id,
                ClientMessage::Merge {
                    request_id: 4,
                    path: "/users".into(),
                    data: json!({"ada/age": 36, "bob": "x"}),
                },
            )
            .unwrap();
        assert_eq!(
            server.value("/users").unwrap(),
            json!({"ada": {"age": 36}, "bob": "x"})
        );
        let messages = client.take();
        assert_eq!(
            messages[0],
            ServerMessage::Data {
                path: "/users".into(),
                data: json!({"ada/age": 36, "bob": "x"}),
                merge: true,
            }
        );
        assert_eq!(messages[1], ServerMessage::ok(4));
    }

    #[test]
    fn merge_priority_sends_full_value() {
        let server = TreeServer::new(ServerConfig::default());
        server.set_value("/a", json!(1)).unwrap();
        let client = connect(&server, None);
        server
            .handle_message(
                client.id,
                ClientMessage::Merge {
                    request_id: 2,
                    path: "/a".into(),
                    data: json!({".priority": 10}),
                },
            )
            .unwrap();
        assert_eq!(
            server.value("/a").unwrap(),
            json!({".value": 1, ".priority": 10})
        );
    }

    #[test]
    fn conditional_put_reports_stale() {
        let server = TreeServer::new(ServerConfig::default());
        server.set_value("/n", json!(5)).unwrap();
        let client = connect(&server, None);

        let stale = ClientMessage::Put {
            request_id: 9,
            path: "/n".into(),
            data: json!(6),
            hash: Some(String::new()),
        };
        server.handle_message(client.id, stale).unwrap();
        assert_eq!(
            client.take(),
            vec![ServerMessage::Ack {
                request_id: 9,
                status: AckStatus::DataStale { current: json!(5) },
            }]
        );
        assert_eq!(server.value("/n").unwrap(), json!(5));
    }

    #[test]
    fn rules_deny_writes() {
        let server =
            TreeServer::new(ServerConfig::default().with_rules(Rules::open().deny_write("locked")));
        let client = connect(&server, None);
        server.handle_message(client.id, put("/locked/x", json!(1))).unwrap();
        assert_eq!(
            client.take(),
            vec![ServerMessage::Ack {
                request_id: 1,
                status: AckStatus::PermissionDenied,
            }]
        );
        assert_eq!(server.value("/locked").unwrap(), Json::Null);
    }

    #[test]
    fn invalid_path_acks_error() {
        let server = TreeServer::new(ServerConfig::default());
        let client = connect(&server, None);
        server.handle_message(client.id, put("/a.b", json!(1))).unwrap();
        assert!(matches!(
            client.take().as_slice(),
            [ServerMessage::Ack {
                status: AckStatus::Error { .. },
                ..
            }]
        ));
    }

    #[test]
    fn disconnect_actions_run_on_close() {
        let server = TreeServer::new(ServerConfig::default());
        let watcher = connect(&server, None);
        let leaver = connect(&server, None);
        server.set_value("/presence/ada", json!(true)).unwrap();
        listen(&server, &watcher, "/presence");
        watcher.take();

        server
            .handle_message(
                leaver.id,
                ClientMessage::OnDisconnectPut {
                    request_id: 1,
                    path: "/presence/ada".into(),
                    data: Json::Null,
                },
            )
            .unwrap();
        server
            .handle_message(
                leaver.id,
                ClientMessage::OnDisconnectPut {
                    request_id: 2,
                    path: "/presence/bob".into(),
                    data: json!(false),
                },
            )
            .unwrap();
        server
            .handle_message(
                leaver.id,
                ClientMessage::OnDisconnectCancel {
                    request_id: 3,
                    path: "/presence/bob".into(),
                },
            )
            .unwrap();
        assert_eq!(server.value("/presence/ada").unwrap(), json!(true));

        server.close_session(leaver.id);
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.value("/presence").unwrap(), Json::Null);
        assert_eq!(watcher.take(), vec![data("/presence/ada", Json::Null)]);
    }

    #[test]
    fn rule_change_revokes_listens() {
        let server = TreeServer::new(ServerConfig::default());
        let client = connect(&server, None);
        listen(&server, &client, "/secret/x");
        listen(&server, &client, "/public");
        client.take();

        server.set_rules(Rules::open().deny_read("secret"));
        assert_eq!(
            client.take(),
            vec![ServerMessage::ListenRevoked {
                path: "/secret/x".into(),
                query: "default".into(),
                reason: "permission_denied".into(),
            }]
        );
        assert_eq!(server.listen_count(client.id), 1);
    }

    #[test]
    fn auth_required() {
        let server = TreeServer::new(ServerConfig::default().with_auth(b"secret-key".to_vec()));
        let (response, id) = server.open_session(
            &HandshakeRequest::new("anon", None),
            Arc::new(|_: ServerMessage| {}),
        );
        assert!(!response.success);
        assert!(id.is_none());

        let token = server.issue_token([1; 16]).unwrap();
        let client = connect(&server, Some(token));
        server.handle_message(client.id, put("/a", json!(1))).unwrap();
        assert_eq!(client.take(), vec![ServerMessage::ok(1)]);
    }

    #[test]
    fn revoked_auth_blocks_requests() {
        let server = TreeServer::new(ServerConfig::default().with_auth(b"secret-key".to_vec()));
        let client = connect(&server, Some(server.issue_token([1; 16]).unwrap()));
        server.revoke_auth("token_revoked");
        assert_eq!(
            client.take(),
            vec![ServerMessage::AuthRevoked {
                reason: "token_revoked".into()
            }]
        );
        server.handle_message(client.id, put("/a", json!(1))).unwrap();
        assert!(matches!(
            client.take().as_slice(),
            [ServerMessage::Ack {
                status: AckStatus::PermissionDenied,
                ..
            }]
        ));
    }

    #[test]
    fn version_mismatch_is_refused() {
        let server = TreeServer::new(ServerConfig::default());
        let mut request = HandshakeRequest::new("old", None);
        request.protocol_version = 99;
        let (response, id) = server.open_session(&request, Arc::new(|_: ServerMessage| {}));
        assert!(!response.success);
        assert!(id.is_none());
    }

    #[test]
    fn unknown_session() {
        let server = TreeServer::new(ServerConfig::default());
        assert!(matches!(
            server.handle_message(42, put("/a", json!(1))),
            Err(ServerError::UnknownSession(42))
        ));
    }

    #[test]
    fn server_values_resolve_on_write() {
        let server = TreeServer::new(ServerConfig::default());
        let client = connect(&server, None);
        server
            .handle_message(client.id, put("/t", json!({".sv": "timestamp"})))
            .unwrap();
        assert!(server.value("/t").unwrap().as_f64().unwrap() > 0.0);
    }
}
