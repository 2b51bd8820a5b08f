//! Request handlers for client messages.
//!
//! A [`RequestHandler`] borrows the server state for the duration of one
//! message and records every outgoing message instead of sending it, so the
//! caller can release its lock before any sink runs.

use crate::auth::TokenClaims;
use crate::error::{ServerError, ServerResult};
use crate::rules::Rules;
use canopy_core::{Node, Path, Priority, ServerValues, WriteOp, PRIORITY_KEY};
use canopy_sync_protocol::{AckStatus, ClientMessage, ServerMessage};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifies an open session.
pub type SessionId = u64;

/// Receives messages pushed to one session.
pub type SessionSink = Arc<dyn Fn(ServerMessage) + Send + Sync>;

/// A message waiting to be delivered.
pub(crate) type Outgoing = (SessionSink, ServerMessage);

/// A write queued to run when its session ends.
#[derive(Debug, Clone)]
enum DisconnectWrite {
    Put(Json),
    Merge(Json),
}

#[derive(Debug, Clone)]
struct DisconnectAction {
    path: Path,
    write: DisconnectWrite,
}

/// A subscription held by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Listen {
    pub path: Path,
    pub query: String,
}

/// State kept per session.
pub(crate) struct Session {
    pub sink: SessionSink,
    pub claims: Option<TokenClaims>,
    pub listens: Vec<Listen>,
    on_disconnect: Vec<DisconnectAction>,
}

impl Session {
    pub fn new(sink: SessionSink, claims: Option<TokenClaims>) -> Self {
        Self {
            sink,
            claims,
            listens: Vec::new(),
            on_disconnect: Vec::new(),
        }
    }
}

/// Everything the server holds.
pub(crate) struct ServerState {
    pub root: Node,
    pub sessions: BTreeMap<SessionId, Session>,
    pub rules: Rules,
    pub require_auth: bool,
    pub auth_not_before: u64,
    pub next_session: SessionId,
}

impl ServerState {
    pub fn new(rules: Rules, require_auth: bool) -> Self {
        Self {
            root: Node::empty(),
            sessions: BTreeMap::new(),
            rules,
            require_auth,
            auth_not_before: 0,
            next_session: 1,
        }
    }
}

/// Handler for one batch of server work.
pub(crate) struct RequestHandler<'a> {
    state: &'a mut ServerState,
    values: ServerValues,
    outgoing: Vec<Outgoing>,
}

impl<'a> RequestHandler<'a> {
    /// Creates a handler resolving server values against the local clock.
    pub fn new(state: &'a mut ServerState) -> Self {
        Self {
            state,
            values: ServerValues::now(),
            outgoing: Vec::new(),
        }
    }

    /// Returns the messages to deliver, in order.
    pub fn finish(self) -> Vec<Outgoing> {
        self.outgoing
    }

    /// Handles a client message.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownSession`] if the session is not open.
    /// Request level failures are reported to the client as acknowledgments.
    pub fn handle(&mut self, session: SessionId, message: ClientMessage) -> ServerResult<()> {
        if !self.state.sessions.contains_key(&session) {
            return Err(ServerError::UnknownSession(session));
        }
        let Some(request_id) = message.request_id() else {
            if let ClientMessage::Unlisten { path, query } = message {
                self.handle_unlisten(session, &path, &query);
            }
            return Ok(());
        };

        let status = match self.dispatch(session, message) {
            Ok(status) => status,
            Err(ServerError::PermissionDenied(path)) => {
                tracing::debug!(session, %path, "request denied by rules");
                AckStatus::PermissionDenied
            }
            Err(e) => {
                tracing::debug!(session, error = %e, "request failed");
                AckStatus::Error {
                    message: e.to_string(),
                }
            }
        };
        self.send(session, ServerMessage::Ack { request_id, status });
        Ok(())
    }

    fn dispatch(&mut self, session: SessionId, message: ClientMessage) -> ServerResult<AckStatus> {
        if self.state.require_auth
            && self
                .state
                .sessions
                .get(&session)
                .is_some_and(|s| s.claims.is_none())
        {
            return Err(ServerError::PermissionDenied(message.path().to_string()));
        }

        match message {
            ClientMessage::Listen { path, query, .. } => {
                let path = Path::parse(&path)?;
                self.check_read(&path)?;
                let data = self.state.root.get(&path).export();
                if let Some(s) = self.state.sessions.get_mut(&session) {
                    let listen = Listen {
                        path: path.clone(),
                        query,
                    };
                    if !s.listens.contains(&listen) {
                        s.listens.push(listen);
                    }
                }
                self.send(
                    session,
                    ServerMessage::Data {
                        path: path.to_string(),
                        data,
                        merge: false,
                    },
                );
                Ok(AckStatus::Ok)
            }
            ClientMessage::Put {
                path, data, hash, ..
            } => {
                let path = Path::parse(&path)?;
                self.check_write(&path)?;
                if let Some(expected) = hash {
                    let current = self.state.root.get(&path);
                    if current.hash() != expected {
                        return Ok(AckStatus::DataStale {
                            current: current.export(),
                        });
                    }
                }
                let node = Node::from_json_with(&data, &self.values)?;
                self.apply(&path, vec![(path.clone(), WriteOp::Overwrite(node))], false);
                Ok(AckStatus::Ok)
            }
            ClientMessage::Merge { path, data, .. } => {
                let path = Path::parse(&path)?;
                let changes = parse_merge(&path, &data, &self.values)?;
                for (target, _) in &changes {
                    self.check_write(target)?;
                }
                let merge_form = !changes
                    .iter()
                    .any(|(_, op)| matches!(op, WriteOp::Priority(_)));
                self.apply(&path, changes, merge_form);
                Ok(AckStatus::Ok)
            }
            ClientMessage::OnDisconnectPut { path, data, .. } => {
                let path = Path::parse(&path)?;
                self.check_write(&path)?;
                Node::from_json_with(&data, &self.values)?;
                self.queue_disconnect(session, path, DisconnectWrite::Put(data));
                Ok(AckStatus::Ok)
            }
            ClientMessage::OnDisconnectMerge { path, data, .. } => {
                let path = Path::parse(&path)?;
                for (target, _) in parse_merge(&path, &data, &self.values)? {
                    self.check_write(&target)?;
                }
                self.queue_disconnect(session, path, DisconnectWrite::Merge(data));
                Ok(AckStatus::Ok)
            }
            ClientMessage::OnDisconnectCancel { path, .. } => {
                let path = Path::parse(&path)?;
                if let Some(s) = self.state.sessions.get_mut(&session) {
                    s.on_disconnect.retain(|a| !path.is_ancestor_of(&a.path));
                }
                Ok(AckStatus::Ok)
            }
            ClientMessage::Unlisten { .. } => Ok(AckStatus::Ok),
        }
    }

    fn handle_unlisten(&mut self, session: SessionId, path: &str, query: &str) {
        let Ok(path) = Path::parse(path) else {
            return;
        };
        if let Some(s) = self.state.sessions.get_mut(&session) {
            s.listens.retain(|l| !(l.path == path && l.query == query));
        }
    }

    fn queue_disconnect(&mut self, session: SessionId, path: Path, write: DisconnectWrite) {
        if let Some(s) = self.state.sessions.get_mut(&session) {
            s.on_disconnect.push(DisconnectAction { path, write });
        }
    }

    /// Runs and drops the disconnect actions of a session that is closing.
    pub fn run_disconnect(&mut self, mut session: Session) {
        for action in std::mem::take(&mut session.on_disconnect) {
            let changes = match &action.write {
                DisconnectWrite::Put(data) => Node::from_json_with(data, &self.values)
                    .map(|node| vec![(action.path.clone(), WriteOp::Overwrite(node))])
                    .map_err(ServerError::from),
                DisconnectWrite::Merge(data) => parse_merge(&action.path, data, &self.values),
            };
            match changes {
                Ok(changes) => {
                    let merge_form = matches!(action.write, DisconnectWrite::Merge(_))
                        && !changes
                            .iter()
                            .any(|(_, op)| matches!(op, WriteOp::Priority(_)));
                    tracing::debug!(path = %action.path, "running disconnect action");
                    self.apply(&action.path, changes, merge_form);
                }
                Err(e) => tracing::warn!(path = %action.path, error = %e, "disconnect action failed"),
            }
        }
    }

    /// Replaces the value at `path` on behalf of the server itself.
    pub fn set_value(&mut self, path: &Path, data: &Json) -> ServerResult<()> {
        let node = Node::from_json_with(data, &self.values)?;
        self.apply(path, vec![(path.clone(), WriteOp::Overwrite(node))], false);
        Ok(())
    }

    /// Drops listens that the current rules no longer allow.
    pub fn revoke_unreadable(&mut self) {
        let rules = self.state.rules.clone();
        let mut revoked = Vec::new();
        for (id, session) in &mut self.state.sessions {
            session.listens.retain(|listen| {
                let allowed = rules.can_read(&listen.path);
                if !allowed {
                    revoked.push((*id, listen.clone()));
                }
                allowed
            });
        }
        for (id, listen) in revoked {
            tracing::info!(session = id, path = %listen.path, "listen revoked");
            self.send(
                id,
                ServerMessage::ListenRevoked {
                    path: listen.path.to_string(),
                    query: listen.query,
                    reason: "permission_denied".into(),
                },
            );
        }
    }

    /// Invalidates every session credential and every token issued so far.
    pub fn revoke_auth(&mut self, reason: &str) {
        self.state.auth_not_before = crate::auth::now_millis();
        let ids: Vec<SessionId> = self
            .state
            .sessions
            .iter_mut()
            .filter_map(|(id, s)| s.claims.take().map(|_| *id))
            .collect();
        for id in ids {
            self.send(
                id,
                ServerMessage::AuthRevoked {
                    reason: reason.to_string(),
                },
            );
        }
    }

    fn check_read(&self, path: &Path) -> ServerResult<()> {
        if self.state.rules.can_read(path) {
            Ok(())
        } else {
            Err(ServerError::PermissionDenied(path.to_string()))
        }
    }

    fn check_write(&self, path: &Path) -> ServerResult<()> {
        if self.state.rules.can_write(path) {
            Ok(())
        } else {
            Err(ServerError::PermissionDenied(path.to_string()))
        }
    }

    /// Applies `changes` written at `path` and notifies overlapping listens.
    ///
    /// Listens at or above `path` receive one message for `path`; listens
    /// beneath it receive their own location. A session never receives the
    /// same location twice for one write.
    fn apply(&mut self, path: &Path, changes: Vec<(Path, WriteOp)>, merge_form: bool) {
        let mut root = self.state.root.clone();
        for (target, op) in &changes {
            root = op.apply(&root, target);
        }
        self.state.root = root;

        let at_path = if merge_form {
            let mut map = Map::new();
            for (target, _) in &changes {
                if let Some(rel) = Path::relative(path, target) {
                    map.insert(
                        rel.segments().join("/"),
                        self.state.root.get(target).export(),
                    );
                }
            }
            ServerMessage::Data {
                path: path.to_string(),
                data: Json::Object(map),
                merge: true,
            }
        } else {
            ServerMessage::Data {
                path: path.to_string(),
                data: self.state.root.get(path).export(),
                merge: false,
            }
        };

        let mut pending = Vec::new();
        for (id, session) in &self.state.sessions {
            let mut sent: Vec<&Path> = Vec::new();
            for listen in &session.listens {
                if listen.path.is_ancestor_of(path) {
                    if !sent.contains(&path) {
                        sent.push(path);
                        pending.push((Arc::clone(&session.sink), at_path.clone()));
                    }
                } else if changes.iter().any(|(t, _)| t.overlaps(&listen.path))
                    && !sent.contains(&&listen.path)
                {
                    sent.push(&listen.path);
                    pending.push((
                        Arc::clone(&session.sink),
                        ServerMessage::Data {
                            path: listen.path.to_string(),
                            data: self.state.root.get(&listen.path).export(),
                            merge: false,
                        },
                    ));
                }
            }
            if !sent.is_empty() {
                tracing::trace!(session = id, path = %path, "broadcast");
            }
        }
        self.outgoing.extend(pending);
    }

    fn send(&mut self, session: SessionId, message: ServerMessage) {
        if let Some(s) = self.state.sessions.get(&session) {
            self.outgoing.push((Arc::clone(&s.sink), message));
        }
    }
}

/// Parses a merge payload written at `path` into absolute changes.
///
/// Keys are relative paths; the key `.priority` replaces the priority at
/// `path` itself.
fn parse_merge(path: &Path, data: &Json, values: &ServerValues) -> ServerResult<Vec<(Path, WriteOp)>> {
    let Json::Object(map) = data else {
        return Err(ServerError::InvalidRequest("merge data must be an object".into()));
    };
    let mut changes: Vec<(Path, WriteOp)> = Vec::with_capacity(map.len());
    for (key, value) in map {
        if key == PRIORITY_KEY {
            changes.push((path.clone(), WriteOp::Priority(Priority::from_json(value)?)));
            continue;
        }
        let target = path.child_path(key)?;
        if target == *path {
            return Err(ServerError::InvalidRequest(format!(
                "merge key {key:?} names no child"
            )));
        }
        changes.push((target, WriteOp::Overwrite(Node::from_json_with(value, values)?)));
    }
    Ok(changes)
}
