//! Connection facade: the boundary between the cache and the transport.
//!
//! Tracks what the server must know about this client (outstanding
//! writes, listens, disconnect actions) and replays it on every
//! (re)connect. It never touches the cache; the database applies what
//! comes back.

use crate::auth::TokenProvider;
use crate::error::{SyncError, SyncResult};
use crate::transport::{InboundSink, Transport};
use canopy_core::{Path, QueryKey, QuerySpec, WriteId, WriteKind, WriteRecord, PRIORITY_KEY};
use canopy_sync_protocol::{ClientMessage, HandshakeRequest};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session. Writes queue locally.
    Offline,
    /// Handshake in progress.
    Connecting,
    /// Session open.
    Online,
}

/// Resolves an operation's completion future.
pub(crate) type Completer = oneshot::Sender<SyncResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CompletionKey {
    Write(WriteId),
    Op(u64),
}

/// What an outstanding request id refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Write(WriteId),
    Listen(QueryKey),
    Disconnect(u64),
    Cancel(u64),
}

/// A mutation in wire form.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WireWrite {
    Put { data: Json, hash: Option<String> },
    Merge { data: Json },
}

impl WireWrite {
    pub fn from_record(record: &WriteRecord) -> Self {
        match record.kind {
            WriteKind::Set => WireWrite::Put {
                data: record.payload.clone(),
                hash: record.expected_hash.clone(),
            },
            WriteKind::Remove => WireWrite::Put {
                data: Json::Null,
                hash: record.expected_hash.clone(),
            },
            WriteKind::Update => WireWrite::Merge {
                data: record.payload.clone(),
            },
            WriteKind::SetPriority => {
                let mut map = Map::new();
                map.insert(PRIORITY_KEY.to_string(), record.payload.clone());
                WireWrite::Merge {
                    data: Json::Object(map),
                }
            }
        }
    }

    fn message(&self, request_id: u64, path: &Path) -> ClientMessage {
        let path = path.to_string();
        match self.clone() {
            WireWrite::Put { data, hash } => ClientMessage::Put {
                request_id,
                path,
                data,
                hash,
            },
            WireWrite::Merge { data } => ClientMessage::Merge {
                request_id,
                path,
                data,
            },
        }
    }

    fn disconnect_message(&self, request_id: u64, path: &Path) -> ClientMessage {
        let path = path.to_string();
        match self.clone() {
            WireWrite::Put { data, .. } => ClientMessage::OnDisconnectPut {
                request_id,
                path,
                data,
            },
            WireWrite::Merge { data } => ClientMessage::OnDisconnectMerge {
                request_id,
                path,
                data,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct OutboundWrite {
    id: WriteId,
    path: Path,
    wire: WireWrite,
}

#[derive(Debug, Clone)]
struct DisconnectEntry {
    op: u64,
    path: Path,
    wire: WireWrite,
}

fn listen_message(request_id: u64, query: &QuerySpec) -> ClientMessage {
    ClientMessage::Listen {
        request_id,
        path: query.path.to_string(),
        query: query.params.identifier(),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Client side of the session.
pub(crate) struct ConnectionFacade {
    transport: Arc<dyn Transport>,
    inbound: Arc<InboundSink>,
    tokens: Option<Arc<dyn TokenProvider>>,
    session_id: String,
    protocol_version: u16,
    state: ConnectionState,
    wants_online: bool,
    refresh_token: bool,
    server_time_offset: i64,
    next_request: u64,
    next_op: u64,
    requests: BTreeMap<u64, Request>,
    writes: Vec<OutboundWrite>,
    listens: BTreeMap<QueryKey, QuerySpec>,
    disconnect: Vec<DisconnectEntry>,
    completions: BTreeMap<CompletionKey, Completer>,
}

impl ConnectionFacade {
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: Arc<InboundSink>,
        tokens: Option<Arc<dyn TokenProvider>>,
        protocol_version: u16,
    ) -> Self {
        Self {
            transport,
            inbound,
            tokens,
            session_id: uuid::Uuid::new_v4().to_string(),
            protocol_version,
            state: ConnectionState::Offline,
            wants_online: false,
            refresh_token: false,
            server_time_offset: 0,
            next_request: 0,
            next_op: 0,
            requests: BTreeMap::new(),
            writes: Vec::new(),
            listens: BTreeMap::new(),
            disconnect: Vec::new(),
            completions: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True when the client should be online but is not.
    pub fn needs_reconnect(&self) -> bool {
        self.wants_online && self.state == ConnectionState::Offline
    }

    /// Opens a session, replays client state, and returns the server clock
    /// offset in milliseconds.
    pub fn connect(&mut self) -> SyncResult<i64> {
        self.wants_online = true;
        if self.state == ConnectionState::Online {
            return Ok(self.server_time_offset);
        }
        self.state = ConnectionState::Connecting;
        match self.handshake() {
            Ok(offset) => {
                self.state = ConnectionState::Online;
                self.refresh_token = false;
                self.server_time_offset = offset;
                self.restore();
                Ok(offset)
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.state = ConnectionState::Offline;
                Err(e)
            }
        }
    }

    fn handshake(&mut self) -> SyncResult<i64> {
        let mut force_refresh = self.refresh_token;
        loop {
            let auth_token = match &self.tokens {
                Some(provider) => provider.token(force_refresh)?,
                None => None,
            };
            let request = HandshakeRequest {
                session_id: self.session_id.clone(),
                auth_token,
                protocol_version: self.protocol_version,
            };
            let response = self
                .transport
                .connect(&request, Arc::clone(&self.inbound))?;
            if response.success {
                if response.protocol_version != self.protocol_version {
                    self.transport.disconnect();
                    return Err(SyncError::Protocol(format!(
                        "server speaks version {}, client {}",
                        response.protocol_version, self.protocol_version
                    )));
                }
                return Ok(response.server_time - now_millis());
            }
            let message = response
                .error
                .unwrap_or_else(|| "handshake refused".to_string());
            if self.tokens.is_some() && !force_refresh {
                debug!(%message, "handshake refused, refreshing token");
                force_refresh = true;
                continue;
            }
            return Err(SyncError::AuthenticationFailed(message));
        }
    }

    fn restore(&mut self) {
        let listens: Vec<QuerySpec> = self.listens.values().cloned().collect();
        for query in &listens {
            self.send_request(Request::Listen(query.key()), |id| listen_message(id, query));
        }
        let actions = self.disconnect.clone();
        for action in &actions {
            self.send_request(Request::Disconnect(action.op), |id| {
                action.wire.disconnect_message(id, &action.path)
            });
        }
        let writes = self.writes.clone();
        for write in &writes {
            self.send_request(Request::Write(write.id), |id| {
                write.wire.message(id, &write.path)
            });
        }
        info!(
            listens = listens.len(),
            disconnect_actions = actions.len(),
            writes = writes.len(),
            "session restored"
        );
    }

    /// Closes the session on request. Client state stays queued.
    pub fn go_offline(&mut self) {
        self.wants_online = false;
        self.transport.disconnect();
        self.mark_offline();
    }

    /// The transport reported the session gone.
    pub fn connection_lost(&mut self) {
        if self.state != ConnectionState::Offline {
            info!("connection lost");
        }
        self.mark_offline();
    }

    /// The server invalidated the session credential.
    pub fn auth_revoked(&mut self) {
        self.transport.disconnect();
        self.refresh_token = true;
        self.mark_offline();
    }

    fn mark_offline(&mut self) {
        self.state = ConnectionState::Offline;
        self.requests.clear();
    }

    fn send_request(&mut self, request: Request, build: impl FnOnce(u64) -> ClientMessage) {
        if self.state != ConnectionState::Online {
            return;
        }
        self.next_request += 1;
        let id = self.next_request;
        self.requests.insert(id, request);
        self.send(build(id));
    }

    fn send(&mut self, message: ClientMessage) {
        if self.state != ConnectionState::Online {
            return;
        }
        if let Err(e) = self.transport.send(&message) {
            warn!(error = %e, "send failed");
            self.mark_offline();
        }
    }

    /// Queues a write for the server, in submission order.
    pub fn enqueue_write(&mut self, record: &WriteRecord, completer: Option<Completer>) {
        let wire = WireWrite::from_record(record);
        if let Some(completer) = completer {
            self.completions
                .insert(CompletionKey::Write(record.id), completer);
        }
        self.writes.push(OutboundWrite {
            id: record.id,
            path: record.path.clone(),
            wire: wire.clone(),
        });
        self.send_request(Request::Write(record.id), |id| {
            wire.message(id, &record.path)
        });
    }

    /// Forgets a resolved write and returns its completer.
    pub fn finish_write(&mut self, id: WriteId) -> Option<Completer> {
        self.writes.retain(|w| w.id != id);
        self.completions.remove(&CompletionKey::Write(id))
    }

    /// Writes not yet acknowledged.
    pub fn outstanding_writes(&self) -> usize {
        self.writes.len()
    }

    /// Makes the server listens match `active`.
    pub fn reconcile_listens(&mut self, active: Vec<QuerySpec>) {
        let wanted: BTreeMap<QueryKey, QuerySpec> =
            active.into_iter().map(|q| (q.key(), q)).collect();
        let stale: Vec<QuerySpec> = self
            .listens
            .iter()
            .filter(|(key, _)| !wanted.contains_key(*key))
            .map(|(_, q)| q.clone())
            .collect();
        for query in stale {
            self.listens.remove(&query.key());
            debug!(query = %query, "unlisten");
            self.send(ClientMessage::Unlisten {
                path: query.path.to_string(),
                query: query.params.identifier(),
            });
        }
        for (key, query) in wanted {
            if self.listens.contains_key(&key) {
                continue;
            }
            debug!(query = %query, "listen");
            self.send_request(Request::Listen(key.clone()), |id| listen_message(id, &query));
            self.listens.insert(key, query);
        }
    }

    /// Drops a listen the server no longer serves.
    pub fn forget_listen(&mut self, key: &QueryKey) {
        self.listens.remove(key);
    }

    /// Keys of the listens the server knows about.
    #[cfg(test)]
    pub fn listen_keys(&self) -> Vec<QueryKey> {
        self.listens.keys().cloned().collect()
    }

    /// Queues a disconnect action.
    pub fn queue_disconnect(&mut self, path: Path, wire: WireWrite, completer: Completer) {
        self.next_op += 1;
        let op = self.next_op;
        self.completions.insert(CompletionKey::Op(op), completer);
        self.send_request(Request::Disconnect(op), |id| wire.disconnect_message(id, &path));
        self.disconnect.push(DisconnectEntry { op, path, wire });
    }

    /// Drops disconnect actions at and beneath `path`. Their completions
    /// fail with [`SyncError::Cancelled`].
    pub fn cancel_disconnect(&mut self, path: &Path, completer: Completer) {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.disconnect)
            .into_iter()
            .partition(|entry| path.is_ancestor_of(&entry.path));
        self.disconnect = kept;
        for entry in dropped {
            if let Some(pending) = self.completions.remove(&CompletionKey::Op(entry.op)) {
                let _ = pending.send(Err(SyncError::Cancelled {
                    path: entry.path.to_string(),
                }));
            }
        }
        if self.state != ConnectionState::Online {
            let _ = completer.send(Ok(()));
            return;
        }
        self.next_op += 1;
        let op = self.next_op;
        self.completions.insert(CompletionKey::Op(op), completer);
        self.send_request(Request::Cancel(op), |request_id| {
            ClientMessage::OnDisconnectCancel {
                request_id,
                path: path.to_string(),
            }
        });
    }

    /// Resolves a disconnect request. A refused action is dropped.
    pub fn finish_op(&mut self, request: &Request, result: SyncResult<()>) {
        let op = match request {
            Request::Disconnect(op) | Request::Cancel(op) => *op,
            Request::Write(_) | Request::Listen(_) => return,
        };
        if result.is_err() {
            self.disconnect.retain(|entry| entry.op != op);
        }
        if let Some(completer) = self.completions.remove(&CompletionKey::Op(op)) {
            let _ = completer.send(result);
        }
    }

    /// Number of queued disconnect actions.
    #[cfg(test)]
    pub fn disconnect_actions(&self) -> usize {
        self.disconnect.len()
    }

    /// Looks up and forgets an outstanding request.
    pub fn take_request(&mut self, request_id: u64) -> Option<Request> {
        self.requests.remove(&request_id)
    }

    /// Severs the session and returns every unresolved completer.
    pub fn shutdown(&mut self) -> Vec<Completer> {
        self.go_offline();
        self.writes.clear();
        self.listens.clear();
        self.disconnect.clear();
        std::mem::take(&mut self.completions).into_values().collect()
    }
}
