//! The database service object.
//!
//! All cache mutation goes through `transact`: one change at a
//! time, repo lock before facade lock, events fired once both locks are
//! released, completions resolved after the events.

use crate::auth::TokenProvider;
use crate::config::{host_of, DatabaseConfig};
use crate::connection::{Completer, ConnectionFacade, ConnectionState, Request, WireWrite};
use crate::error::{SyncError, SyncResult};
use crate::event_queue::EventQueue;
use crate::reference::Reference;
use crate::transport::{InboundEvent, InboundSink, Transport};
use canopy_core::{
    AckOutcome, CoreError, Dispatch, Event, EventRouter, EventType, ListenOptions, ListenerHandle,
    Node, Path, PersistenceStore, PushIdGenerator, QueryKey, QuerySpec, ServerValues, SyncTree,
    WriteId, WriteKind, WriteRecord,
};
use canopy_sync_protocol::{AckStatus, ServerMessage};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Cache plus the listeners reading it.
pub(crate) struct Repo {
    pub tree: SyncTree,
    pub router: EventRouter,
}

/// What one serialized change produced.
pub(crate) struct Step<R> {
    value: R,
    dispatches: Vec<Dispatch>,
    resolved: Vec<(Completer, SyncResult<()>)>,
}

impl<R> Step<R> {
    fn new(value: R) -> Self {
        Self {
            value,
            dispatches: Vec::new(),
            resolved: Vec::new(),
        }
    }

    fn with_dispatches(mut self, dispatches: Vec<Dispatch>) -> Self {
        self.dispatches.extend(dispatches);
        self
    }

    fn resolve(&mut self, completer: Completer, result: SyncResult<()>) {
        self.resolved.push((completer, result));
    }
}

struct DatabaseInner {
    config: DatabaseConfig,
    repo: Mutex<Repo>,
    facade: Mutex<ConnectionFacade>,
    inbound: Arc<InboundSink>,
    events: EventQueue,
    push_ids: PushIdGenerator,
    deleted: AtomicBool,
}

/// A client-side realtime tree database.
///
/// Cheap to clone; clones share the cache, listeners and connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.inner.config.database_url)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl Database {
    /// Starts building a database for `config`.
    pub fn builder(config: DatabaseConfig) -> DatabaseBuilder {
        DatabaseBuilder::new(config)
    }

    /// The configuration in use.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Reference to the root location.
    pub fn root(&self) -> Reference {
        Reference::new(self.clone(), Path::root())
    }

    /// Reference to `path`; the root when `path` is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment is malformed.
    pub fn reference(&self, path: &str) -> SyncResult<Reference> {
        Ok(Reference::new(self.clone(), Path::parse(path)?))
    }

    /// Reference to the location a full URL names.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] if the URL names another
    /// host or namespace, or a malformed path.
    pub fn reference_from_url(&self, url: &str) -> SyncResult<Reference> {
        let host = host_of(url);
        if !host.eq_ignore_ascii_case(self.inner.config.host()) {
            return Err(CoreError::invalid_argument(format!(
                "url host {host} does not match database {}",
                self.inner.config.host()
            ))
            .into());
        }
        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        let Some(after_host) = rest.strip_prefix(host) else {
            return Err(CoreError::invalid_argument(format!("malformed url {url}")).into());
        };
        let after_host = after_host.split('#').next().unwrap_or_default();
        let (path, query) = after_host.split_once('?').unwrap_or((after_host, ""));
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            if let Some(("ns", namespace)) = pair.split_once('=') {
                if namespace != self.inner.config.namespace {
                    return Err(CoreError::invalid_argument(format!(
                        "url namespace {namespace} does not match {}",
                        self.inner.config.namespace
                    ))
                    .into());
                }
            }
        }
        self.reference(path)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.facade.lock().state()
    }

    /// Estimated server clock minus local clock, in milliseconds.
    pub fn server_time_offset(&self) -> i64 {
        self.inner.repo.lock().tree.server_time_offset()
    }

    /// Writes submitted but not yet acknowledged by the server.
    pub fn outstanding_writes(&self) -> usize {
        self.inner.facade.lock().outstanding_writes()
    }

    /// Opens a session and replays queued state.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached or refuses the
    /// credential. The database keeps trying from [`Database::run`].
    pub fn go_online(&self) -> SyncResult<()> {
        self.ensure_live()?;
        self.transact(|repo, facade| {
            let offset = facade.connect()?;
            repo.tree.set_server_time_offset(offset);
            Ok(Step::new(()))
        })
    }

    /// Closes the session. Writes keep applying locally and queue for the
    /// next [`Database::go_online`].
    pub fn go_offline(&self) {
        info!("going offline");
        self.inner.facade.lock().go_offline();
    }

    /// Detaches every listener, fails pending operations with
    /// [`SyncError::DatabaseDeleted`], and severs the connection.
    pub fn delete(&self) {
        if self.inner.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        let completers = self.inner.events.serialize(|| {
            let mut repo = self.inner.repo.lock();
            let mut facade = self.inner.facade.lock();
            repo.router.clear();
            let abandoned = repo.tree.abandon_all();
            debug!(abandoned = abandoned.len(), "pending writes abandoned");
            (facade.shutdown(), Vec::new())
        });
        for completer in completers {
            let _ = completer.send(Err(SyncError::DatabaseDeleted));
        }
        self.inner.inbound.wake();
        info!(url = %self.inner.config.database_url, "database deleted");
    }

    /// True once [`Database::delete`] has run.
    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::SeqCst)
    }

    /// Processes every queued inbound event. Returns how many were handled.
    pub fn pump(&self) -> usize {
        let (handled, reconnect) = self.inner.events.serialize(|| {
            let mut handled = 0;
            let mut reconnect = false;
            while let Some(event) = self.inner.inbound.pop() {
                handled += 1;
                reconnect |= self.handle_inbound(event);
            }
            ((handled, reconnect), Vec::new())
        });
        if reconnect && !self.is_deleted() {
            if let Err(e) = self.reconnect() {
                debug!(error = %e, "immediate reconnect failed");
            }
        }
        handled
    }

    /// Drives inbound processing and reconnects with backoff until the
    /// database is deleted.
    pub async fn run(&self) {
        let mut attempt = 0u32;
        loop {
            self.pump();
            if self.is_deleted() {
                break;
            }
            let needs_reconnect = self.inner.facade.lock().needs_reconnect();
            if !needs_reconnect {
                attempt = 0;
                self.inner.inbound.notified().await;
                continue;
            }
            let retry = &self.inner.config.reconnect;
            if attempt >= retry.max_attempts {
                warn!(attempts = attempt, "reconnect attempts exhausted");
                attempt = 0;
                self.inner.inbound.notified().await;
                continue;
            }
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            attempt += 1;
            if let Err(e) = self.reconnect() {
                debug!(attempt, error = %e, "reconnect failed");
            }
        }
        debug!("inbound loop stopped");
    }

    fn reconnect(&self) -> SyncResult<()> {
        if !self.inner.facade.lock().needs_reconnect() {
            return Ok(());
        }
        self.go_online()
    }

    fn ensure_live(&self) -> SyncResult<()> {
        if self.is_deleted() {
            return Err(SyncError::DatabaseDeleted);
        }
        Ok(())
    }

    /// Runs one serialized change.
    fn transact<R>(
        &self,
        change: impl FnOnce(&mut Repo, &mut ConnectionFacade) -> SyncResult<Step<R>>,
    ) -> SyncResult<R> {
        let (result, resolved) = self.inner.events.serialize(|| {
            let mut repo = self.inner.repo.lock();
            let mut facade = self.inner.facade.lock();
            match change(&mut repo, &mut facade) {
                Ok(step) => {
                    let active = repo.router.active_queries();
                    let listened = active.iter().map(|q| q.path.clone()).collect();
                    if let Err(e) = repo.tree.set_listened(listened) {
                        warn!(error = %e, "failed to drop unlistened cache");
                    }
                    facade.reconcile_listens(active);
                    ((Ok(step.value), step.resolved), step.dispatches)
                }
                Err(e) => ((Err(e), Vec::new()), Vec::new()),
            }
        });
        for (completer, outcome) in resolved {
            let _ = completer.send(outcome);
        }
        result
    }

    pub(crate) fn now_millis(&self) -> i64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        local + self.server_time_offset()
    }

    pub(crate) fn push_key(&self) -> String {
        self.inner.push_ids.generate(self.now_millis())
    }

    /// Reads the merged value at `path`, or the server value when
    /// `include_pending` is false.
    pub(crate) fn read_node(&self, path: &Path, include_pending: bool) -> Node {
        let repo = self.inner.repo.lock();
        if include_pending {
            repo.tree.read(path)
        } else {
            repo.tree.read_server(path)
        }
    }

    /// Records a local write and queues it for the server.
    pub(crate) fn submit_write(
        &self,
        path: &Path,
        kind: WriteKind,
        payload: Json,
        expected_hash: Option<String>,
        apply_locally: bool,
    ) -> SyncResult<(WriteId, WriteFuture)> {
        self.ensure_live()?;
        let (tx, rx) = oneshot::channel();
        let id = self.transact(|repo, facade| {
            let write = repo
                .tree
                .submit(path, kind, payload, expected_hash, apply_locally)?;
            let dispatches = repo.router.notify(&repo.tree, &write.affected_paths());
            facade.enqueue_write(&write.record, Some(tx));
            Ok(Step::new(write.id()).with_dispatches(dispatches))
        })?;
        Ok((id, Completion::new(self.clone(), rx)))
    }

    pub(crate) fn listen(
        &self,
        query: QuerySpec,
        options: ListenOptions,
        once: bool,
    ) -> SyncResult<ListenerHandle> {
        self.ensure_live()?;
        self.transact(|repo, _| {
            let registered = repo.router.register(&repo.tree, query, options, once);
            Ok(Step::new(registered.handle).with_dispatches(registered.initial))
        })
    }

    pub(crate) fn unlisten(
        &self,
        query: &QuerySpec,
        event_type: Option<EventType>,
        handle: Option<&ListenerHandle>,
    ) -> SyncResult<()> {
        self.transact(|repo, _| {
            let emptied = repo.router.unregister(query, event_type, handle);
            debug!(emptied = emptied.len(), "queries without listeners");
            Ok(Step::new(()))
        })
    }

    pub(crate) fn listen_once(&self, query: QuerySpec, event_type: EventType) -> SyncResult<OnceFuture> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let data_slot = Arc::clone(&slot);
        let options = ListenOptions::new(event_type, move |event: &Event| {
            if let Some(tx) = data_slot.lock().take() {
                let _ = tx.send(Ok(event.clone()));
            }
        })
        .with_cancel(move |error: &CoreError| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(Err(SyncError::from(error.clone())));
            }
        });
        self.listen(query, options, true)?;
        Ok(Completion::new(self.clone(), rx))
    }

    pub(crate) fn queue_disconnect(
        &self,
        path: &Path,
        kind: WriteKind,
        payload: Json,
    ) -> SyncResult<WriteFuture> {
        self.ensure_live()?;
        let record = WriteRecord {
            id: WriteId(0),
            path: path.clone(),
            kind,
            payload,
            expected_hash: None,
            apply_locally: false,
        };
        record.resolve(&ServerValues::now())?;
        let (tx, rx) = oneshot::channel();
        self.inner
            .facade
            .lock()
            .queue_disconnect(record.path.clone(), WireWrite::from_record(&record), tx);
        Ok(Completion::new(self.clone(), rx))
    }

    pub(crate) fn cancel_disconnect(&self, path: &Path) -> SyncResult<WriteFuture> {
        self.ensure_live()?;
        let (tx, rx) = oneshot::channel();
        self.inner.facade.lock().cancel_disconnect(path, tx);
        Ok(Completion::new(self.clone(), rx))
    }

    fn handle_inbound(&self, event: InboundEvent) -> bool {
        match event {
            InboundEvent::ConnectionLost => {
                self.inner.facade.lock().connection_lost();
                true
            }
            InboundEvent::Message(ServerMessage::AuthRevoked { reason }) => {
                warn!(%reason, "credential revoked");
                self.inner.facade.lock().auth_revoked();
                true
            }
            InboundEvent::Message(message) => {
                if let Err(e) = self.handle_message(message) {
                    warn!(error = %e, "failed to apply server message");
                }
                false
            }
        }
    }

    fn handle_message(&self, message: ServerMessage) -> SyncResult<()> {
        match message {
            ServerMessage::Ack { request_id, status } => self.handle_ack(request_id, status),
            ServerMessage::Data { path, data, merge } => self.handle_data(&path, data, merge),
            ServerMessage::ListenRevoked {
                path,
                query,
                reason,
            } => {
                let path = Path::parse(&path)?;
                let key = QueryKey::new(path.clone(), query);
                self.transact(|repo, facade| {
                    facade.forget_listen(&key);
                    let error = CoreError::StaleListenerCancelled {
                        path: path.to_string(),
                        reason,
                    };
                    Ok(Step::new(()).with_dispatches(repo.router.cancel_query(&key, error)))
                })
            }
            ServerMessage::AuthRevoked { .. } => Ok(()),
        }
    }

    fn handle_ack(&self, request_id: u64, status: AckStatus) -> SyncResult<()> {
        self.transact(|repo, facade| {
            let mut step = Step::new(());
            let Some(request) = facade.take_request(request_id) else {
                debug!(request_id, "acknowledgment for unknown request");
                return Ok(step);
            };
            match request {
                Request::Write(id) => {
                    let path = repo.tree.pending_write(id).map(|w| w.path().clone());
                    let shown = path.as_ref().map(Path::to_string).unwrap_or_default();
                    let (outcome, result) = match status {
                        AckStatus::Ok => (AckOutcome::Applied, Ok(())),
                        AckStatus::DataStale { current } => {
                            if let Some(path) = &path {
                                repo.tree.apply_server_update(path, Node::from_json(&current)?)?;
                            }
                            (AckOutcome::Rejected, Err(SyncError::DataStale { path: shown }))
                        }
                        AckStatus::PermissionDenied => (
                            AckOutcome::Rejected,
                            Err(SyncError::PermissionDenied { path: shown }),
                        ),
                        AckStatus::Error { message } => {
                            (AckOutcome::Rejected, Err(SyncError::ServerError(message)))
                        }
                    };
                    if let Err(e) = &result {
                        debug!(write_id = %id, error = %e, "write rejected");
                    }
                    if let Some(write) = repo.tree.acknowledge(id, outcome)? {
                        let dispatches = repo.router.notify(&repo.tree, &write.affected_paths());
                        step = step.with_dispatches(dispatches);
                    }
                    if let Some(completer) = facade.finish_write(id) {
                        step.resolve(completer, result);
                    }
                }
                Request::Listen(key) => {
                    if !status.is_ok() {
                        warn!(query = %key, ?status, "listen refused");
                        facade.forget_listen(&key);
                        let path = key.path.to_string();
                        let dispatches = repo
                            .router
                            .cancel_query(&key, CoreError::PermissionDenied { path });
                        step = step.with_dispatches(dispatches);
                    }
                }
                other => {
                    let result = match status {
                        AckStatus::Ok => Ok(()),
                        AckStatus::PermissionDenied => Err(SyncError::PermissionDenied {
                            path: String::new(),
                        }),
                        AckStatus::DataStale { .. } => Err(SyncError::ServerError(
                            "unexpected precondition failure".to_string(),
                        )),
                        AckStatus::Error { message } => Err(SyncError::ServerError(message)),
                    };
                    facade.finish_op(&other, result);
                }
            }
            Ok(step)
        })
    }

    fn handle_data(&self, path: &str, data: Json, merge: bool) -> SyncResult<()> {
        let path = Path::parse(path)?;
        self.transact(|repo, _| {
            let changed = if merge {
                let Json::Object(map) = data else {
                    return Err(CoreError::invalid_argument("merge data must be an object").into());
                };
                let mut entries = Vec::with_capacity(map.len());
                let mut changed = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let relative = Path::parse(&key)?;
                    changed.push(path.join(&relative));
                    entries.push((relative, Node::from_json(&value)?));
                }
                repo.tree.apply_server_merge(&path, entries)?;
                changed
            } else {
                repo.tree.apply_server_update(&path, Node::from_json(&data)?)?;
                vec![path.clone()]
            };
            Ok(Step::new(()).with_dispatches(repo.router.notify(&repo.tree, &changed)))
        })
    }
}

/// Future resolved when the server settles an operation.
///
/// Polling also processes queued inbound messages, so awaiting a
/// completion is enough to drive the database when nothing else calls
/// [`Database::pump`].
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<T> {
    db: Database,
    rx: oneshot::Receiver<SyncResult<T>>,
}

/// Completion of a write.
pub type WriteFuture = Completion<()>;

/// Completion of a `once` listener.
pub type OnceFuture = Completion<Event>;

impl<T> Completion<T> {
    fn new(db: Database, rx: oneshot::Receiver<SyncResult<T>>) -> Self {
        Self { db, rx }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl<T> Future for Completion<T> {
    type Output = SyncResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.db.inner.inbound.register_waker(cx.waker());
        self.db.pump();
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SyncError::DatabaseDeleted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Assembles a [`Database`] from its collaborators.
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    transport: Option<Arc<dyn Transport>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    persistence: Option<Box<dyn PersistenceStore>>,
    connect: bool,
}

impl DatabaseBuilder {
    /// Starts from `config`.
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            transport: None,
            tokens: None,
            persistence: None,
            connect: true,
        }
    }

    /// Sets the transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the auth collaborator.
    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Sets the persistence collaborator.
    pub fn persistence(mut self, store: Box<dyn PersistenceStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Starts offline instead of connecting in [`DatabaseBuilder::build`].
    pub fn start_offline(mut self) -> Self {
        self.connect = false;
        self
    }

    /// Builds the database, rehydrating persisted state and connecting
    /// unless told otherwise. A failed first connect is retried from
    /// [`Database::run`].
    ///
    /// # Errors
    ///
    /// Returns an error if no transport was given or persisted state cannot
    /// be decoded.
    pub fn build(self) -> SyncResult<Database> {
        let transport = self
            .transport
            .ok_or_else(|| CoreError::invalid_argument("a transport is required"))?;
        let tree = match self.persistence {
            Some(store) => SyncTree::with_persistence(store)?,
            None => SyncTree::new(),
        };
        let inbound = Arc::new(InboundSink::new());
        let mut facade = ConnectionFacade::new(
            transport,
            Arc::clone(&inbound),
            self.tokens,
            self.config.protocol_version,
        );
        for write in tree.pending_writes() {
            facade.enqueue_write(&write.record, None);
        }
        if !tree.pending_writes().is_empty() {
            info!(writes = tree.pending_writes().len(), "re-queued persisted writes");
        }
        let db = Database {
            inner: Arc::new(DatabaseInner {
                config: self.config,
                repo: Mutex::new(Repo {
                    tree,
                    router: EventRouter::new(),
                }),
                facade: Mutex::new(facade),
                inbound,
                events: EventQueue::new(),
                push_ids: PushIdGenerator::new(),
                deleted: AtomicBool::new(false),
            }),
        };
        if self.connect {
            if let Err(e) = db.go_online() {
                warn!(error = %e, "initial connect failed");
            }
        }
        Ok(db)
    }
}
