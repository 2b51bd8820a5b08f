//! Query and reference handles.
//!
//! A [`Reference`] is a [`Query`] with a location and the right to mutate
//! it. The capabilities are split into traits so that code needing only one
//! of them can say so:
//!
//! - [`QueryOps`]: ordering, bounds, limits and listening.
//! - [`Location`]: navigation.
//! - [`Mutation`]: writes and transactions.
//! - [`Disconnect`]: server-side disconnect actions.

use crate::database::{Database, OnceFuture, WriteFuture};
use crate::error::{SyncError, SyncResult};
use crate::on_disconnect::OnDisconnect;
use crate::transaction::{self, TransactionDecision, TransactionResult};
use canopy_core::{
    payload_with_priority, CoreError, CoreResult, EventType, Leaf, Limit, ListenOptions,
    ListenerHandle, OrderBy, Path, QueryParams, QuerySpec, WriteKind,
};
use serde_json::Value as Json;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::ops::Deref;
use std::pin::Pin;

/// Future returned by [`Mutation::transaction`].
pub type TransactionFuture = Pin<Box<dyn Future<Output = SyncResult<TransactionResult>> + Send>>;

fn bound_value(value: Json) -> SyncResult<Option<Leaf>> {
    if value.is_null() {
        return Ok(None);
    }
    Leaf::from_json(&value).map(Some).ok_or_else(|| {
        CoreError::invalid_argument("query bounds must be null, a boolean, a number or a string")
            .into()
    })
}

/// Ordering, filtering and listening.
pub trait QueryOps {
    /// The database this handle belongs to.
    fn database(&self) -> &Database;

    /// The location and parameters this handle observes.
    fn query_spec(&self) -> QuerySpec;

    /// Derives a query with adjusted parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`] if `adjust` rejects the
    /// combination.
    fn with_params<F>(&self, adjust: F) -> SyncResult<Query>
    where
        F: FnOnce(QueryParams) -> CoreResult<QueryParams>,
    {
        let spec = self.query_spec();
        Ok(Query {
            db: self.database().clone(),
            spec: QuerySpec::new(spec.path, adjust(spec.params)?),
        })
    }

    /// Orders children by key.
    ///
    /// # Errors
    ///
    /// Fails if an ordering is already set.
    fn order_by_key(&self) -> SyncResult<Query> {
        self.with_params(|p| p.with_order_by(OrderBy::Key))
    }

    /// Orders children by value.
    ///
    /// # Errors
    ///
    /// Fails if an ordering is already set.
    fn order_by_value(&self) -> SyncResult<Query> {
        self.with_params(|p| p.with_order_by(OrderBy::Value))
    }

    /// Orders children by priority.
    ///
    /// # Errors
    ///
    /// Fails if an ordering is already set.
    fn order_by_priority(&self) -> SyncResult<Query> {
        self.with_params(|p| p.with_order_by(OrderBy::Priority))
    }

    /// Orders children by the value at `path` beneath each child.
    ///
    /// # Errors
    ///
    /// Fails if an ordering is already set or `path` is malformed.
    fn order_by_child(&self, path: &str) -> SyncResult<Query> {
        let child = Path::parse(path)?;
        self.with_params(|p| p.with_order_by(OrderBy::Child(child)))
    }

    /// Keeps children at or after `value` (and `key` on ties).
    ///
    /// # Errors
    ///
    /// Fails if a start bound is already set or the bound does not suit the
    /// ordering.
    fn start_at(&self, value: Json, key: Option<&str>) -> SyncResult<Query> {
        let value = bound_value(value)?;
        self.with_params(|p| p.with_start_at(value, key.map(str::to_string)))
    }

    /// Keeps children at or before `value` (and `key` on ties).
    ///
    /// # Errors
    ///
    /// Fails if an end bound is already set or the bound does not suit the
    /// ordering.
    fn end_at(&self, value: Json, key: Option<&str>) -> SyncResult<Query> {
        let value = bound_value(value)?;
        self.with_params(|p| p.with_end_at(value, key.map(str::to_string)))
    }

    /// Keeps children equal to `value`.
    ///
    /// # Errors
    ///
    /// Fails if either bound is already set.
    fn equal_to(&self, value: Json, key: Option<&str>) -> SyncResult<Query> {
        let value = bound_value(value)?;
        self.with_params(|p| p.with_equal_to(value, key.map(str::to_string)))
    }

    /// Keeps the first `limit` children.
    ///
    /// # Errors
    ///
    /// Fails if a limit is already set or `limit` is zero.
    fn limit_to_first(&self, limit: usize) -> SyncResult<Query> {
        self.with_params(|p| p.with_limit(Limit::First(limit)))
    }

    /// Keeps the last `limit` children.
    ///
    /// # Errors
    ///
    /// Fails if a limit is already set or `limit` is zero.
    fn limit_to_last(&self, limit: usize) -> SyncResult<Query> {
        self.with_params(|p| p.with_limit(Limit::Last(limit)))
    }

    /// Registers a listener. Events for the current state fire before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Fails if the database was deleted.
    fn on(&self, options: ListenOptions) -> SyncResult<ListenerHandle> {
        self.database().listen(self.query_spec(), options, false)
    }

    /// Detaches listeners. With no arguments every listener at this query
    /// goes; `event_type` and `handle` narrow the match.
    ///
    /// # Errors
    ///
    /// Never fails today; reserved for transport errors.
    fn off(&self, event_type: Option<EventType>, handle: Option<&ListenerHandle>) -> SyncResult<()> {
        self.database()
            .unlisten(&self.query_spec(), event_type, handle)
    }

    /// Resolves with the first `event_type` event.
    ///
    /// # Errors
    ///
    /// Fails if the database was deleted. The future fails if the listener
    /// is cancelled.
    fn once(&self, event_type: EventType) -> SyncResult<OnceFuture> {
        self.database().listen_once(self.query_spec(), event_type)
    }

    /// Reference to the queried location.
    fn reference(&self) -> Reference {
        Reference::new(self.database().clone(), self.query_spec().path)
    }
}

/// Navigation.
pub trait Location: QueryOps {
    /// The location.
    fn path(&self) -> &Path;

    /// Last segment, or `None` at the root.
    fn key(&self) -> Option<&str> {
        self.path().key()
    }

    /// Enclosing location, or `None` at the root.
    fn parent(&self) -> Option<Reference> {
        self.path()
            .parent()
            .map(|path| Reference::new(self.database().clone(), path))
    }

    /// The root location.
    fn root(&self) -> Reference {
        self.database().root()
    }

    /// Location at `path` beneath this one; `path` may contain separators.
    ///
    /// # Errors
    ///
    /// Fails if a segment is malformed.
    fn child(&self, path: &str) -> SyncResult<Reference> {
        Ok(Reference::new(
            self.database().clone(),
            self.path().child_path(path)?,
        ))
    }
}

/// Writes.
///
/// Every write applies to the local cache and fires listeners before it
/// returns; the returned future settles when the server answers.
/// Validation errors are returned immediately.
pub trait Mutation: Location {
    /// Replaces the value.
    ///
    /// # Errors
    ///
    /// Fails if `value` is not a valid tree value.
    fn set(&self, value: Json) -> SyncResult<WriteFuture> {
        self.write(WriteKind::Set, value)
    }

    /// Replaces the value and its priority.
    ///
    /// # Errors
    ///
    /// Fails if `value` or `priority` is invalid.
    fn set_with_priority(&self, value: Json, priority: Json) -> SyncResult<WriteFuture> {
        canopy_core::Priority::from_json(&priority)?;
        self.write(WriteKind::Set, payload_with_priority(value, &priority))
    }

    /// Replaces the priority only.
    ///
    /// # Errors
    ///
    /// Fails if `priority` is not a string, number or null.
    fn set_priority(&self, priority: Json) -> SyncResult<WriteFuture> {
        self.write(WriteKind::SetPriority, priority)
    }

    /// Replaces several descendants. Keys are relative paths.
    ///
    /// # Errors
    ///
    /// Fails if `values` is not an object, a key is malformed, or two keys
    /// overlap.
    fn update(&self, values: Json) -> SyncResult<WriteFuture> {
        self.write(WriteKind::Update, values)
    }

    /// Deletes the value.
    ///
    /// # Errors
    ///
    /// Fails if the database was deleted.
    fn remove(&self) -> SyncResult<WriteFuture> {
        self.write(WriteKind::Remove, Json::Null)
    }

    /// Creates a child with a generated, chronologically sortable key and
    /// optionally writes `value` there.
    ///
    /// # Errors
    ///
    /// Fails if `value` is invalid.
    fn push(&self, value: Option<Json>) -> SyncResult<ThenableReference> {
        let db = self.database();
        let reference = Reference::new(db.clone(), self.path().child(&db.push_key())?);
        let completion = match value {
            Some(value) => Some(reference.set(value)?),
            None => None,
        };
        Ok(ThenableReference {
            reference,
            completion,
        })
    }

    /// Atomically modifies the value. `transform` may run several times.
    /// With `apply_locally` unset, intermediate values stay out of the
    /// local cache.
    fn transaction<F>(&self, transform: F, apply_locally: bool) -> TransactionFuture
    where
        F: FnMut(Json) -> TransactionDecision + Send + 'static,
    {
        Box::pin(transaction::run(
            self.database().clone(),
            self.path().clone(),
            transform,
            apply_locally,
        ))
    }

    /// Submits a write of `kind`.
    ///
    /// # Errors
    ///
    /// Fails if the payload is invalid for `kind`.
    fn write(&self, kind: WriteKind, payload: Json) -> SyncResult<WriteFuture> {
        let (_, done) = self
            .database()
            .submit_write(self.path(), kind, payload, None, true)?;
        Ok(done)
    }
}

/// Server-side disconnect actions.
pub trait Disconnect: Location {
    /// Actions for this location.
    fn on_disconnect(&self) -> OnDisconnect {
        OnDisconnect::new(self.database().clone(), self.path().clone())
    }
}

/// A filtered, ordered view of a location.
#[derive(Clone)]
pub struct Query {
    db: Database,
    spec: QuerySpec,
}

impl QueryOps for Query {
    fn database(&self) -> &Database {
        &self.db
    }

    fn query_spec(&self) -> QuerySpec {
        self.spec.clone()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.db.config().database_url, self.spec.path)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("spec", &self.spec).finish()
    }
}

/// A location in the database.
#[derive(Clone)]
pub struct Reference {
    db: Database,
    path: Path,
}

impl Reference {
    pub(crate) fn new(db: Database, path: Path) -> Self {
        Self { db, path }
    }
}

impl QueryOps for Reference {
    fn database(&self) -> &Database {
        &self.db
    }

    fn query_spec(&self) -> QuerySpec {
        QuerySpec::default_at(self.path.clone())
    }
}

impl Location for Reference {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Mutation for Reference {}

impl Disconnect for Reference {}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.db.config().database_url == other.db.config().database_url
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.db.config().database_url, self.path)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reference").field(&self.path).finish()
    }
}

/// A freshly pushed location. Dereferences to the [`Reference`]; awaiting
/// it waits for the pushed value to be acknowledged.
pub struct ThenableReference {
    reference: Reference,
    completion: Option<WriteFuture>,
}

impl ThenableReference {
    /// Splits into the reference and the write completion, if a value was
    /// written.
    pub fn into_parts(self) -> (Reference, Option<WriteFuture>) {
        (self.reference, self.completion)
    }
}

impl Deref for ThenableReference {
    type Target = Reference;

    fn deref(&self) -> &Reference {
        &self.reference
    }
}

impl fmt::Debug for ThenableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThenableReference")
            .field("reference", &self.reference)
            .field("pending", &self.completion.is_some())
            .finish()
    }
}

impl IntoFuture for ThenableReference {
    type Output = SyncResult<Reference>;
    type IntoFuture = Pin<Box<dyn Future<Output = SyncResult<Reference>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            if let Some(completion) = self.completion {
                completion.await?;
            }
            Ok::<_, SyncError>(self.reference)
        })
    }
}
