//! Optimistic read-modify-write.
//!
//! Each attempt reads the cache, runs the transform, and submits a set
//! conditioned on the hash of what it read. A stale precondition brings
//! the server value into the cache, so the next attempt sees it.

use crate::database::Database;
use crate::error::{SyncError, SyncResult};
use canopy_core::{payload_with_priority, DataSnapshot, OrderBy, Path, WriteKind, PRIORITY_KEY};
use serde_json::Value as Json;
use tracing::debug;

/// What a transaction transform wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionDecision {
    /// Write this value.
    Commit(Json),
    /// Stop without writing.
    Abort,
}

/// Outcome of a finished transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// True if the value was written.
    pub committed: bool,
    /// The value after commit, or the value the transform last saw.
    pub snapshot: DataSnapshot,
}

fn snapshot(path: &Path, node: canopy_core::Node) -> DataSnapshot {
    DataSnapshot::new(path.clone(), node, OrderBy::Priority)
}

fn carries_priority(value: &Json) -> bool {
    matches!(value, Json::Object(map) if map.contains_key(PRIORITY_KEY))
}

/// Runs `transform` against the value at `path` until a write sticks.
///
/// # Errors
///
/// Fails with [`SyncError::MaxRetriesExceeded`] when every attempt lost a
/// race, [`SyncError::TransactionAborted`] when the database is deleted
/// meanwhile, or whatever error rejected the write.
pub(crate) async fn run<F>(
    db: Database,
    path: Path,
    mut transform: F,
    apply_locally: bool,
) -> SyncResult<TransactionResult>
where
    F: FnMut(Json) -> TransactionDecision,
{
    let attempts = db.config().max_transaction_retries;
    for attempt in 1..=attempts {
        let current = db.read_node(&path, apply_locally);
        let seen = snapshot(&path, current.clone());
        let value = match transform(seen.val()) {
            TransactionDecision::Commit(value) => value,
            TransactionDecision::Abort => {
                debug!(path = %path, attempt, "transaction aborted by transform");
                return Ok(TransactionResult {
                    committed: false,
                    snapshot: seen,
                });
            }
        };
        let payload = if carries_priority(&value) {
            value
        } else {
            payload_with_priority(value, &seen.priority())
        };
        let (_, done) = db.submit_write(
            &path,
            WriteKind::Set,
            payload,
            Some(current.hash().to_string()),
            apply_locally,
        )?;
        match done.await {
            Ok(()) => {
                debug!(path = %path, attempt, "transaction committed");
                return Ok(TransactionResult {
                    committed: true,
                    snapshot: snapshot(&path, db.read_node(&path, true)),
                });
            }
            Err(SyncError::DataStale { .. }) => {
                debug!(path = %path, attempt, "transaction lost a race, retrying");
            }
            Err(SyncError::DatabaseDeleted) => {
                return Err(SyncError::TransactionAborted {
                    reason: "database deleted".to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Err(SyncError::MaxRetriesExceeded { attempts })
}
