//! Optional durable record of pending writes and server cache.
//!
//! A [`SyncTree`](crate::SyncTree) configured with a store records every
//! pending write and every change to its server cache. A new tree built
//! from the same store starts with that state before talking to the
//! server.

use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::path::Path;
use crate::write::{WriteId, WriteRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// State recovered from a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Server cache in exported form.
    pub server_cache: Json,
    /// Locations whose server state is fully known.
    pub complete: Vec<Path>,
    /// Pending writes in submission order.
    pub writes: Vec<WriteRecord>,
}

/// Durable storage collaborator.
pub trait PersistenceStore: Send {
    /// Records a new pending write.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be stored.
    fn save_write(&mut self, record: &WriteRecord) -> CoreResult<()>;

    /// Forgets an acknowledged or reverted write.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated.
    fn remove_write(&mut self, id: WriteId) -> CoreResult<()>;

    /// Replaces the stored server cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be stored.
    fn save_server_cache(&mut self, root: &Node, complete: &[Path]) -> CoreResult<()>;

    /// Reads back everything stored.
    ///
    /// # Errors
    ///
    /// Returns an error if stored records cannot be decoded.
    fn load(&self) -> CoreResult<PersistedState>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    writes: BTreeMap<WriteId, Vec<u8>>,
    cache: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    root: Json,
    complete: Vec<Path>,
}

/// In-memory store. Clones share the same records, so a test can hand one
/// clone to a tree and rehydrate another tree from a second clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryPersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pending writes.
    pub fn write_count(&self) -> usize {
        self.inner.read().writes.len()
    }
}

fn encode<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| CoreError::persistence(format!("encode failed: {e}")))?;
    Ok(buf)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::persistence(format!("decode failed: {e}")))
}

impl PersistenceStore for MemoryPersistence {
    fn save_write(&mut self, record: &WriteRecord) -> CoreResult<()> {
        let bytes = encode(record)?;
        self.inner.write().writes.insert(record.id, bytes);
        Ok(())
    }

    fn remove_write(&mut self, id: WriteId) -> CoreResult<()> {
        self.inner.write().writes.remove(&id);
        Ok(())
    }

    fn save_server_cache(&mut self, root: &Node, complete: &[Path]) -> CoreResult<()> {
        let bytes = encode(&CacheRecord {
            root: root.export(),
            complete: complete.to_vec(),
        })?;
        self.inner.write().cache = Some(bytes);
        Ok(())
    }

    fn load(&self) -> CoreResult<PersistedState> {
        let inner = self.inner.read();
        let mut state = PersistedState::default();
        if let Some(bytes) = &inner.cache {
            let cache: CacheRecord = decode(bytes)?;
            state.server_cache = cache.root;
            state.complete = cache.complete;
        }
        for bytes in inner.writes.values() {
            state.writes.push(decode(bytes)?);
        }
        Ok(state)
    }
}
