//! Server cache plus pending-write overlay.
//!
//! The visible tree is the server cache with every visible pending write
//! applied in submission order, so a later write to an ancestor shadows
//! earlier ones until it is reverted. All mutations go through `&mut self`,
//! so callers serialize them by owning the tree behind one lock.
//!
//! Server state only counts as complete beneath an active listen. When the
//! last listen covering a location goes away, the cached state there is
//! dropped, because nothing keeps it current any more.

use crate::error::CoreResult;
use crate::node::Node;
use crate::path::Path;
use crate::persistence::PersistenceStore;
use crate::server_values::ServerValues;
use crate::write::{PendingWrite, WriteId, WriteKind, WriteRecord, WriteStatus};
use serde_json::Value as Json;
use tracing::{debug, trace, warn};

/// Outcome reported by the server for a write.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The server applied the write.
    Applied,
    /// The server rejected the write, or the write was abandoned.
    Rejected,
}

/// Local cache owner.
pub struct SyncTree {
    server: Node,
    complete: Vec<Path>,
    listened: Vec<Path>,
    pending: Vec<PendingWrite>,
    visible: Node,
    next_write_id: u64,
    server_time_offset: i64,
    persistence: Option<Box<dyn PersistenceStore>>,
}

impl SyncTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            server: Node::empty(),
            complete: Vec::new(),
            listened: Vec::new(),
            pending: Vec::new(),
            visible: Node::empty(),
            next_write_id: 1,
            server_time_offset: 0,
            persistence: None,
        }
    }

    /// Creates a tree backed by `store`, starting from whatever it holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be decoded.
    pub fn with_persistence(store: Box<dyn PersistenceStore>) -> CoreResult<Self> {
        let state = store.load()?;
        let mut tree = Self::new();
        tree.server = Node::from_json(&state.server_cache)?;
        // Rehydrated state stays complete until a listen covering it ends.
        for path in state.complete {
            tree.mark_complete(&path);
        }
        let values = ServerValues::now();
        for record in state.writes {
            let op = record.resolve(&values)?;
            tree.next_write_id = tree.next_write_id.max(record.id.0 + 1);
            tree.pending.push(PendingWrite::new(record, op));
        }
        tree.recompute();
        debug!(
            pending = tree.pending.len(),
            complete = tree.complete.len(),
            "rehydrated sync tree"
        );
        tree.persistence = Some(store);
        Ok(tree)
    }

    /// Sets the correction applied to the local clock when resolving server
    /// value placeholders.
    pub fn set_server_time_offset(&mut self, offset_millis: i64) {
        self.server_time_offset = offset_millis;
    }

    /// The current clock correction.
    pub fn server_time_offset(&self) -> i64 {
        self.server_time_offset
    }

    /// Merged view at `path`.
    pub fn read(&self, path: &Path) -> Node {
        self.visible.get(path)
    }

    /// Last known server state at `path`.
    pub fn read_server(&self, path: &Path) -> Node {
        self.server.get(path)
    }

    /// True when the merged view at `path` is fully known: the server state
    /// there was received, or a visible full write covers it.
    pub fn is_complete(&self, path: &Path) -> bool {
        self.complete.iter().any(|c| c.is_ancestor_of(path))
            || self
                .pending
                .iter()
                .any(|w| w.is_visible() && w.is_full_write() && w.path().is_ancestor_of(path))
    }

    /// Locations with known server state.
    pub fn complete_paths(&self) -> &[Path] {
        &self.complete
    }

    /// True when an active listen covers `path`.
    pub fn is_listened(&self, path: &Path) -> bool {
        self.listened.iter().any(|l| l.is_ancestor_of(path))
    }

    /// Replaces the set of locations the server keeps current. Locations
    /// no longer covered lose their cached server state and completeness.
    ///
    /// # Errors
    ///
    /// Returns an error only if the persistence store fails.
    pub fn set_listened(&mut self, paths: Vec<Path>) -> CoreResult<()> {
        let dropped: Vec<Path> = self
            .listened
            .iter()
            .filter(|old| !paths.iter().any(|p| p.is_ancestor_of(old)))
            .cloned()
            .collect();
        self.listened = paths;
        if dropped.is_empty() {
            return Ok(());
        }
        for path in &dropped {
            self.forget(path);
        }
        self.save_server_cache()?;
        self.recompute();
        Ok(())
    }

    /// Writes not yet acknowledged, in submission order.
    pub fn pending_writes(&self) -> &[PendingWrite] {
        &self.pending
    }

    /// Looks up a pending write.
    pub fn pending_write(&self, id: WriteId) -> Option<&PendingWrite> {
        self.pending.iter().find(|w| w.id() == id)
    }

    /// Replaces the value at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a valid tree value.
    pub fn write(&mut self, path: &Path, value: Json) -> CoreResult<PendingWrite> {
        self.submit(path, WriteKind::Set, value, None, true)
    }

    /// Replaces several descendants of `path`. Keys are relative paths and
    /// may contain separators.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidArgument`](crate::CoreError::InvalidArgument) if the map is malformed or
    /// two keys overlap.
    pub fn patch(&mut self, path: &Path, updates: Json) -> CoreResult<PendingWrite> {
        self.submit(path, WriteKind::Update, updates, None, true)
    }

    /// Deletes the value at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the persistence store fails.
    pub fn remove(&mut self, path: &Path) -> CoreResult<PendingWrite> {
        self.submit(path, WriteKind::Remove, Json::Null, None, true)
    }

    /// Replaces the priority at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if `priority` is not a string, number or null.
    pub fn set_priority(&mut self, path: &Path, priority: Json) -> CoreResult<PendingWrite> {
        self.submit(path, WriteKind::SetPriority, priority, None, true)
    }

    /// Records a write of any kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is invalid for `kind`.
    pub fn submit(
        &mut self,
        path: &Path,
        kind: WriteKind,
        payload: Json,
        expected_hash: Option<String>,
        apply_locally: bool,
    ) -> CoreResult<PendingWrite> {
        let record = WriteRecord {
            id: WriteId(self.next_write_id),
            path: path.clone(),
            kind,
            payload,
            expected_hash,
            apply_locally,
        };
        let op = record.resolve(&ServerValues::with_offset(self.server_time_offset))?;
        if let Some(store) = self.persistence.as_mut() {
            store.save_write(&record)?;
        }
        self.next_write_id += 1;

        let write = PendingWrite::new(record, op);
        if write.is_visible() {
            self.visible = write.op.apply(&self.visible, path);
        }
        debug!(write_id = %write.id(), path = %path, kind = ?kind, "local write");
        self.pending.push(write.clone());
        Ok(write)
    }

    /// Resolves a pending write. An applied write is folded into the server
    /// cache; a rejected one leaves the overlay. Returns the write in its
    /// final state, or `None` if the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error only if the persistence store fails.
    pub fn acknowledge(
        &mut self,
        id: WriteId,
        outcome: AckOutcome,
    ) -> CoreResult<Option<PendingWrite>> {
        let Some(index) = self.pending.iter().position(|w| w.id() == id) else {
            warn!(write_id = %id, "acknowledgment for unknown write");
            return Ok(None);
        };
        let mut write = self.pending.remove(index);
        match outcome {
            AckOutcome::Applied => {
                self.server = write.op.apply(&self.server, write.path());
                if write.is_full_write() && self.is_listened(write.path()) {
                    self.mark_complete(write.path());
                }
                write.status = WriteStatus::Acknowledged;
                self.save_server_cache()?;
            }
            AckOutcome::Rejected => {
                write.status = WriteStatus::Reverted;
            }
        }
        if let Some(store) = self.persistence.as_mut() {
            store.remove_write(id)?;
        }
        self.recompute();
        debug!(write_id = %id, status = ?write.status, "write resolved");
        Ok(Some(write))
    }

    /// Replaces the server state at `path`, marking it complete when a
    /// listen covers it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the persistence store fails.
    pub fn apply_server_update(&mut self, path: &Path, node: Node) -> CoreResult<()> {
        trace!(path = %path, "server update");
        self.server = self.server.update(path, node);
        if self.is_listened(path) {
            self.mark_complete(path);
        }
        self.save_server_cache()?;
        self.recompute();
        Ok(())
    }

    /// Replaces several server descendants of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the persistence store fails.
    pub fn apply_server_merge(&mut self, path: &Path, entries: Vec<(Path, Node)>) -> CoreResult<()> {
        trace!(path = %path, entries = entries.len(), "server merge");
        for (rel, node) in entries {
            self.server = self.server.update(&path.join(&rel), node);
        }
        self.save_server_cache()?;
        self.recompute();
        Ok(())
    }

    /// Records that the server state at `path` is fully known.
    pub fn mark_complete(&mut self, path: &Path) {
        if self.complete.iter().any(|c| c.is_ancestor_of(path)) {
            return;
        }
        self.complete.retain(|c| !path.is_ancestor_of(c));
        self.complete.push(path.clone());
    }

    /// Drops every pending write without acknowledgment and returns them.
    pub fn abandon_all(&mut self) -> Vec<PendingWrite> {
        let mut dropped = std::mem::take(&mut self.pending);
        for write in &mut dropped {
            write.status = WriteStatus::Reverted;
        }
        self.recompute();
        dropped
    }

    /// Clears server state at `path`, keeping what listens beneath it
    /// still cover.
    fn forget(&mut self, path: &Path) {
        let kept: Vec<(Path, Node, bool)> = self
            .listened
            .iter()
            .filter(|l| path.is_strict_ancestor_of(l))
            .map(|l| {
                let complete = self.complete.iter().any(|c| c.is_ancestor_of(l));
                (l.clone(), self.server.get(l), complete)
            })
            .collect();
        self.server = self.server.update(path, Node::empty());
        let listened = &self.listened;
        self.complete
            .retain(|c| !c.overlaps(path) || listened.iter().any(|l| l.is_ancestor_of(c)));
        for (at, node, complete) in kept {
            self.server = self.server.update(&at, node);
            if complete {
                self.mark_complete(&at);
            }
        }
        debug!(path = %path, "unlistened server state dropped");
    }

    fn recompute(&mut self) {
        self.visible = self
            .pending
            .iter()
            .filter(|w| w.is_visible())
            .fold(self.server.clone(), |acc, w| w.op.apply(&acc, w.path()));
    }

    fn save_server_cache(&mut self) -> CoreResult<()> {
        if let Some(store) = self.persistence.as_mut() {
            store.save_server_cache(&self.server, &self.complete)?;
        }
        Ok(())
    }
}

impl Default for SyncTree {
    fn default() -> Self {
        Self::new()
    }
}
