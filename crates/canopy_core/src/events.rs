//! Listener registry and change events.
//!
//! Registrations are grouped into views, one per distinct query. Each view
//! remembers the ordered children and value it last reported. When the
//! cache changes beneath a view, the router recomputes it and diffs the old
//! child list against the new one:
//!
//! - children only in the old list are removed
//! - children in both lists whose hash differs are changed
//! - children in both lists whose ordering value changed and whose
//!   preceding surviving sibling differs are moved
//! - children only in the new list are added
//!
//! A `value` event follows when the view is complete and differs from the
//! last value reported. Events from one change are returned as
//! [`Dispatch`] items ordered by type: removed, changed, moved, added,
//! value.
//!
//! The router never calls listeners itself. Callers fire the returned
//! dispatches after releasing their locks.

use crate::error::CoreError;
use crate::node::Node;
use crate::path::Path;
use crate::query::{QueryKey, QuerySpec};
use crate::snapshot::DataSnapshot;
use crate::sync_tree::SyncTree;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Kind of change reported to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The whole query result.
    Value,
    /// A child entered the result.
    ChildAdded,
    /// A child in the result changed value or priority.
    ChildChanged,
    /// A child left the result.
    ChildRemoved,
    /// A child changed position within the result.
    ChildMoved,
}

impl EventType {
    fn rank(self) -> u8 {
        match self {
            EventType::ChildRemoved => 0,
            EventType::ChildChanged => 1,
            EventType::ChildMoved => 2,
            EventType::ChildAdded => 3,
            EventType::Value => 4,
        }
    }

    /// Name used in logs and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Value => "value",
            EventType::ChildAdded => "child_added",
            EventType::ChildChanged => "child_changed",
            EventType::ChildRemoved => "child_removed",
            EventType::ChildMoved => "child_moved",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// What happened.
    pub event_type: EventType,
    /// The query result for `value`, the child otherwise.
    pub snapshot: DataSnapshot,
    /// Key of the preceding sibling for added, changed and moved events.
    pub prev_key: Option<String>,
}

/// Data callback.
pub type DataCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Cancellation callback.
pub type CancelCallback = Arc<dyn Fn(&CoreError) + Send + Sync>;

/// Listener configuration.
#[derive(Clone)]
pub struct ListenOptions {
    /// Event type to receive.
    pub event_type: EventType,
    /// Called for every matching event.
    pub on_data: DataCallback,
    /// Called once if the server revokes the listener.
    pub on_cancel: Option<CancelCallback>,
    /// Distinguishes registrations that share a callback.
    pub dedupe_key: Option<String>,
}

impl ListenOptions {
    /// Listens for `event_type` with `on_data`.
    pub fn new<F>(event_type: EventType, on_data: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self {
            event_type,
            on_data: Arc::new(on_data),
            on_cancel: None,
            dedupe_key: None,
        }
    }

    /// Sets the cancellation callback.
    #[must_use]
    pub fn with_cancel<F>(mut self, on_cancel: F) -> Self
    where
        F: Fn(&CoreError) + Send + Sync + 'static,
    {
        self.on_cancel = Some(Arc::new(on_cancel));
        self
    }

    /// Sets the dedupe key.
    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("event_type", &self.event_type)
            .field("has_cancel", &self.on_cancel.is_some())
            .field("dedupe_key", &self.dedupe_key)
            .finish()
    }
}

/// Identifies a registration for later removal.
#[derive(Clone)]
pub struct ListenerHandle {
    id: u64,
    event_type: EventType,
    on_data: DataCallback,
    dedupe_key: Option<String>,
}

impl ListenerHandle {
    /// Registration id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The event type registered for.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    fn matches(&self, options: &ListenOptions) -> bool {
        Arc::ptr_eq(&self.on_data, &options.on_data) && self.dedupe_key == options.dedupe_key
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .finish()
    }
}

/// A pending callback invocation.
pub enum Dispatch {
    /// Deliver an event, unless the registration was detached meanwhile.
    Data {
        /// Callback to call.
        callback: DataCallback,
        /// Event to deliver.
        event: Event,
        /// Cleared when the registration is detached.
        active: Arc<AtomicBool>,
    },
    /// Report cancellation.
    Cancel {
        /// Callback to call.
        callback: CancelCallback,
        /// Why the listener was cancelled.
        error: CoreError,
    },
}

impl Dispatch {
    /// Invokes the callback.
    pub fn fire(self) {
        match self {
            Dispatch::Data {
                callback,
                event,
                active,
            } => {
                if active.load(AtomicOrdering::Acquire) {
                    callback(&event);
                }
            }
            Dispatch::Cancel { callback, error } => callback(&error),
        }
    }

    /// The event carried by a data dispatch.
    pub fn event(&self) -> Option<&Event> {
        match self {
            Dispatch::Data { event, .. } => Some(event),
            Dispatch::Cancel { .. } => None,
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Data { event, .. } => f.debug_tuple("Data").field(event).finish(),
            Dispatch::Cancel { error, .. } => f.debug_tuple("Cancel").field(error).finish(),
        }
    }
}

struct Registration {
    id: u64,
    options: ListenOptions,
    once: bool,
    active: Arc<AtomicBool>,
}

impl Registration {
    fn deactivate(&self) {
        self.active.store(false, AtomicOrdering::Release);
    }
}

struct View {
    query: QuerySpec,
    registrations: Vec<Registration>,
    children: Vec<(String, Node)>,
    value: Option<Node>,
}

impl View {
    fn new(query: QuerySpec, tree: &SyncTree) -> Self {
        let mut view = Self {
            query,
            registrations: Vec::new(),
            children: Vec::new(),
            value: None,
        };
        view.children = view.compute_children(tree);
        if tree.is_complete(&view.query.path) {
            view.value = Some(view.compute_value(tree));
        }
        view
    }

    fn compute_children(&self, tree: &SyncTree) -> Vec<(String, Node)> {
        self.query.params.view(&tree.read(&self.query.path))
    }

    fn compute_value(&self, tree: &SyncTree) -> Node {
        self.query.params.filtered_node(&tree.read(&self.query.path))
    }

    fn value_snapshot(&self, node: Node) -> DataSnapshot {
        DataSnapshot::new(self.query.path.clone(), node, self.query.params.order())
    }

    fn child_event(&self, event_type: EventType, key: &str, node: &Node, prev_key: Option<String>) -> Event {
        let path = self
            .query
            .path
            .child(key)
            .unwrap_or_else(|_| self.query.path.clone());
        Event {
            event_type,
            snapshot: DataSnapshot::new(path, node.clone(), self.query.params.order()),
            prev_key,
        }
    }

    /// Events taking an empty view to the current state.
    fn initial_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let mut prev: Option<String> = None;
        for (key, node) in &self.children {
            events.push(self.child_event(EventType::ChildAdded, key, node, prev.clone()));
            prev = Some(key.clone());
        }
        if let Some(value) = &self.value {
            events.push(Event {
                event_type: EventType::Value,
                snapshot: self.value_snapshot(value.clone()),
                prev_key: None,
            });
        }
        events
    }

    /// Recomputes the view and returns the events describing the change.
    fn refresh(&mut self, tree: &SyncTree) -> Vec<Event> {
        let new_children = self.compute_children(tree);
        let mut events = diff_children(self, &self.children, &new_children);
        self.children = new_children;

        if tree.is_complete(&self.query.path) {
            let value = self.compute_value(tree);
            if self.value.as_ref() != Some(&value) {
                events.push(Event {
                    event_type: EventType::Value,
                    snapshot: self.value_snapshot(value.clone()),
                    prev_key: None,
                });
                self.value = Some(value);
            }
        }
        events
    }
}

/// Turns events into dispatches for matching registrations. One-shot
/// registrations that receive an event are dropped.
fn route(registrations: &mut Vec<Registration>, events: &[Event], out: &mut Vec<(u8, Dispatch)>) {
    registrations.retain(|reg| {
        let mut fired = false;
        for event in events {
            if event.event_type != reg.options.event_type || (reg.once && fired) {
                continue;
            }
            out.push((
                event.event_type.rank(),
                Dispatch::Data {
                    callback: Arc::clone(&reg.options.on_data),
                    event: event.clone(),
                    active: Arc::clone(&reg.active),
                },
            ));
            fired = true;
        }
        !(reg.once && fired)
    });
}

/// Computes removed, changed, moved and added events between two ordered
/// child lists.
fn diff_children(view: &View, old: &[(String, Node)], new: &[(String, Node)]) -> Vec<Event> {
    let old_index: HashMap<&str, usize> = old
        .iter()
        .enumerate()
        .map(|(i, (k, _))| (k.as_str(), i))
        .collect();
    let new_index: HashMap<&str, usize> = new
        .iter()
        .enumerate()
        .map(|(i, (k, _))| (k.as_str(), i))
        .collect();

    let mut events = Vec::new();
    for (key, node) in old {
        if !new_index.contains_key(key.as_str()) {
            events.push(view.child_event(EventType::ChildRemoved, key, node, None));
        }
    }

    // (new index, old index) of the surviving children, in new order.
    let common: Vec<(usize, usize)> = new
        .iter()
        .enumerate()
        .filter_map(|(ni, (k, _))| old_index.get(k.as_str()).map(|oi| (ni, *oi)))
        .collect();
    let old_survivors: Vec<&str> = old
        .iter()
        .map(|(k, _)| k.as_str())
        .filter(|k| new_index.contains_key(k))
        .collect();
    let prev_survivor_before: HashMap<&str, Option<&str>> = old_survivors
        .iter()
        .enumerate()
        .map(|(i, k)| (*k, i.checked_sub(1).map(|p| old_survivors[p])))
        .collect();
    let order = view.query.params.order();

    let prev_of = |ni: usize| -> Option<String> {
        if ni == 0 {
            None
        } else {
            Some(new[ni - 1].0.clone())
        }
    };

    let mut moved = Vec::new();
    for (ci, (ni, oi)) in common.iter().enumerate() {
        let (key, node) = &new[*ni];
        let old_node = &old[*oi].1;
        if old_node.hash() != node.hash() {
            events.push(view.child_event(EventType::ChildChanged, key, node, prev_of(*ni)));
        }
        // Only a child whose own ordering value changed is reported as
        // moved; neighbours it passed over keep their place.
        let prev_survivor_after = ci.checked_sub(1).map(|p| new[common[p].0].0.as_str());
        if order.indexed_value_changed(old_node, node)
            && prev_survivor_before.get(key.as_str()).copied().flatten() != prev_survivor_after
        {
            moved.push(view.child_event(EventType::ChildMoved, key, node, prev_of(*ni)));
        }
    }
    events.extend(moved);

    for (ni, (key, node)) in new.iter().enumerate() {
        if !old_index.contains_key(key.as_str()) {
            events.push(view.child_event(EventType::ChildAdded, key, node, prev_of(ni)));
        }
    }
    events
}

/// Result of adding a registration.
#[derive(Debug)]
pub struct Registered {
    /// Handle for later removal.
    pub handle: ListenerHandle,
    /// Events describing the current state to the new listener.
    pub initial: Vec<Dispatch>,
    /// True when the registration created a view that now needs server
    /// data.
    pub new_view: bool,
}

/// Fan-out of cache changes to registered listeners.
#[derive(Default)]
pub struct EventRouter {
    views: BTreeMap<QueryKey, View>,
    next_id: u64,
}

impl EventRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. `once` listeners are dropped after their first
    /// event.
    pub fn register(
        &mut self,
        tree: &SyncTree,
        query: QuerySpec,
        options: ListenOptions,
        once: bool,
    ) -> Registered {
        self.next_id += 1;
        let id = self.next_id;
        let key = query.key();
        let new_view = !self.views.contains_key(&key);
        let view = self
            .views
            .entry(key.clone())
            .or_insert_with(|| View::new(query, tree));

        let handle = ListenerHandle {
            id,
            event_type: options.event_type,
            on_data: Arc::clone(&options.on_data),
            dedupe_key: options.dedupe_key.clone(),
        };
        let registration = Registration {
            id,
            options,
            once,
            active: Arc::new(AtomicBool::new(true)),
        };

        let events = view.initial_events();
        let mut routed = Vec::new();
        let mut fresh = vec![registration];
        route(&mut fresh, &events, &mut routed);
        view.registrations.append(&mut fresh);
        if view.registrations.is_empty() {
            self.views.remove(&key);
        }
        let new_view = new_view && self.views.contains_key(&key);

        debug!(query = %key, registration = id, new_view, "listener registered");
        Registered {
            handle,
            initial: routed.into_iter().map(|(_, d)| d).collect(),
            new_view,
        }
    }

    /// Recomputes every view overlapping `changed` and returns the events.
    pub fn notify(&mut self, tree: &SyncTree, changed: &[Path]) -> Vec<Dispatch> {
        let mut routed: Vec<(u8, Dispatch)> = Vec::new();
        let mut emptied = Vec::new();
        for (key, view) in self.views.iter_mut() {
            if !changed.iter().any(|p| p.overlaps(&view.query.path)) {
                continue;
            }
            let events = view.refresh(tree);
            if events.is_empty() {
                continue;
            }
            trace!(query = %key, events = events.len(), "view changed");
            route(&mut view.registrations, &events, &mut routed);
            if view.registrations.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.views.remove(&key);
        }
        routed.sort_by_key(|(rank, _)| *rank);
        routed.into_iter().map(|(_, d)| d).collect()
    }

    /// Detaches registrations and returns the queries left without
    /// listeners.
    ///
    /// An unfiltered `query` targets every view at its path; a filtered one
    /// only its own view. `event_type` and `handle` narrow the match.
    pub fn unregister(
        &mut self,
        query: &QuerySpec,
        event_type: Option<EventType>,
        handle: Option<&ListenerHandle>,
    ) -> Vec<QuerySpec> {
        let target_key = query.key();
        let all_at_path = query.params.is_default();
        let mut emptied = Vec::new();
        let mut removed = 0usize;
        for (key, view) in self.views.iter_mut() {
            let targeted = if all_at_path {
                view.query.path == query.path
            } else {
                *key == target_key
            };
            if !targeted {
                continue;
            }
            view.registrations.retain(|reg| {
                let type_matches = event_type.map_or(true, |t| t == reg.options.event_type);
                let handle_matches = handle.map_or(true, |h| h.matches(&reg.options));
                if type_matches && handle_matches {
                    reg.deactivate();
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            if view.registrations.is_empty() {
                emptied.push(key.clone());
            }
        }
        let mut queries = Vec::new();
        for key in emptied {
            if let Some(view) = self.views.remove(&key) {
                queries.push(view.query);
            }
        }
        debug!(query = %target_key, removed, "listeners detached");
        queries
    }

    /// Removes the view for `query_key`, returning a cancellation for each
    /// registration that asked for one.
    pub fn cancel_query(&mut self, query_key: &QueryKey, error: CoreError) -> Vec<Dispatch> {
        let Some(view) = self.views.remove(query_key) else {
            return Vec::new();
        };
        debug!(query = %query_key, %error, "listeners cancelled");
        view.registrations
            .into_iter()
            .filter_map(|reg| {
                reg.deactivate();
                reg.options.on_cancel.map(|callback| Dispatch::Cancel {
                    callback,
                    error: error.clone(),
                })
            })
            .collect()
    }

    /// Detaches every registration.
    pub fn clear(&mut self) {
        for view in self.views.values() {
            for reg in &view.registrations {
                reg.deactivate();
            }
        }
        self.views.clear();
    }

    /// Queries that currently have listeners.
    pub fn active_queries(&self) -> Vec<QuerySpec> {
        self.views.values().map(|v| v.query.clone()).collect()
    }

    /// True when a view exists for `query_key`.
    pub fn has_view(&self, query_key: &QueryKey) -> bool {
        self.views.contains_key(query_key)
    }

    /// Total number of registrations.
    pub fn registration_count(&self) -> usize {
        self.views.values().map(|v| v.registrations.len()).sum()
    }

    /// Ids of every registration, for diagnostics.
    pub fn registration_ids(&self) -> Vec<u64> {
        self.views
            .values()
            .flat_map(|v| v.registrations.iter().map(|r| r.id))
            .collect()
    }
}
