//! Test fixtures: a shared reference server and clients wired to it.

use crate::loopback::LoopbackTransport;
use canopy_sync_engine::{
    Database, DatabaseBuilder, DatabaseConfig, Event, EventType, ListenOptions, Transport,
};
use canopy_sync_server::{ServerConfig, TreeServer};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::ops::Deref;
use std::sync::Arc;

/// Database URL used by every fixture client.
pub const TEST_URL: &str = "https://demo.canopy.test";

/// One in-process server that any number of clients connect to.
pub struct TestHarness {
    /// The server.
    pub server: Arc<TreeServer>,
}

impl TestHarness {
    /// Creates a harness around an open server with no auth.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a harness around a server built from `config`.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            server: Arc::new(TreeServer::new(config)),
        }
    }

    /// A connected client.
    pub fn client(&self) -> TestClient {
        self.client_with(|builder| builder)
    }

    /// A client that has not connected yet.
    pub fn offline_client(&self) -> TestClient {
        self.client_with(DatabaseBuilder::start_offline)
    }

    /// A client whose builder `customize` adjusts before it is built.
    pub fn client_with<F>(&self, customize: F) -> TestClient
    where
        F: FnOnce(DatabaseBuilder) -> DatabaseBuilder,
    {
        let transport = Arc::new(LoopbackTransport::new(Arc::clone(&self.server)));
        let builder = Database::builder(DatabaseConfig::new(TEST_URL))
            .transport(Arc::clone(&transport) as Arc<dyn Transport>);
        let db = customize(builder)
            .build()
            .expect("Failed to build test database");
        settle(&db);
        TestClient { db, transport }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A database plus the transport it talks through.
pub struct TestClient {
    /// The client database.
    pub db: Database,
    /// Its transport, for inspecting traffic and simulating failures.
    pub transport: Arc<LoopbackTransport>,
}

impl TestClient {
    /// Drops the connection and lets the client react to it.
    pub fn lose_connection(&self) {
        self.transport.drop_connection();
        settle(&self.db);
    }
}

impl Deref for TestClient {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

/// Pumps `db` until no inbound events remain.
pub fn settle(db: &Database) {
    while db.pump() > 0 {}
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    /// Event type.
    pub event_type: EventType,
    /// Key of the snapshot.
    pub key: Option<String>,
    /// Key of the preceding sibling.
    pub prev_key: Option<String>,
    /// Exported snapshot value.
    pub value: Json,
}

/// Collects events delivered to listeners built from it.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener options that record every `event_type` event here.
    pub fn options(&self, event_type: EventType) -> ListenOptions {
        let events = Arc::clone(&self.events);
        ListenOptions::new(event_type, move |event: &Event| {
            events.lock().push(Recorded {
                event_type: event.event_type,
                key: event.snapshot.key().map(str::to_string),
                prev_key: event.prev_key.clone(),
                value: event.snapshot.val(),
            });
        })
    }

    /// Returns and clears everything recorded so far.
    pub fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Returns and clears the recorded values.
    pub fn take_values(&self) -> Vec<Json> {
        self.take().into_iter().map(|r| r.value).collect()
    }

    /// Number of events recorded.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
