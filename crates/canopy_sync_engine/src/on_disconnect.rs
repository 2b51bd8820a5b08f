//! Writes the server performs when this client's session ends.

use crate::database::{Database, WriteFuture};
use crate::error::SyncResult;
use canopy_core::{payload_with_priority, Path, Priority, WriteKind};
use serde_json::Value as Json;

/// Disconnect actions for one location.
///
/// Actions are kept client-side and sent again on every reconnect, so they
/// survive dropped sessions until cancelled.
#[derive(Debug, Clone)]
pub struct OnDisconnect {
    db: Database,
    path: Path,
}

impl OnDisconnect {
    pub(crate) fn new(db: Database, path: Path) -> Self {
        Self { db, path }
    }

    /// Sets the value on disconnect.
    ///
    /// # Errors
    ///
    /// Fails if `value` is not a valid tree value.
    pub fn set(&self, value: Json) -> SyncResult<WriteFuture> {
        self.db.queue_disconnect(&self.path, WriteKind::Set, value)
    }

    /// Sets the value and priority on disconnect.
    ///
    /// # Errors
    ///
    /// Fails if `value` or `priority` is invalid.
    pub fn set_with_priority(&self, value: Json, priority: Json) -> SyncResult<WriteFuture> {
        Priority::from_json(&priority)?;
        self.set(payload_with_priority(value, &priority))
    }

    /// Merges `values` on disconnect.
    ///
    /// # Errors
    ///
    /// Fails if `values` is not a valid update map.
    pub fn update(&self, values: Json) -> SyncResult<WriteFuture> {
        self.db.queue_disconnect(&self.path, WriteKind::Update, values)
    }

    /// Removes the value on disconnect.
    ///
    /// # Errors
    ///
    /// Fails if the database was deleted.
    pub fn remove(&self) -> SyncResult<WriteFuture> {
        self.db.queue_disconnect(&self.path, WriteKind::Remove, Json::Null)
    }

    /// Drops every action queued at or beneath this location.
    ///
    /// # Errors
    ///
    /// Fails if the database was deleted.
    pub fn cancel(&self) -> SyncResult<WriteFuture> {
        self.db.cancel_disconnect(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DatabaseConfig;
    use crate::database::Database;
    use crate::reference::{Disconnect, Location};
    use crate::transport::{MockTransport, Transport};
    use canopy_sync_protocol::{AckStatus, ClientMessage, ServerMessage};
    use serde_json::json;
    use std::sync::Arc;

    fn database(transport: &Arc<MockTransport>) -> Database {
        Database::builder(DatabaseConfig::new("https://demo.canopy.test"))
            .transport(Arc::clone(transport) as Arc<dyn Transport>)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn actions_are_acknowledged() {
        let transport = Arc::new(MockTransport::new());
        let db = database(&transport);
        let presence = db.reference("presence/me").unwrap().on_disconnect();
        let done = presence.remove().unwrap();
        let sent = transport.take_sent();
        let [ClientMessage::OnDisconnectPut {
            request_id, path, data,
        }] = sent.as_slice()
        else {
            panic!("unexpected messages {sent:?}");
        };
        assert_eq!(path, "/presence/me");
        assert!(data.is_null());
        transport.deliver(ServerMessage::ok(*request_id));
        done.await.unwrap();
    }

    #[tokio::test]
    async fn refused_action_fails() {
        let transport = Arc::new(MockTransport::new());
        let db = database(&transport);
        let done = db
            .reference("locked")
            .unwrap()
            .on_disconnect()
            .update(json!({"a": 1}))
            .unwrap();
        let request_id = transport.sent()[0].request_id().unwrap();
        transport.deliver(ServerMessage::Ack {
            request_id,
            status: AckStatus::PermissionDenied,
        });
        assert!(done.await.unwrap_err().is_permission_denied());
    }

    #[test]
    fn invalid_payloads_fail_immediately() {
        let transport = Arc::new(MockTransport::new());
        let db = database(&transport);
        let actions = db.root().child("x").unwrap().on_disconnect();
        assert!(actions.update(json!(3)).unwrap_err().is_invalid_argument());
        assert!(actions
            .set_with_priority(json!(1), json!({"no": "objects"}))
            .unwrap_err()
            .is_invalid_argument());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn queued_offline_and_sent_on_connect() {
        let transport = Arc::new(MockTransport::new());
        let db = database(&transport);
        db.go_offline();
        transport.take_sent();
        let actions = db.reference("status").unwrap().on_disconnect();
        let _pending = actions.set(json!("offline")).unwrap();
        assert!(transport.sent().is_empty());

        db.go_online().unwrap();
        assert!(matches!(
            transport.sent().as_slice(),
            [ClientMessage::OnDisconnectPut { path, .. }] if path == "/status"
        ));

        db.go_offline();
        actions.cancel().unwrap().await.unwrap();
        db.go_online().unwrap();
        assert!(!transport
            .sent()
            .iter()
            .skip(1)
            .any(|m| matches!(m, ClientMessage::OnDisconnectPut { .. })));
    }
}
