//! # Canopy Sync Engine
//!
//! Client for the canopy realtime tree database.
//!
//! This crate provides:
//! - The [`Database`] service object and its builder
//! - [`Reference`] and [`Query`] handles with capability traits
//! - Optimistic writes with completion futures
//! - Listeners with value and child events, `once` futures
//! - Optimistic transactions with bounded retry
//! - Disconnect actions
//! - A connection facade that queues while offline and replays on reconnect
//! - Transport, auth and persistence collaborator seams
//!
//! ## Architecture
//!
//! Every cache change runs under one gate: the sync tree applies it, the
//! event router diffs the affected queries, and listeners fire before the
//! next change starts. Only the connection boundary suspends; inbound
//! server messages queue in an [`InboundSink`] and are applied by
//! [`Database::pump`], by [`Database::run`], or by awaiting any completion.
//!
//! ## Key Invariants
//!
//! - Local writes are visible and fire listeners immediately, online or not
//! - Queued writes reach the server in submission order
//! - A rejected write is reverted, with correction events, before its
//!   future resolves
//! - A detached listener never fires again
//!
//! ## Example
//!
//! ```rust
//! use canopy_sync_engine::{
//!     Database, DatabaseConfig, EventType, ListenOptions, Location, Mutation, MockTransport,
//!     QueryOps,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let db = Database::builder(DatabaseConfig::new("https://demo.canopy.test"))
//!     .transport(Arc::new(MockTransport::new()))
//!     .start_offline()
//!     .build()
//!     .unwrap();
//!
//! let scores = db.reference("scores").unwrap();
//! scores
//!     .on(ListenOptions::new(EventType::ChildAdded, |event| {
//!         println!("added {:?}", event.snapshot.key());
//!     }))
//!     .unwrap();
//! let _pending = scores.child("ada").unwrap().set(json!(42)).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used)]

mod auth;
mod config;
mod connection;
mod database;
mod error;
mod event_queue;
mod logging;
mod on_disconnect;
mod reference;
mod transaction;
mod transport;

pub use auth::{StaticTokenProvider, TokenProvider};
pub use config::{DatabaseConfig, RetryConfig, DEFAULT_TRANSACTION_RETRIES};
pub use connection::ConnectionState;
pub use database::{Completion, Database, DatabaseBuilder, OnceFuture, WriteFuture};
pub use error::{SyncError, SyncResult};
pub use logging::{enable_logging, DEFAULT_DIRECTIVE};
pub use on_disconnect::OnDisconnect;
pub use reference::{
    Disconnect, Location, Mutation, Query, QueryOps, Reference, ThenableReference,
    TransactionFuture,
};
pub use transaction::{TransactionDecision, TransactionResult};
pub use transport::{InboundEvent, InboundSink, MockTransport, Transport};

pub use canopy_core::{
    DataSnapshot, Event, EventType, ListenOptions, ListenerHandle, ServerValue,
};
