//! # Canopy Testkit
//!
//! Test utilities for canopy.
//!
//! This crate provides:
//! - A loopback transport that connects clients to an in-process server
//! - Fixtures for a shared server and any number of clients
//! - An event log for asserting listener output
//! - Property-based generators for keys, values and writes
//!
//! ## Usage
//!
//! ```rust
//! use canopy_testkit::prelude::*;
//! use canopy_sync_engine::{EventType, Location, Mutation, QueryOps};
//! use serde_json::json;
//!
//! let harness = TestHarness::new();
//! let alice = harness.client();
//! let bob = harness.client();
//!
//! let log = EventLog::new();
//! bob.reference("greeting").unwrap().on(log.options(EventType::Value)).unwrap();
//! let _ = alice.reference("greeting").unwrap().set(json!("hi")).unwrap();
//! settle(&alice);
//! settle(&bob);
//! assert_eq!(log.take_values().last(), Some(&json!("hi")));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod loopback;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::loopback::*;
}

pub use fixtures::*;
pub use generators::*;
pub use loopback::*;
