//! # Canopy Sync Server
//!
//! Reference authoritative server for canopy clients.
//!
//! This crate provides:
//! - Sessions opened by a handshake (optionally authenticated)
//! - Listens answered with the current value and kept up to date
//! - Plain and conditional (hash checked) writes
//! - Per-session disconnect actions run when the session closes
//! - Authentication with HMAC-SHA256 tokens
//! - Prefix based read/write rules, with listener revocation
//!
//! # Architecture
//!
//! The server holds one tree in memory using the same node model as the
//! clients. It does not do I/O: a transport hands it decoded
//! [`ClientMessage`](canopy_sync_protocol::ClientMessage)s and receives
//! [`ServerMessage`](canopy_sync_protocol::ServerMessage)s through the
//! session sink registered at handshake time.
//!
//! # Authentication
//!
//! ```rust
//! use canopy_sync_server::{AuthConfig, ServerConfig, TokenValidator, TreeServer};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let server = TreeServer::new(ServerConfig::default().with_auth(secret.clone()));
//!
//! let validator = TokenValidator::new(AuthConfig::new(secret));
//! let token = validator.create_token([7u8; 16]).unwrap();
//! assert_eq!(validator.validate_token(&token).unwrap(), [7u8; 16]);
//! # let _ = server;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod rules;
mod server;

pub use auth::{AuthConfig, TokenClaims, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use rules::Rules;
pub use server::{SessionId, SessionSink, TreeServer};
