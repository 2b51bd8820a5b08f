//! # Canopy Sync Protocol
//!
//! Messages exchanged between a canopy client and its server.
//!
//! This crate provides:
//! - The session handshake
//! - Client intents: listens, writes, disconnect actions
//! - Server pushes: acknowledgments, data, revocations
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations. Paths travel as
//! slash separated strings and values as JSON trees.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;

pub use codec::{decode_message, encode_message};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AckStatus, ClientMessage, HandshakeRequest, HandshakeResponse, ServerMessage,
    PROTOCOL_VERSION,
};
