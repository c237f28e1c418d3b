//! # sync-types
//!
//! Wire format types for the queuesync encrypted relay.
//!
//! This crate provides the foundational types used across all queuesync crates:
//! - [`ClientId`], [`MessageId`], [`Revision`] - Identity and ordering types
//! - [`Envelope`] - Encrypted, versioned unit exchanged through the queue
//! - [`Command`], [`Snapshot`], [`Record`] - Plaintext payloads
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;

pub use envelope::{Cipher, Envelope, MessageType, NONCE_SIZE, SCHEMA_VERSION, TAG_SIZE};
pub use error::SyncError;
pub use ids::{ClientId, MessageId, Revision};
pub use messages::{Command, Record, Snapshot, MAX_UPDATED_AT};
