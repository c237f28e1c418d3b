//! # sync-core
//!
//! Pure logic for queuesync (no I/O, instant tests).
//!
//! This crate implements the decision logic of the relay engine without any
//! network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about convergence
//!
//! The actual I/O (queue calls, store writes) is performed by `sync-client`,
//! which interprets the decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod merge;
pub mod revisions;
pub mod seen;
pub mod state;
pub mod throttle;

pub use backoff::RetryPolicy;
pub use merge::{compare_versions, merge, MergeOutcome, MergeStats};
pub use revisions::{PeerRevisions, SnapshotDecision};
pub use seen::SeenMessages;
pub use state::{LinkAction, LinkEvent, LinkState};
pub use throttle::ThrottlePolicy;
