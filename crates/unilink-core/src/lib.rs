#![warn(missing_docs)]

//! unilink-core: foundational types shared by every unilink endpoint.
//!
//! This crate provides the minimal set of core types used across all layers:
//! - Operation status taxonomy (`status`)
//! - Operation records for open/close/send/receive (`op`)
//! - Deadline resolution and saturating time arithmetic (`deadline`)
//!
//! Endpoint-specific logic lives in specialized crates:
//! - `unilink-filter`: chainable byte filters and the storage planner
//! - `unilink-endpoint`: the operation dispatcher and endpoint variants
//! - `unilink-udp` / `unilink-tcp`: concrete transports

/// Deadline resolution and saturating time arithmetic.
pub mod deadline;
/// Operation records carried through the dispatcher.
pub mod op;
/// Operation status taxonomy.
pub mod status;

pub use deadline::Timeout;
pub use op::{CloseOp, OpenOp, RecvOp, SendOp};
pub use status::{FilterAbortKind, Status, StatusError};
