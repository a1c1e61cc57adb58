#![warn(missing_docs)]

//! unilink-filter: chainable, copy-minimising byte filters.
//!
//! A [`Filter`] is a stateful transform applied to bytes crossing an
//! endpoint boundary. Filters compose into a [`Chain`] that behaves like a
//! single filter; before any bytes flow, the chain plans which storage slot
//! each stage reads from and writes to so that in-place transforms reuse
//! upstream buffers and the receive tail can write straight into the user's
//! destination buffer.
//!
//! The built-in filters cover the common framing jobs: appending trailer
//! bytes, fixed-size segmentation, size-capped splitting, delimiter
//! scanning, repetition, and RFC-1055 SLIP encode/decode.

mod builtin;
mod chain;
mod filter;
mod slip_codec;
mod storage;

/// RFC-1055 SLIP framing filters.
pub mod slip {
    pub use crate::slip_codec::{Decode, Encode, FRAME_END, FRAME_ESC, TRANS_END, TRANS_ESC};
}

pub use builtin::{Append, Delimit, FixedSize, ForwardByCopy, ForwardByPointing, Repeat, SplitAbove};
pub use chain::{Chain, Pump, RunResult};
pub use filter::{Filter, FilterResult, InputPolicy, Scratch, StoragePolicy};
pub use storage::{Data, SlotId, Storage};

/// Default upper bound on the packet size a filter touches, matching the
/// common Ethernet MTU budget.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;
