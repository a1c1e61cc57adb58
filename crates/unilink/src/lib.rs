#![warn(missing_docs)]

//! Unilink: a small public API facade for the workspace.
//!
//! This crate re-exports the most commonly used types for building uniform
//! byte transport endpoints:
//!
//! - Endpoint variants and the transport hook trait
//!   (`Endpoint`, `RawEndpoint`, `Connection`, `Transport`)
//! - Status and timeout types (`Status`, `Timeout`)
//! - Common open options and callbacks (`CommonOpts`, `RecvCallback`)
//! - Filters and chaining (`Chain`, `Append`, `Delimit`, `slip`, ...)
//! - The bundled UDP and TCP transports
//!
//! Example
//! ```no_run
//! use unilink::prelude::*;
//!
//! let server = Endpoint::new(UdpTransport::new());
//! let status = server.open_with(
//!     Some(UdpArgs::server("127.0.0.1:9000".parse().unwrap())),
//!     CommonOpts::new().recv_filter(slip::Decode::new()),
//!     Timeout::Default,
//! );
//! assert!(status.is_success());
//!
//! let mut buf = [0u8; 1500];
//! let got = server.receive(&mut buf);
//! println!("{}: {} bytes", got.status, got.len);
//! ```

// Core status, operations, and deadlines
pub use unilink_core::{deadline, op, CloseOp, FilterAbortKind, OpenOp, RecvOp, SendOp, Status,
    StatusError, Timeout};
// Filters: the framework and the built-ins
pub use unilink_filter::{slip, Append, Chain, Data, Delimit, Filter, FilterResult, FixedSize,
    ForwardByCopy, ForwardByPointing, InputPolicy, Repeat, Scratch, SplitAbove, StoragePolicy,
    DEFAULT_MAX_PACKET_SIZE};
// The dispatcher: endpoint variants, options, and the transport contract
pub use unilink_endpoint::{shared_callback, shared_filter, CommonOpts, Connection, Endpoint,
    LinkCtx, NoopWaker, RawEndpoint, RecvCallback, RecvResult, SendRecv, Timeouts, Transport,
    TransportWaker};
// Bundled transports
pub use unilink_tcp::{TcpArgs, TcpRole, TcpTransport};
pub use unilink_udp::{UdpArgs, UdpRole, UdpTransport};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        slip, Append, Chain, CommonOpts, Connection, Delimit, Endpoint, FixedSize, RawEndpoint,
        RecvCallback, RecvResult, Repeat, SplitAbove, Status, TcpArgs, TcpTransport, Timeout,
        UdpArgs, UdpTransport,
    };
}
