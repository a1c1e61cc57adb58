#![warn(missing_docs)]

//! unilink-endpoint: the operation coordination engine behind every
//! concrete unilink transport.
//!
//! A [`Transport`] implements six hooks (construct/destruct, open, close,
//! send-receive, plus a sticky cross-thread waker); the endpoint variants
//! wrap it in a uniform behavioral contract:
//!
//! - [`Endpoint`]: thread-safe, with a dedicated management thread per
//!   endpoint. All hooks, filter work and receive callbacks run there.
//! - [`RawEndpoint`]: single-threaded cooperative; public calls run the
//!   management step inline.
//!
//! Operations (`open`/`reopen`/`close`/`send`/`receive`) carry deadlines
//! and finish with a [`Status`](unilink_core::Status). Composable byte
//! filters from `unilink-filter` can be attached per direction through
//! [`CommonOpts`], along with a receive callback and auto-reopen.

mod engine;
mod options;
mod pipeline;
mod raw;
mod state;
mod threadsafe;
mod transport;

pub use options::{
    shared_callback, shared_filter, CallbackSlot, CommonOpts, FilterSlot, RecvCallback, Timeouts,
};
pub use raw::RawEndpoint;
pub use state::{Category, OpFlags};
pub use threadsafe::Endpoint;
pub use transport::{LinkCtx, NoopWaker, SendRecv, Transport, TransportWaker};

use unilink_core::Status;

/// The outcome of a receive: the final status, the number of bytes written
/// into the caller's buffer, and the channel the bytes arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvResult {
    /// Final status of the receive.
    pub status: Status,
    /// Number of bytes received.
    pub len: usize,
    /// Channel/port/client id the receive occurred on, when known.
    pub channel: Option<i32>,
}

/// Object-safe view of an endpoint, for code that handles heterogeneous
/// transports at runtime. Both endpoint variants implement it.
pub trait Connection {
    /// Opens with the saved arguments; fails if already open.
    fn open(&mut self) -> Status;
    /// Reopens with the saved arguments, closing first if open.
    fn reopen(&mut self) -> Status;
    /// Closes the connection.
    fn close(&mut self) -> Status;
    /// Sends bytes with the default timeout.
    fn send(&mut self, data: &[u8]) -> Status;
    /// Receives bytes with the default timeout.
    fn receive(&mut self, buf: &mut [u8]) -> RecvResult;
    /// The status of the most recent open.
    fn open_status(&self) -> Status;
    /// True while the connection is open.
    fn is_open(&self) -> bool {
        self.open_status() == Status::Success
    }
    /// Display name of the underlying transport.
    fn name(&self) -> &'static str;
    /// Numeric id of the underlying transport.
    fn id(&self) -> i32;
    /// Whether the endpoint runs a management thread.
    fn is_threadsafe(&self) -> bool;
    /// Tears the endpoint down, canceling all pending operations.
    fn destroy(&mut self);
}

impl<T: Transport> Connection for Endpoint<T> {
    fn open(&mut self) -> Status {
        Endpoint::open(self)
    }
    fn reopen(&mut self) -> Status {
        Endpoint::reopen(self)
    }
    fn close(&mut self) -> Status {
        Endpoint::close(self)
    }
    fn send(&mut self, data: &[u8]) -> Status {
        Endpoint::send(self, data)
    }
    fn receive(&mut self, buf: &mut [u8]) -> RecvResult {
        Endpoint::receive(self, buf)
    }
    fn open_status(&self) -> Status {
        Endpoint::open_status(self)
    }
    fn name(&self) -> &'static str {
        Endpoint::name(self)
    }
    fn id(&self) -> i32 {
        Endpoint::id(self)
    }
    fn is_threadsafe(&self) -> bool {
        true
    }
    fn destroy(&mut self) {
        Endpoint::destroy(self)
    }
}

impl<T: Transport> Connection for RawEndpoint<T> {
    fn open(&mut self) -> Status {
        RawEndpoint::open(self)
    }
    fn reopen(&mut self) -> Status {
        RawEndpoint::reopen(self)
    }
    fn close(&mut self) -> Status {
        RawEndpoint::close(self)
    }
    fn send(&mut self, data: &[u8]) -> Status {
        RawEndpoint::send(self, data)
    }
    fn receive(&mut self, buf: &mut [u8]) -> RecvResult {
        RawEndpoint::receive(self, buf)
    }
    fn open_status(&self) -> Status {
        RawEndpoint::open_status(self)
    }
    fn name(&self) -> &'static str {
        RawEndpoint::name(self)
    }
    fn id(&self) -> i32 {
        RawEndpoint::id(self)
    }
    fn is_threadsafe(&self) -> bool {
        false
    }
    fn destroy(&mut self) {
        RawEndpoint::destroy(self)
    }
}
