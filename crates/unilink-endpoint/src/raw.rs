use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use unilink_core::{CloseOp, OpenOp, RecvOp, SendOp, Status, Timeout};

use crate::engine::Engine;
use crate::options::{ArgsSlot, CommonOpts, OpenRequest, Timeouts};
use crate::state::{Category, CoreState, OpFlags, OpSlot};
use crate::transport::Transport;
use crate::RecvResult;

/// A single-threaded, cooperative endpoint over a [`Transport`].
///
/// Every public call runs the management step inline on the caller's thread
/// until the operation resolves or its deadline passes; there is no
/// management thread and no cross-thread waking. Concurrent use from
/// multiple threads is prevented by the `&mut self` receivers. Receive
/// callbacks are not available — with no management thread there would be
/// nothing to drive them — so options carrying one are rejected with
/// `RecvCallbackNotValidInRaw`.
pub struct RawEndpoint<T: Transport> {
    engine: Engine<T>,
    state: CoreState<T::OpenArgs>,
    open_args: Arc<Mutex<ArgsSlot<T::OpenArgs>>>,
    timeouts: Timeouts,
    name: &'static str,
    id: i32,
}

impl<T: Transport> RawEndpoint<T> {
    /// Constructs the transport inline and returns the endpoint.
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, Timeouts::default())
    }

    /// Like [`RawEndpoint::new`] with explicit per-category default
    /// timeouts.
    pub fn with_timeouts(transport: T, timeouts: Timeouts) -> Self {
        let name = transport.name();
        let id = transport.id();
        let open_args = Arc::new(Mutex::new(ArgsSlot::default()));
        let mut engine = Engine::new(transport, Arc::clone(&open_args), timeouts);
        engine.construct();
        let mut state = CoreState::default();
        state.flags.complete(Category::Construct);
        Self { engine, state, open_args, timeouts, name, id }
    }

    /// Opens the endpoint with the saved arguments; fails with
    /// `FailedAlreadyOpen` if it is already open.
    pub fn open(&mut self) -> Status {
        self.do_open(None, CommonOpts::new(), Timeout::Default, true)
    }

    /// Opens the endpoint with new arguments.
    pub fn open_with_args(&mut self, args: T::OpenArgs) -> Status {
        self.do_open(Some(args), CommonOpts::new(), Timeout::Default, true)
    }

    /// Opens with optional new arguments, common options, and a timeout.
    pub fn open_with(
        &mut self,
        args: Option<T::OpenArgs>,
        opts: CommonOpts,
        timeout: Timeout,
    ) -> Status {
        self.do_open(args, opts, timeout, true)
    }

    /// Reopens the endpoint (closing first if open) with the saved
    /// arguments.
    pub fn reopen(&mut self) -> Status {
        self.do_open(None, CommonOpts::new(), Timeout::Default, false)
    }

    /// Reopens the endpoint with new arguments.
    pub fn reopen_with_args(&mut self, args: T::OpenArgs) -> Status {
        self.do_open(Some(args), CommonOpts::new(), Timeout::Default, false)
    }

    /// Reopens with optional new arguments, common options, and a timeout.
    pub fn reopen_with(
        &mut self,
        args: Option<T::OpenArgs>,
        opts: CommonOpts,
        timeout: Timeout,
    ) -> Status {
        self.do_open(args, opts, timeout, false)
    }

    /// Closes the endpoint with the default close timeout.
    pub fn close(&mut self) -> Status {
        self.close_within(Timeout::Default)
    }

    /// Closes the endpoint within the given timeout.
    pub fn close_within(&mut self, timeout: Timeout) -> Status {
        if let Some(status) = self.gate(Category::Close, true) {
            return status;
        }
        let deadline = timeout.resolve(self.timeouts.close);
        self.state.close = OpSlot::Requested(CloseOp::new(deadline));
        self.state.flags.start_request(Category::Close);
        if !self.run_until_complete(Category::Close) {
            return Status::CanceledInDestroy;
        }
        let op = self.state.close.take_completed().expect("completed close present");
        self.state.flags.clear(Category::Close);
        op.status
    }

    /// Sends bytes with the default send timeout.
    pub fn send(&mut self, data: &[u8]) -> Status {
        self.send_with(None, data, Timeout::Default)
    }

    /// Sends bytes over a specific channel.
    pub fn send_on(&mut self, channel: i32, data: &[u8]) -> Status {
        self.send_with(Some(channel), data, Timeout::Default)
    }

    /// Sends bytes within the given timeout.
    pub fn send_within(&mut self, data: &[u8], timeout: Timeout) -> Status {
        self.send_with(None, data, timeout)
    }

    /// Sends bytes with an optional target channel and timeout.
    pub fn send_with(&mut self, channel: Option<i32>, data: &[u8], timeout: Timeout) -> Status {
        if let Some(status) = self.gate(Category::Send, true) {
            return status;
        }
        let deadline = timeout.resolve(self.timeouts.send);
        self.state.send = OpSlot::Requested(SendOp::new(data, channel, deadline));
        self.state.flags.start_request(Category::Send);
        if !self.run_until_complete(Category::Send) {
            return Status::CanceledInDestroy;
        }
        let op = self.state.send.take_completed().expect("completed send present");
        self.state.flags.clear(Category::Send);
        op.status
    }

    /// Receives bytes into `buf` with the default receive timeout.
    pub fn receive(&mut self, buf: &mut [u8]) -> RecvResult {
        self.receive_within(buf, Timeout::Default)
    }

    /// Receives bytes into `buf` within the given timeout.
    pub fn receive_within(&mut self, buf: &mut [u8], timeout: Timeout) -> RecvResult {
        if let Some(status) = self.gate(Category::Receive, true) {
            return RecvResult { status, len: 0, channel: None };
        }
        let deadline = timeout.resolve(self.timeouts.recv);
        self.state.recv = OpSlot::Requested(RecvOp::with_capacity(buf.len(), deadline));
        self.state.flags.start_request(Category::Receive);
        if !self.run_until_complete(Category::Receive) {
            return RecvResult { status: Status::CanceledInDestroy, len: 0, channel: None };
        }
        let op = self.state.recv.take_completed().expect("completed receive present");
        self.state.flags.clear(Category::Receive);
        buf[..op.received].copy_from_slice(op.payload());
        RecvResult { status: op.status, len: op.received, channel: op.channel }
    }

    /// The status of the most recent open, or the error behind an
    /// unsolicited closure.
    pub fn open_status(&self) -> Status {
        self.state.open_status
    }

    /// True while the endpoint is open.
    pub fn is_open(&self) -> bool {
        self.state.open_status == Status::Success
    }

    /// A copy of the last used open arguments, if any.
    pub fn get_open_args(&self) -> Option<T::OpenArgs> {
        let slot = self.open_args.lock();
        slot.initialized.then(|| slot.value.clone())
    }

    /// Stores arguments for the next `open`/`reopen` call without opening.
    pub fn set_open_args(&mut self, args: T::OpenArgs) {
        let mut slot = self.open_args.lock();
        slot.value = args;
        slot.initialized = true;
    }

    /// The transport's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The transport's numeric id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// This variant never runs a management thread.
    pub fn is_threadsafe(&self) -> bool {
        false
    }

    /// Tears the endpoint down inline. Idempotent; also invoked by `Drop`.
    pub fn destroy(&mut self) {
        if self.state.flags.is_any(OpFlags::ANY_DESTROY) {
            return;
        }
        self.state.flags.start_request(Category::Destroy);
        self.state.flags.accept(Category::Destroy);
        self.state.open_status = Status::NotOpen;
        self.engine.on_destroy();
        self.engine.destruct();
        self.state.flags.complete(Category::Destroy);
    }

    fn do_open(
        &mut self,
        args: Option<T::OpenArgs>,
        opts: CommonOpts,
        timeout: Timeout,
        fail_if_open: bool,
    ) -> Status {
        if opts.installs_callback() {
            return Status::RecvCallbackNotValidInRaw;
        }
        if let Some(status) = self.gate(Category::Open, false) {
            return status;
        }
        if fail_if_open && self.state.open_status == Status::Success {
            return Status::FailedAlreadyOpen;
        }
        if args.is_none() && !self.open_args.lock().initialized {
            return Status::NoPriorOpenArgs;
        }
        let deadline = opts.resolve_open_deadline(timeout, self.timeouts.open);
        self.state.open =
            OpSlot::Requested(OpenRequest { op: OpenOp::new(deadline), args, opts });
        self.state.flags.start_request(Category::Open);
        if !self.run_until_complete(Category::Open) {
            return Status::CanceledInDestroy;
        }
        let req = self.state.open.take_completed().expect("completed open present");
        self.state.flags.clear(Category::Open);
        req.op.status
    }

    /// Immediate admission checks; also gives auto-reopen its chance to run,
    /// since with no management thread retries can only happen during calls.
    fn gate(&mut self, category: Category, needs_open: bool) -> Option<Status> {
        self.poll_auto_reopen();
        if self.state.flags.is_any(OpFlags::ANY_DESTROY) {
            return Some(Status::CanceledInDestroy);
        }
        if needs_open && self.state.open_status != Status::Success {
            return Some(Status::NotOpen);
        }
        if category == Category::Receive && self.state.recv_disabled {
            return Some(Status::Disabled);
        }
        None
    }

    fn poll_auto_reopen(&mut self) {
        self.engine.fire_auto_reopen_if_due(Instant::now());
        while self.engine.synthetic_in_flight() {
            self.engine.service();
            self.engine.finalize(&mut self.state, Instant::now());
        }
    }

    fn run_until_complete(&mut self, category: Category) -> bool {
        loop {
            self.engine.take_requests(&mut self.state);
            self.engine.service();
            self.engine.finalize(&mut self.state, Instant::now());
            if self.state.flags.is_complete(category) {
                return true;
            }
            if self.state.flags.is_any(OpFlags::ANY_DESTROY) {
                return false;
            }
        }
    }
}

impl<T: Transport> Drop for RawEndpoint<T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
