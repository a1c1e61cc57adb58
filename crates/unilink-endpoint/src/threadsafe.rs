use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;
use unilink_core::{CloseOp, OpenOp, RecvOp, SendOp, Status, Timeout};

use crate::engine::Engine;
use crate::options::{ArgsSlot, CommonOpts, OpenRequest, Timeouts};
use crate::state::{Category, CoreState, OpFlags, OpSlot};
use crate::transport::{Transport, TransportWaker};
use crate::RecvResult;

struct Shared<A> {
    state: Mutex<CoreState<A>>,
    cond: Condvar,
}

impl<A> Default for Shared<A> {
    fn default() -> Self {
        Self { state: Mutex::new(CoreState::default()), cond: Condvar::new() }
    }
}

/// A thread-safe endpoint over a [`Transport`].
///
/// A dedicated management thread is spawned at construction; every transport
/// hook, filter step, and receive callback runs there. Public calls may be
/// made from any thread and block until their operation reaches a final
/// status — at most one operation per category is pending at a time, sends
/// and receives may overlap each other but never an open or close, and a
/// destroy preempts everything.
pub struct Endpoint<T: Transport> {
    shared: Arc<Shared<T::OpenArgs>>,
    open_args: Arc<Mutex<ArgsSlot<T::OpenArgs>>>,
    waker: T::Waker,
    timeouts: Timeouts,
    name: &'static str,
    id: i32,
    thread: Option<JoinHandle<()>>,
}

impl<T: Transport> Endpoint<T> {
    /// Spawns the management thread and returns the endpoint. The transport
    /// is constructed on the management thread before the first operation.
    pub fn new(transport: T) -> Self {
        Self::with_timeouts(transport, Timeouts::default())
    }

    /// Like [`Endpoint::new`] with explicit per-category default timeouts.
    pub fn with_timeouts(transport: T, timeouts: Timeouts) -> Self {
        let waker = transport.waker();
        let name = transport.name();
        let id = transport.id();
        let shared = Arc::new(Shared::default());
        let open_args = Arc::new(Mutex::new(ArgsSlot::default()));
        let engine = Engine::new(transport, Arc::clone(&open_args), timeouts);

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("unilink-{name}"))
            .spawn(move || management_main(engine, thread_shared))
            .expect("failed to spawn endpoint management thread");

        Self { shared, open_args, waker, timeouts, name, id, thread: Some(thread) }
    }

    /// Opens the endpoint with the saved arguments; fails with
    /// `FailedAlreadyOpen` if it is already open.
    pub fn open(&self) -> Status {
        self.do_open(None, CommonOpts::new(), Timeout::Default, true)
    }

    /// Opens the endpoint with new arguments.
    pub fn open_with_args(&self, args: T::OpenArgs) -> Status {
        self.do_open(Some(args), CommonOpts::new(), Timeout::Default, true)
    }

    /// Opens with optional new arguments, common options, and a timeout.
    pub fn open_with(
        &self,
        args: Option<T::OpenArgs>,
        opts: CommonOpts,
        timeout: Timeout,
    ) -> Status {
        self.do_open(args, opts, timeout, true)
    }

    /// Reopens the endpoint (closing first if open) with the saved
    /// arguments.
    pub fn reopen(&self) -> Status {
        self.do_open(None, CommonOpts::new(), Timeout::Default, false)
    }

    /// Reopens the endpoint with new arguments.
    pub fn reopen_with_args(&self, args: T::OpenArgs) -> Status {
        self.do_open(Some(args), CommonOpts::new(), Timeout::Default, false)
    }

    /// Reopens with optional new arguments, common options, and a timeout.
    pub fn reopen_with(
        &self,
        args: Option<T::OpenArgs>,
        opts: CommonOpts,
        timeout: Timeout,
    ) -> Status {
        self.do_open(args, opts, timeout, false)
    }

    /// Closes the endpoint with the default close timeout.
    pub fn close(&self) -> Status {
        self.close_within(Timeout::Default)
    }

    /// Closes the endpoint within the given timeout.
    pub fn close_within(&self, timeout: Timeout) -> Status {
        let deadline = timeout.resolve(self.timeouts.close);
        let mut st = self.shared.state.lock();
        if let Err(status) = self.wait_install(&mut st, Category::Close, true, deadline) {
            return status;
        }
        st.close = OpSlot::Requested(CloseOp::new(deadline));
        st.flags.start_request(Category::Close);
        self.wake_after_install(&mut st);
        drop(st);
        self.shared.cond.notify_all();

        let mut st = self.shared.state.lock();
        match self.wait_complete(&mut st, Category::Close) {
            Err(status) => status,
            Ok(()) => {
                let op = st.close.take_completed().expect("completed close present");
                st.flags.clear(Category::Close);
                drop(st);
                self.shared.cond.notify_all();
                op.status
            }
        }
    }

    /// Sends bytes with the default send timeout.
    pub fn send(&self, data: &[u8]) -> Status {
        self.send_with(None, data, Timeout::Default)
    }

    /// Sends bytes over a specific channel.
    pub fn send_on(&self, channel: i32, data: &[u8]) -> Status {
        self.send_with(Some(channel), data, Timeout::Default)
    }

    /// Sends bytes within the given timeout.
    pub fn send_within(&self, data: &[u8], timeout: Timeout) -> Status {
        self.send_with(None, data, timeout)
    }

    /// Sends bytes with an optional target channel and timeout.
    pub fn send_with(&self, channel: Option<i32>, data: &[u8], timeout: Timeout) -> Status {
        let deadline = timeout.resolve(self.timeouts.send);
        let mut st = self.shared.state.lock();
        if let Err(status) = self.wait_install(&mut st, Category::Send, true, deadline) {
            return status;
        }
        st.send = OpSlot::Requested(SendOp::new(data, channel, deadline));
        st.flags.start_request(Category::Send);
        self.wake_after_install(&mut st);
        drop(st);
        self.shared.cond.notify_all();

        let mut st = self.shared.state.lock();
        match self.wait_complete(&mut st, Category::Send) {
            Err(status) => status,
            Ok(()) => {
                let op = st.send.take_completed().expect("completed send present");
                st.flags.clear(Category::Send);
                drop(st);
                self.shared.cond.notify_all();
                op.status
            }
        }
    }

    /// Receives bytes into `buf` with the default receive timeout.
    pub fn receive(&self, buf: &mut [u8]) -> RecvResult {
        self.receive_within(buf, Timeout::Default)
    }

    /// Receives bytes into `buf` within the given timeout.
    pub fn receive_within(&self, buf: &mut [u8], timeout: Timeout) -> RecvResult {
        let deadline = timeout.resolve(self.timeouts.recv);
        let mut st = self.shared.state.lock();
        if let Err(status) = self.wait_install(&mut st, Category::Receive, true, deadline) {
            return RecvResult { status, len: 0, channel: None };
        }
        st.recv = OpSlot::Requested(RecvOp::with_capacity(buf.len(), deadline));
        st.flags.start_request(Category::Receive);
        self.wake_after_install(&mut st);
        drop(st);
        self.shared.cond.notify_all();

        let mut st = self.shared.state.lock();
        match self.wait_complete(&mut st, Category::Receive) {
            Err(status) => RecvResult { status, len: 0, channel: None },
            Ok(()) => {
                let op = st.recv.take_completed().expect("completed receive present");
                st.flags.clear(Category::Receive);
                drop(st);
                self.shared.cond.notify_all();
                buf[..op.received].copy_from_slice(op.payload());
                RecvResult { status: op.status, len: op.received, channel: op.channel }
            }
        }
    }

    /// The status of the most recent open, or the error behind an
    /// unsolicited closure.
    pub fn open_status(&self) -> Status {
        self.shared.state.lock().open_status
    }

    /// True while the endpoint is open.
    pub fn is_open(&self) -> bool {
        self.open_status() == Status::Success
    }

    /// A copy of the last used open arguments, if any open or
    /// [`Endpoint::set_open_args`] recorded them.
    pub fn get_open_args(&self) -> Option<T::OpenArgs> {
        let slot = self.open_args.lock();
        slot.initialized.then(|| slot.value.clone())
    }

    /// Stores arguments for the next `open`/`reopen` call without opening.
    pub fn set_open_args(&self, args: T::OpenArgs) {
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

    /// This variant always runs a management thread.
    pub fn is_threadsafe(&self) -> bool {
        true
    }

    /// Tears the endpoint down: cancels every pending operation with
    /// `CanceledInDestroy`, runs the transport's `destruct` on the
    /// management thread, and forces the open status to `NotOpen`.
    /// Idempotent and safe from any thread; also invoked by `Drop`.
    pub fn destroy(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.flags.is_any(OpFlags::ANY_DESTROY) {
                while !st.flags.is_complete(Category::Destroy) {
                    self.shared.cond.wait(&mut st);
                }
                return;
            }
            st.flags.start_request(Category::Destroy);
            while !st.flags.is_complete(Category::Construct) {
                self.shared.cond.wait(&mut st);
            }
            if !st.flags.is_complete(Category::Destroy) {
                self.waker.wake();
            }
        }
        self.shared.cond.notify_all();

        let mut st = self.shared.state.lock();
        while !st.flags.is_complete(Category::Destroy) {
            self.shared.cond.wait(&mut st);
        }
    }

    fn do_open(
        &self,
        args: Option<T::OpenArgs>,
        opts: CommonOpts,
        timeout: Timeout,
        fail_if_open: bool,
    ) -> Status {
        let deadline = opts.resolve_open_deadline(timeout, self.timeouts.open);
        let mut st = self.shared.state.lock();
        if let Err(status) = self.wait_install(&mut st, Category::Open, false, deadline) {
            return status;
        }
        if fail_if_open && st.open_status == Status::Success {
            return Status::FailedAlreadyOpen;
        }
        if args.is_none() && !self.open_args.lock().initialized {
            return Status::NoPriorOpenArgs;
        }
        st.open = OpSlot::Requested(OpenRequest { op: OpenOp::new(deadline), args, opts });
        st.flags.start_request(Category::Open);
        self.wake_after_install(&mut st);
        drop(st);
        self.shared.cond.notify_all();

        let mut st = self.shared.state.lock();
        match self.wait_complete(&mut st, Category::Open) {
            Err(status) => status,
            Ok(()) => {
                let req = st.open.take_completed().expect("completed open present");
                st.flags.clear(Category::Open);
                drop(st);
                self.shared.cond.notify_all();
                req.op.status
            }
        }
    }

    /// Blocks until this category may install a new operation: the category
    /// is idle and no open/close is in flight. Bails out early on destroy,
    /// on a closed endpoint for operations that need it open, on a disabled
    /// receive category, and on deadline expiry.
    fn wait_install(
        &self,
        st: &mut MutexGuard<'_, CoreState<T::OpenArgs>>,
        category: Category,
        needs_open: bool,
        deadline: Option<Instant>,
    ) -> Result<(), Status> {
        loop {
            if let Some(result) = Self::install_gate(st, category, needs_open) {
                return result;
            }
            match deadline {
                Some(at) => {
                    if self.shared.cond.wait_until(st, at).timed_out() {
                        return match Self::install_gate(st, category, needs_open) {
                            Some(result) => result,
                            None => Err(Status::TimedOut),
                        };
                    }
                }
                None => self.shared.cond.wait(st),
            }
        }
    }

    fn install_gate(
        st: &CoreState<T::OpenArgs>,
        category: Category,
        needs_open: bool,
    ) -> Option<Result<(), Status>> {
        if st.flags.is_any(OpFlags::ANY_DESTROY) {
            return Some(Err(Status::CanceledInDestroy));
        }
        if needs_open && st.open_status != Status::Success {
            return Some(Err(Status::NotOpen));
        }
        if category == Category::Receive && st.recv_disabled {
            return Some(Err(Status::Disabled));
        }
        if !st.flags.is_any(OpFlags::ANY_OPEN_OR_CLOSE) && !st.flags.is_busy(category) {
            return Some(Ok(()));
        }
        None
    }

    /// The waker must not fire before the transport is constructed.
    fn wake_after_install(&self, st: &mut MutexGuard<'_, CoreState<T::OpenArgs>>) {
        while !st.flags.is_complete(Category::Construct) {
            self.shared.cond.wait(st);
        }
        self.waker.wake();
    }

    fn wait_complete(
        &self,
        st: &mut MutexGuard<'_, CoreState<T::OpenArgs>>,
        category: Category,
    ) -> Result<(), Status> {
        loop {
            if st.flags.is_any(OpFlags::ANY_DESTROY) {
                return Err(Status::CanceledInDestroy);
            }
            if st.flags.is_complete(category) {
                return Ok(());
            }
            self.shared.cond.wait(st);
        }
    }
}

impl<T: Transport> Drop for Endpoint<T> {
    fn drop(&mut self) {
        self.destroy();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn management_main<T: Transport>(mut engine: Engine<T>, shared: Arc<Shared<T::OpenArgs>>) {
    engine.construct();
    {
        let mut st = shared.state.lock();
        st.flags.complete(Category::Construct);
    }
    shared.cond.notify_all();

    loop {
        let mut destroying = false;
        {
            let mut st = shared.state.lock();
            loop {
                if st.flags.is_any(OpFlags::ANY_REQUEST) || engine.has_active_work() {
                    break;
                }
                match engine.auto_wait_deadline() {
                    Some(at) => {
                        if shared.cond.wait_until(&mut st, at).timed_out() {
                            engine.fire_auto_reopen_if_due(Instant::now());
                            break;
                        }
                    }
                    None => shared.cond.wait(&mut st),
                }
            }
            if st.flags.is_requested(Category::Destroy) {
                st.flags.accept(Category::Destroy);
                st.open_status = Status::NotOpen;
                engine.on_destroy();
                destroying = true;
            } else {
                engine.take_requests(&mut st);
            }
        }
        shared.cond.notify_all();
        if destroying {
            break;
        }

        engine.service();

        {
            let mut st = shared.state.lock();
            engine.finalize(&mut st, Instant::now());
        }
        shared.cond.notify_all();

        engine.deliver_callback();
    }

    debug!(transport = engine.transport_name(), "endpoint destroying");
    engine.destruct();
    {
        let mut st = shared.state.lock();
        st.flags.complete(Category::Destroy);
    }
    shared.cond.notify_all();
}
