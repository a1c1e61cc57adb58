//! The management-step engine shared by both endpoint variants.
//!
//! One step is: accept requested operations, advance the filter pipelines
//! and the receive-callback driver, fire at most one transport hook in
//! close > open > send-receive priority, then finalize — expire deadlines,
//! cancel against a closed transport, install common options at open
//! completion, and publish completions back into the shared state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};
use unilink_core::{deadline, OpenOp, RecvOp, SendOp, Status};

use crate::options::{ArgsSlot, CallbackSlot, CommonOpts, Setting, Timeouts};
use crate::pipeline::{RxPipeline, TxPipeline};
use crate::state::{Category, CoreState, OpSlot};
use crate::transport::{LinkCtx, SendRecv, Transport};

struct WorkingOpen {
    op: OpenOp,
    opts: CommonOpts,
}

pub(crate) struct Engine<T: Transport> {
    transport: T,
    open_status: Status,
    idle_in_send_recv: bool,
    tx: TxPipeline,
    rx: RxPipeline,
    callback: Option<CallbackSlot>,
    cb_op: Option<RecvOp>,
    cb_deliver: Option<RecvOp>,
    auto_interval: Option<Duration>,
    auto_suspended: bool,
    next_auto_attempt: Option<Instant>,
    synthetic_open: Option<OpenOp>,
    open_args: Arc<Mutex<ArgsSlot<T::OpenArgs>>>,
    timeouts: Timeouts,
    w_send: Option<SendOp>,
    w_recv: Option<RecvOp>,
    w_open: Option<WorkingOpen>,
    w_close: Option<unilink_core::CloseOp>,
}

impl<T: Transport> Engine<T> {
    pub fn new(
        transport: T,
        open_args: Arc<Mutex<ArgsSlot<T::OpenArgs>>>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            transport,
            open_status: Status::NotOpen,
            idle_in_send_recv: false,
            tx: TxPipeline::default(),
            rx: RxPipeline::default(),
            callback: None,
            cb_op: None,
            cb_deliver: None,
            auto_interval: None,
            auto_suspended: false,
            next_auto_attempt: None,
            synthetic_open: None,
            open_args,
            timeouts,
            w_send: None,
            w_recv: None,
            w_open: None,
            w_close: None,
        }
    }

    pub fn construct(&mut self) {
        self.transport.construct();
    }

    pub fn destruct(&mut self) {
        self.open_status = Status::NotOpen;
        self.transport.destruct();
    }

    /// True while the engine must keep stepping instead of sleeping: any
    /// accepted operation, a pending auto-reopen attempt, or an open
    /// endpoint whose transport idles in send-receive or feeds a callback.
    pub fn has_active_work(&self) -> bool {
        self.w_send.is_some()
            || self.w_recv.is_some()
            || self.w_open.is_some()
            || self.w_close.is_some()
            || self.synthetic_open.is_some()
            || self.cb_deliver.is_some()
            || (self.open_status == Status::Success
                && (self.idle_in_send_recv || self.callback.is_some()))
    }

    /// When the management task may sleep, until when: the next auto-reopen
    /// attempt, if one is armed.
    pub fn auto_wait_deadline(&self) -> Option<Instant> {
        self.next_auto_attempt
    }

    /// Synthesises an open from the saved arguments once the auto-reopen
    /// interval has elapsed.
    pub fn fire_auto_reopen_if_due(&mut self, now: Instant) {
        let Some(at) = self.next_auto_attempt else { return };
        if now < at
            || self.w_open.is_some()
            || self.w_close.is_some()
            || self.synthetic_open.is_some()
        {
            return;
        }
        debug!(transport = self.transport.name(), "auto-reopen attempt");
        self.synthetic_open =
            Some(OpenOp::new(deadline::deadline_after(now, self.timeouts.open)));
        self.next_auto_attempt = None;
    }

    /// Moves requested operations into the engine's working set.
    pub fn take_requests(&mut self, st: &mut CoreState<T::OpenArgs>) {
        if st.flags.is_requested(Category::Send) {
            if let Some(op) = st.send.take_requested() {
                st.flags.accept(Category::Send);
                self.w_send = Some(op);
            }
        }
        if st.flags.is_requested(Category::Receive) {
            if let Some(op) = st.recv.take_requested() {
                st.flags.accept(Category::Receive);
                self.w_recv = Some(op);
            }
        }
        if st.flags.is_requested(Category::Close) {
            if let Some(op) = st.close.take_requested() {
                st.flags.accept(Category::Close);
                self.w_close = Some(op);
            }
        }
        if st.flags.is_requested(Category::Open) {
            if let Some(req) = st.open.take_requested() {
                st.flags.accept(Category::Open);
                // save the new arguments before the attempt, so a failed
                // open can still be retried with them
                if let Some(args) = req.args {
                    let mut slot = self.open_args.lock();
                    slot.value = args;
                    slot.initialized = true;
                }
                // an explicit open re-arms auto-reopen and supersedes any
                // synthetic attempt
                self.auto_suspended = false;
                self.synthetic_open = None;
                self.next_auto_attempt = None;
                self.w_open = Some(WorkingOpen { op: req.op, opts: req.opts });
            }
        }
    }

    /// Advances filters and the callback driver, then fires at most one
    /// transport hook, close first, then open, then send-receive.
    pub fn service(&mut self) {
        // keep the callback driver fed with an internal receive; a manual
        // receive accepted before the callback was installed finishes first
        if self.callback.is_some()
            && self.open_status == Status::Success
            && self.cb_op.is_none()
            && self.cb_deliver.is_none()
            && self.w_recv.is_none()
        {
            let capacity = self.callback.as_ref().map(|cb| cb.capacity()).unwrap_or(0);
            self.cb_op = Some(RecvOp::with_capacity(capacity, None));
        }

        // hooks work on a copy of the open arguments, written back after the
        // hook returns: holding the lock across a blocking hook would couple
        // get/set_open_args to operation traffic
        let mut args_value = self.open_args.lock().value.clone();
        self.run_hooks(&mut args_value);
        self.open_args.lock().value = args_value;
    }

    fn run_hooks(&mut self, args_value: &mut T::OpenArgs) {
        let Engine {
            transport,
            open_status,
            idle_in_send_recv,
            tx,
            rx,
            w_send,
            w_recv,
            w_open,
            w_close,
            cb_op,
            synthetic_open,
            ..
        } = self;

        let mut cx = LinkCtx {
            open_status,
            open_args: args_value,
            idle_in_send_recv,
        };

        if let Some(op) = w_close.as_mut() {
            transport.process_close(op, &mut cx);
            return;
        }
        if let Some(open) = w_open.as_mut() {
            transport.process_open(&mut open.op, &mut cx);
            return;
        }
        if let Some(op) = synthetic_open.as_mut() {
            transport.process_open(op, &mut cx);
            return;
        }

        if tx.has_filter() {
            if let Some(ext) = w_send.as_mut() {
                tx.advance(ext);
            }
        }
        if rx.has_filter() {
            if let Some(ext) = w_recv.as_mut() {
                rx.advance(ext);
            } else if let Some(ext) = cb_op.as_mut() {
                rx.advance(ext);
            }
        }

        let send_view =
            if tx.has_filter() { tx.inner.as_mut() } else { w_send.as_mut() };
        let recv_view = if rx.has_filter() {
            rx.inner.as_mut()
        } else if w_recv.is_some() {
            w_recv.as_mut()
        } else {
            cb_op.as_mut()
        };

        let any_io = send_view.is_some() || recv_view.is_some();
        if any_io || *cx.idle_in_send_recv {
            transport.process_send_receive(
                SendRecv { send: send_view, recv: recv_view },
                &mut cx,
            );

            // the transport has now had its first look; flip fresh records
            // so it can tell a continued operation from a new one
            let send_after =
                if tx.has_filter() { tx.inner.as_mut() } else { w_send.as_mut() };
            if let Some(op) = send_after {
                if op.status == Status::StartNewOp {
                    op.status = Status::InProgress;
                }
            }
            let recv_after = if rx.has_filter() {
                rx.inner.as_mut()
            } else if w_recv.is_some() {
                w_recv.as_mut()
            } else {
                cb_op.as_mut()
            };
            if let Some(op) = recv_after {
                if op.status == Status::StartNewOp {
                    op.status = Status::InProgress;
                }
            }
        }
    }

    /// Ends expired or cancelled operations, publishes completions, and
    /// keeps the auto-reopen timer armed.
    pub fn finalize(&mut self, st: &mut CoreState<T::OpenArgs>, now: Instant) {
        // close and open settle first: a close that just succeeded flips the
        // open status, which must cancel pending sends and receives within
        // this same step
        self.finalize_close(st, now);
        self.finalize_open(st, now);
        self.finalize_synthetic(now);
        self.finalize_send(st, now);
        self.finalize_recv(st, now);
        self.finalize_callback();

        let args_ready = self.open_args.lock().initialized;
        if self.open_status == Status::Success {
            self.next_auto_attempt = None;
        } else if self.auto_interval.is_some()
            && !self.auto_suspended
            && args_ready
            && self.w_open.is_none()
            && self.w_close.is_none()
            && self.synthetic_open.is_none()
            && self.next_auto_attempt.is_none()
        {
            self.next_auto_attempt =
                deadline::deadline_after(now, self.auto_interval.unwrap_or_default());
        }

        st.open_status = self.open_status;
        st.recv_disabled = self.callback.is_some();
    }

    fn finalize_send(&mut self, st: &mut CoreState<T::OpenArgs>, now: Instant) {
        let mut cancel = None;
        if let Some(op) = &self.w_send {
            if op.is_operating() {
                if deadline::has_expired(op.deadline, now) {
                    cancel = Some(Status::TimedOut);
                } else if self.open_status != Status::Success {
                    cancel = Some(Status::NotOpen);
                }
            }
        }
        if let Some(status) = cancel {
            if self.tx.has_filter() {
                self.tx.abandon();
            }
            if let Some(op) = self.w_send.as_mut() {
                op.end(status);
            }
        }
        if self.w_send.as_ref().is_some_and(|op| !op.is_operating()) {
            let op = self.w_send.take().expect("send op present");
            trace!(status = %op.status, "send finished");
            st.send = OpSlot::Completed(op);
            st.flags.complete(Category::Send);
        }
    }

    fn finalize_recv(&mut self, st: &mut CoreState<T::OpenArgs>, now: Instant) {
        let mut cancel = None;
        if let Some(op) = &self.w_recv {
            if op.is_operating() {
                if deadline::has_expired(op.deadline, now) {
                    cancel = Some(Status::TimedOut);
                } else if self.open_status != Status::Success {
                    cancel = Some(Status::NotOpen);
                }
            }
        }
        if let Some(status) = cancel {
            let Engine { rx, w_recv, .. } = self;
            let op = w_recv.as_mut().expect("recv op present");
            if rx.has_filter() {
                rx.abandon(op);
            }
            op.end(status);
        }
        if self.w_recv.as_ref().is_some_and(|op| !op.is_operating()) {
            let op = self.w_recv.take().expect("recv op present");
            trace!(status = %op.status, len = op.received, "receive finished");
            st.recv = OpSlot::Completed(op);
            st.flags.complete(Category::Receive);
        }
    }

    fn finalize_close(&mut self, st: &mut CoreState<T::OpenArgs>, now: Instant) {
        if let Some(op) = self.w_close.as_mut() {
            if op.is_operating() {
                if deadline::has_expired(op.deadline, now) {
                    op.end(Status::TimedOut);
                } else if self.open_status != Status::Success {
                    op.end(Status::NotOpen);
                }
            }
        }
        if self.w_close.as_ref().is_some_and(|op| !op.is_operating()) {
            let op = self.w_close.take().expect("close op present");
            if op.status == Status::Success {
                self.open_status = Status::NotOpen;
                // an explicit close turns auto-reopen off until the next
                // explicit open
                self.auto_suspended = true;
                self.next_auto_attempt = None;
            }
            debug!(status = %op.status, "close finished");
            st.close = OpSlot::Completed(op);
            st.flags.complete(Category::Close);
        }
    }

    fn finalize_open(&mut self, st: &mut CoreState<T::OpenArgs>, now: Instant) {
        if let Some(open) = self.w_open.as_mut() {
            if open.op.is_operating() && deadline::has_expired(open.op.deadline, now) {
                open.op.end(Status::TimedOut);
            }
        }
        if self.w_open.as_ref().is_some_and(|w| !w.op.is_operating()) {
            let open = self.w_open.take().expect("open op present");
            self.open_status = open.op.status;
            debug!(status = %open.op.status, "open finished");
            // options ride along with a successful open; a failed open still
            // installs them when they enable auto-reopen, so retries pick
            // them up
            if open.op.status == Status::Success || open.opts.enables_auto_reopen() {
                self.install_opts(open.opts);
            }
            st.open = OpSlot::Completed(crate::options::OpenRequest {
                op: open.op,
                args: None,
                opts: CommonOpts::default(),
            });
            st.flags.complete(Category::Open);
        }
    }

    fn finalize_synthetic(&mut self, now: Instant) {
        if let Some(op) = self.synthetic_open.as_mut() {
            if op.is_operating() && deadline::has_expired(op.deadline, now) {
                op.end(Status::TimedOut);
            }
            if !op.is_operating() {
                self.open_status = op.status;
                debug!(status = %op.status, "auto-reopen finished");
                self.synthetic_open = None;
            }
        }
    }

    fn finalize_callback(&mut self) {
        let mut cancel = false;
        if let Some(op) = &self.cb_op {
            if op.is_operating() && self.open_status != Status::Success {
                cancel = true;
            }
        }
        if cancel {
            let Engine { rx, cb_op, .. } = self;
            let op = cb_op.as_mut().expect("callback op present");
            if rx.has_filter() {
                rx.abandon(op);
            }
            op.end(Status::NotOpen);
        }
        if self.cb_op.as_ref().is_some_and(|op| !op.is_operating()) {
            let op = self.cb_op.take().expect("callback op present");
            if op.status == Status::NotOpen {
                // the driver goes quiet until the endpoint reopens
                return;
            }
            self.cb_deliver = Some(op);
        }
    }

    /// Invokes a completed callback receive. Runs outside every dispatcher
    /// lock, so a slow sink never stalls calls arriving from other threads.
    /// The sink must not issue blocking operations against its own endpoint;
    /// it runs on the management task that would have to serve them.
    pub fn deliver_callback(&mut self) {
        let Some(op) = self.cb_deliver.take() else { return };
        if let Some(cb) = self.callback.as_mut() {
            cb.invoke(&op);
        }
        // reuse the record if the installed callback still matches it
        let capacity = self.callback.as_ref().map(|cb| cb.capacity());
        if capacity == Some(op.capacity()) {
            let mut op = op;
            op.reset_for_reuse();
            self.cb_op = Some(op);
        }
    }

    fn install_opts(&mut self, opts: CommonOpts) {
        let rx_touched = matches!(opts.rx_filter, Setting::Update(_));
        let cb_touched = matches!(opts.callback, Setting::Update(_));
        if rx_touched || cb_touched {
            // the driver's in-flight receive cannot survive a filter or
            // callback swap; recover its buffer and let the driver restart
            let Engine { rx, cb_op, .. } = self;
            if let Some(op) = cb_op.as_mut() {
                if rx.has_filter() {
                    rx.abandon(op);
                }
            }
            *cb_op = None;
        }
        if cb_touched {
            self.cb_deliver = None;
        }
        if let Setting::Update(value) = opts.callback {
            self.callback = value;
        }
        if let Setting::Update(value) = opts.rx_filter {
            self.rx.replace_filter(value);
        }
        if let Setting::Update(value) = opts.tx_filter {
            self.tx.replace_filter(value);
        }
        if let Setting::Update(value) = opts.auto_reopen {
            self.auto_interval = value;
            self.next_auto_attempt = None;
        }
    }

    /// True while a synthesised auto-reopen attempt is being processed.
    pub fn synthetic_in_flight(&self) -> bool {
        self.synthetic_open.is_some()
    }

    pub fn on_destroy(&mut self) {
        self.open_status = Status::NotOpen;
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }
}
