use unilink_core::{CloseOp, OpenOp, RecvOp, SendOp, Status};

/// Cross-thread wake handle for a transport.
///
/// `wake` is the only transport entry point invoked from threads other than
/// the management task, so it lives on a separate cloneable handle instead
/// of the transport itself. The signal must be **sticky**: a wake delivered
/// before the transport starts waiting must still interrupt that wait (a
/// swapped atomic flag or an eventfd-style counter, never an edge).
pub trait TransportWaker: Send + Sync + 'static {
    /// Interrupts a blocking `process_*` hook, or marks the next one to
    /// return promptly.
    fn wake(&self);
}

/// Waker for transports whose hooks never block, or that are only driven
/// through [`RawEndpoint`](crate::RawEndpoint).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopWaker;

impl TransportWaker for NoopWaker {
    fn wake(&self) {}
}

/// The endpoint state a transport hook may read and write freely.
pub struct LinkCtx<'a, A> {
    /// The endpoint's open status. Set this to an error to report an
    /// unsolicited closure; the dispatcher surfaces it to pending and
    /// subsequent operations as `NotOpen`.
    pub open_status: &'a mut Status,
    /// The most recent open arguments. Freely modifiable; a server transport
    /// may record the last peer here, for example.
    pub open_args: &'a mut A,
    /// When true, `process_send_receive` keeps being invoked even with no
    /// operation pending — used by server transports to accept and reap
    /// clients.
    pub idle_in_send_recv: &'a mut bool,
}

/// The pending operations visible to `process_send_receive`. Either side may
/// be absent; both may be serviced in a single call.
pub struct SendRecv<'a> {
    /// The pending send, if any.
    pub send: Option<&'a mut SendOp>,
    /// The pending receive, if any.
    pub recv: Option<&'a mut RecvOp>,
}

/// The hook set a concrete transport implements to live behind an endpoint.
///
/// Every hook runs on the management task. Hooks are free to block, but must
/// return promptly once the associated [`TransportWaker`] fires and should
/// bound their waits by the pending operations' deadlines
/// (see [`unilink_core::op::shortest_wait`]).
pub trait Transport: Send + 'static {
    /// Transport-specific arguments for `open`. The last used value is kept
    /// by the endpoint so `reopen` and auto-reopen can reuse it.
    type OpenArgs: Clone + Default + Send + 'static;
    /// The cross-thread wake handle type.
    type Waker: TransportWaker + Clone;

    /// Returns the wake handle. Called once, before the transport moves onto
    /// the management task.
    fn waker(&self) -> Self::Waker;

    /// First-run initialisation on the management task.
    fn construct(&mut self) {}

    /// Teardown on the management task.
    fn destruct(&mut self) {}

    /// Drives the pending open. Must end `op` before the endpoint considers
    /// the open finished; an already-open transport closes first (reopen).
    fn process_open(&mut self, op: &mut OpenOp, cx: &mut LinkCtx<'_, Self::OpenArgs>);

    /// Drives the pending close. Must end `op` before returning control.
    fn process_close(&mut self, op: &mut CloseOp, cx: &mut LinkCtx<'_, Self::OpenArgs>);

    /// Advances any pending send and/or receive; may end zero, one, or both.
    /// Invoked with neither pending when `idle_in_send_recv` is set.
    fn process_send_receive(&mut self, io: SendRecv<'_>, cx: &mut LinkCtx<'_, Self::OpenArgs>);

    /// Optional display name for the endpoint.
    fn name(&self) -> &'static str {
        "unnamed"
    }

    /// Optional numeric id for the endpoint.
    fn id(&self) -> i32 {
        -1
    }
}
