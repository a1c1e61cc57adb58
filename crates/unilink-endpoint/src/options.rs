use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use unilink_core::{deadline, OpenOp, RecvOp, Timeout};
use unilink_filter::Chain;

/// Per-category default timeouts for an endpoint, used whenever an operation
/// is issued with [`Timeout::Default`].
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// Default receive timeout.
    pub recv: Duration,
    /// Default send timeout.
    pub send: Duration,
    /// Default open timeout.
    pub open: Duration,
    /// Default close timeout.
    pub close: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            recv: Duration::from_secs(30),
            send: Duration::from_secs(1),
            open: Duration::from_secs(1),
            close: Duration::from_secs(1),
        }
    }
}

/// A common option that is only applied when the caller wrote it.
#[derive(Clone, Debug, Default)]
pub(crate) enum Setting<T> {
    /// Replace the current value.
    Update(T),
    /// Leave whatever a previous open installed.
    #[default]
    UseExisting,
}

/// The open-timeout option, which can carry an absolute time, a relative
/// duration, "no timeout", or defer to the endpoint default.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) enum OpenTimeoutSetting {
    At(Instant),
    After(Duration),
    Never,
    UseDefault,
    #[default]
    UseExisting,
}

/// A filter installed on one direction of an endpoint: either owned by the
/// endpoint outright, or shared between several endpoints behind a mutex.
pub enum FilterSlot {
    /// The endpoint owns the chain.
    Owned(Chain),
    /// The chain is shared; it is locked for the duration of each
    /// management step that uses it.
    Shared(Arc<Mutex<Chain>>),
}

impl FilterSlot {
    pub(crate) fn with<R>(&mut self, f: impl FnOnce(&mut Chain) -> R) -> R {
        match self {
            FilterSlot::Owned(chain) => f(chain),
            FilterSlot::Shared(chain) => f(&mut chain.lock()),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        match self {
            FilterSlot::Owned(chain) => chain.is_valid(),
            FilterSlot::Shared(chain) => chain.lock().is_valid(),
        }
    }
}

/// Wraps a chain for sharing between endpoints. Installing the returned
/// handle on several endpoints keeps one filter instance alive until the
/// last holder drops it.
pub fn shared_filter(chain: impl Into<Chain>) -> Arc<Mutex<Chain>> {
    Arc::new(Mutex::new(chain.into()))
}

/// A receive-callback container: the sink callable plus the buffer and op
/// record the internal receive loop runs against.
pub struct RecvCallback {
    capacity: usize,
    func: Box<dyn FnMut(&RecvOp) + Send>,
}

impl RecvCallback {
    /// Creates a callback whose receives may carry up to `capacity` bytes.
    ///
    /// # Panics
    /// Panics if `capacity` is zero; a receive needs storage to land in.
    pub fn new(capacity: usize, func: impl FnMut(&RecvOp) + Send + 'static) -> Self {
        assert!(capacity > 0, "receive callback needs non-zero storage");
        Self { capacity, func: Box::new(func) }
    }

    /// The receive buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn invoke(&mut self, op: &RecvOp) {
        (self.func)(op);
    }
}

impl std::fmt::Debug for RecvCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvCallback").field("capacity", &self.capacity).finish()
    }
}

/// A callback installed on an endpoint, owned or shared.
pub enum CallbackSlot {
    /// The endpoint owns the container.
    Owned(RecvCallback),
    /// The container is shared between endpoints.
    Shared(Arc<Mutex<RecvCallback>>),
}

impl CallbackSlot {
    pub(crate) fn capacity(&self) -> usize {
        match self {
            CallbackSlot::Owned(cb) => cb.capacity(),
            CallbackSlot::Shared(cb) => cb.lock().capacity(),
        }
    }

    pub(crate) fn invoke(&mut self, op: &RecvOp) {
        match self {
            CallbackSlot::Owned(cb) => cb.invoke(op),
            CallbackSlot::Shared(cb) => cb.lock().invoke(op),
        }
    }
}

/// Wraps a receive callback for sharing between endpoints.
pub fn shared_callback(callback: RecvCallback) -> Arc<Mutex<RecvCallback>> {
    Arc::new(Mutex::new(callback))
}

/// Common open options that are not transport-specific.
///
/// Every option is "leave unchanged unless written": a fresh `CommonOpts`
/// changes nothing about the endpoint. Ownership of filters and callbacks is
/// explicit in the setter types — pass a [`Chain`] (or bare filter) to hand
/// it to the endpoint, or a handle from [`shared_filter`] /
/// [`shared_callback`] to share one instance across endpoints.
#[derive(Default)]
pub struct CommonOpts {
    pub(crate) open_timeout: OpenTimeoutSetting,
    pub(crate) callback: Setting<Option<CallbackSlot>>,
    pub(crate) rx_filter: Setting<Option<FilterSlot>>,
    pub(crate) tx_filter: Setting<Option<FilterSlot>>,
    pub(crate) auto_reopen: Setting<Option<Duration>>,
}

impl CommonOpts {
    /// Creates options that leave every setting unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the open out at an absolute instant.
    pub fn open_timeout_at(mut self, at: Instant) -> Self {
        self.open_timeout = OpenTimeoutSetting::At(at);
        self
    }

    /// Times the open out after a relative duration.
    pub fn open_timeout_after(mut self, dur: Duration) -> Self {
        self.open_timeout = OpenTimeoutSetting::After(dur);
        self
    }

    /// Lets the open wait forever.
    pub fn no_open_timeout(mut self) -> Self {
        self.open_timeout = OpenTimeoutSetting::Never;
        self
    }

    /// Uses the endpoint's default open timeout.
    pub fn default_open_timeout(mut self) -> Self {
        self.open_timeout = OpenTimeoutSetting::UseDefault;
        self
    }

    /// Installs a receive callback owned by the endpoint. Manual receives
    /// return `Disabled` while a callback is installed. Threadsafe endpoints
    /// only.
    pub fn recv_callback(mut self, callback: RecvCallback) -> Self {
        self.callback = Setting::Update(Some(CallbackSlot::Owned(callback)));
        self
    }

    /// Installs a shared receive callback (see [`shared_callback`]).
    pub fn recv_callback_shared(mut self, callback: Arc<Mutex<RecvCallback>>) -> Self {
        self.callback = Setting::Update(Some(CallbackSlot::Shared(callback)));
        self
    }

    /// Removes any installed receive callback, re-enabling manual receives.
    pub fn no_recv_callback(mut self) -> Self {
        self.callback = Setting::Update(None);
        self
    }

    /// Installs a send filter owned by the endpoint.
    pub fn send_filter(mut self, chain: impl Into<Chain>) -> Self {
        self.tx_filter = Setting::Update(Some(FilterSlot::Owned(chain.into())));
        self
    }

    /// Installs a shared send filter (see [`shared_filter`]).
    pub fn send_filter_shared(mut self, chain: Arc<Mutex<Chain>>) -> Self {
        self.tx_filter = Setting::Update(Some(FilterSlot::Shared(chain)));
        self
    }

    /// Removes any installed send filter.
    pub fn no_send_filter(mut self) -> Self {
        self.tx_filter = Setting::Update(None);
        self
    }

    /// Installs a receive filter owned by the endpoint.
    pub fn recv_filter(mut self, chain: impl Into<Chain>) -> Self {
        self.rx_filter = Setting::Update(Some(FilterSlot::Owned(chain.into())));
        self
    }

    /// Installs a shared receive filter (see [`shared_filter`]).
    pub fn recv_filter_shared(mut self, chain: Arc<Mutex<Chain>>) -> Self {
        self.rx_filter = Setting::Update(Some(FilterSlot::Shared(chain)));
        self
    }

    /// Removes any installed receive filter.
    pub fn no_recv_filter(mut self) -> Self {
        self.rx_filter = Setting::Update(None);
        self
    }

    /// After an unsolicited closure or failed open, keep reopening with the
    /// last used arguments every `interval` until a manual close or destroy.
    pub fn auto_reopen_after(mut self, interval: Duration) -> Self {
        self.auto_reopen = Setting::Update(Some(interval));
        self
    }

    /// Disables automatic reopening.
    pub fn no_auto_reopen(mut self) -> Self {
        self.auto_reopen = Setting::Update(None);
        self
    }

    /// True when these options would install a receive callback.
    pub(crate) fn installs_callback(&self) -> bool {
        matches!(self.callback, Setting::Update(Some(_)))
    }

    /// True when these options enable auto-reopen, which makes them worth
    /// installing even if the open itself fails.
    pub(crate) fn enables_auto_reopen(&self) -> bool {
        matches!(self.auto_reopen, Setting::Update(Some(_)))
    }

    /// True when any filter written into these options reports itself
    /// unusable (e.g. an empty append pattern).
    pub fn has_invalid_filter(&self) -> bool {
        [&self.rx_filter, &self.tx_filter].into_iter().any(|setting| {
            matches!(setting, Setting::Update(Some(slot)) if !slot.is_valid())
        })
    }

    /// Resolves the open deadline: an explicit per-call timeout wins, then
    /// the open-timeout option, then the endpoint default.
    pub(crate) fn resolve_open_deadline(
        &self,
        call_timeout: Timeout,
        default: Duration,
    ) -> Option<Instant> {
        if !matches!(call_timeout, Timeout::Default) {
            return call_timeout.resolve(default);
        }
        match self.open_timeout {
            OpenTimeoutSetting::At(at) => Some(at),
            OpenTimeoutSetting::After(dur) => deadline::deadline_after(Instant::now(), dur),
            OpenTimeoutSetting::Never => None,
            OpenTimeoutSetting::UseDefault | OpenTimeoutSetting::UseExisting => {
                deadline::deadline_after(Instant::now(), default)
            }
        }
    }
}

/// A requested open travelling through the dispatcher: the op record plus
/// the arguments and common options to apply.
pub(crate) struct OpenRequest<A> {
    pub op: OpenOp,
    pub args: Option<A>,
    pub opts: CommonOpts,
}

/// The last-used open arguments, behind their own lock so they can be
/// queried and replaced independently of operation traffic.
#[derive(Debug, Default)]
pub(crate) struct ArgsSlot<A> {
    pub value: A,
    pub initialized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use unilink_filter::Append;

    #[test]
    fn test_fresh_opts_change_nothing() {
        let opts = CommonOpts::new();
        assert!(matches!(opts.callback, Setting::UseExisting));
        assert!(matches!(opts.tx_filter, Setting::UseExisting));
        assert!(matches!(opts.rx_filter, Setting::UseExisting));
        assert!(matches!(opts.auto_reopen, Setting::UseExisting));
        assert!(!opts.installs_callback());
        assert!(!opts.enables_auto_reopen());
    }

    #[test]
    fn test_auto_reopen_update_detected() {
        let opts = CommonOpts::new().auto_reopen_after(Duration::from_millis(250));
        assert!(opts.enables_auto_reopen());
        let opts = CommonOpts::new().no_auto_reopen();
        assert!(!opts.enables_auto_reopen());
        assert!(matches!(opts.auto_reopen, Setting::Update(None)));
    }

    #[test]
    fn test_invalid_filter_detected() {
        let opts = CommonOpts::new().send_filter(Append::new(b""));
        assert!(opts.has_invalid_filter());
        let opts = CommonOpts::new().send_filter(Append::new(b"ok"));
        assert!(!opts.has_invalid_filter());
    }

    #[test]
    fn test_explicit_call_timeout_wins() {
        let opts = CommonOpts::new().no_open_timeout();
        let deadline = opts
            .resolve_open_deadline(Timeout::After(Duration::from_millis(5)), Duration::from_secs(9))
            .unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(50));

        // with a Default call timeout the option decides
        assert_eq!(
            opts.resolve_open_deadline(Timeout::Default, Duration::from_secs(9)),
            None
        );
    }

    #[test]
    fn test_shared_filter_handle_clones() {
        let shared = shared_filter(Append::new(b"x"));
        let opts_a = CommonOpts::new().send_filter_shared(shared.clone());
        let opts_b = CommonOpts::new().send_filter_shared(shared);
        assert!(!opts_a.has_invalid_filter());
        assert!(!opts_b.has_invalid_filter());
    }
}
