use std::time::{Duration, Instant};

/// How long an operation may take before it is timed out.
///
/// Deadlines resolve to `Option<Instant>` where `None` means "never".
/// Additions that would overflow the clock saturate to "never" instead of
/// panicking, so very large relative timeouts behave like no timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Use the endpoint's configured default for the operation category.
    Default,
    /// Wait forever.
    Never,
    /// Expire after the given duration from now.
    After(Duration),
    /// Expire at the given absolute time.
    At(Instant),
}

impl Timeout {
    /// Resolves the timeout into an absolute deadline, using `default` when
    /// [`Timeout::Default`] was requested.
    pub fn resolve(self, default: Duration) -> Option<Instant> {
        match self {
            Timeout::Default => deadline_after(Instant::now(), default),
            Timeout::Never => None,
            Timeout::After(dur) => deadline_after(Instant::now(), dur),
            Timeout::At(at) => Some(at),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Default
    }
}

impl From<Duration> for Timeout {
    fn from(dur: Duration) -> Self {
        Timeout::After(dur)
    }
}

impl From<Instant> for Timeout {
    fn from(at: Instant) -> Self {
        Timeout::At(at)
    }
}

/// `now + dur`, saturating to `None` ("never") on clock overflow.
pub fn deadline_after(now: Instant, dur: Duration) -> Option<Instant> {
    now.checked_add(dur)
}

/// True once the deadline has passed. A `None` deadline never expires.
pub fn has_expired(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|at| at <= now)
}

/// Time remaining until the deadline; zero if already expired, `None` if
/// there is no deadline.
pub fn time_left(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    deadline.map(|at| at.saturating_duration_since(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_timeout_resolves_forward() {
        let deadline = Timeout::After(Duration::from_millis(50))
            .resolve(Duration::from_secs(1))
            .unwrap();
        assert!(deadline > Instant::now());
    }

    #[test]
    fn test_default_uses_supplied_duration() {
        let deadline = Timeout::Default.resolve(Duration::from_secs(2)).unwrap();
        let left = time_left(Some(deadline), Instant::now()).unwrap();
        assert!(left <= Duration::from_secs(2));
        assert!(left > Duration::from_secs(1));
    }

    #[test]
    fn test_never_has_no_deadline() {
        assert_eq!(Timeout::Never.resolve(Duration::from_secs(1)), None);
        assert!(!has_expired(None, Instant::now()));
    }

    #[test]
    fn test_huge_relative_timeout_saturates_to_never() {
        // Duration::MAX cannot be added to the current instant.
        assert_eq!(Timeout::After(Duration::MAX).resolve(Duration::ZERO), None);
    }

    #[test]
    fn test_expiry_and_time_left() {
        let now = Instant::now();
        assert!(has_expired(Some(now), now));
        assert_eq!(time_left(Some(now), now), Some(Duration::ZERO));

        let later = now + Duration::from_millis(10);
        assert!(!has_expired(Some(later), now));
        assert_eq!(time_left(Some(later), now), Some(Duration::from_millis(10)));
    }
}
