use std::time::{Duration, Instant};

use crate::deadline;
use crate::status::Status;

/// The arguments and outcome of one send operation.
///
/// The bytes are owned by the record so it can move between the calling
/// thread and the management task without lifetime coupling.
#[derive(Debug)]
pub struct SendOp {
    /// The bytes to send.
    pub data: Box<[u8]>,
    /// Optional channel/port/client id the send should occur on.
    pub channel: Option<i32>,
    /// Absolute deadline, `None` for no timeout.
    pub deadline: Option<Instant>,
    /// Current status of the operation.
    pub status: Status,
}

impl SendOp {
    /// Creates a new send operation over a copy of `data`.
    pub fn new(data: &[u8], channel: Option<i32>, deadline: Option<Instant>) -> Self {
        Self { data: data.into(), channel, deadline, status: Status::StartNewOp }
    }

    /// Creates a send operation that already owns its bytes.
    pub fn from_owned(data: Box<[u8]>, channel: Option<i32>, deadline: Option<Instant>) -> Self {
        Self { data, channel, deadline, status: Status::StartNewOp }
    }

    /// True while no final status has been reached.
    pub fn is_operating(&self) -> bool {
        self.status.is_operating()
    }

    /// Ends the operation with the given status.
    pub fn end(&mut self, status: Status) {
        self.status = status;
    }

    /// Ends the operation with a transport-specific error code and label.
    pub fn end_with_error(&mut self, code: u32, label: &'static str) {
        self.status = Status::Extension { code, label };
    }
}

/// The arguments and outcome of one receive operation.
#[derive(Debug)]
pub struct RecvOp {
    dest: Box<[u8]>,
    /// Number of valid bytes in the destination buffer.
    pub received: usize,
    /// Channel/port/client id the receive occurred on, when known.
    pub channel: Option<i32>,
    /// Absolute deadline, `None` for no timeout.
    pub deadline: Option<Instant>,
    /// Current status of the operation.
    pub status: Status,
}

impl RecvOp {
    /// Creates a receive operation with a destination buffer of `capacity`
    /// bytes.
    pub fn with_capacity(capacity: usize, deadline: Option<Instant>) -> Self {
        Self {
            dest: vec![0u8; capacity].into_boxed_slice(),
            received: 0,
            channel: None,
            deadline,
            status: Status::StartNewOp,
        }
    }

    /// Capacity of the destination buffer.
    pub fn capacity(&self) -> usize {
        self.dest.len()
    }

    /// The received bytes.
    pub fn payload(&self) -> &[u8] {
        &self.dest[..self.received]
    }

    /// Mutable access to the whole destination buffer, for transports that
    /// read directly into it. Pair with [`RecvOp::set_received`].
    pub fn buffer(&mut self) -> &mut [u8] {
        &mut self.dest
    }

    /// Records how many bytes a transport wrote into [`RecvOp::buffer`].
    pub fn set_received(&mut self, len: usize) {
        debug_assert!(len <= self.dest.len());
        self.received = len;
    }

    /// Copies `data` into the destination buffer and ends the operation:
    /// `Success` when it fits, `RecvDataTooLarge` when it does not.
    ///
    /// Returns true if the bytes fit.
    pub fn fill_from(&mut self, data: &[u8]) -> bool {
        if data.len() > self.dest.len() {
            self.end(Status::RecvDataTooLarge);
            return false;
        }
        self.dest[..data.len()].copy_from_slice(data);
        self.received = data.len();
        self.end(Status::Success);
        true
    }

    /// Takes the destination buffer out of the record, leaving it empty.
    /// Used by the filter pipeline to lend the buffer to the storage
    /// planner; pair with [`RecvOp::put_dest`].
    pub fn take_dest(&mut self) -> Box<[u8]> {
        std::mem::take(&mut self.dest)
    }

    /// Returns a previously taken destination buffer.
    pub fn put_dest(&mut self, dest: Box<[u8]>) {
        self.dest = dest;
    }

    /// Re-arms the record for another receive without touching the
    /// destination buffer, preserving the storage across uses.
    pub fn reset_for_reuse(&mut self) {
        self.received = 0;
        self.channel = None;
        self.deadline = None;
        self.status = Status::StartNewOp;
    }

    /// True while no final status has been reached.
    pub fn is_operating(&self) -> bool {
        self.status.is_operating()
    }

    /// Ends the operation with the given status.
    pub fn end(&mut self, status: Status) {
        self.status = status;
    }

    /// Ends the operation with a transport-specific error code and label.
    pub fn end_with_error(&mut self, code: u32, label: &'static str) {
        self.status = Status::Extension { code, label };
    }
}

/// The deadline and outcome of one open operation.
#[derive(Debug)]
pub struct OpenOp {
    /// Absolute deadline, `None` for no timeout.
    pub deadline: Option<Instant>,
    /// Current status of the operation.
    pub status: Status,
}

impl OpenOp {
    /// Creates a new open operation.
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline, status: Status::StartNewOp }
    }

    /// True while no final status has been reached.
    pub fn is_operating(&self) -> bool {
        self.status.is_operating()
    }

    /// Ends the operation with the given status.
    pub fn end(&mut self, status: Status) {
        self.status = status;
    }

    /// Ends the operation with a transport-specific error code and label.
    pub fn end_with_error(&mut self, code: u32, label: &'static str) {
        self.status = Status::Extension { code, label };
    }
}

/// The deadline and outcome of one close operation.
#[derive(Debug)]
pub struct CloseOp {
    /// Absolute deadline, `None` for no timeout.
    pub deadline: Option<Instant>,
    /// Current status of the operation.
    pub status: Status,
}

impl CloseOp {
    /// Creates a new close operation.
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline, status: Status::StartNewOp }
    }

    /// True while no final status has been reached.
    pub fn is_operating(&self) -> bool {
        self.status.is_operating()
    }

    /// Ends the operation with the given status.
    pub fn end(&mut self, status: Status) {
        self.status = status;
    }

    /// Ends the operation with a transport-specific error code and label.
    pub fn end_with_error(&mut self, code: u32, label: &'static str) {
        self.status = Status::Extension { code, label };
    }
}

/// The smallest remaining time among the given deadlines, measured from
/// `now`. Returns zero if any deadline already expired and `None` when every
/// entry is unbounded — useful for sizing a transport's poll wait.
pub fn shortest_wait(deadlines: &[Option<Instant>], now: Instant) -> Option<Duration> {
    deadlines
        .iter()
        .filter_map(|d| deadline::time_left(*d, now))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_op_starts_new() {
        let op = SendOp::new(b"abc", None, None);
        assert!(op.is_operating());
        assert_eq!(op.status, Status::StartNewOp);
        assert_eq!(&*op.data, b"abc");
    }

    #[test]
    fn test_recv_fill_from_fits() {
        let mut op = RecvOp::with_capacity(8, None);
        assert!(op.fill_from(b"hello"));
        assert_eq!(op.status, Status::Success);
        assert_eq!(op.payload(), b"hello");
        assert_eq!(op.channel, None);
    }

    #[test]
    fn test_recv_fill_from_too_large() {
        let mut op = RecvOp::with_capacity(3, None);
        assert!(!op.fill_from(b"too long"));
        assert_eq!(op.status, Status::RecvDataTooLarge);
        assert_eq!(op.received, 0);
    }

    #[test]
    fn test_recv_reset_keeps_storage() {
        let mut op = RecvOp::with_capacity(8, None);
        op.fill_from(b"one");
        op.channel = Some(3);
        op.reset_for_reuse();
        assert_eq!(op.capacity(), 8);
        assert_eq!(op.received, 0);
        assert_eq!(op.channel, None);
        assert!(op.is_operating());
    }

    #[test]
    fn test_shortest_wait() {
        let now = Instant::now();
        let near = Some(now + Duration::from_millis(5));
        let far = Some(now + Duration::from_secs(5));
        assert_eq!(shortest_wait(&[far, near], now), Some(Duration::from_millis(5)));
        assert_eq!(shortest_wait(&[None, None], now), None);
        assert_eq!(shortest_wait(&[Some(now), far], now), Some(Duration::ZERO));
    }

    #[test]
    fn test_end_with_error_maps_to_extension() {
        let mut op = OpenOp::new(None);
        op.end_with_error(98, "BIND_FAILURE");
        assert_eq!(op.status, Status::Extension { code: 98, label: "BIND_FAILURE" });
        assert!(!op.is_operating());
    }
}
