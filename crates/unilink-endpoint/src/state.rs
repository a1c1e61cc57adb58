use unilink_core::{CloseOp, RecvOp, SendOp, Status};

use crate::options::OpenRequest;

/// The operation categories coordinated by the dispatcher. The numeric
/// values are bit offsets into [`OpFlags`], three bits per category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    /// Opening the transport.
    Open = 0,
    /// Closing the transport.
    Close = 3,
    /// Sending bytes.
    Send = 6,
    /// Receiving bytes.
    Receive = 9,
    /// Tearing the endpoint down.
    Destroy = 12,
    /// First-run construction on the management task.
    Construct = 15,
}

const REQUEST: u32 = 0b001;
const ACCEPT: u32 = 0b010;
const COMPLETE: u32 = 0b100;
const ALL: u32 = REQUEST | ACCEPT | COMPLETE;

/// Bit-packed progress tracking for every operation category, allowing O(1)
/// composite checks like "any destroy in flight" or "any open-or-close in
/// flight".
///
/// The stages of an operation are:
/// 1. requester: `start_request`
/// 2. processor: `accept`
/// 3. processor: ... does the work ...
/// 4. processor: `complete`
/// 5. requester: `clear`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpFlags(u32);

impl OpFlags {
    /// Any category in its requested stage.
    pub const ANY_REQUEST: u32 = (REQUEST << Category::Open as u32)
        | (REQUEST << Category::Close as u32)
        | (REQUEST << Category::Send as u32)
        | (REQUEST << Category::Receive as u32)
        | (REQUEST << Category::Destroy as u32);
    /// Destruction in any stage.
    pub const ANY_DESTROY: u32 = ALL << Category::Destroy as u32;
    /// Open or close in any stage.
    pub const ANY_OPEN_OR_CLOSE: u32 =
        (ALL << Category::Open as u32) | (ALL << Category::Close as u32);

    /// True if any of the ORed mask bits are set.
    pub fn is_any(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    /// True if the category is in any stage of progress.
    pub fn is_busy(self, category: Category) -> bool {
        self.0 & (ALL << category as u32) != 0
    }

    /// True if the category is in the requested stage.
    pub fn is_requested(self, category: Category) -> bool {
        self.0 & (REQUEST << category as u32) != 0
    }

    /// True if the category is in the accepted stage.
    pub fn is_accepted(self, category: Category) -> bool {
        self.0 & (ACCEPT << category as u32) != 0
    }

    /// True if the category is in the completed stage.
    pub fn is_complete(self, category: Category) -> bool {
        self.0 & (COMPLETE << category as u32) != 0
    }

    /// Moves the category to the requested stage.
    pub fn start_request(&mut self, category: Category) {
        self.0 &= !(ALL << category as u32);
        self.0 |= REQUEST << category as u32;
    }

    /// Moves the category to the accepted stage.
    pub fn accept(&mut self, category: Category) {
        self.0 &= !(ALL << category as u32);
        self.0 |= ACCEPT << category as u32;
    }

    /// Moves the category to the completed stage.
    pub fn complete(&mut self, category: Category) {
        self.0 &= !(ALL << category as u32);
        self.0 |= COMPLETE << category as u32;
    }

    /// Clears the category back to idle.
    pub fn clear(&mut self, category: Category) {
        self.0 &= !(ALL << category as u32);
    }
}

/// One pending-operation slot: the payload parks here between the requester
/// and the management task.
#[derive(Debug, Default)]
pub(crate) enum OpSlot<P> {
    /// No operation in this category.
    #[default]
    Idle,
    /// Installed by the requester, not yet accepted.
    Requested(P),
    /// Accepted; the management task owns the record.
    Active,
    /// Finished; waiting for the requester to collect it.
    Completed(P),
}

impl<P> OpSlot<P> {
    pub(crate) fn take_requested(&mut self) -> Option<P> {
        match std::mem::replace(self, OpSlot::Active) {
            OpSlot::Requested(p) => Some(p),
            other => {
                *self = other;
                None
            }
        }
    }

    pub(crate) fn take_completed(&mut self) -> Option<P> {
        match std::mem::replace(self, OpSlot::Idle) {
            OpSlot::Completed(p) => Some(p),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// The lock-protected state shared between public calls and the management
/// task.
pub(crate) struct CoreState<A> {
    pub flags: OpFlags,
    /// Mirror of the engine's authoritative open status, refreshed at the
    /// end of every management step.
    pub open_status: Status,
    /// True while a receive callback owns the receive category.
    pub recv_disabled: bool,
    pub send: OpSlot<SendOp>,
    pub recv: OpSlot<RecvOp>,
    pub open: OpSlot<OpenRequest<A>>,
    pub close: OpSlot<CloseOp>,
}

impl<A> Default for CoreState<A> {
    fn default() -> Self {
        Self {
            flags: OpFlags::default(),
            open_status: Status::NotOpen,
            recv_disabled: false,
            send: OpSlot::Idle,
            recv: OpSlot::Idle,
            open: OpSlot::Idle,
            close: OpSlot::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_stage_progression() {
        let mut flags = OpFlags::default();
        assert!(!flags.is_busy(Category::Send));

        flags.start_request(Category::Send);
        assert!(flags.is_requested(Category::Send));
        assert!(flags.is_any(OpFlags::ANY_REQUEST));

        flags.accept(Category::Send);
        assert!(!flags.is_requested(Category::Send));
        assert!(flags.is_accepted(Category::Send));
        assert!(flags.is_busy(Category::Send));

        flags.complete(Category::Send);
        assert!(flags.is_complete(Category::Send));

        flags.clear(Category::Send);
        assert!(!flags.is_busy(Category::Send));
    }

    #[test]
    fn test_composite_masks() {
        let mut flags = OpFlags::default();
        flags.start_request(Category::Destroy);
        assert!(flags.is_any(OpFlags::ANY_DESTROY));
        assert!(!flags.is_any(OpFlags::ANY_OPEN_OR_CLOSE));

        flags.accept(Category::Destroy);
        assert!(flags.is_any(OpFlags::ANY_DESTROY));
        assert!(!flags.is_any(OpFlags::ANY_REQUEST));

        let mut flags = OpFlags::default();
        flags.start_request(Category::Open);
        assert!(flags.is_any(OpFlags::ANY_OPEN_OR_CLOSE));
        flags.accept(Category::Open);
        assert!(flags.is_any(OpFlags::ANY_OPEN_OR_CLOSE));
        flags.clear(Category::Open);
        flags.start_request(Category::Close);
        assert!(flags.is_any(OpFlags::ANY_OPEN_OR_CLOSE));
    }

    #[test]
    fn test_categories_do_not_interfere() {
        let mut flags = OpFlags::default();
        flags.start_request(Category::Send);
        flags.start_request(Category::Receive);
        flags.accept(Category::Send);
        assert!(flags.is_requested(Category::Receive));
        assert!(flags.is_accepted(Category::Send));
        flags.clear(Category::Send);
        assert!(flags.is_requested(Category::Receive));
    }

    #[test]
    fn test_slot_transitions() {
        let mut slot: OpSlot<u32> = OpSlot::Idle;
        assert!(slot.take_requested().is_none());
        slot = OpSlot::Requested(7);
        assert_eq!(slot.take_requested(), Some(7));
        assert!(matches!(slot, OpSlot::Active));
        slot = OpSlot::Completed(9);
        assert_eq!(slot.take_completed(), Some(9));
        assert!(matches!(slot, OpSlot::Idle));
    }
}
