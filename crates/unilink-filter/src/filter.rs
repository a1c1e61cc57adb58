use unilink_core::FilterAbortKind;

use crate::storage::{Arena, Data, SlotId};

/// What the chain should do after a filter call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterResult {
    /// Keep running the filter while input is available; otherwise wait for
    /// the next input.
    Continue,
    /// Re-enter the filter even with no input pending.
    ForceKeepProcessing,
    /// Abort without a more specific reason.
    Abort,
    /// Abort because storage space ran out.
    AbortExceededStorage,
    /// Abort because the data contents are malformed.
    AbortDataFormatError,
}

impl FilterResult {
    /// True for any of the abort variants.
    pub fn is_abort(self) -> bool {
        matches!(
            self,
            FilterResult::Abort
                | FilterResult::AbortExceededStorage
                | FilterResult::AbortDataFormatError
        )
    }

    /// Maps abort variants onto the status taxonomy's abort kinds.
    pub fn abort_kind(self) -> Option<FilterAbortKind> {
        match self {
            FilterResult::Abort => Some(FilterAbortKind::Generic),
            FilterResult::AbortExceededStorage => Some(FilterAbortKind::ExceededStorage),
            FilterResult::AbortDataFormatError => Some(FilterAbortKind::DataFormatError),
            _ => None,
        }
    }
}

/// Whether the storage planner may alias a filter's input and output onto
/// the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoragePolicy {
    /// The filter transforms in place, so the upstream output slot can be
    /// reused as both input and output (appending filters).
    AllowReuseOfInput,
    /// Input and output memory must stay separate (segmenting or encoding
    /// filters).
    NeverReuseInput,
}

/// Whether a filter accepts being called with an empty input window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputPolicy {
    /// Skip the filter call entirely when the input window is empty.
    OnlyValid,
    /// Call the filter even with no input (filters that drain internal
    /// state).
    AllowEmpty,
}

/// A stateful byte transform that can be chained onto an endpoint's send or
/// receive path.
///
/// Implementations express their work through the [`Scratch`] handle, which
/// resolves to whichever storage slot the planner assigned for this stage's
/// output — possibly an upstream slot (in-place reuse) or the user's receive
/// buffer (tail optimisation). A filter must not emit a second output while
/// a previous one is unread; the chain enforces this before calling in.
pub trait Filter: Send {
    /// Consumes zero or more bytes from `input` and optionally emits exactly
    /// one `output` window.
    fn process(&mut self, io: &mut Scratch<'_>, input: &mut Data, output: &mut Data)
        -> FilterResult;

    /// Clears any per-stream state (match counters, escape flags).
    fn reset(&mut self) {}

    /// Name used to tag aborts for diagnostics.
    fn name(&self) -> &'static str;

    /// Upper bound on the packet size this filter touches, input or output.
    fn max_packet_size(&self) -> usize;

    /// Whether the planner may alias this filter's input and output slots.
    fn storage_policy(&self) -> StoragePolicy {
        StoragePolicy::NeverReuseInput
    }

    /// Whether the filter tolerates empty input windows.
    fn input_policy(&self) -> InputPolicy {
        InputPolicy::OnlyValid
    }

    /// True if the filter is usable (e.g. configured with a non-empty
    /// pattern). Checked when the filter is installed on an endpoint.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Mediated access to a stage's planned output storage and to the bytes
/// behind data windows.
///
/// All reads and writes go through slot ids, so a stage whose input and
/// output were aliased onto the same slot stays sound.
pub struct Scratch<'a> {
    arena: &'a mut Arena,
    out: SlotId,
}

impl<'a> Scratch<'a> {
    pub(crate) fn new(arena: &'a mut Arena, out: SlotId) -> Self {
        Self { arena, out }
    }

    /// Capacity of the planned output storage.
    pub fn capacity(&self) -> usize {
        self.arena.get(self.out).capacity()
    }

    /// Current fill of the planned output storage.
    pub fn fill(&self) -> usize {
        self.arena.get(self.out).fill()
    }

    /// Empties the planned output storage.
    pub fn clear(&mut self) {
        self.arena.get_mut(self.out).reset();
    }

    /// Drops `count` bytes from the end of the output storage.
    pub fn shrink_by(&mut self, count: usize) {
        self.arena.get_mut(self.out).shrink_by(count);
    }

    /// Appends one byte to the output storage; false if full.
    pub fn append(&mut self, value: u8) -> bool {
        self.arena.get_mut(self.out).append(value)
    }

    /// Appends a slice to the output storage; false if it would not fit.
    pub fn append_slice(&mut self, data: &[u8]) -> bool {
        self.arena.get_mut(self.out).append_slice(data)
    }

    /// Removes and returns the first byte of the input window.
    pub fn pop(&mut self, input: &mut Data) -> Option<u8> {
        if !input.is_live() {
            return None;
        }
        let byte = self.arena.window(input)[0];
        input.advance(1);
        Some(byte)
    }

    /// Reads byte `index` of a window without consuming it.
    pub fn byte_at(&self, data: &Data, index: usize) -> u8 {
        self.arena.window(data)[index]
    }

    /// Copies the input window into the output storage, skipping the copy
    /// when the window already occupies the front of that storage (the
    /// in-place reuse case). False if the window would not fit.
    pub fn copy_in_lazily(&mut self, input: &Data) -> bool {
        let len = input.len();
        if len > self.capacity() {
            return false;
        }
        match input.slot() {
            Some(slot) if slot == self.out => {
                if input.pos() != 0 {
                    let pos = input.pos();
                    self.arena.get_mut(self.out).raw_mut().copy_within(pos..pos + len, 0);
                }
                self.arena.get_mut(self.out).set_fill(len);
            }
            Some(slot) => {
                let (dst, src) = self.arena.pair_mut(self.out, slot);
                let bytes = &src.raw()[input.pos()..input.pos() + len];
                dst.raw_mut()[..len].copy_from_slice(bytes);
                dst.set_fill(len);
            }
            None => {
                self.arena.get_mut(self.out).set_fill(0);
            }
        }
        true
    }

    /// Starts `output` over the output storage's fill and consumes that
    /// storage, so the same bytes cannot be emitted twice.
    pub fn emit(&mut self, output: &mut Data) {
        let fill = self.fill();
        output.start(self.out, 0, fill);
        self.arena.get_mut(self.out).reset();
    }
}
