use unilink_core::FilterAbortKind;

use crate::filter::{Filter, FilterResult, InputPolicy, Scratch, StoragePolicy};
use crate::storage::{Arena, Data, SlotId, Storage};

const EXT_IN: SlotId = SlotId(0);
const EXT_OUT: SlotId = SlotId(1);

/// Result of one pass over the chain's stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunResult {
    /// More work is possible only if more input arrives.
    Continue,
    /// At least one stage insists on being re-entered without new input.
    ForceKeep,
    /// A stage aborted; carries the abort kind and the stage's name.
    Abort {
        /// Why the stage aborted.
        kind: FilterAbortKind,
        /// Name of the aborting filter.
        filter: &'static str,
    },
}

/// Result of pumping the chain until it yields an output or runs dry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pump {
    /// The chain cannot make progress until new input is fed in.
    DoneUntilNextInput,
    /// Exactly one output window is now live.
    YieldedOutput,
    /// A stage aborted; the driver should reset the chain.
    Abort {
        /// Why the stage aborted.
        kind: FilterAbortKind,
        /// Name of the aborting filter.
        filter: &'static str,
    },
}

struct Stage {
    filter: Box<dyn Filter>,
    local_in: SlotId,
    local_out: SlotId,
    best_in: SlotId,
    best_out: SlotId,
    forced: bool,
}

/// An ordered composition of filters that behaves as a single filter.
///
/// The chain owns a slot arena: two external slots (incoming bytes and the
/// final destination buffer, swapped in by the dispatcher) plus a local
/// input and output slot per stage. Before bytes flow, the storage planner
/// resolves each stage's working slots so that in-place stages reuse their
/// upstream buffer and, on the receive side, the tail stage can write
/// directly into the destination.
pub struct Chain {
    stages: Vec<Stage>,
    mids: Vec<Data>,
    arena: Arena,
    last_run: RunResult,
}

impl Chain {
    /// Wraps a single filter as a chain.
    pub fn single(filter: Box<dyn Filter>) -> Self {
        let mut arena = Arena::default();
        arena.push(Storage::default()); // EXT_IN, installed per operation
        arena.push(Storage::default()); // EXT_OUT, installed per operation
        let mut chain =
            Self { stages: Vec::new(), mids: Vec::new(), arena, last_run: RunResult::Continue };
        chain.push(filter);
        chain
    }

    /// Appends a filter to the end of the chain.
    pub fn then(mut self, filter: Box<dyn Filter>) -> Self {
        self.mids.push(Data::default());
        self.push(filter);
        self
    }

    fn push(&mut self, filter: Box<dyn Filter>) {
        let cap = filter.max_packet_size();
        let local_in = self.arena.push(Storage::with_capacity(cap));
        let local_out = self.arena.push(Storage::with_capacity(cap));
        self.stages.push(Stage {
            filter,
            local_in,
            local_out,
            best_in: local_in,
            best_out: local_out,
            forced: false,
        });
        self.plan_forward();
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// A chain always holds at least one stage.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// True if every stage reports itself usable.
    pub fn is_valid(&self) -> bool {
        self.stages.iter().all(|s| s.filter.is_valid())
    }

    /// Name of the head filter, used when the chain as a whole needs a tag.
    pub fn name(&self) -> &'static str {
        self.stages[0].filter.name()
    }

    /// The slot new input bytes should be fed into.
    pub fn best_input(&self) -> SlotId {
        self.stages[0].best_in
    }

    /// The slot the tail stage writes its output into.
    pub fn best_output(&self) -> SlotId {
        self.stages[self.stages.len() - 1].best_out
    }

    /// The external input slot id.
    pub fn ext_in(&self) -> SlotId {
        EXT_IN
    }

    /// The external output slot id.
    pub fn ext_out(&self) -> SlotId {
        EXT_OUT
    }

    /// Current fill of a slot.
    pub fn storage_fill(&self, slot: SlotId) -> usize {
        self.arena.get(slot).fill()
    }

    /// Capacity of a slot.
    pub fn storage_capacity(&self, slot: SlotId) -> usize {
        self.arena.get(slot).capacity()
    }

    /// Rewinds a slot's fill count.
    pub fn reset_storage(&mut self, slot: SlotId) {
        self.arena.get_mut(slot).reset();
    }

    /// Installs the bytes entering the chain and returns a window over them.
    pub fn load_ext_in(&mut self, data: Box<[u8]>) -> Data {
        let len = data.len();
        self.arena.replace(EXT_IN, Storage::from_boxed(data, len));
        let mut window = Data::default();
        window.start(EXT_IN, 0, len);
        window
    }

    /// Installs the final destination buffer for the receive tail.
    pub fn load_ext_out(&mut self, buf: Box<[u8]>) {
        self.arena.replace(EXT_OUT, Storage::from_boxed(buf, 0));
    }

    /// Removes and returns the destination buffer installed with
    /// [`Chain::load_ext_out`].
    pub fn take_ext_out(&mut self) -> Box<[u8]> {
        self.arena.replace(EXT_OUT, Storage::default()).into_boxed()
    }

    /// Copies freshly received bytes into the chain's planned input slot and
    /// returns a window over them. The slot must be at least `bytes` long;
    /// the dispatcher sizes its internal receives from
    /// [`Chain::best_input`]'s capacity.
    pub fn feed_input(&mut self, bytes: &[u8]) -> Data {
        let slot = self.best_input();
        let storage = self.arena.get_mut(slot);
        storage.reset();
        let ok = storage.append_slice(bytes);
        debug_assert!(ok, "internal receive exceeded the planned input slot");
        let mut window = Data::default();
        window.start(slot, 0, bytes.len());
        window
    }

    /// The bytes behind a window, independent of slot fill counts.
    pub fn bytes(&self, data: &Data) -> &[u8] {
        self.arena.window(data)
    }

    /// Copies a window's bytes into the external output slot. The window
    /// must not already live in that slot, and must fit its capacity.
    pub fn copy_window_into_ext_out(&mut self, data: &Data) {
        let src = data.slot().expect("window must be live");
        debug_assert_ne!(src, EXT_OUT);
        let len = data.len();
        let pos = data.pos();
        let (dst, src) = self.arena.pair_mut(EXT_OUT, src);
        dst.raw_mut()[..len].copy_from_slice(&src.raw()[pos..pos + len]);
        dst.set_fill(len);
    }

    /// Forward planning pass: each stage picks its working slots from its
    /// storage policy and the upstream stage's output slot. An upstream slot
    /// is only adopted when it is large enough for this stage's packets.
    pub fn plan_forward(&mut self) {
        let mut prev: Option<SlotId> = None;
        for stage in &mut self.stages {
            let usable_prev = prev
                .filter(|p| self.arena.get(*p).capacity() >= stage.filter.max_packet_size());
            match stage.filter.storage_policy() {
                StoragePolicy::AllowReuseOfInput => match usable_prev {
                    Some(p) => {
                        stage.best_in = p;
                        stage.best_out = p;
                    }
                    None => {
                        stage.best_in = stage.local_in;
                        stage.best_out = stage.local_in;
                    }
                },
                StoragePolicy::NeverReuseInput => {
                    stage.best_in = usable_prev.unwrap_or(stage.local_in);
                    stage.best_out = stage.local_out;
                }
            }
            prev = Some(stage.best_out);
        }
    }

    /// Backward planning pass: thread the external destination slot from the
    /// tail toward the head through every stage that allows input reuse.
    ///
    /// No capacity check is made here, so a destination smaller than a
    /// stage's `max_packet_size` is still usable; an oversized output
    /// surfaces later as an exceeded-storage abort.
    pub fn plan_backward_to_ext_out(&mut self) {
        for stage in self.stages.iter_mut().rev() {
            stage.best_out = EXT_OUT;
            if stage.filter.storage_policy() == StoragePolicy::AllowReuseOfInput {
                stage.best_in = EXT_OUT;
            } else {
                break;
            }
        }
    }

    /// One pass over the stages. Each stage runs only when its output handle
    /// is free, no downstream stage has demanded to keep processing, and its
    /// input side is usable (live bytes, an allow-empty policy, or its own
    /// keep-processing demand).
    pub fn run(&mut self, input: &mut Data, output: &mut Data) -> RunResult {
        let count = self.stages.len();
        for i in 0..count {
            if self.stages[i + 1..].iter().any(|s| s.forced) {
                continue;
            }

            let mut in_window = if i == 0 { *input } else { self.mids[i - 1] };
            let mut out_window = if i == count - 1 { *output } else { self.mids[i] };

            let stage = &self.stages[i];
            let input_usable = in_window.is_live()
                || stage.forced
                || stage.filter.input_policy() == InputPolicy::AllowEmpty;
            if out_window.is_live() || !input_usable {
                continue;
            }

            let result = {
                let stage = &mut self.stages[i];
                let skip_empty = stage.filter.input_policy() == InputPolicy::OnlyValid
                    && !in_window.is_live();
                if skip_empty {
                    FilterResult::Continue
                } else {
                    let mut io = Scratch::new(&mut self.arena, stage.best_out);
                    let r = stage.filter.process(&mut io, &mut in_window, &mut out_window);
                    if !r.is_abort() && in_window.is_live() {
                        // unread input must force a re-entry, or the chain
                        // would stall with bytes stranded mid-stream
                        FilterResult::ForceKeepProcessing
                    } else {
                        r
                    }
                }
            };

            if i == 0 {
                *input = in_window;
            } else {
                self.mids[i - 1] = in_window;
            }
            if i == count - 1 {
                *output = out_window;
            } else {
                self.mids[i] = out_window;
            }

            if let Some(kind) = result.abort_kind() {
                return RunResult::Abort { kind, filter: self.stages[i].filter.name() };
            }
            self.stages[i].forced = result == FilterResult::ForceKeepProcessing;
        }

        if self.stages.iter().any(|s| s.forced) {
            RunResult::ForceKeep
        } else {
            RunResult::Continue
        }
    }

    /// Drives [`Chain::run`] until the chain yields one output, runs dry, or
    /// aborts. On abort the caller is expected to recover any external
    /// buffer and then call [`Chain::reset`].
    pub fn pump(&mut self, input: &mut Data, output: &mut Data) -> Pump {
        if self.last_run == RunResult::Continue && !input.is_live() {
            return Pump::DoneUntilNextInput;
        }
        loop {
            match self.run(input, output) {
                RunResult::Abort { kind, filter } => return Pump::Abort { kind, filter },
                r => self.last_run = r,
            }
            if output.is_live() {
                return Pump::YieldedOutput;
            }
            if self.last_run != RunResult::ForceKeep {
                return Pump::DoneUntilNextInput;
            }
        }
    }

    /// Resets every stage, stranded intermediate windows, local storage and
    /// the planning state. The external output slot keeps its buffer so a
    /// lent destination can still be recovered afterwards.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.filter.reset();
            stage.forced = false;
        }
        for mid in &mut self.mids {
            mid.stop();
        }
        let slots: Vec<SlotId> = self.stages.iter().flat_map(|s| [s.local_in, s.local_out]).collect();
        for slot in slots {
            self.arena.get_mut(slot).reset();
        }
        self.arena.replace(EXT_IN, Storage::default());
        self.arena.get_mut(EXT_OUT).reset();
        self.last_run = RunResult::Continue;
        self.plan_forward();
    }

    /// True when a yielded output still aliases the tail stage's working
    /// storage and that storage was refilled without being consumed — the
    /// signature of a filter that forgot to release shared storage.
    pub fn output_unconsumed(&self, output: &Data) -> bool {
        match output.slot() {
            Some(slot) => slot == self.best_output() && self.arena.get(slot).is_live(),
            None => false,
        }
    }
}

impl<F: Filter + 'static> From<F> for Chain {
    fn from(filter: F) -> Self {
        Chain::single(Box::new(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{Append, FixedSize, ForwardByCopy, ForwardByPointing};
    use crate::DEFAULT_MAX_PACKET_SIZE;

    fn drain(chain: &mut Chain, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut input = chain.load_ext_in(bytes.into());
        let mut output = Data::default();
        let mut yielded = Vec::new();
        loop {
            match chain.pump(&mut input, &mut output) {
                Pump::YieldedOutput => {
                    yielded.push(chain.bytes(&output).to_vec());
                    output.stop();
                }
                Pump::DoneUntilNextInput => return yielded,
                Pump::Abort { kind, filter } => {
                    panic!("unexpected abort {:?} in {}", kind, filter)
                }
            }
        }
    }

    #[test]
    fn test_three_appends_single_output() {
        let mut chain = Chain::single(Box::new(Append::new(b"111")))
            .then(Box::new(Append::new(b"222")))
            .then(Box::new(Append::new(b"333")));
        let outs = drain(&mut chain, b"000");
        assert_eq!(outs, vec![b"000111222333".to_vec()]);
    }

    #[test]
    fn test_append_then_fixed_size_splits() {
        let mut chain =
            Chain::single(Box::new(Append::new(b"111"))).then(Box::new(FixedSize::new(3)));
        let outs = drain(&mut chain, b"000");
        assert_eq!(outs, vec![b"000".to_vec(), b"111".to_vec()]);
    }

    #[test]
    fn test_fixed_size_spans_inputs() {
        let mut chain = Chain::single(Box::new(FixedSize::new(4)));
        assert!(drain(&mut chain, b"ab").is_empty());
        let outs = drain(&mut chain, b"cdef");
        assert_eq!(outs, vec![b"abcd".to_vec()]);
        // "ef" stays buffered until two more bytes arrive
        let outs = drain(&mut chain, b"gh");
        assert_eq!(outs, vec![b"efgh".to_vec()]);
    }

    #[test]
    fn test_forward_pass_reuses_upstream_for_inplace_stage() {
        let chain = Chain::single(Box::new(ForwardByCopy::new()))
            .then(Box::new(Append::new(b"x")));
        // the appending stage transforms in place, so it adopts the copy
        // stage's output slot as both input and output
        assert_eq!(chain.stages[1].best_in, chain.stages[0].best_out);
        assert_eq!(chain.stages[1].best_out, chain.stages[0].best_out);
    }

    #[test]
    fn test_forward_pass_rejects_undersized_upstream() {
        let chain = Chain::single(Box::new(ForwardByCopy::with_max_packet_size(8)))
            .then(Box::new(Append::with_max_packet_size(
                b"x",
                DEFAULT_MAX_PACKET_SIZE,
            )));
        // 8-byte upstream storage is too small for a 1500-byte stage
        assert_eq!(chain.stages[1].best_in, chain.stages[1].local_in);
    }

    #[test]
    fn test_backward_pass_threads_through_reuse_stages() {
        let mut chain = Chain::single(Box::new(ForwardByCopy::new()))
            .then(Box::new(ForwardByPointing::new()))
            .then(Box::new(Append::new(b"x")));
        chain.load_ext_out(vec![0u8; 64].into_boxed_slice());
        chain.plan_backward_to_ext_out();
        let ext_out = chain.ext_out();
        // tail (append, reuse) and the pointing stage take the destination;
        // the copy stage keeps separate input memory, stopping the walk
        assert_eq!(chain.stages[2].best_out, ext_out);
        assert_eq!(chain.stages[2].best_in, ext_out);
        assert_eq!(chain.stages[1].best_out, ext_out);
        assert_eq!(chain.stages[1].best_in, ext_out);
        assert_eq!(chain.stages[0].best_out, ext_out);
        assert_ne!(chain.stages[0].best_in, ext_out);
    }

    #[test]
    fn test_reset_clears_stranded_state() {
        let mut chain = Chain::single(Box::new(FixedSize::new(4)));
        drain(&mut chain, b"ab"); // leaves two bytes buffered
        chain.reset();
        let outs = drain(&mut chain, b"wxyz");
        assert_eq!(outs, vec![b"wxyz".to_vec()]);
    }
}
