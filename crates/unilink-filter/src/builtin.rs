use crate::filter::{Filter, FilterResult, Scratch, StoragePolicy};
use crate::storage::Data;
use crate::DEFAULT_MAX_PACKET_SIZE;

/// Identity transform that copies its input into fresh storage, isolating
/// downstream stages from the upstream buffer.
pub struct ForwardByCopy {
    max_packet_size: usize,
}

impl ForwardByCopy {
    /// Creates the filter with the default packet budget.
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates the filter with an explicit packet budget.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for ForwardByCopy {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ForwardByCopy {
    fn process(
        &mut self,
        io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        if !io.copy_in_lazily(input) {
            return FilterResult::AbortExceededStorage;
        }
        io.emit(output);
        input.stop();
        FilterResult::Continue
    }

    fn name(&self) -> &'static str {
        "ForwardByCopy"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

/// Identity transform that re-emits the input window itself, reusing the
/// upstream storage with no copy at all.
pub struct ForwardByPointing {
    max_packet_size: usize,
}

impl ForwardByPointing {
    /// Creates the filter with the default packet budget.
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates the filter with an explicit packet budget.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for ForwardByPointing {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ForwardByPointing {
    fn process(
        &mut self,
        _io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        input.pass_to(output);
        FilterResult::Continue
    }

    fn name(&self) -> &'static str {
        "ForwardByPointing"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn storage_policy(&self) -> StoragePolicy {
        StoragePolicy::AllowReuseOfInput
    }
}

/// Appends fixed trailing bytes to every packet. Transforms in place when
/// the planner lets it reuse the upstream buffer.
pub struct Append {
    data: Vec<u8>,
    max_packet_size: usize,
}

impl Append {
    /// Creates the filter appending `data` with the default packet budget.
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self::with_max_packet_size(data, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates the filter appending `data` with an explicit packet budget.
    pub fn with_max_packet_size(data: impl AsRef<[u8]>, max_packet_size: usize) -> Self {
        Self { data: data.as_ref().to_vec(), max_packet_size }
    }
}

impl Filter for Append {
    fn process(
        &mut self,
        io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        if !io.copy_in_lazily(input) {
            return FilterResult::AbortExceededStorage;
        }
        if !io.append_slice(&self.data) {
            return FilterResult::AbortExceededStorage;
        }
        io.emit(output);
        input.stop();
        FilterResult::Continue
    }

    fn name(&self) -> &'static str {
        "Append"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn storage_policy(&self) -> StoragePolicy {
        StoragePolicy::AllowReuseOfInput
    }

    fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }
}

/// Accumulates bytes and emits packets of exactly `size` bytes, either
/// splitting one operation into many or combining several into one.
pub struct FixedSize {
    size: usize,
    max_packet_size: usize,
}

impl FixedSize {
    /// Creates the filter emitting `size`-byte packets.
    pub fn new(size: usize) -> Self {
        Self::with_max_packet_size(size, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates the filter with an explicit packet budget.
    pub fn with_max_packet_size(size: usize, max_packet_size: usize) -> Self {
        assert!(size <= max_packet_size, "fixed size must fit the packet budget");
        Self { size, max_packet_size }
    }
}

impl Filter for FixedSize {
    fn process(
        &mut self,
        io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        while input.is_live() && io.fill() < self.size {
            let byte = match io.pop(input) {
                Some(b) => b,
                None => break,
            };
            if !io.append(byte) {
                return FilterResult::AbortExceededStorage;
            }
        }
        if io.fill() >= self.size {
            io.emit(output);
        }
        FilterResult::Continue
    }

    fn name(&self) -> &'static str {
        "FixedSize"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn is_valid(&self) -> bool {
        self.size > 0
    }
}

/// Passes packets through unchanged unless they exceed `limit` bytes, in
/// which case they are segmented into `limit`-sized pieces plus a remainder.
pub struct SplitAbove {
    limit: usize,
    max_packet_size: usize,
}

impl SplitAbove {
    /// Creates the filter segmenting above `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self::with_max_packet_size(limit, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates the filter with an explicit packet budget.
    pub fn with_max_packet_size(limit: usize, max_packet_size: usize) -> Self {
        assert!(limit <= max_packet_size, "split limit must fit the packet budget");
        Self { limit, max_packet_size }
    }
}

impl Filter for SplitAbove {
    fn process(
        &mut self,
        io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        while input.is_live() && io.fill() < self.limit {
            let byte = match io.pop(input) {
                Some(b) => b,
                None => break,
            };
            if !io.append(byte) {
                return FilterResult::AbortExceededStorage;
            }
        }
        if io.fill() > 0 {
            io.emit(output);
        }
        FilterResult::Continue
    }

    fn name(&self) -> &'static str {
        "SplitAbove"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn is_valid(&self) -> bool {
        self.limit > 0
    }
}

/// Accumulates bytes until a multi-byte delimiter is seen, then emits the
/// bytes before it. A partial delimiter match is kept appended and trimmed
/// once the full sequence is confirmed.
pub struct Delimit {
    seq: Vec<u8>,
    matched: usize,
    max_packet_size: usize,
}

impl Delimit {
    /// Creates the filter splitting on `seq`.
    pub fn new(seq: impl AsRef<[u8]>) -> Self {
        Self::with_max_packet_size(seq, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates the filter with an explicit packet budget.
    pub fn with_max_packet_size(seq: impl AsRef<[u8]>, max_packet_size: usize) -> Self {
        Self { seq: seq.as_ref().to_vec(), matched: 0, max_packet_size }
    }
}

impl Filter for Delimit {
    fn process(
        &mut self,
        io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        while input.is_live() {
            let byte = match io.pop(input) {
                Some(b) => b,
                None => break,
            };
            if byte == self.seq[self.matched] {
                self.matched += 1;
                if self.matched >= self.seq.len() {
                    self.matched = 0;
                    // drop the partial-match bytes now that the delimiter is
                    // confirmed; the final byte was never appended
                    io.shrink_by(self.seq.len() - 1);
                    io.emit(output);
                    return FilterResult::Continue;
                }
            } else if byte == self.seq[0] {
                // a failed partial match can still begin a new one
                self.matched = 1;
            } else {
                self.matched = 0;
            }
            if !io.append(byte) {
                return FilterResult::AbortExceededStorage;
            }
        }
        FilterResult::Continue
    }

    fn reset(&mut self) {
        self.matched = 0;
    }

    fn name(&self) -> &'static str {
        "Delimit"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn is_valid(&self) -> bool {
        !self.seq.is_empty()
    }
}

/// Emits the same input `count` times before releasing it.
pub struct Repeat {
    count: usize,
    emitted: usize,
    max_packet_size: usize,
}

impl Repeat {
    /// Creates the filter repeating each packet `count` times.
    pub fn new(count: usize) -> Self {
        Self::with_max_packet_size(count, DEFAULT_MAX_PACKET_SIZE)
    }

    /// Creates the filter with an explicit packet budget.
    pub fn with_max_packet_size(count: usize, max_packet_size: usize) -> Self {
        Self { count, emitted: 0, max_packet_size }
    }
}

impl Filter for Repeat {
    fn process(
        &mut self,
        _io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        output.start_from(input);
        self.emitted += 1;
        if self.emitted >= self.count {
            input.stop();
            self.emitted = 0;
        }
        FilterResult::Continue
    }

    fn reset(&mut self) {
        self.emitted = 0;
    }

    fn name(&self) -> &'static str {
        "Repeat"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn is_valid(&self) -> bool {
        self.count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chain, Pump};

    fn drain(chain: &mut Chain, bytes: &[u8]) -> Result<Vec<Vec<u8>>, Pump> {
        let mut input = chain.load_ext_in(bytes.into());
        let mut output = Data::default();
        let mut yielded = Vec::new();
        loop {
            match chain.pump(&mut input, &mut output) {
                Pump::YieldedOutput => {
                    yielded.push(chain.bytes(&output).to_vec());
                    output.stop();
                }
                Pump::DoneUntilNextInput => return Ok(yielded),
                abort => return Err(abort),
            }
        }
    }

    #[test]
    fn test_forward_by_copy_is_identity() {
        let mut chain = Chain::from(ForwardByCopy::new());
        assert_eq!(drain(&mut chain, b"hello").unwrap(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_forward_by_pointing_is_identity() {
        let mut chain = Chain::from(ForwardByPointing::new());
        assert_eq!(drain(&mut chain, b"hello").unwrap(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_append_adds_trailer() {
        let mut chain = Chain::from(Append::new(b"\r\n"));
        assert_eq!(drain(&mut chain, b"line").unwrap(), vec![b"line\r\n".to_vec()]);
    }

    #[test]
    fn test_append_empty_pattern_is_invalid() {
        assert!(!Append::new(b"").is_valid());
        assert!(Append::new(b"x").is_valid());
    }

    #[test]
    fn test_fixed_size_splits_into_segments() {
        let mut chain = Chain::from(FixedSize::new(3));
        let outs = drain(&mut chain, b"aaabbbcccddd").unwrap();
        assert_eq!(
            outs,
            vec![b"aaa".to_vec(), b"bbb".to_vec(), b"ccc".to_vec(), b"ddd".to_vec()]
        );
    }

    #[test]
    fn test_split_above_keeps_small_and_segments_large() {
        let mut chain = Chain::from(SplitAbove::new(4));
        assert_eq!(drain(&mut chain, b"abc").unwrap(), vec![b"abc".to_vec()]);
        let outs = drain(&mut chain, b"abcdefgh1").unwrap();
        assert_eq!(outs, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"1".to_vec()]);
    }

    #[test]
    fn test_delimit_single_byte() {
        let mut chain = Chain::from(Delimit::new(b"\n"));
        let outs = drain(&mut chain, b"one\ntwo\nrest").unwrap();
        assert_eq!(outs, vec![b"one".to_vec(), b"two".to_vec()]);
        // "rest" is still accumulating; a later delimiter flushes it
        let outs = drain(&mut chain, b"\n").unwrap();
        assert_eq!(outs, vec![b"rest".to_vec()]);
    }

    #[test]
    fn test_delimit_multi_byte_trims_partial_match() {
        let mut chain = Chain::from(Delimit::new(b"--"));
        let outs = drain(&mut chain, b"a-b--c--").unwrap();
        assert_eq!(outs, vec![b"a-b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_delimit_restarts_partial_match() {
        let mut chain = Chain::from(Delimit::new(b"ab"));
        let outs = drain(&mut chain, b"xaab").unwrap();
        assert_eq!(outs, vec![b"xa".to_vec()]);
    }

    #[test]
    fn test_repeat_emits_three_copies() {
        let mut chain = Chain::from(Repeat::new(3));
        let outs = drain(&mut chain, b"ping").unwrap();
        assert_eq!(outs, vec![b"ping".to_vec(); 3]);
    }

    #[test]
    fn test_chained_output_matches_pointwise_composition() {
        // the planner must never alter semantics, only layout: a chain's
        // output equals running the filters one after the other by hand
        let mut chained = Chain::single(Box::new(Append::new(b"-1")))
            .then(Box::new(FixedSize::new(2)));
        let chained_out = drain(&mut chained, b"abcd").unwrap();

        let mut first = Chain::from(Append::new(b"-1"));
        let step1 = drain(&mut first, b"abcd").unwrap();
        let mut second = Chain::from(FixedSize::new(2));
        let mut pointwise = Vec::new();
        for piece in step1 {
            pointwise.extend(drain(&mut second, &piece).unwrap());
        }
        assert_eq!(chained_out, pointwise);
    }
}
