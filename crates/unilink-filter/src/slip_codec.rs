//! RFC-1055 SLIP framing.
//!
//! Encoding escapes 0xC0 and 0xDB payload bytes as 0xDB 0xDC and 0xDB 0xDD
//! and terminates each frame with 0xC0. Decoding treats 0xC0 as a frame
//! boundary, ignores empty frames, and rejects unknown escape sequences.
//!
//! Both directions support a nonstandard alignment aid: the encoder can
//! prefix every frame with an extra frame end, and the decoder can discard
//! everything before the first frame end it sees. Used together they keep a
//! receiver aligned even when it attaches mid-stream after a hot restart.

use crate::filter::{Filter, FilterResult, Scratch};
use crate::storage::Data;
use crate::DEFAULT_MAX_PACKET_SIZE;

/// SLIP frame terminator.
pub const FRAME_END: u8 = 0xC0;
/// SLIP escape introducer.
pub const FRAME_ESC: u8 = 0xDB;
/// Escaped stand-in for a payload 0xC0.
pub const TRANS_END: u8 = 0xDC;
/// Escaped stand-in for a payload 0xDB.
pub const TRANS_ESC: u8 = 0xDD;

/// SLIP encoder.
pub struct Encode {
    prefix_with_frame_end: bool,
    max_packet_size: usize,
}

impl Encode {
    /// Standard encoder: frames are terminated, not prefixed.
    pub fn new() -> Self {
        Self { prefix_with_frame_end: false, max_packet_size: DEFAULT_MAX_PACKET_SIZE }
    }

    /// Adds a leading frame end to every frame. Pair with
    /// [`Decode::waiting_for_first_frame_end`] so the first frame after a
    /// reconnect is not dropped.
    pub fn prefixed_with_frame_end() -> Self {
        Self { prefix_with_frame_end: true, max_packet_size: DEFAULT_MAX_PACKET_SIZE }
    }

    /// Overrides the packet budget.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }
}

impl Default for Encode {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Encode {
    fn process(
        &mut self,
        io: &mut Scratch<'_>,
        input: &mut Data,
        output: &mut Data,
    ) -> FilterResult {
        // worst case is checked incrementally; this guards the no-escape case
        let minimum = input.len() + 1 + usize::from(self.prefix_with_frame_end);
        if minimum > io.capacity() {
            return FilterResult::AbortExceededStorage;
        }

        io.clear();
        if self.prefix_with_frame_end && !io.append(FRAME_END) {
            return FilterResult::AbortExceededStorage;
        }
        for i in 0..input.len() {
            let byte = io.byte_at(input, i);
            let ok = match byte {
                FRAME_END => io.append(FRAME_ESC) && io.append(TRANS_END),
                FRAME_ESC => io.append(FRAME_ESC) && io.append(TRANS_ESC),
                other => io.append(other),
            };
            if !ok {
                return FilterResult::AbortExceededStorage;
            }
        }
        if !io.append(FRAME_END) {
            return FilterResult::AbortExceededStorage;
        }
        io.emit(output);
        input.stop();
        FilterResult::Continue
    }

    fn name(&self) -> &'static str {
        "slip::Encode"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

/// SLIP decoder.
pub struct Decode {
    wait_for_first_frame_end: bool,
    need_first_frame_end: bool,
    in_escape: bool,
    max_packet_size: usize,
}

impl Decode {
    /// Standard decoder: bytes before the first frame end are payload.
    pub fn new() -> Self {
        Self {
            wait_for_first_frame_end: false,
            need_first_frame_end: false,
            in_escape: false,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Discards everything before the first frame end, guaranteeing no
    /// partial frame is surfaced after attaching mid-stream. Pair with
    /// [`Encode::prefixed_with_frame_end`].
    pub fn waiting_for_first_frame_end() -> Self {
        Self {
            wait_for_first_frame_end: true,
            need_first_frame_end: true,
            in_escape: false,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Overrides the packet budget.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }
}

impl Default for Decode {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Decode {
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

            if self.need_first_frame_end {
                self.need_first_frame_end = byte != FRAME_END;
                continue;
            }

            if self.in_escape {
                self.in_escape = false;
                let decoded = match byte {
                    TRANS_END => FRAME_END,
                    TRANS_ESC => FRAME_ESC,
                    _ => return FilterResult::AbortDataFormatError,
                };
                if !io.append(decoded) {
                    return FilterResult::AbortExceededStorage;
                }
            } else if byte == FRAME_END {
                // empty frames are ignored, so back-to-back frame ends and
                // alignment prefixes cost nothing
                if io.fill() > 0 {
                    io.emit(output);
                    return FilterResult::Continue;
                }
            } else if byte == FRAME_ESC {
                self.in_escape = true;
            } else if !io.append(byte) {
                return FilterResult::AbortExceededStorage;
            }
        }
        FilterResult::Continue
    }

    fn reset(&mut self) {
        self.in_escape = false;
        self.need_first_frame_end = self.wait_for_first_frame_end;
    }

    fn name(&self) -> &'static str {
        "slip::Decode"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chain, Pump};
    use unilink_core::FilterAbortKind;

    fn drain(chain: &mut Chain, bytes: &[u8]) -> Result<Vec<Vec<u8>>, (FilterAbortKind, &'static str)> {
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
                Pump::Abort { kind, filter } => return Err((kind, filter)),
            }
        }
    }

    #[test]
    fn test_encode_terminates_frame() {
        let mut chain = Chain::from(Encode::new());
        let outs = drain(&mut chain, b"hi").unwrap();
        assert_eq!(outs, vec![vec![b'h', b'i', FRAME_END]]);
    }

    #[test]
    fn test_encode_escapes_special_bytes() {
        let mut chain = Chain::from(Encode::new());
        let outs = drain(&mut chain, &[1, FRAME_END, 2, FRAME_ESC, 3]).unwrap();
        assert_eq!(
            outs,
            vec![vec![1, FRAME_ESC, TRANS_END, 2, FRAME_ESC, TRANS_ESC, 3, FRAME_END]]
        );
    }

    #[test]
    fn test_decode_splits_concatenated_frames() {
        let mut chain = Chain::from(Decode::new());
        let mut wire = Vec::new();
        wire.extend_from_slice(b"hello1");
        wire.push(FRAME_END);
        wire.push(FRAME_END); // empty frame is ignored
        wire.extend_from_slice(b"hello2");
        wire.push(FRAME_END);
        wire.extend_from_slice(b"hello3");
        wire.push(FRAME_END);
        let outs = drain(&mut chain, &wire).unwrap();
        assert_eq!(outs, vec![b"hello1".to_vec(), b"hello2".to_vec(), b"hello3".to_vec()]);
    }

    #[test]
    fn test_round_trip_all_byte_values() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut enc = Chain::from(Encode::new());
        let frames = drain(&mut enc, &payload).unwrap();
        assert_eq!(frames.len(), 1);

        let mut dec = Chain::from(Decode::new());
        let decoded = drain(&mut dec, &frames[0]).unwrap();
        assert_eq!(decoded, vec![payload]);
    }

    #[test]
    fn test_round_trip_concatenation_preserves_order() {
        let messages: [&[u8]; 3] = [b"one", &[FRAME_END, FRAME_ESC], b"three"];
        let mut enc = Chain::from(Encode::new());
        let mut wire = Vec::new();
        for msg in messages {
            for frame in drain(&mut enc, msg).unwrap() {
                wire.extend_from_slice(&frame);
            }
        }
        let mut dec = Chain::from(Decode::new());
        let decoded = drain(&mut dec, &wire).unwrap();
        assert_eq!(decoded, messages.iter().map(|m| m.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn test_decode_rejects_unknown_escape() {
        let mut chain = Chain::from(Decode::new());
        let err = drain(&mut chain, &[FRAME_ESC, 0x42]).unwrap_err();
        assert_eq!(err, (FilterAbortKind::DataFormatError, "slip::Decode"));
    }

    #[test]
    fn test_alignment_pairing_drops_partial_first_frame() {
        // a decoder attaching mid-stream sees the tail of an old frame first
        let mut dec = Chain::from(Decode::waiting_for_first_frame_end());
        let mut wire = b"tail-of-old-frame".to_vec();
        wire.push(FRAME_END);

        let mut enc = Chain::from(Encode::prefixed_with_frame_end());
        for frame in drain(&mut enc, b"fresh").unwrap() {
            wire.extend_from_slice(&frame);
        }

        let outs = drain(&mut dec, &wire).unwrap();
        assert_eq!(outs, vec![b"fresh".to_vec()]);
    }
}
