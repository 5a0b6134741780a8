//! Canonical Huffman codec for HPACK string literals (RFC 7541
//! Appendix B).
//!
//! Encoding walks the static code table and packs codes MSB-first,
//! padding the last byte with 1-bits (a prefix of EOS). Decoding runs a
//! finite automaton one nibble at a time: `state x nibble` looks up the
//! next state plus an optional emitted byte, so the per-input work is
//! O(1) regardless of code length. The transition tables are derived
//! once from the code table at first use, and every table access is
//! bounds-checked indexing.

use std::sync::OnceLock;

/// The static Huffman code: `(code, bit length)` per symbol, indexed by
/// byte value; entry 256 is EOS.
pub static HUFFMAN_CODES: [(u32, u8); 257] = [
    (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28),
    (0xfffffe4, 28), (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28),
    (0xfffffe8, 28), (0xffffea, 24), (0x3ffffffc, 30), (0xfffffe9, 28),
    (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28), (0xfffffec, 28),
    (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
    (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28),
    (0xffffff4, 28), (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28),
    (0xffffff8, 28), (0xffffff9, 28), (0xffffffa, 28), (0xffffffb, 28),
    (0x14, 6), (0x3f8, 10), (0x3f9, 10), (0xffa, 12),
    (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
    (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11),
    (0xfa, 8), (0x16, 6), (0x17, 6), (0x18, 6),
    (0x0, 5), (0x1, 5), (0x2, 5), (0x19, 6),
    (0x1a, 6), (0x1b, 6), (0x1c, 6), (0x1d, 6),
    (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
    (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10),
    (0x1ffa, 13), (0x21, 6), (0x5d, 7), (0x5e, 7),
    (0x5f, 7), (0x60, 7), (0x61, 7), (0x62, 7),
    (0x63, 7), (0x64, 7), (0x65, 7), (0x66, 7),
    (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
    (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7),
    (0x6f, 7), (0x70, 7), (0x71, 7), (0x72, 7),
    (0xfc, 8), (0x73, 7), (0xfd, 8), (0x1ffb, 13),
    (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14), (0x22, 6),
    (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
    (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6),
    (0x27, 6), (0x6, 5), (0x74, 7), (0x75, 7),
    (0x28, 6), (0x29, 6), (0x2a, 6), (0x7, 5),
    (0x2b, 6), (0x76, 7), (0x2c, 6), (0x8, 5),
    (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
    (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15),
    (0x7fc, 11), (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28),
    (0xfffe6, 20), (0x3fffd2, 22), (0xfffe7, 20), (0xfffe8, 20),
    (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22), (0x7fffd9, 23),
    (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
    (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23),
    (0xffffec, 24), (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23),
    (0xffffee, 24), (0x7fffe1, 23), (0x7fffe2, 23), (0x7fffe3, 23),
    (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22), (0x7fffe5, 23),
    (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
    (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22),
    (0x3fffdc, 22), (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21),
    (0x7fffea, 23), (0x3fffdd, 22), (0x3fffde, 22), (0xfffff0, 24),
    (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23), (0x7fffec, 23),
    (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
    (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23),
    (0xfffea, 20), (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22),
    (0x7ffff0, 23), (0x3fffe5, 22), (0x3fffe6, 22), (0x7ffff1, 23),
    (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20), (0x7fff1, 19),
    (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
    (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27),
    (0x7ffffdf, 27), (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25),
    (0x7fff2, 19), (0x1fffe3, 21), (0x3ffffe6, 26), (0x7ffffe0, 27),
    (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27), (0xfffff2, 24),
    (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
    (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27),
    (0xfffec, 20), (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21),
    (0x3fffe9, 22), (0x1fffe7, 21), (0x1fffe8, 21), (0x7ffff3, 23),
    (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25), (0x1ffffef, 25),
    (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
    (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26),
    (0x7ffffe7, 27), (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27),
    (0x7ffffeb, 27), (0xffffffe, 28), (0x7ffffec, 27), (0x7ffffed, 27),
    (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27), (0x3ffffee, 26),
    (0x3fffffff, 30),];

/// Symbol index of the end-of-string marker in [HUFFMAN_CODES].
const EOS: usize = 256;

/// Number of bytes `encode` will produce for `src`, without encoding.
pub fn encoded_len(src: &[u8]) -> usize {
    let bits: usize = src
        .iter()
        .map(|&b| HUFFMAN_CODES[b as usize].1 as usize)
        .sum();
    bits.div_ceil(8)
}

/// Huffman-encode a string literal: codes are concatenated MSB-first and
/// the final byte is padded with 1-bits (the EOS prefix).
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(src));
    let mut acc: u64 = 0;
    let mut nbits: u32 = 0;

    for &b in src {
        let (code, len) = HUFFMAN_CODES[b as usize];
        acc = (acc << len) | code as u64;
        nbits += len as u32;
        while nbits >= 8 {
            nbits -= 8;
            out.push((acc >> nbits) as u8);
        }
    }

    if nbits > 0 {
        let pad = 8 - nbits;
        out.push(((acc << pad) | ((1u64 << pad) - 1)) as u8);
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HuffmanDecoderError {
    /// The EOS symbol appeared inside the string; RFC 7541 requires
    /// treating it as a decoding error.
    #[error("EOS symbol encountered inside a Huffman-coded string")]
    EosInString,

    /// Input ended partway through a code, or the padding was not a
    /// prefix of EOS (all 1-bits, fewer than 8).
    #[error("Huffman-coded string ended in an incomplete code or bad padding")]
    InvalidPadding,

    /// The automaton reached a state/nibble pair with no transition.
    /// Cannot happen for tables derived from a complete code; kept so
    /// table indexing stays checked.
    #[error("no transition for the current decoder state")]
    InvalidState,
}

#[derive(Clone, Copy)]
struct Transition {
    next: u16,
    emit: Option<u8>,
    error: bool,
}

struct DecodeTables {
    /// `state * 16 + nibble` indexed transitions.
    transitions: Vec<Transition>,
    /// Whether ending in this state is a valid end of input.
    accepting: Vec<bool>,
}

static TABLES: OnceLock<DecodeTables> = OnceLock::new();

fn tables() -> &'static DecodeTables {
    TABLES.get_or_init(build_tables)
}

/// Build the nibble-at-a-time transition tables from [HUFFMAN_CODES].
///
/// The code table is a complete prefix code (every interior trie node
/// has both children), so the only error transitions are the ones that
/// reach the EOS leaf. A state is accepting when the bits consumed since
/// the last emitted symbol are all ones and fewer than 8 of them, i.e. a
/// legal padding.
fn build_tables() -> DecodeTables {
    const NONE: usize = usize::MAX;

    struct Node {
        children: [usize; 2],
        sym: Option<u16>,
        all_ones: bool,
        depth: u8,
    }

    let mut nodes: Vec<Node> = vec![Node {
        children: [NONE; 2],
        sym: None,
        all_ones: true,
        depth: 0,
    }];

    for (sym, &(code, len)) in HUFFMAN_CODES.iter().enumerate() {
        let mut cur = 0usize;
        for pos in (0..len).rev() {
            let bit = ((code >> pos) & 1) as usize;
            let next = nodes[cur].children[bit];
            let next = if next == NONE {
                let id = nodes.len();
                let all_ones = nodes[cur].all_ones && bit == 1;
                let depth = nodes[cur].depth.saturating_add(1);
                nodes.push(Node {
                    children: [NONE; 2],
                    sym: None,
                    all_ones,
                    depth,
                });
                nodes[cur].children[bit] = id;
                id
            } else {
                next
            };
            cur = next;
        }
        nodes[cur].sym = Some(sym as u16);
    }

    // interior nodes become automaton states
    let mut state_of = vec![NONE; nodes.len()];
    let mut num_states = 0usize;
    for (idx, node) in nodes.iter().enumerate() {
        if node.sym.is_none() {
            state_of[idx] = num_states;
            num_states += 1;
        }
    }
    debug_assert_eq!(state_of[0], 0, "root must be state zero");

    let mut transitions = Vec::with_capacity(num_states * 16);
    let mut accepting = vec![false; num_states];

    for (idx, node) in nodes.iter().enumerate() {
        if node.sym.is_some() {
            continue;
        }
        accepting[state_of[idx]] = node.all_ones && node.depth < 8;
    }

    for (idx, node) in nodes.iter().enumerate() {
        if node.sym.is_some() {
            continue;
        }
        for nibble in 0u8..16 {
            let mut cur = idx;
            let mut emit = None;
            let mut error = false;
            for pos in (0..4).rev() {
                let bit = ((nibble >> pos) & 1) as usize;
                let child = nodes[cur].children[bit];
                debug_assert_ne!(child, NONE, "complete code has no missing children");
                match nodes[child].sym {
                    Some(sym) if sym as usize == EOS => {
                        error = true;
                        break;
                    }
                    Some(sym) => {
                        debug_assert!(emit.is_none(), "at most one symbol per nibble");
                        emit = Some(sym as u8);
                        cur = 0;
                    }
                    None => cur = child,
                }
            }
            transitions.push(Transition {
                next: if error { 0 } else { state_of[cur] as u16 },
                emit,
                error,
            });
        }
    }

    DecodeTables {
        transitions,
        accepting,
    }
}

/// Restartable Huffman decoder: the automaton state is the only carried
/// context, so input may be fed a byte (or a buffer) at a time.
pub struct HuffmanDecoder {
    state: u16,
}

impl Default for HuffmanDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HuffmanDecoder {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    fn step(&mut self, nibble: u8, out: &mut Vec<u8>) -> Result<(), HuffmanDecoderError> {
        let t = tables();
        let idx = self.state as usize * 16 + nibble as usize;
        let tr = t
            .transitions
            .get(idx)
            .copied()
            .ok_or(HuffmanDecoderError::InvalidState)?;
        if tr.error {
            return Err(HuffmanDecoderError::EosInString);
        }
        if let Some(sym) = tr.emit {
            out.push(sym);
        }
        self.state = tr.next;
        Ok(())
    }

    /// Feed one input byte, appending any decoded bytes to `out`.
    pub fn feed(&mut self, byte: u8, out: &mut Vec<u8>) -> Result<(), HuffmanDecoderError> {
        self.step(byte >> 4, out)?;
        self.step(byte & 0x0f, out)
    }

    /// True if ending the input in the current state is legal.
    pub fn is_accepting(&self) -> bool {
        tables()
            .accepting
            .get(self.state as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Check that the input ended on a code boundary or legal padding.
    pub fn finish(&self) -> Result<(), HuffmanDecoderError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(HuffmanDecoderError::InvalidPadding)
        }
    }

    /// One-shot decode of a whole buffer.
    pub fn decode(buf: &[u8]) -> Result<Vec<u8>, HuffmanDecoderError> {
        let mut decoder = Self::new();
        let mut out = Vec::with_capacity(buf.len() * 2);
        for &b in buf {
            decoder.feed(b, &mut out)?;
        }
        decoder.finish()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrip_simple_strings() {
        let cases: &[&[u8]] = &[
            b"",
            b"www.example.com",
            b"no-cache",
            b"custom-key",
            b"custom-value",
            b"/sample/path?query=1&other=2",
            b"Mon, 21 Oct 2013 20:13:21 GMT",
        ];
        for &input in cases {
            let encoded = encode(input);
            assert_eq!(encoded.len(), encoded_len(input));
            let decoded = HuffmanDecoder::decode(&encoded).unwrap();
            assert_eq!(decoded, input, "roundtrip failed for {input:?}");
        }
    }

    #[test]
    fn roundtrip_all_byte_values() {
        let input: Vec<u8> = (0u8..=255).collect();
        let decoded = HuffmanDecoder::decode(&encode(&input)).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn known_answer_rfc7541_c4() {
        // RFC 7541 C.4.1
        let encoded = encode(b"www.example.com");
        assert_eq!(
            encoded,
            [0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]
        );
    }

    #[test]
    fn byte_at_a_time_matches_one_shot() {
        let input = b"feeding the decoder byte by byte must not change anything";
        let encoded = encode(input);

        let whole = HuffmanDecoder::decode(&encoded).unwrap();

        let mut decoder = HuffmanDecoder::new();
        let mut incremental = Vec::new();
        for &b in &encoded {
            decoder.feed(b, &mut incremental).unwrap();
        }
        decoder.finish().unwrap();

        assert_eq!(incremental, whole);
        assert_eq!(incremental, input);
    }

    #[test]
    fn eos_in_stream_is_an_error() {
        // 30 bits of ones (the EOS code) followed by 1-bit padding
        let err = HuffmanDecoder::decode(&[0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err, HuffmanDecoderError::EosInString);
    }

    #[test]
    fn full_byte_of_padding_is_an_error() {
        // 'a' (5 bits) then 8+3 bits of ones: padding too long
        let mut bytes = encode(b"a");
        assert_eq!(bytes.len(), 1);
        bytes.push(0xff);
        let err = HuffmanDecoder::decode(&bytes).unwrap_err();
        assert_eq!(err, HuffmanDecoderError::InvalidPadding);
    }

    #[test]
    fn non_ones_padding_is_an_error() {
        // '0' is 00000, leaving three 0-bits of padding: must be ones
        let err = HuffmanDecoder::decode(&[0x00]).unwrap_err();
        assert_eq!(err, HuffmanDecoderError::InvalidPadding);
    }

    #[test]
    fn empty_input_is_accepting() {
        assert_eq!(HuffmanDecoder::decode(&[]).unwrap(), Vec::<u8>::new());
        assert!(HuffmanDecoder::new().is_accepting());
    }
}
