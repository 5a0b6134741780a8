//! Metadata header-block codec.
//!
//! Every field is emitted as a literal that is never indexed, with the
//! name and value Huffman-coded, so no dynamic compression table has to be
//! synchronized across the connection. The decoder accepts both the
//! never-indexed and without-indexing literal forms, raw or Huffman
//! strings, and is restartable across CONTINUATION boundaries only at the
//! block level (fragments are reassembled before decoding).

use bytes::Bytes;
use weft_hpack::{huffman, HuffmanDecoder, HuffmanDecoderError};

use crate::stream::MetadataField;

/// Literal with incremental indexing disabled, never-indexed form.
const LITERAL_NEVER_INDEXED: u8 = 0x10;
/// String literal flag: payload is Huffman-coded.
const HUFFMAN_STRING: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderBlockError {
    #[error("header block ended mid-field")]
    Truncated,

    #[error("length integer overflowed")]
    IntegerOverflow,

    #[error("unsupported field representation (first byte {first_byte:#04x})")]
    UnsupportedRepresentation { first_byte: u8 },

    #[error("huffman-coded string is invalid: {0}")]
    Huffman(#[from] HuffmanDecoderError),
}

/// Encode metadata fields into a header block.
pub fn encode_block(fields: &[MetadataField], out: &mut Vec<u8>) {
    for (name, value) in fields {
        out.push(LITERAL_NEVER_INDEXED);
        encode_string(name, out);
        encode_string(value, out);
    }
}

fn encode_string(s: &[u8], out: &mut Vec<u8>) {
    let encoded_len = huffman::encoded_len(s);
    encode_int(encoded_len as u64, 7, HUFFMAN_STRING, out);
    out.extend_from_slice(&huffman::encode(s));
}

/// HPACK prefix integer, RFC 7541 section 5.1. `flags` occupies the bits
/// above the prefix in the first byte.
fn encode_int(mut value: u64, prefix_bits: u8, flags: u8, out: &mut Vec<u8>) {
    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        out.push(flags | value as u8);
        return;
    }
    out.push(flags | max_prefix as u8);
    value -= max_prefix;
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a complete header block into metadata fields.
pub fn decode_block(block: &[u8]) -> Result<Vec<MetadataField>, HeaderBlockError> {
    let mut fields = Vec::new();
    let mut rest = block;
    while let Some((&first, _)) = rest.split_first() {
        // Literal without indexing (0000xxxx) or never indexed (0001xxxx),
        // and only with a literal name (low nibble zero).
        if first & 0xe0 != 0 || first & 0x0f != 0 {
            return Err(HeaderBlockError::UnsupportedRepresentation { first_byte: first });
        }
        rest = &rest[1..];
        let (name, after_name) = decode_string(rest)?;
        let (value, after_value) = decode_string(after_name)?;
        rest = after_value;
        fields.push((name, value));
    }
    Ok(fields)
}

fn decode_string(input: &[u8]) -> Result<(Bytes, &[u8]), HeaderBlockError> {
    let Some((&first, rest)) = input.split_first() else {
        return Err(HeaderBlockError::Truncated);
    };
    let huffman_coded = first & HUFFMAN_STRING != 0;
    let (len, rest) = decode_int(first & 0x7f, 7, rest)?;
    let len = usize::try_from(len).map_err(|_| HeaderBlockError::IntegerOverflow)?;
    if rest.len() < len {
        return Err(HeaderBlockError::Truncated);
    }
    let (raw, rest) = rest.split_at(len);
    let s = if huffman_coded {
        Bytes::from(HuffmanDecoder::decode(raw)?)
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((s, rest))
}

fn decode_int(prefix: u8, prefix_bits: u8, input: &[u8]) -> Result<(u64, &[u8]), HeaderBlockError> {
    let max_prefix = (1u64 << prefix_bits) - 1;
    let mut value = prefix as u64;
    if value < max_prefix {
        return Ok((value, input));
    }
    let mut rest = input;
    let mut shift = 0u32;
    loop {
        let Some((&b, tail)) = rest.split_first() else {
            return Err(HeaderBlockError::Truncated);
        };
        rest = tail;
        value = (b as u64 & 0x7f)
            .checked_shl(shift)
            .and_then(|v| value.checked_add(v))
            .ok_or(HeaderBlockError::IntegerOverflow)?;
        if b & 0x80 == 0 {
            return Ok((value, rest));
        }
        shift += 7;
        if shift > 56 {
            return Err(HeaderBlockError::IntegerOverflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(name: &str, value: &str) -> MetadataField {
        (
            Bytes::copy_from_slice(name.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    #[test]
    fn roundtrip_fields() {
        let fields = vec![
            field(":method", "POST"),
            field(":path", "/demo.Echo/Ping"),
            field("content-type", "application/grpc"),
            field("x-large", &"v".repeat(300)),
        ];
        let mut block = Vec::new();
        encode_block(&fields, &mut block);
        assert_eq!(decode_block(&block).unwrap(), fields);
    }

    #[test]
    fn decodes_raw_string_literals() {
        // Never-indexed, raw (non-Huffman) strings: "a: b".
        let block = [0x10, 0x01, b'a', 0x01, b'b'];
        assert_eq!(decode_block(&block).unwrap(), vec![field("a", "b")]);
    }

    #[test]
    fn decodes_without_indexing_form() {
        let block = [0x00, 0x01, b'k', 0x01, b'v'];
        assert_eq!(decode_block(&block).unwrap(), vec![field("k", "v")]);
    }

    #[test]
    fn rejects_indexed_representations() {
        // Indexed field (high bit set) is never produced by this codec.
        let err = decode_block(&[0x82]).unwrap_err();
        assert_eq!(
            err,
            HeaderBlockError::UnsupportedRepresentation { first_byte: 0x82 }
        );
    }

    #[test]
    fn truncated_block_is_rejected() {
        let mut block = Vec::new();
        encode_block(&[field("name", "value")], &mut block);
        block.truncate(block.len() - 1);
        assert_eq!(decode_block(&block).unwrap_err(), HeaderBlockError::Truncated);
    }

    #[test]
    fn prefix_int_multi_byte_roundtrip() {
        // RFC 7541 C.1.2: 1337 with a 5-bit prefix.
        let mut out = Vec::new();
        encode_int(1337, 5, 0, &mut out);
        assert_eq!(out, vec![0x1f, 0x9a, 0x0a]);

        let (value, rest) = decode_int(out[0] & 0x1f, 5, &out[1..]).unwrap();
        assert_eq!(value, 1337);
        assert!(rest.is_empty());
    }

    #[test]
    fn unbounded_int_continuation_is_rejected() {
        let bytes = [0xff; 16];
        assert_eq!(
            decode_int(0x7f, 7, &bytes).unwrap_err(),
            HeaderBlockError::IntegerOverflow
        );
    }
}
