//! Header-string compression codec for the weft HTTP/2 transport.
//!
//! This crate carries the byte/bit level of HPACK: the static Huffman
//! table and a restartable table-driven decoder. The field-block layer
//! (indexing tables, representations) lives with the transport's header
//! seam, which calls into this crate for every string literal.

pub mod huffman;

pub use huffman::{HuffmanDecoder, HuffmanDecoderError};
