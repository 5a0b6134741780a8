//! Incremental frame reader.
//!
//! Consumes arbitrary byte chunks and yields complete frames. The state
//! machine has three positions: matching the client preface (servers
//! only), filling the 9-byte frame header, and filling the payload. A
//! frame's payload parser kind is decided as soon as its header is
//! complete, so payloads for reset streams and unknown frame types are
//! discarded as they stream in instead of being buffered.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use tracing::trace;
use weft_h2::{Frame, FrameType, HeadersFlags, StreamId, PREFACE};

use crate::error::ConnectionError;

const FRAME_HEADER_LEN: usize = 9;

/// How to treat a frame's payload as it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserKind {
    /// Buffer the payload and emit it with the frame.
    Typed,
    /// Count the bytes down, emit the frame with an empty payload.
    Skip,
}

/// A complete frame, payload reassembled and padding stripped.
#[derive(Debug)]
pub(crate) struct DeframedFrame {
    pub frame: Frame,
    pub payload: Bytes,
    /// Payload was discarded (reset stream or unknown frame type).
    pub skipped: bool,
}

enum State {
    Preface { matched: usize },
    FrameHeader { buf: [u8; FRAME_HEADER_LEN], filled: usize },
    Payload { frame: Frame, parser: ParserKind, buf: Vec<u8>, remaining: usize },
}

pub(crate) struct Deframer {
    state: State,
    max_frame_size: u32,
    /// Streams we reset locally: inbound DATA/HEADERS/CONTINUATION for
    /// them are discarded instead of buffered.
    skip_streams: HashSet<StreamId>,
}

impl Deframer {
    pub(crate) fn new(expect_preface: bool) -> Self {
        let state = if expect_preface {
            State::Preface { matched: 0 }
        } else {
            State::FrameHeader {
                buf: [0; FRAME_HEADER_LEN],
                filled: 0,
            }
        };
        Self {
            state,
            max_frame_size: weft_h2::Settings::default().max_frame_size,
            skip_streams: HashSet::new(),
        }
    }

    /// Raise the frame-size ceiling after announcing a larger
    /// MAX_FRAME_SIZE of our own.
    pub(crate) fn set_max_frame_size(&mut self, n: u32) {
        self.max_frame_size = n;
    }

    pub(crate) fn skip_stream(&mut self, id: StreamId) {
        self.skip_streams.insert(id);
    }

    pub(crate) fn unskip_stream(&mut self, id: StreamId) {
        self.skip_streams.remove(&id);
    }

    /// Feed a chunk of bytes, appending every frame completed by it to
    /// `out`. Progress already made is kept across calls, so a frame may
    /// arrive one byte at a time.
    pub(crate) fn feed(
        &mut self,
        mut data: &[u8],
        out: &mut VecDeque<DeframedFrame>,
    ) -> Result<(), ConnectionError> {
        while !data.is_empty() {
            match &mut self.state {
                State::Preface { matched } => {
                    let want = &PREFACE[*matched..];
                    let n = want.len().min(data.len());
                    if data[..n] != want[..n] {
                        return Err(ConnectionError::BadPreface);
                    }
                    *matched += n;
                    data = &data[n..];
                    if *matched == PREFACE.len() {
                        trace!("received connection preface");
                        self.state = State::FrameHeader {
                            buf: [0; FRAME_HEADER_LEN],
                            filled: 0,
                        };
                    }
                }
                State::FrameHeader { buf, filled } => {
                    let n = (FRAME_HEADER_LEN - *filled).min(data.len());
                    buf[*filled..*filled + n].copy_from_slice(&data[..n]);
                    *filled += n;
                    data = &data[n..];
                    if *filled < FRAME_HEADER_LEN {
                        continue;
                    }
                    let frame = Frame::parse_header(*buf);
                    if frame.len > self.max_frame_size {
                        return Err(ConnectionError::FrameTooLarge {
                            frame_size: frame.len,
                            max_frame_size: self.max_frame_size,
                        });
                    }
                    let parser = self.parser_for(&frame);
                    self.state = State::Payload {
                        buf: match parser {
                            ParserKind::Typed => Vec::with_capacity(frame.len as usize),
                            ParserKind::Skip => Vec::new(),
                        },
                        remaining: frame.len as usize,
                        parser,
                        frame,
                    };
                    self.finish_if_complete(out)?;
                }
                State::Payload { parser, buf, remaining, .. } => {
                    let n = (*remaining).min(data.len());
                    if matches!(parser, ParserKind::Typed) {
                        buf.extend_from_slice(&data[..n]);
                    }
                    *remaining -= n;
                    data = &data[n..];
                    self.finish_if_complete(out)?;
                }
            }
        }
        Ok(())
    }

    fn parser_for(&self, frame: &Frame) -> ParserKind {
        match frame.frame_type {
            FrameType::Unknown(ft) => {
                trace!(ty = ft.ty, "skipping unknown frame type");
                ParserKind::Skip
            }
            FrameType::Data(_) | FrameType::Headers(_) | FrameType::Continuation(_)
                if self.skip_streams.contains(&frame.stream_id) =>
            {
                ParserKind::Skip
            }
            _ => ParserKind::Typed,
        }
    }

    fn finish_if_complete(
        &mut self,
        out: &mut VecDeque<DeframedFrame>,
    ) -> Result<(), ConnectionError> {
        let State::Payload { remaining: 0, .. } = self.state else {
            return Ok(());
        };
        let next = State::FrameHeader {
            buf: [0; FRAME_HEADER_LEN],
            filled: 0,
        };
        let State::Payload { frame, parser, buf, .. } = std::mem::replace(&mut self.state, next)
        else {
            unreachable!()
        };
        let skipped = parser == ParserKind::Skip;
        let payload = if skipped {
            Bytes::new()
        } else {
            strip_padding(&frame, buf)?
        };
        out.push_back(DeframedFrame {
            frame,
            payload,
            skipped,
        });
        Ok(())
    }
}

/// Strip the pad-length prefix and trailing padding from DATA and padded
/// HEADERS payloads.
fn strip_padding(frame: &Frame, buf: Vec<u8>) -> Result<Bytes, ConnectionError> {
    let padded = match frame.frame_type {
        FrameType::Data(flags) => flags.contains(weft_h2::DataFlags::Padded),
        FrameType::Headers(flags) => flags.contains(HeadersFlags::Padded),
        _ => false,
    };
    if !padded {
        return Ok(Bytes::from(buf));
    }
    let Some((&pad_len, rest)) = buf.split_first() else {
        return Err(ConnectionError::PaddedFrameTooShort {
            frame_type: frame.frame_type,
        });
    };
    if pad_len as usize > rest.len() {
        return Err(ConnectionError::PaddedFrameEmpty {
            frame_type: frame.frame_type,
        });
    }
    let mut payload = Bytes::from(buf);
    // Drop the length byte, then the padding at the tail.
    let body_len = payload.len() - 1 - pad_len as usize;
    Ok(payload.split_off(1).split_to(body_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use weft_h2::DataFlags;

    fn frame_bytes(frame: Frame, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        frame.write_into(&mut out).unwrap();
        out.extend_from_slice(payload);
        out
    }

    fn data_frame(stream: u32, payload: &[u8]) -> Vec<u8> {
        let frame = Frame::new(FrameType::Data(Default::default()), StreamId(stream))
            .with_len(payload.len() as u32);
        frame_bytes(frame, payload)
    }

    #[test]
    fn preface_then_frame_byte_at_a_time() {
        let mut d = Deframer::new(true);
        let mut wire = PREFACE.to_vec();
        wire.extend_from_slice(&data_frame(1, b"hello"));

        let mut out = VecDeque::new();
        for b in wire {
            d.feed(&[b], &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
        let f = out.pop_front().unwrap();
        assert_eq!(f.frame.stream_id, StreamId(1));
        assert_eq!(&f.payload[..], b"hello");
        assert!(!f.skipped);
    }

    #[test]
    fn bad_preface_detected_early() {
        let mut d = Deframer::new(true);
        let mut out = VecDeque::new();
        let err = d.feed(b"GET / HTTP/1.1\r\n", &mut out).unwrap_err();
        assert!(matches!(err, ConnectionError::BadPreface));
    }

    #[test]
    fn oversized_frame_rejected_at_header() {
        let mut d = Deframer::new(false);
        let frame =
            Frame::new(FrameType::Data(Default::default()), StreamId(1)).with_len(1 << 20);
        let mut out = VecDeque::new();
        let err = d.feed(&frame_bytes(frame, &[]), &mut out).unwrap_err();
        assert!(matches!(err, ConnectionError::FrameTooLarge { .. }));
    }

    #[test]
    fn unknown_frame_type_skipped_not_buffered() {
        let mut d = Deframer::new(false);
        let mut wire = vec![
            0x00, 0x00, 0x03, // len 3
            0xfa, 0x00, // type 0xfa, flags 0
            0x00, 0x00, 0x00, 0x00, // stream 0
            0xaa, 0xbb, 0xcc,
        ];
        wire.extend_from_slice(&data_frame(1, b"x"));

        let mut out = VecDeque::new();
        d.feed(&wire, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].skipped);
        assert!(out[0].payload.is_empty());
        assert_eq!(&out[1].payload[..], b"x");
    }

    #[test]
    fn reset_stream_payloads_are_discarded() {
        let mut d = Deframer::new(false);
        d.skip_stream(StreamId(1));

        let mut out = VecDeque::new();
        d.feed(&data_frame(1, b"stale"), &mut out).unwrap();
        d.feed(&data_frame(3, b"live"), &mut out).unwrap();

        assert!(out[0].skipped);
        assert!(!out[1].skipped);
        assert_eq!(&out[1].payload[..], b"live");

        d.unskip_stream(StreamId(1));
        d.feed(&data_frame(1, b"fresh"), &mut out).unwrap();
        assert!(!out[2].skipped);
    }

    #[test]
    fn padding_is_stripped() {
        let payload = {
            let mut p = vec![2u8]; // pad length
            p.extend_from_slice(b"body");
            p.extend_from_slice(&[0, 0]);
            p
        };
        let frame = Frame::new(
            FrameType::Data(DataFlags::Padded.into()),
            StreamId(1),
        )
        .with_len(payload.len() as u32);

        let mut d = Deframer::new(false);
        let mut out = VecDeque::new();
        d.feed(&frame_bytes(frame, &payload), &mut out).unwrap();
        assert_eq!(&out[0].payload[..], b"body");
    }

    #[test]
    fn overlong_padding_is_a_connection_error() {
        let frame = Frame::new(
            FrameType::Data(DataFlags::Padded.into()),
            StreamId(1),
        )
        .with_len(1);
        let mut d = Deframer::new(false);
        let mut out = VecDeque::new();
        let err = d.feed(&frame_bytes(frame, &[9]), &mut out).unwrap_err();
        assert!(matches!(err, ConnectionError::PaddedFrameEmpty { .. }));
    }

    #[test]
    fn zero_length_frame_completes_without_payload_bytes() {
        let frame = Frame::new(
            FrameType::Data(DataFlags::EndStream.into()),
            StreamId(1),
        );
        let mut d = Deframer::new(false);
        let mut out = VecDeque::new();
        d.feed(&frame_bytes(frame, &[]), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].frame.is_end_stream());
    }
}
