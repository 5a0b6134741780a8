//! The write engine.
//!
//! A write round assembles one buffer: control frames first (SETTINGS,
//! acks and pongs, outbound pings, resets, window updates, GOAWAY), then
//! stream frames round-robin off the writable list. Flow-control windows
//! are debited as frames are assembled; a round that hits the byte cap
//! reports itself partial and the leftovers ride the next round.

use tracing::trace;
use weft_h2::enumflags2::BitFlags;
use weft_h2::{
    ContinuationFlags, DataFlags, Frame, FrameType, HeadersFlags, Ping, RstStream, SettingPairs,
    SettingsFlags, StreamId, WindowUpdate, PREFACE,
};

use crate::error::ConnectionError;
use crate::lifecycle::GoawayState;
use crate::stream::{QueuedFrame, Stream, StreamHandle, StreamList};
use crate::transport::{InducedFrame, Transport, WriteState};

/// One assembled write round.
pub struct WriteRound {
    pub buf: Vec<u8>,
    /// The byte cap cut this round short; more stream data is waiting.
    pub partial: bool,
}

enum DrainResult {
    /// Everything queued on the stream went out.
    Drained,
    /// The stream still has frames but a window is empty.
    Stalled(StreamList),
    /// The round's byte budget ran out mid-stream.
    OutOfBudget,
}

fn infallible(res: std::io::Result<()>) {
    if res.is_err() {
        unreachable!("writing to a Vec cannot fail");
    }
}

fn put_frame(buf: &mut Vec<u8>, frame: Frame, payload: &[u8]) {
    infallible(frame.write_into(&mut *buf));
    buf.extend_from_slice(payload);
}

/// HEADERS plus CONTINUATIONs for one block. Header blocks are not flow
/// controlled and must stay contiguous on the wire, so the whole block is
/// always written in one go.
fn put_header_block(
    buf: &mut Vec<u8>,
    stream_id: StreamId,
    block: &[u8],
    end_stream: bool,
    max_frame: usize,
) {
    let mut chunks: Vec<&[u8]> = block.chunks(max_frame).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let frame = if i == 0 {
            let mut flags = BitFlags::<HeadersFlags>::empty();
            if end_stream {
                flags |= HeadersFlags::EndStream;
            }
            if last == 0 {
                flags |= HeadersFlags::EndHeaders;
            }
            Frame::new(FrameType::Headers(flags), stream_id)
        } else {
            let mut flags = BitFlags::<ContinuationFlags>::empty();
            if i == last {
                flags |= ContinuationFlags::EndHeaders;
            }
            Frame::new(FrameType::Continuation(flags), stream_id)
        }
        .with_len(chunk.len() as u32);
        put_frame(buf, frame, chunk);
    }
}

impl Transport {
    /// Assemble the next write round. `None` means there is nothing to
    /// write, or a round is already in flight (in which case the engine
    /// remembers that more work arrived).
    pub fn begin_write(&mut self) -> Option<WriteRound> {
        if self.write_state != WriteState::Idle {
            self.write_state = WriteState::WritingWithMore;
            return None;
        }

        let mut buf = Vec::new();

        if self.preface_pending {
            self.preface_pending = false;
            buf.extend_from_slice(PREFACE);
        }

        if let Some(pairs) = self.settings.frame_to_send() {
            let mut payload = Vec::new();
            infallible(SettingPairs(&pairs).write_into(&mut payload));
            let frame = Frame::new(
                FrameType::Settings(BitFlags::empty()),
                StreamId::CONNECTION,
            )
            .with_len(payload.len() as u32);
            put_frame(&mut buf, frame, &payload);
        }

        while let Some(induced) = self.induced.pop_front() {
            match induced {
                InducedFrame::SettingsAck => {
                    let frame = Frame::new(
                        FrameType::Settings(SettingsFlags::Ack.into()),
                        StreamId::CONNECTION,
                    );
                    put_frame(&mut buf, frame, &[]);
                }
                InducedFrame::Pong(opaque) => {
                    self.put_ping(&mut buf, opaque, true);
                }
            }
        }

        if let Some(opaque) = self.ping.promote() {
            self.put_ping(&mut buf, opaque, false);
        }

        while let Some((stream_id, code)) = self.control_rsts.pop_front() {
            let frame = Frame::new(FrameType::RstStream, stream_id).with_len(4);
            infallible(frame.write_into(&mut buf));
            infallible(
                RstStream {
                    error_code: code.into(),
                }
                .write_into(&mut buf),
            );
        }

        self.put_window_updates(&mut buf);

        let mut final_goaway = false;
        while let Some(goaway) = self.goaway_queue.pop_front() {
            trace!(last_stream_id = %goaway.last_stream_id, "writing GOAWAY");
            let frame = Frame::new(FrameType::GoAway, StreamId::CONNECTION)
                .with_len(goaway.wire_len() as u32);
            infallible(frame.write_into(&mut buf));
            infallible(goaway.write_into(&mut buf));
        }
        if self.goaway_state == GoawayState::FinalScheduled {
            self.goaway_state = GoawayState::FinalSent;
            final_goaway = true;
        }

        let mut partial = false;
        if !final_goaway {
            self.promote_waiting();
            partial = self.put_stream_frames(&mut buf);
        }

        self.want_write = false;
        if buf.is_empty() {
            return None;
        }
        self.write_state = WriteState::Writing;
        self.last_round_partial = partial;
        Some(WriteRound { buf, partial })
    }

    /// The endpoint finished (or failed) the round's write. Returns
    /// whether another round should be scheduled right away.
    pub fn end_write(&mut self, result: std::io::Result<()>) -> bool {
        if let Err(e) = result {
            self.close_with(ConnectionError::EndpointClosed {
                message: e.to_string(),
            });
        }

        // Streams deferred by the byte cap go back on the writable list,
        // behind anything that became writable during the round.
        let mut deferred = false;
        while let Some(handle) = self.streams.pop_list(StreamList::Writing) {
            if self.streams.get(handle).is_some_and(Stream::has_queued_frames) {
                self.streams.push_list(handle, StreamList::Writable);
                deferred = true;
            }
        }

        let had_more = self.write_state == WriteState::WritingWithMore;
        self.write_state = WriteState::Idle;
        if had_more || deferred || self.last_round_partial {
            self.want_write = true;
        }
        self.last_round_partial = false;
        self.wants_write()
    }

    fn put_ping(&mut self, buf: &mut Vec<u8>, opaque: u64, ack: bool) {
        let flags = if ack {
            weft_h2::PingFlags::Ack.into()
        } else {
            BitFlags::empty()
        };
        let frame = Frame::new(FrameType::Ping(flags), StreamId::CONNECTION).with_len(8);
        infallible(frame.write_into(&mut *buf));
        infallible(Ping { opaque }.write_into(&mut *buf));
    }

    /// Flush pending flow-control credit, connection first then streams.
    fn put_window_updates(&mut self, buf: &mut Vec<u8>) {
        let credit = self.recv_window.pending_credit();
        if credit > 0 {
            put_window_update(buf, StreamId::CONNECTION, credit);
            self.recv_window.update_sent(credit);
        }
        for handle in self.streams.handles() {
            let Some(stream) = self.streams.get_mut(handle) else {
                continue;
            };
            if stream.read_closed {
                continue;
            }
            let credit = stream.recv_window.pending_credit();
            if credit > 0 {
                put_window_update(buf, stream.id, credit);
                stream.recv_window.update_sent(credit);
            }
        }
    }

    /// One round-robin pass over the writable list. Every stream that was
    /// writable when the round started gets a turn before any is
    /// revisited.
    fn put_stream_frames(&mut self, buf: &mut Vec<u8>) -> bool {
        let mut partial = false;
        let turns = self.streams.list_len(StreamList::Writable);
        for _ in 0..turns {
            let Some(handle) = self.streams.pop_list(StreamList::Writable) else {
                break;
            };
            match self.drain_one_stream(handle, buf) {
                DrainResult::Drained => self.maybe_finish_stream(handle),
                DrainResult::Stalled(list) => {
                    self.streams.push_list(handle, list);
                }
                DrainResult::OutOfBudget => {
                    self.streams.push_list(handle, StreamList::Writing);
                    partial = true;
                }
            }
        }
        partial
    }

    fn drain_one_stream(&mut self, handle: StreamHandle, buf: &mut Vec<u8>) -> DrainResult {
        let cap = self.cfg.write_buffer_size;
        let max_frame = self.settings.peer().max_frame_size as usize;
        // The cap is soft: every stream that gets a turn writes at least
        // one frame, so a single large stream cannot starve the rest.
        let mut wrote_any = false;

        loop {
            if wrote_any && buf.len() >= cap {
                let more = self.streams.get(handle).is_some_and(Stream::has_queued_frames);
                return if more {
                    DrainResult::OutOfBudget
                } else {
                    DrainResult::Drained
                };
            }
            let Some(stream) = self.streams.get_mut(handle) else {
                return DrainResult::Drained;
            };
            let Some(queued) = stream.outgoing.pop_front() else {
                return DrainResult::Drained;
            };
            wrote_any = true;

            match queued {
                QueuedFrame::Headers { block, end_stream } => {
                    put_header_block(buf, stream.id, &block, end_stream, max_frame);
                    self.sent_data_since_ping = true;
                    self.pings_since_data = 0;
                }
                QueuedFrame::Data { payload, end_stream } => {
                    if payload.is_empty() {
                        // Bare half-close.
                        let flags = if end_stream {
                            DataFlags::EndStream.into()
                        } else {
                            BitFlags::empty()
                        };
                        put_frame(buf, Frame::new(FrameType::Data(flags), stream.id), &[]);
                        self.sent_data_since_ping = true;
                        continue;
                    }

                    let stream_cap = stream.send_window.capacity() as usize;
                    let conn_cap = self.send_window.capacity() as usize;
                    let budget = stream_cap.min(conn_cap).min(max_frame);
                    if budget == 0 {
                        stream
                            .outgoing
                            .push_front(QueuedFrame::Data { payload, end_stream });
                        return if conn_cap == 0 {
                            DrainResult::Stalled(StreamList::StalledByTransport)
                        } else {
                            DrainResult::Stalled(StreamList::StalledByStream)
                        };
                    }

                    let chunk = budget.min(payload.len());
                    let end_here = end_stream && chunk == payload.len();
                    let flags = if end_here {
                        DataFlags::EndStream.into()
                    } else {
                        BitFlags::empty()
                    };
                    let frame =
                        Frame::new(FrameType::Data(flags), stream.id).with_len(chunk as u32);
                    put_frame(buf, frame, &payload[..chunk]);
                    stream.send_window.data_sent(chunk as u32);
                    self.send_window.data_sent(chunk as u32);
                    self.sent_data_since_ping = true;
                    self.pings_since_data = 0;

                    if chunk < payload.len() {
                        let Some(stream) = self.streams.get_mut(handle) else {
                            return DrainResult::Drained;
                        };
                        stream.outgoing.push_front(QueuedFrame::Data {
                            payload: payload.slice(chunk..),
                            end_stream,
                        });
                    }
                }
            }
        }
    }
}

fn put_window_update(buf: &mut Vec<u8>, stream_id: StreamId, increment: u32) {
    let frame = Frame::new(FrameType::WindowUpdate, stream_id).with_len(4);
    infallible(frame.write_into(&mut *buf));
    infallible(
        WindowUpdate {
            reserved: 0,
            increment,
        }
        .write_into(&mut *buf),
    );
}
