//! Per-stream state and the stream registry.
//!
//! Streams live in a slab arena and are addressed by handle. List
//! membership (which write-scheduling queue a stream sits in) is a bitset
//! on the stream itself, so pushing a stream onto a list it is already in
//! is a cheap no-op and popping always clears the bit first.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use slab::Slab;
use smallvec::SmallVec;
use weft_h2::StreamId;

use crate::flow::{ReceiveWindow, SendWindow};

/// Handle into the stream arena. Never exposed outside the crate; the
/// public surface speaks [StreamId].
pub(crate) type StreamHandle = usize;

/// Write-scheduling lists a stream can be a member of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum StreamList {
    /// Has frames to write and believes it can make progress.
    Writable = 0,
    /// Picked up by the current write round.
    Writing = 1,
    /// Blocked on the connection-level send window.
    StalledByTransport = 2,
    /// Blocked on its own send window.
    StalledByStream = 3,
    /// Waiting for the peer's concurrent-stream limit to open up.
    WaitingForConcurrency = 4,
}

pub(crate) const STREAM_LIST_COUNT: usize = 5;

const LISTS: [StreamList; STREAM_LIST_COUNT] = [
    StreamList::Writable,
    StreamList::Writing,
    StreamList::StalledByTransport,
    StreamList::StalledByStream,
    StreamList::WaitingForConcurrency,
];

/// One metadata field, name and value.
pub type MetadataField = (Bytes, Bytes);

/// A frame queued on a stream, waiting for the write engine.
#[derive(Debug)]
pub(crate) enum QueuedFrame {
    /// A header block, initial or trailing metadata.
    Headers { block: Bytes, end_stream: bool },
    /// One message payload. DATA framing is decided at write time.
    Data { payload: Bytes, end_stream: bool },
}

pub(crate) struct Stream {
    pub id: StreamId,
    pub send_window: SendWindow,
    pub recv_window: ReceiveWindow,

    /// Peer sent END_STREAM; no more frames expected inbound.
    pub read_closed: bool,
    /// We queued END_STREAM (or RST); no more frames may be queued.
    pub write_closed: bool,
    /// Initial metadata has been flushed, so this stream counts against
    /// the peer's concurrent-stream limit.
    pub started: bool,
    /// Initial metadata from the peer has been surfaced.
    pub peer_metadata_seen: bool,
    /// Trailing metadata delivered; late reads return nothing.
    pub trailers_seen: bool,

    /// The close event for this stream has been surfaced already.
    pub closed_event_sent: bool,

    pub outgoing: VecDeque<QueuedFrame>,
    pub incoming: VecDeque<Bytes>,

    pub deadline: Option<Instant>,

    list_bits: u8,
}

impl Stream {
    pub(crate) fn new(id: StreamId, send_initial: u32, recv_initial: u32) -> Self {
        Self {
            id,
            send_window: SendWindow::new(send_initial),
            recv_window: ReceiveWindow::new(recv_initial),
            read_closed: false,
            write_closed: false,
            started: false,
            peer_metadata_seen: false,
            trailers_seen: false,
            closed_event_sent: false,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            deadline: None,
            list_bits: 0,
        }
    }

    pub(crate) fn in_list(&self, list: StreamList) -> bool {
        self.list_bits & (1 << list as u8) != 0
    }

    pub(crate) fn has_queued_frames(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Both directions closed; nothing further will happen on the wire.
    pub(crate) fn fully_closed(&self) -> bool {
        self.read_closed && self.write_closed && self.outgoing.is_empty()
    }
}

pub(crate) struct StreamRegistry {
    slab: Slab<Stream>,
    by_id: HashMap<StreamId, StreamHandle>,
    lists: [VecDeque<StreamHandle>; STREAM_LIST_COUNT],
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slab: Slab::new(),
            by_id: HashMap::new(),
            lists: Default::default(),
        }
    }

    pub(crate) fn insert(&mut self, stream: Stream) -> StreamHandle {
        let id = stream.id;
        let handle = self.slab.insert(stream);
        self.by_id.insert(id, handle);
        handle
    }

    /// Remove a stream from the arena and from every list it is on.
    pub(crate) fn remove(&mut self, handle: StreamHandle) -> Option<Stream> {
        if !self.slab.contains(handle) {
            return None;
        }
        for list in LISTS {
            if self.slab[handle].in_list(list) {
                self.lists[list as usize].retain(|&h| h != handle);
                self.slab[handle].list_bits &= !(1 << list as u8);
            }
        }
        let stream = self.slab.remove(handle);
        self.by_id.remove(&stream.id);
        Some(stream)
    }

    pub(crate) fn get(&self, handle: StreamHandle) -> Option<&Stream> {
        self.slab.get(handle)
    }

    pub(crate) fn get_mut(&mut self, handle: StreamHandle) -> Option<&mut Stream> {
        self.slab.get_mut(handle)
    }

    pub(crate) fn handle_of(&self, id: StreamId) -> Option<StreamHandle> {
        self.by_id.get(&id).copied()
    }

    pub(crate) fn by_id_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        let handle = self.handle_of(id)?;
        self.slab.get_mut(handle)
    }

    pub(crate) fn count(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn handles(&self) -> SmallVec<[StreamHandle; 8]> {
        self.slab.iter().map(|(h, _)| h).collect()
    }

    /// Push onto a list unless the stream is already a member. Returns
    /// whether the stream was actually enqueued.
    pub(crate) fn push_list(&mut self, handle: StreamHandle, list: StreamList) -> bool {
        let Some(stream) = self.slab.get_mut(handle) else {
            return false;
        };
        if stream.in_list(list) {
            return false;
        }
        stream.list_bits |= 1 << list as u8;
        self.lists[list as usize].push_back(handle);
        true
    }

    /// Pop the head of a list, clearing its membership bit.
    pub(crate) fn pop_list(&mut self, list: StreamList) -> Option<StreamHandle> {
        let handle = self.lists[list as usize].pop_front()?;
        // Handles in lists are purged on removal, so this entry is live.
        self.slab[handle].list_bits &= !(1 << list as u8);
        Some(handle)
    }

    pub(crate) fn list_len(&self, list: StreamList) -> usize {
        self.lists[list as usize].len()
    }
}
