//! The connection engine.
//!
//! [Transport] is a synchronous state machine: bytes in through
//! [Transport::recv_bytes], write rounds out through
//! [Transport::begin_write] / [Transport::end_write] (in `write.rs`), and
//! everything the application needs to react to surfaces as a
//! [TransportEvent]. All methods expect to be called from a single task;
//! the actor in `driver.rs` provides that serialization over real sockets.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};
use weft_h2::enumflags2::BitFlags;
use weft_h2::{
    ContinuationFlags, DataFlags, ErrorCode, Frame, FrameType, GoAway, HeadersFlags,
    KnownErrorCode, Ping, PingFlags, PrioritySpec, RstStream, Settings, SettingsFlags, StreamId,
    WindowUpdate,
};

use crate::deframer::{DeframedFrame, Deframer};
use crate::error::{ConnectionError, StreamError, TransportError};
use crate::flow::{FlowControlAction, ReceiveWindow, SendWindow, DEFAULT_WINDOW};
use crate::headers;
use crate::lifecycle::{GoawayState, Keepalive, KeepaliveAction, KeepaliveConfig, KeepaliveState};
use crate::ping::{PingAck, PingCallback, PingPolicy, PingQueue, PingRecvState};
use crate::settings::{SettingsSet, SettingsSets};
use crate::stream::{MetadataField, QueuedFrame, Stream, StreamHandle, StreamList, StreamRegistry};

/// Which side of the connection this transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Where the write engine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// No write round in progress.
    Idle,
    /// A round's bytes are with the endpoint.
    Writing,
    /// A round is in flight and more work arrived since it started.
    WritingWithMore,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Settings announced to the peer.
    pub settings: Settings,
    /// Soft cap on the bytes assembled per write round.
    pub write_buffer_size: usize,
    pub keepalive: KeepaliveConfig,
    pub ping_policy: PingPolicy,
    /// Pause reading once this many induced frames (acks, pongs) are
    /// queued and unflushed.
    pub max_pending_induced_frames: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            write_buffer_size: 64 * 1024,
            keepalive: KeepaliveConfig::default(),
            ping_policy: PingPolicy::default(),
            max_pending_induced_frames: 10_000,
        }
    }
}

/// Something the application must react to.
#[derive(Debug)]
pub enum TransportEvent {
    /// First header block on a stream.
    InitialMetadata {
        stream_id: StreamId,
        fields: Vec<MetadataField>,
        end_stream: bool,
    },
    /// A message arrived; fetch it with [Transport::take_message].
    MessageReady { stream_id: StreamId },
    /// Trailing header block; the peer is done with the stream.
    TrailingMetadata {
        stream_id: StreamId,
        fields: Vec<MetadataField>,
    },
    /// The stream is gone. `error` is `None` for a clean close.
    StreamClosed {
        stream_id: StreamId,
        error: Option<StreamError>,
    },
    /// The peer announced shutdown.
    GoAwayReceived {
        error_code: ErrorCode,
        last_stream_id: StreamId,
        debug_data: Bytes,
    },
    /// The connection is dead.
    ConnectionClosed { error: ConnectionError },
}

/// Frames the peer's traffic obliges us to send.
pub(crate) enum InducedFrame {
    SettingsAck,
    Pong(u64),
}

/// A header block being reassembled across CONTINUATION frames.
struct HeaderAccumulator {
    stream_id: StreamId,
    end_stream: bool,
    fragments: Vec<Bytes>,
}

pub struct Transport {
    pub(crate) role: Role,
    pub(crate) cfg: TransportConfig,

    pub(crate) deframer: Deframer,
    deframe_queue: VecDeque<DeframedFrame>,
    pub(crate) settings: SettingsSets,
    pub(crate) streams: StreamRegistry,

    /// Connection-level windows.
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: ReceiveWindow,

    pub(crate) write_state: WriteState,
    pub(crate) want_write: bool,
    /// Client preface still owed to the peer.
    pub(crate) preface_pending: bool,
    /// The byte cap truncated the last round.
    pub(crate) last_round_partial: bool,

    next_stream_id: u32,
    last_peer_stream_id: StreamId,
    /// Started streams we initiated, counted against the peer's
    /// concurrent-stream limit.
    self_active: usize,
    /// Active streams the peer initiated, counted against ours.
    peer_active: usize,

    pub(crate) goaway_state: GoawayState,
    pub(crate) goaway_queue: VecDeque<GoAway>,
    goaway_received: Option<(ErrorCode, StreamId)>,

    pub(crate) ping: PingQueue,
    ping_recv: PingRecvState,
    pub(crate) keepalive: Keepalive,
    /// Keepalive pings sent since data last flowed out.
    pub(crate) pings_since_data: u32,
    /// Data or headers written since the peer's last ping.
    pub(crate) sent_data_since_ping: bool,

    pub(crate) induced: VecDeque<InducedFrame>,
    /// RST_STREAM frames owed for streams that no longer exist.
    pub(crate) control_rsts: VecDeque<(StreamId, KnownErrorCode)>,

    pending_headers: Option<HeaderAccumulator>,
    /// A discarded header block with EndStream is still open: the stream
    /// unskips once its closing CONTINUATION arrives.
    skipped_trailers: Option<StreamId>,
    /// Messages still buffered when their stream finished cleanly. They
    /// stay fetchable by [Transport::take_message] after the close event.
    undelivered: HashMap<StreamId, VecDeque<Bytes>>,
    events: VecDeque<TransportEvent>,
    closed: Option<ConnectionError>,
}

impl Transport {
    pub fn new(role: Role, cfg: TransportConfig) -> Self {
        let local = cfg.settings;
        Self {
            role,
            deframer: Deframer::new(role == Role::Server),
            deframe_queue: VecDeque::new(),
            settings: SettingsSets::new(local),
            streams: StreamRegistry::new(),
            send_window: SendWindow::new(DEFAULT_WINDOW),
            recv_window: ReceiveWindow::with_available(
                local.initial_window_size.max(DEFAULT_WINDOW),
                DEFAULT_WINDOW,
            ),
            write_state: WriteState::Idle,
            want_write: true,
            preface_pending: role == Role::Client,
            last_round_partial: false,
            next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            last_peer_stream_id: StreamId(0),
            self_active: 0,
            peer_active: 0,
            goaway_state: GoawayState::None,
            goaway_queue: VecDeque::new(),
            goaway_received: None,
            ping: PingQueue::new(),
            ping_recv: PingRecvState::new(),
            keepalive: Keepalive::new(cfg.keepalive.clone()),
            pings_since_data: 0,
            sent_data_since_ping: false,
            induced: VecDeque::new(),
            control_rsts: VecDeque::new(),
            pending_headers: None,
            skipped_trailers: None,
            undelivered: HashMap::new(),
            events: VecDeque::new(),
            closed: None,
            cfg,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub fn goaway_state(&self) -> GoawayState {
        self.goaway_state
    }

    pub fn keepalive_state(&self) -> KeepaliveState {
        self.keepalive.state()
    }

    pub fn keepalive_interval(&self) -> Option<std::time::Duration> {
        self.keepalive.interval()
    }

    pub fn keepalive_timeout(&self) -> std::time::Duration {
        self.keepalive.timeout()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// A copy of one of the four tracked settings sets.
    pub fn settings(&self, set: SettingsSet) -> Settings {
        *self.settings.get(set)
    }

    /// Change the local settings. The diff goes out with the next write
    /// round (or the one after the outstanding ack arrives) and takes
    /// effect once the peer acknowledges it.
    pub fn update_settings(&mut self, f: impl FnOnce(&mut Settings)) {
        self.settings.update_local(f);
        self.initiate_write();
    }

    pub fn active_streams(&self) -> usize {
        self.streams.count()
    }

    /// The driver should stop reading until a write round drains the
    /// induced-frame backlog.
    pub fn reading_paused(&self) -> bool {
        self.induced.len() > self.cfg.max_pending_induced_frames
    }

    /// A write round should be scheduled.
    pub fn wants_write(&self) -> bool {
        self.want_write && self.write_state == WriteState::Idle
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn event(&mut self, ev: TransportEvent) {
        self.events.push_back(ev);
    }

    pub(crate) fn initiate_write(&mut self) {
        match self.write_state {
            WriteState::Idle => self.want_write = true,
            WriteState::Writing => self.write_state = WriteState::WritingWithMore,
            WriteState::WritingWithMore => {}
        }
    }

    // ---- inbound ----

    /// Feed bytes read from the endpoint. On error the connection is
    /// already torn down: a final GOAWAY is queued and every stream has
    /// been failed.
    pub fn recv_bytes(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if let Some(err) = &self.closed {
            return Err(err.clone());
        }
        let mut queue = std::mem::take(&mut self.deframe_queue);
        let res = self.deframer.feed(data, &mut queue);
        if let Err(err) = res {
            self.close_with(err.clone());
            return Err(err);
        }
        while let Some(df) = queue.pop_front() {
            if let Err(err) = self.process_frame(df) {
                self.close_with(err.clone());
                return Err(err);
            }
        }
        self.deframe_queue = queue;
        Ok(())
    }

    fn process_frame(&mut self, df: DeframedFrame) -> Result<(), ConnectionError> {
        let frame = df.frame;
        trace!(?frame, skipped = df.skipped, "processing frame");

        // A started header block owns the connection until END_HEADERS.
        if let Some(acc) = &self.pending_headers {
            if !matches!(frame.frame_type, FrameType::Continuation(_)) {
                return Err(ConnectionError::ExpectedContinuationFrame {
                    stream_id: acc.stream_id,
                    frame_type: frame.frame_type,
                });
            }
        }

        match frame.frame_type {
            FrameType::Data(flags) => self.on_data(frame, df, flags),
            FrameType::Headers(flags) => self.on_headers(frame, df, flags),
            FrameType::Priority => self.on_priority(frame, &df.payload),
            FrameType::RstStream => self.on_rst_stream(frame, &df.payload),
            FrameType::Settings(flags) => {
                self.on_settings(frame, &df.payload, flags.contains(SettingsFlags::Ack))
            }
            FrameType::PushPromise => Err(ConnectionError::PushPromiseNotSupported),
            FrameType::Ping(flags) => {
                self.on_ping(frame, &df.payload, flags.contains(PingFlags::Ack))
            }
            FrameType::GoAway => self.on_goaway(frame, &df.payload),
            FrameType::WindowUpdate => self.on_window_update(frame, &df.payload),
            FrameType::Continuation(flags) => self.on_continuation(frame, df, flags),
            FrameType::Unknown(_) => Ok(()),
        }
    }

    fn on_data(
        &mut self,
        frame: Frame,
        df: DeframedFrame,
        flags: BitFlags<DataFlags>,
    ) -> Result<(), ConnectionError> {
        if frame.stream_id == StreamId::CONNECTION {
            return Err(ConnectionError::StreamSpecificFrameToConnection {
                frame_type: frame.frame_type,
            });
        }

        // The whole payload, padding included, counts against the
        // connection window even for streams we no longer care about.
        match self.recv_window.data_received(frame.len) {
            Ok(action) => self.apply_transport_flow_action(action),
            Err(e) => {
                return Err(ConnectionError::FlowControlViolation {
                    debit: e.debit,
                    available: e.available,
                })
            }
        }

        let end_stream = flags.contains(DataFlags::EndStream);
        if df.skipped {
            if end_stream {
                self.deframer.unskip_stream(frame.stream_id);
            }
            return Ok(());
        }

        let Some(handle) = self.streams.handle_of(frame.stream_id) else {
            return Err(ConnectionError::StreamClosed {
                frame_type: frame.frame_type,
                stream_id: frame.stream_id,
            });
        };

        let mut urgent = false;
        {
            let Some(stream) = self.streams.get_mut(handle) else {
                return Ok(());
            };
            if stream.read_closed {
                self.reset_stream(handle, StreamError::ReceivedFrameAfterEndStream);
                return Ok(());
            }
            match stream.recv_window.data_received(frame.len) {
                Ok(FlowControlAction::UpdateImmediately(_)) => urgent = true,
                Ok(_) => {}
                Err(e) => {
                    let err = StreamError::FlowControlViolation {
                        debit: e.debit,
                        available: e.available,
                    };
                    self.reset_stream(handle, err);
                    return Ok(());
                }
            }
            if !df.payload.is_empty() {
                stream.incoming.push_back(df.payload);
            }
            if end_stream {
                stream.read_closed = true;
            }
        }

        if urgent {
            self.initiate_write();
        }
        if self
            .streams
            .get(handle)
            .is_some_and(|s| !s.incoming.is_empty())
        {
            self.event(TransportEvent::MessageReady {
                stream_id: frame.stream_id,
            });
        }
        if end_stream {
            self.maybe_finish_stream(handle);
        }
        Ok(())
    }

    fn on_headers(
        &mut self,
        frame: Frame,
        df: DeframedFrame,
        flags: BitFlags<HeadersFlags>,
    ) -> Result<(), ConnectionError> {
        if frame.stream_id == StreamId::CONNECTION {
            return Err(ConnectionError::StreamSpecificFrameToConnection {
                frame_type: frame.frame_type,
            });
        }
        if df.skipped {
            if flags.contains(HeadersFlags::EndStream) {
                if flags.contains(HeadersFlags::EndHeaders) {
                    self.deframer.unskip_stream(frame.stream_id);
                } else {
                    self.skipped_trailers = Some(frame.stream_id);
                }
            }
            return Ok(());
        }

        let mut payload = df.payload;
        if flags.contains(HeadersFlags::Priority) {
            let (rest, spec) = PrioritySpec::parse(&payload[..]).map_err(|_| {
                ConnectionError::MalformedFrame {
                    frame_type: frame.frame_type,
                }
            })?;
            if spec.stream_dependency == frame.stream_id {
                return Err(ConnectionError::HeadersInvalidPriority {
                    stream_id: frame.stream_id,
                });
            }
            let consumed = payload.len() - rest.len();
            payload = payload.slice(consumed..);
        }

        self.pending_headers = Some(HeaderAccumulator {
            stream_id: frame.stream_id,
            end_stream: flags.contains(HeadersFlags::EndStream),
            fragments: vec![payload],
        });
        if flags.contains(HeadersFlags::EndHeaders) {
            self.finish_header_block()?;
        }
        Ok(())
    }

    fn on_continuation(
        &mut self,
        frame: Frame,
        df: DeframedFrame,
        flags: BitFlags<ContinuationFlags>,
    ) -> Result<(), ConnectionError> {
        if df.skipped {
            if flags.contains(ContinuationFlags::EndHeaders)
                && self.skipped_trailers == Some(frame.stream_id)
            {
                self.skipped_trailers = None;
                self.deframer.unskip_stream(frame.stream_id);
            }
            return Ok(());
        }
        let Some(acc) = &mut self.pending_headers else {
            return Err(ConnectionError::UnexpectedContinuationFrame {
                stream_id: frame.stream_id,
            });
        };
        if acc.stream_id != frame.stream_id {
            return Err(ConnectionError::ExpectedContinuationForStream {
                stream_id: acc.stream_id,
                continuation_stream_id: frame.stream_id,
            });
        }
        acc.fragments.push(df.payload);
        if flags.contains(ContinuationFlags::EndHeaders) {
            self.finish_header_block()?;
        }
        Ok(())
    }

    fn finish_header_block(&mut self) -> Result<(), ConnectionError> {
        let Some(acc) = self.pending_headers.take() else {
            return Ok(());
        };
        let block: Vec<u8> = acc.fragments.iter().flat_map(|f| f.iter().copied()).collect();
        let fields = headers::decode_block(&block)?;
        let stream_id = acc.stream_id;

        if let Some(handle) = self.streams.handle_of(stream_id) {
            let Some(stream) = self.streams.get_mut(handle) else {
                return Ok(());
            };
            if stream.read_closed {
                self.reset_stream(handle, StreamError::ReceivedFrameAfterEndStream);
                return Ok(());
            }
            if !stream.peer_metadata_seen {
                stream.peer_metadata_seen = true;
                if acc.end_stream {
                    stream.read_closed = true;
                }
                self.event(TransportEvent::InitialMetadata {
                    stream_id,
                    fields,
                    end_stream: acc.end_stream,
                });
            } else {
                // Trailing metadata must also close the stream.
                if !acc.end_stream {
                    self.reset_stream(handle, StreamError::TrailersNotEndStream);
                    return Ok(());
                }
                stream.read_closed = true;
                stream.trailers_seen = true;
                self.event(TransportEvent::TrailingMetadata { stream_id, fields });
            }
            if acc.end_stream {
                self.maybe_finish_stream(handle);
            }
            Ok(())
        } else {
            self.accept_peer_stream(stream_id, fields, acc.end_stream)
        }
    }

    fn accept_peer_stream(
        &mut self,
        stream_id: StreamId,
        fields: Vec<MetadataField>,
        end_stream: bool,
    ) -> Result<(), ConnectionError> {
        if self.is_self_initiated(stream_id) {
            // HEADERS for one of our streams that no longer exists.
            return Err(ConnectionError::StreamClosed {
                frame_type: FrameType::Headers(Default::default()),
                stream_id,
            });
        }
        if self.role == Role::Client {
            // Servers only ever open streams via push, which is disabled.
            return Err(ConnectionError::StreamIdParity { stream_id });
        }
        if stream_id <= self.last_peer_stream_id {
            return Err(ConnectionError::StreamIdNotIncreasing {
                stream_id,
                last_stream_id: self.last_peer_stream_id,
            });
        }
        self.last_peer_stream_id = stream_id;

        if self.goaway_state != GoawayState::None {
            debug!(%stream_id, "refusing stream while going away");
            self.refuse_stream(stream_id);
            return Ok(());
        }
        let limit = self.settings.local().max_concurrent_streams;
        if limit.is_some_and(|l| self.peer_active >= l as usize) {
            debug!(%stream_id, "refusing stream over concurrency limit");
            self.refuse_stream(stream_id);
            return Ok(());
        }

        let mut stream = Stream::new(
            stream_id,
            self.settings.peer().initial_window_size,
            self.settings.get(SettingsSet::Sent).initial_window_size,
        );
        stream.started = true;
        stream.peer_metadata_seen = true;
        stream.read_closed = end_stream;
        let handle = self.streams.insert(stream);
        self.peer_active += 1;
        self.event(TransportEvent::InitialMetadata {
            stream_id,
            fields,
            end_stream,
        });
        if end_stream {
            self.maybe_finish_stream(handle);
        }
        Ok(())
    }

    fn on_priority(&mut self, frame: Frame, payload: &[u8]) -> Result<(), ConnectionError> {
        if frame.stream_id == StreamId::CONNECTION {
            return Err(ConnectionError::StreamSpecificFrameToConnection {
                frame_type: frame.frame_type,
            });
        }
        if frame.len != 5 {
            if let Some(handle) = self.streams.handle_of(frame.stream_id) {
                self.reset_stream(handle, StreamError::InvalidPriorityLength { len: frame.len });
            }
            return Ok(());
        }
        let (_, spec) = PrioritySpec::parse(payload).map_err(|_| {
            ConnectionError::MalformedFrame {
                frame_type: frame.frame_type,
            }
        })?;
        if spec.stream_dependency == frame.stream_id {
            return Err(ConnectionError::HeadersInvalidPriority {
                stream_id: frame.stream_id,
            });
        }
        // Priority is advisory and this transport does not reorder on it.
        trace!(stream_id = %frame.stream_id, "ignoring PRIORITY");
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: Frame, payload: &[u8]) -> Result<(), ConnectionError> {
        if frame.stream_id == StreamId::CONNECTION {
            return Err(ConnectionError::StreamSpecificFrameToConnection {
                frame_type: frame.frame_type,
            });
        }
        if frame.len != 4 {
            return Err(ConnectionError::MalformedFrame {
                frame_type: frame.frame_type,
            });
        }
        let (_, rst) = RstStream::parse(payload).map_err(|_| ConnectionError::MalformedFrame {
            frame_type: frame.frame_type,
        })?;

        match self.streams.handle_of(frame.stream_id) {
            Some(handle) => {
                self.close_stream(
                    handle,
                    Some(StreamError::ResetByPeer {
                        code: rst.error_code,
                    }),
                );
            }
            None => {
                // Late reset for a stream we already forgot about.
                debug!(stream_id = %frame.stream_id, code = ?rst.error_code, "RST_STREAM for unknown stream");
                self.deframer.unskip_stream(frame.stream_id);
            }
        }
        Ok(())
    }

    fn on_settings(
        &mut self,
        frame: Frame,
        payload: &[u8],
        ack: bool,
    ) -> Result<(), ConnectionError> {
        if frame.stream_id != StreamId::CONNECTION {
            return Err(ConnectionError::SettingsWithNonZeroStreamId {
                stream_id: frame.stream_id,
            });
        }
        if ack {
            if frame.len != 0 {
                return Err(ConnectionError::SettingsInvalidLength { len: frame.len });
            }
            let acked = self.settings.ack_received()?;
            self.deframer.set_max_frame_size(acked.max_frame_size);
            for handle in self.streams.handles() {
                if let Some(stream) = self.streams.get_mut(handle) {
                    stream.recv_window.resize(acked.initial_window_size);
                }
            }
            return Ok(());
        }

        if frame.len % 6 != 0 {
            return Err(ConnectionError::SettingsInvalidLength { len: frame.len });
        }
        let update = self.settings.apply_peer(payload)?;
        if update.initial_window_delta != 0 {
            for handle in self.streams.handles() {
                let Some(stream) = self.streams.get_mut(handle) else {
                    continue;
                };
                if stream.send_window.adjust(update.initial_window_delta).is_err() {
                    return Err(ConnectionError::WindowUpdateOverflow);
                }
            }
            if update.initial_window_delta > 0 {
                self.unstall(StreamList::StalledByStream);
            }
        }
        self.induced.push_back(InducedFrame::SettingsAck);
        self.initiate_write();
        Ok(())
    }

    fn on_ping(&mut self, frame: Frame, payload: &[u8], ack: bool) -> Result<(), ConnectionError> {
        if frame.stream_id != StreamId::CONNECTION {
            return Err(ConnectionError::PingFrameWithNonZeroStreamId {
                stream_id: frame.stream_id,
            });
        }
        if frame.len != 8 {
            return Err(ConnectionError::PingFrameInvalidLength { len: frame.len });
        }
        let (_, ping) = Ping::parse(payload).map_err(|_| ConnectionError::PingFrameInvalidLength {
            len: frame.len,
        })?;

        if ack {
            match self.ping.ack(ping.opaque) {
                PingAck::Completed { more } => {
                    if more {
                        self.initiate_write();
                    }
                }
                PingAck::Unknown => {
                    debug!(opaque = ping.opaque, "ignoring unmatched ping ack");
                }
            }
            self.keepalive.ping_acked();
            return Ok(());
        }

        let sent_data = std::mem::take(&mut self.sent_data_since_ping);
        self.ping_recv
            .on_ping(Instant::now(), &self.cfg.ping_policy, sent_data)
            .map_err(|abuse| ConnectionError::PingFlood {
                strikes: abuse.strikes,
            })?;
        self.induced.push_back(InducedFrame::Pong(ping.opaque));
        self.initiate_write();
        Ok(())
    }

    fn on_goaway(&mut self, frame: Frame, payload: &[u8]) -> Result<(), ConnectionError> {
        if frame.stream_id != StreamId::CONNECTION {
            return Err(ConnectionError::GoAwayWithNonZeroStreamId {
                stream_id: frame.stream_id,
            });
        }
        let (_, goaway) = GoAway::parse(payload).map_err(|_| ConnectionError::MalformedFrame {
            frame_type: frame.frame_type,
        })?;
        debug!(
            last_stream_id = %goaway.last_stream_id,
            error_code = ?goaway.error_code,
            "received GOAWAY"
        );
        self.goaway_received = Some((goaway.error_code, goaway.last_stream_id));
        self.event(TransportEvent::GoAwayReceived {
            error_code: goaway.error_code,
            last_stream_id: goaway.last_stream_id,
            debug_data: Bytes::from(goaway.additional_debug_data.clone()),
        });

        // Streams we initiated above the cutoff were never processed.
        for handle in self.streams.handles() {
            let Some(stream) = self.streams.get(handle) else {
                continue;
            };
            if self.is_self_initiated(stream.id) && stream.id > goaway.last_stream_id {
                self.close_stream(handle, Some(StreamError::GoingAway { cause: None }));
            }
        }
        Ok(())
    }

    fn on_window_update(&mut self, frame: Frame, payload: &[u8]) -> Result<(), ConnectionError> {
        if frame.len != 4 {
            return Err(ConnectionError::WindowUpdateInvalidLength { len: frame.len });
        }
        let (_, update) =
            WindowUpdate::parse(payload).map_err(|_| ConnectionError::WindowUpdateInvalidLength {
                len: frame.len,
            })?;

        if frame.stream_id == StreamId::CONNECTION {
            if update.increment == 0 {
                return Err(ConnectionError::WindowUpdateZeroIncrement);
            }
            self.send_window
                .window_update(update.increment)
                .map_err(|_| ConnectionError::WindowUpdateOverflow)?;
            self.unstall(StreamList::StalledByTransport);
            return Ok(());
        }

        let Some(handle) = self.streams.handle_of(frame.stream_id) else {
            // Updates for closed streams race their close; ignore.
            trace!(stream_id = %frame.stream_id, "WINDOW_UPDATE for unknown stream");
            return Ok(());
        };
        if update.increment == 0 {
            self.reset_stream(handle, StreamError::ZeroWindowIncrement);
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(handle) else {
            return Ok(());
        };
        if stream.send_window.window_update(update.increment).is_err() {
            self.reset_stream(handle, StreamError::WindowUpdateOverflow);
            return Ok(());
        }
        if stream.has_queued_frames() {
            self.streams.push_list(handle, StreamList::Writable);
            self.initiate_write();
        }
        Ok(())
    }

    // ---- operations ----

    /// Open a new locally initiated stream. The stream may wait for the
    /// peer's concurrency limit before its frames go out.
    pub fn open_stream(&mut self) -> Result<StreamId, TransportError> {
        if let Some(err) = &self.closed {
            return Err(TransportError::Connection(err.clone()));
        }
        if !self.goaway_state.allows_new_streams() || self.goaway_received.is_some() {
            return Err(TransportError::Connection(ConnectionError::GoingAway));
        }

        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 2;
        let stream = Stream::new(
            id,
            self.settings.peer().initial_window_size,
            self.settings.get(SettingsSet::Sent).initial_window_size,
        );
        let handle = self.streams.insert(stream);

        let limit = self.settings.peer().max_concurrent_streams;
        if !limit.is_some_and(|l| self.self_active >= l as usize) {
            self.start_stream(handle);
        } else {
            debug!(stream_id = %id, "stream waiting for concurrency");
            self.streams.push_list(handle, StreamList::WaitingForConcurrency);
        }
        Ok(id)
    }

    pub fn send_initial_metadata(
        &mut self,
        id: StreamId,
        fields: &[MetadataField],
    ) -> Result<(), TransportError> {
        self.queue_headers(id, fields, false)
    }

    /// Queue a message. `end_stream` half-closes the local side, which is
    /// how clients finish a call.
    pub fn send_message(
        &mut self,
        id: StreamId,
        payload: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        let handle = self.writable_stream(id)?;
        let Some(stream) = self.streams.get_mut(handle) else {
            return Err(TransportError::UnknownStream { stream_id: id });
        };
        stream.outgoing.push_back(QueuedFrame::Data {
            payload,
            end_stream,
        });
        if end_stream {
            stream.write_closed = true;
        }
        self.schedule_stream(handle);
        Ok(())
    }

    /// Queue trailing metadata, ending the local side of the stream.
    pub fn send_trailing_metadata(
        &mut self,
        id: StreamId,
        fields: &[MetadataField],
    ) -> Result<(), TransportError> {
        self.queue_headers(id, fields, true)
    }

    fn queue_headers(
        &mut self,
        id: StreamId,
        fields: &[MetadataField],
        end_stream: bool,
    ) -> Result<(), TransportError> {
        let handle = self.writable_stream(id)?;
        let mut block = Vec::new();
        headers::encode_block(fields, &mut block);
        let Some(stream) = self.streams.get_mut(handle) else {
            return Err(TransportError::UnknownStream { stream_id: id });
        };
        stream.outgoing.push_back(QueuedFrame::Headers {
            block: Bytes::from(block),
            end_stream,
        });
        if end_stream {
            stream.write_closed = true;
        }
        self.schedule_stream(handle);
        Ok(())
    }

    fn writable_stream(&mut self, id: StreamId) -> Result<StreamHandle, TransportError> {
        if let Some(err) = &self.closed {
            return Err(TransportError::Connection(err.clone()));
        }
        let Some(handle) = self.streams.handle_of(id) else {
            return Err(TransportError::UnknownStream { stream_id: id });
        };
        let Some(stream) = self.streams.get(handle) else {
            return Err(TransportError::UnknownStream { stream_id: id });
        };
        if stream.write_closed {
            return Err(TransportError::Stream {
                stream_id: id,
                error: StreamError::Cancelled,
            });
        }
        Ok(handle)
    }

    /// Cancel a stream: queued frames are dropped and RST_STREAM goes out.
    pub fn cancel(&mut self, id: StreamId, code: KnownErrorCode) {
        let Some(handle) = self.streams.handle_of(id) else {
            return;
        };
        if let Some(stream) = self.streams.get_mut(handle) {
            stream.outgoing.clear();
        }
        self.emit_close_event(handle, Some(StreamError::Cancelled));
        self.remove_stream(handle);
        self.control_rsts.push_back((id, code));
        self.deframer.skip_stream(id);
        self.initiate_write();
    }

    /// Pop the next received message on a stream. Messages announced
    /// before a clean close stay fetchable after it; an errored stream
    /// drops them.
    pub fn take_message(&mut self, id: StreamId) -> Option<Bytes> {
        if let Some(stream) = self.streams.by_id_mut(id) {
            return stream.incoming.pop_front();
        }
        let queue = self.undelivered.get_mut(&id)?;
        let msg = queue.pop_front();
        if queue.is_empty() {
            self.undelivered.remove(&id);
        }
        msg
    }

    pub fn set_deadline(&mut self, id: StreamId, deadline: Instant) {
        if let Some(stream) = self.streams.by_id_mut(id) {
            stream.deadline = Some(deadline);
        }
    }

    /// Earliest stream deadline, for the driver's timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.streams
            .handles()
            .into_iter()
            .filter_map(|h| self.streams.get(h)?.deadline)
            .min()
    }

    /// Reset every stream whose deadline has passed.
    pub fn expire_deadlines(&mut self, now: Instant) {
        for handle in self.streams.handles() {
            let expired = self
                .streams
                .get(handle)
                .and_then(|s| s.deadline)
                .is_some_and(|d| d <= now);
            if expired {
                self.reset_stream(handle, StreamError::DeadlineExceeded);
            }
        }
    }

    /// Request a ping; the callback fires when the ack arrives or the
    /// connection dies.
    pub fn ping(&mut self, cb: PingCallback) {
        if let Some(err) = &self.closed {
            cb(Err(TransportError::Connection(err.clone())));
            return;
        }
        self.ping.request(cb);
        self.initiate_write();
    }

    /// Begin shutdown. Graceful shutdown stops new streams and lets the
    /// existing ones drain; otherwise a final GOAWAY goes out and every
    /// stream is failed.
    pub fn shutdown(&mut self, graceful: bool) {
        if graceful {
            if self.goaway_state == GoawayState::None {
                self.goaway_queue.push_back(GoAway {
                    last_stream_id: self.last_peer_stream_id,
                    error_code: KnownErrorCode::NoError.into(),
                    additional_debug_data: Vec::new(),
                });
                self.goaway_state = GoawayState::GracefulSent;
                self.initiate_write();
                self.maybe_finish_goaway();
            }
        } else {
            self.close_with(ConnectionError::GoingAway);
        }
    }

    /// The keepalive timer fired.
    pub fn keepalive_timer_fired(&mut self) {
        let has_streams = self.streams.count() > 0;
        match self.keepalive.timer_fired(has_streams) {
            KeepaliveAction::SendPing => {
                if self.pings_since_data >= self.cfg.ping_policy.max_pings_without_data {
                    debug!("keepalive ping throttled, no data since last pings");
                    self.keepalive.ping_acked();
                    return;
                }
                self.pings_since_data += 1;
                self.ping.request_empty();
                self.initiate_write();
            }
            KeepaliveAction::Rearm => {}
        }
    }

    /// The keepalive watchdog fired without an ack.
    pub fn keepalive_watchdog_fired(&mut self) {
        if self.keepalive.watchdog_fired() {
            self.close_with(ConnectionError::KeepaliveTimeout);
        }
    }

    // ---- internals ----

    pub(crate) fn is_self_initiated(&self, id: StreamId) -> bool {
        match self.role {
            Role::Client => id.is_client_initiated(),
            Role::Server => id.is_server_initiated(),
        }
    }

    fn apply_transport_flow_action(&mut self, action: FlowControlAction) {
        if matches!(action, FlowControlAction::UpdateImmediately(_)) {
            self.initiate_write();
        }
    }

    fn start_stream(&mut self, handle: StreamHandle) {
        if let Some(stream) = self.streams.get_mut(handle) {
            stream.started = true;
            self.self_active += 1;
            if self.streams.get(handle).is_some_and(Stream::has_queued_frames) {
                self.streams.push_list(handle, StreamList::Writable);
                self.initiate_write();
            }
        }
    }

    fn schedule_stream(&mut self, handle: StreamHandle) {
        let Some(stream) = self.streams.get(handle) else {
            return;
        };
        if stream.started && stream.has_queued_frames() {
            self.streams.push_list(handle, StreamList::Writable);
            self.initiate_write();
        }
    }

    /// Move everything off a stall list back to writable after new
    /// window credit arrived.
    pub(crate) fn unstall(&mut self, list: StreamList) {
        let mut moved = false;
        while let Some(handle) = self.streams.pop_list(list) {
            if self.streams.get(handle).is_some_and(Stream::has_queued_frames) {
                self.streams.push_list(handle, StreamList::Writable);
                moved = true;
            }
        }
        if moved {
            self.initiate_write();
        }
    }

    pub(crate) fn promote_waiting(&mut self) {
        let limit = self.settings.peer().max_concurrent_streams;
        loop {
            if limit.is_some_and(|l| self.self_active >= l as usize) {
                return;
            }
            let Some(handle) = self.streams.pop_list(StreamList::WaitingForConcurrency) else {
                return;
            };
            trace!("promoting stream waiting for concurrency");
            self.start_stream(handle);
        }
    }

    fn emit_close_event(&mut self, handle: StreamHandle, error: Option<StreamError>) {
        let Some(stream) = self.streams.get_mut(handle) else {
            return;
        };
        if stream.closed_event_sent {
            return;
        }
        stream.closed_event_sent = true;
        let stream_id = stream.id;
        self.event(TransportEvent::StreamClosed { stream_id, error });
    }

    /// Remove a stream, updating concurrency accounting.
    fn remove_stream(&mut self, handle: StreamHandle) {
        let Some(stream) = self.streams.remove(handle) else {
            return;
        };
        if self.is_self_initiated(stream.id) {
            if stream.started {
                self.self_active = self.self_active.saturating_sub(1);
                self.promote_waiting();
            }
        } else {
            self.peer_active = self.peer_active.saturating_sub(1);
        }
        self.maybe_finish_goaway();
    }

    /// A graceful shutdown completes once the last stream drains.
    fn maybe_finish_goaway(&mut self) {
        if self.goaway_state == GoawayState::GracefulSent && self.streams.count() == 0 {
            self.close_with(ConnectionError::GoingAway);
        }
    }

    /// Close a stream without sending anything (peer reset it, GOAWAY
    /// cut it off, or it completed).
    pub(crate) fn close_stream(&mut self, handle: StreamHandle, error: Option<StreamError>) {
        let clean = error.is_none();
        self.emit_close_event(handle, error);
        if let Some(stream) = self.streams.get_mut(handle) {
            // Messages announced but not yet fetched survive a clean
            // close; an errored stream drops them.
            if clean && !stream.incoming.is_empty() {
                let stash = std::mem::take(&mut stream.incoming);
                self.undelivered.insert(stream.id, stash);
            }
            self.deframer.unskip_stream(stream.id);
        }
        self.remove_stream(handle);
    }

    /// Fail a stream locally and send RST_STREAM with the mapped code.
    pub(crate) fn reset_stream(&mut self, handle: StreamHandle, error: StreamError) {
        let Some(stream) = self.streams.get(handle) else {
            return;
        };
        let id = stream.id;
        let code = error.as_known_error_code();
        debug!(stream_id = %id, %error, "resetting stream");
        self.emit_close_event(handle, Some(error));
        self.remove_stream(handle);
        self.control_rsts.push_back((id, code));
        self.deframer.skip_stream(id);
        self.initiate_write();
    }

    /// Send RST_STREAM for a stream that was never created.
    fn refuse_stream(&mut self, id: StreamId) {
        self.control_rsts.push_back((id, KnownErrorCode::RefusedStream));
        self.deframer.skip_stream(id);
        self.initiate_write();
    }

    /// A stream with both sides closed and nothing left to flush is done.
    pub(crate) fn maybe_finish_stream(&mut self, handle: StreamHandle) {
        if self.streams.get(handle).is_some_and(Stream::fully_closed) {
            self.close_stream(handle, None);
        }
    }

    /// Tear the whole connection down: final GOAWAY out, all streams and
    /// pings failed.
    pub(crate) fn close_with(&mut self, error: ConnectionError) {
        if self.closed.is_some() {
            return;
        }
        debug!(%error, "closing connection");
        self.closed = Some(error.clone());

        if self.goaway_state < GoawayState::FinalScheduled {
            self.goaway_queue.push_back(GoAway {
                last_stream_id: self.last_peer_stream_id,
                error_code: error.as_known_error_code().into(),
                additional_debug_data: error.to_string().into_bytes(),
            });
            self.goaway_state = GoawayState::FinalScheduled;
        }

        for handle in self.streams.handles() {
            self.emit_close_event(
                handle,
                Some(StreamError::GoingAway {
                    cause: Some(Box::new(error.clone())),
                }),
            );
            self.remove_stream(handle);
        }
        self.ping
            .fail_all(&TransportError::Connection(error.clone()));
        self.keepalive.disable();
        self.event(TransportEvent::ConnectionClosed { error });
        self.initiate_write();
    }
}
