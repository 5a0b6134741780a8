//! Error taxonomy for the connection engine.
//!
//! [ConnectionError] is fatal to the whole connection: once raised, the
//! transport sends a final GOAWAY carrying the mapped error code and every
//! live stream is failed. [StreamError] is scoped to one stream: the
//! transport sends RST_STREAM and the rest of the connection keeps going.

use weft_h2::{FrameType, KnownErrorCode, SettingsError, StreamId};

use crate::headers::HeaderBlockError;

/// Fatal connection-level errors. Mapped onto a GOAWAY error code via
/// [ConnectionError::as_known_error_code].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("the peer sent an invalid connection preface")]
    BadPreface,

    #[error("frame size {frame_size} exceeds max frame size {max_frame_size}")]
    FrameTooLarge { frame_size: u32, max_frame_size: u32 },

    #[error("{frame_type:?} frame payload has an invalid length")]
    MalformedFrame { frame_type: FrameType },

    #[error("{frame_type:?} frame is padded but the padding fields don't fit")]
    PaddedFrameTooShort { frame_type: FrameType },

    #[error("padding length exceeds {frame_type:?} frame payload")]
    PaddedFrameEmpty { frame_type: FrameType },

    #[error("expected CONTINUATION for stream {stream_id}, received {frame_type:?}")]
    ExpectedContinuationFrame {
        stream_id: StreamId,
        frame_type: FrameType,
    },

    #[error("expected CONTINUATION for stream {stream_id}, received one for stream {continuation_stream_id}")]
    ExpectedContinuationForStream {
        stream_id: StreamId,
        continuation_stream_id: StreamId,
    },

    #[error("received CONTINUATION for stream {stream_id} without a preceding HEADERS")]
    UnexpectedContinuationFrame { stream_id: StreamId },

    #[error("received {frame_type:?} frame with stream ID 0")]
    StreamSpecificFrameToConnection { frame_type: FrameType },

    #[error("received SETTINGS with a non-zero stream ID")]
    SettingsWithNonZeroStreamId { stream_id: StreamId },

    #[error("received SETTINGS with invalid length {len}")]
    SettingsInvalidLength { len: u32 },

    #[error("received unexpected SETTINGS ack")]
    UnexpectedSettingsAck,

    #[error("bad setting value: {0}")]
    BadSettingValue(#[from] SettingsError),

    #[error("received PING with a non-zero stream ID")]
    PingFrameWithNonZeroStreamId { stream_id: StreamId },

    #[error("received PING of length {len}, expected 8")]
    PingFrameInvalidLength { len: u32 },

    #[error("too many pings without data from the peer ({strikes} strikes)")]
    PingFlood { strikes: u32 },

    #[error("received GOAWAY with a non-zero stream ID")]
    GoAwayWithNonZeroStreamId { stream_id: StreamId },

    #[error("received WINDOW_UPDATE of length {len}, expected 4")]
    WindowUpdateInvalidLength { len: u32 },

    #[error("received WINDOW_UPDATE with a zero increment")]
    WindowUpdateZeroIncrement,

    #[error("connection send window overflowed past 2^31-1")]
    WindowUpdateOverflow,

    #[error("peer violated the connection flow-control window: sent {debit} bytes with {available} available")]
    FlowControlViolation { debit: u32, available: i64 },

    #[error("received {frame_type:?} for closed stream {stream_id}")]
    StreamClosed {
        frame_type: FrameType,
        stream_id: StreamId,
    },

    #[error("peer initiated stream {stream_id} with the wrong parity")]
    StreamIdParity { stream_id: StreamId },

    #[error("peer initiated stream {stream_id}, not above last stream {last_stream_id}")]
    StreamIdNotIncreasing {
        stream_id: StreamId,
        last_stream_id: StreamId,
    },

    #[error("received PUSH_PROMISE (server push is disabled)")]
    PushPromiseNotSupported,

    #[error("HEADERS priority declares stream {stream_id} dependent on itself")]
    HeadersInvalidPriority { stream_id: StreamId },

    #[error("error decoding header block: {0}")]
    BadHeaderBlock(#[from] HeaderBlockError),

    #[error("keepalive ping timed out")]
    KeepaliveTimeout,

    #[error("connection is shutting down")]
    GoingAway,

    #[error("endpoint closed: {message}")]
    EndpointClosed { message: String },
}

impl ConnectionError {
    /// The GOAWAY error code sent to the peer when this error tears the
    /// connection down.
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use ConnectionError as E;
        use KnownErrorCode as C;

        match self {
            E::BadPreface
            | E::ExpectedContinuationFrame { .. }
            | E::ExpectedContinuationForStream { .. }
            | E::UnexpectedContinuationFrame { .. }
            | E::StreamSpecificFrameToConnection { .. }
            | E::SettingsWithNonZeroStreamId { .. }
            | E::UnexpectedSettingsAck
            | E::PingFrameWithNonZeroStreamId { .. }
            | E::GoAwayWithNonZeroStreamId { .. }
            | E::WindowUpdateZeroIncrement
            | E::StreamClosed { .. }
            | E::StreamIdParity { .. }
            | E::StreamIdNotIncreasing { .. }
            | E::PushPromiseNotSupported
            | E::HeadersInvalidPriority { .. } => C::ProtocolError,

            E::FrameTooLarge { .. }
            | E::MalformedFrame { .. }
            | E::PaddedFrameTooShort { .. }
            | E::PaddedFrameEmpty { .. }
            | E::SettingsInvalidLength { .. }
            | E::PingFrameInvalidLength { .. }
            | E::WindowUpdateInvalidLength { .. } => C::FrameSizeError,

            E::BadSettingValue(e) => match e {
                SettingsError::InitialWindowSizeTooLarge { .. } => C::FlowControlError,
                _ => C::ProtocolError,
            },

            E::WindowUpdateOverflow | E::FlowControlViolation { .. } => C::FlowControlError,

            E::PingFlood { .. } => C::EnhanceYourCalm,

            E::BadHeaderBlock(_) => C::CompressionError,

            E::KeepaliveTimeout | E::GoingAway | E::EndpointClosed { .. } => C::NoError,
        }
    }
}

/// Errors scoped to a single stream. The transport answers with RST_STREAM
/// carrying [StreamError::as_known_error_code] and the stream is torn down;
/// other streams and the connection are unaffected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("peer violated the stream flow-control window: sent {debit} bytes with {available} available")]
    FlowControlViolation { debit: u32, available: i64 },

    #[error("stream send window overflowed past 2^31-1")]
    WindowUpdateOverflow,

    #[error("received PRIORITY of length {len}, expected 5")]
    InvalidPriorityLength { len: u32 },

    #[error("received WINDOW_UPDATE with a zero increment")]
    ZeroWindowIncrement,

    #[error("received trailers without END_STREAM")]
    TrailersNotEndStream,

    #[error("received a frame after the peer half-closed the stream")]
    ReceivedFrameAfterEndStream,

    #[error("stream reset by peer with code {code:?}")]
    ResetByPeer { code: weft_h2::ErrorCode },

    #[error("stream cancelled locally")]
    Cancelled,

    #[error("stream refused: over the concurrent stream limit")]
    Refused,

    #[error("stream deadline exceeded")]
    DeadlineExceeded,

    #[error("connection is going away")]
    GoingAway {
        #[source]
        cause: Option<Box<ConnectionError>>,
    },
}

impl StreamError {
    /// The RST_STREAM error code sent to the peer for this error.
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use KnownErrorCode as C;
        use StreamError as E;

        match self {
            E::FlowControlViolation { .. } | E::WindowUpdateOverflow => C::FlowControlError,
            E::InvalidPriorityLength { .. } => C::FrameSizeError,
            E::TrailersNotEndStream | E::ReceivedFrameAfterEndStream | E::ZeroWindowIncrement => {
                C::ProtocolError
            }
            E::ResetByPeer { .. } | E::Cancelled | E::DeadlineExceeded => C::Cancel,
            E::Refused | E::GoingAway { .. } => C::RefusedStream,
        }
    }
}

/// Umbrella error returned by transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("stream {stream_id} error: {error}")]
    Stream {
        stream_id: StreamId,
        #[source]
        error: StreamError,
    },

    #[error("stream {stream_id} is unknown or already closed")]
    UnknownStream { stream_id: StreamId },
}
