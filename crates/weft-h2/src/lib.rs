//! HTTP/2 wire grammar for the weft transport.
//!
//! Frame headers, typed flags, settings, error codes and the payload
//! codecs for control frames, cf. <https://httpwg.org/specs/rfc9113.html>.
//! Parsing is nom-based and streaming: callers feed byte slices and get
//! `Incomplete` back until enough bytes are available.

use std::{fmt, ops::RangeInclusive};

use byteorder::{BigEndian, WriteBytesExt};
use enum_repr::EnumRepr;

pub use enumflags2;
use enumflags2::{bitflags, BitFlags};

pub use nom;

use nom::{
    combinator::map,
    number::streaming::{be_u24, be_u32, be_u8},
    sequence::tuple,
    IResult,
};

/// Sent by clients at connection establishment, before any frame.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of a frame header on the wire: 24-bit length, type, flags,
/// reserved bit + 31-bit stream id.
pub const FRAME_HEADER_LEN: usize = 9;

/// See <https://httpwg.org/specs/rfc9113.html#FrameTypes>
#[EnumRepr(type = "u8")]
#[derive(Debug, Clone, Copy)]
pub enum RawFrameType {
    Data = 0x00,
    Headers = 0x01,
    Priority = 0x02,
    RstStream = 0x03,
    Settings = 0x04,
    PushPromise = 0x05,
    Ping = 0x06,
    GoAway = 0x07,
    WindowUpdate = 0x08,
    Continuation = 0x09,
}

/// A frame type together with its typed flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data(BitFlags<DataFlags>),
    Headers(BitFlags<HeadersFlags>),
    Priority,
    RstStream,
    Settings(BitFlags<SettingsFlags>),
    PushPromise,
    Ping(BitFlags<PingFlags>),
    GoAway,
    WindowUpdate,
    Continuation(BitFlags<ContinuationFlags>),
    Unknown(EncodedFrameType),
}

/// See <https://httpwg.org/specs/rfc9113.html#DATA>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataFlags {
    Padded = 0x08,
    EndStream = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#rfc.section.6.2>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeadersFlags {
    Priority = 0x20,
    Padded = 0x08,
    EndHeaders = 0x04,
    EndStream = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#SETTINGS>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SettingsFlags {
    Ack = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#PING>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PingFlags {
    Ack = 0x01,
}

/// See <https://httpwg.org/specs/rfc9113.html#CONTINUATION>
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContinuationFlags {
    EndHeaders = 0x04,
}

/// Raw (type, flags) pair as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrameType {
    pub ty: u8,
    pub flags: u8,
}

impl EncodedFrameType {
    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (ty, flags)) = tuple((be_u8, be_u8))(i)?;
        Ok((i, Self { ty, flags }))
    }
}

impl From<(RawFrameType, u8)> for EncodedFrameType {
    fn from((ty, flags): (RawFrameType, u8)) -> Self {
        Self {
            ty: ty.repr(),
            flags,
        }
    }
}

impl FrameType {
    pub(crate) fn encode(self) -> EncodedFrameType {
        match self {
            FrameType::Data(f) => (RawFrameType::Data, f.bits()).into(),
            FrameType::Headers(f) => (RawFrameType::Headers, f.bits()).into(),
            FrameType::Priority => (RawFrameType::Priority, 0).into(),
            FrameType::RstStream => (RawFrameType::RstStream, 0).into(),
            FrameType::Settings(f) => (RawFrameType::Settings, f.bits()).into(),
            FrameType::PushPromise => (RawFrameType::PushPromise, 0).into(),
            FrameType::Ping(f) => (RawFrameType::Ping, f.bits()).into(),
            FrameType::GoAway => (RawFrameType::GoAway, 0).into(),
            FrameType::WindowUpdate => (RawFrameType::WindowUpdate, 0).into(),
            FrameType::Continuation(f) => (RawFrameType::Continuation, f.bits()).into(),
            FrameType::Unknown(ft) => ft,
        }
    }

    fn decode(ft: EncodedFrameType) -> Self {
        match RawFrameType::from_repr(ft.ty) {
            Some(ty) => match ty {
                RawFrameType::Data => {
                    FrameType::Data(BitFlags::<DataFlags>::from_bits_truncate(ft.flags))
                }
                RawFrameType::Headers => {
                    FrameType::Headers(BitFlags::<HeadersFlags>::from_bits_truncate(ft.flags))
                }
                RawFrameType::Priority => FrameType::Priority,
                RawFrameType::RstStream => FrameType::RstStream,
                RawFrameType::Settings => {
                    FrameType::Settings(BitFlags::<SettingsFlags>::from_bits_truncate(ft.flags))
                }
                RawFrameType::PushPromise => FrameType::PushPromise,
                RawFrameType::Ping => {
                    FrameType::Ping(BitFlags::<PingFlags>::from_bits_truncate(ft.flags))
                }
                RawFrameType::GoAway => FrameType::GoAway,
                RawFrameType::WindowUpdate => FrameType::WindowUpdate,
                RawFrameType::Continuation => FrameType::Continuation(
                    BitFlags::<ContinuationFlags>::from_bits_truncate(ft.flags),
                ),
            },
            None => FrameType::Unknown(ft),
        }
    }
}

/// A 31-bit stream identifier. Stream 0 is the connection itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Stream ID used for connection control frames
    pub const CONNECTION: Self = Self(0);

    /// Server-initiated streams have even IDs
    pub fn is_server_initiated(&self) -> bool {
        self.0 % 2 == 0
    }

    /// Client-initiated streams have odd IDs
    pub fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct StreamIdOutOfRange(pub u32);

impl TryFrom<u32> for StreamId {
    type Error = StreamIdOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value & 0x8000_0000 != 0 {
            Err(StreamIdOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// See <https://httpwg.org/specs/rfc9113.html#FrameHeader>
#[derive(Clone, Copy)]
pub struct Frame {
    pub frame_type: FrameType,
    pub reserved: u8,
    pub stream_id: StreamId,
    pub len: u32,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream_id.0 == 0 {
            write!(f, "Conn:")?;
        } else {
            write!(f, "#{}:", self.stream_id.0)?;
        }

        let name = match &self.frame_type {
            FrameType::Data(_) => "Data",
            FrameType::Headers(_) => "Headers",
            FrameType::Priority => "Priority",
            FrameType::RstStream => "RstStream",
            FrameType::Settings(_) => "Settings",
            FrameType::PushPromise => "PushPromise",
            FrameType::Ping(_) => "Ping",
            FrameType::GoAway => "GoAway",
            FrameType::WindowUpdate => "WindowUpdate",
            FrameType::Continuation(_) => "Continuation",
            FrameType::Unknown(EncodedFrameType { ty, flags }) => {
                return write!(f, "UnknownFrame({:#x}, {:#x}, len={})", ty, flags, self.len)
            }
        };
        let mut s = f.debug_struct(name);

        if self.reserved != 0 {
            s.field("reserved", &self.reserved);
        }
        if self.len > 0 {
            s.field("len", &self.len);
        }

        struct DisplayDebug<'a, D: fmt::Display>(&'a D);
        impl<'a, D: fmt::Display> fmt::Debug for DisplayDebug<'a, D> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self.0, f)
            }
        }

        match &self.frame_type {
            FrameType::Data(flags) => {
                if !flags.is_empty() {
                    s.field("flags", &DisplayDebug(flags));
                }
            }
            FrameType::Headers(flags) => {
                if !flags.is_empty() {
                    s.field("flags", &DisplayDebug(flags));
                }
            }
            FrameType::Settings(flags) => {
                if !flags.is_empty() {
                    s.field("flags", &DisplayDebug(flags));
                }
            }
            FrameType::Ping(flags) => {
                if !flags.is_empty() {
                    s.field("flags", &DisplayDebug(flags));
                }
            }
            FrameType::Continuation(flags) => {
                if !flags.is_empty() {
                    s.field("flags", &DisplayDebug(flags));
                }
            }
            _ => {}
        }

        s.finish()
    }
}

impl Frame {
    /// Create a new frame with the given type and stream ID.
    pub fn new(frame_type: FrameType, stream_id: StreamId) -> Self {
        Self {
            frame_type,
            reserved: 0,
            stream_id,
            len: 0,
        }
    }

    /// Set the frame's length.
    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Decode a complete 9-byte frame header. Unknown frame types come
    /// back as [FrameType::Unknown].
    pub fn parse_header(buf: [u8; FRAME_HEADER_LEN]) -> Self {
        let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let ft = EncodedFrameType {
            ty: buf[3],
            flags: buf[4],
        };
        let stream_word = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        Self {
            len,
            frame_type: FrameType::decode(ft),
            reserved: (stream_word >> 31) as u8,
            stream_id: StreamId(stream_word & 0x7FFF_FFFF),
        }
    }

    /// Parse a frame header from the given slice.
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (len, frame_type, (reserved, stream_id))) = tuple((
            be_u24,
            EncodedFrameType::parse,
            parse_reserved_and_stream_id,
        ))(i)?;

        let frame = Frame {
            frame_type: FrameType::decode(frame_type),
            reserved,
            stream_id,
            len,
        };
        Ok((i, frame))
    }

    /// Serialize the 9-byte frame header.
    pub fn write_into(self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_u24::<BigEndian>(self.len as _)?;
        let ft = self.frame_type.encode();
        w.write_u8(ft.ty)?;
        w.write_u8(ft.flags)?;
        w.write_all(&pack_reserved_and_stream_id(self.reserved, self.stream_id))?;

        Ok(())
    }

    /// Returns true if this frame has `EndHeaders` set
    pub fn is_end_headers(&self) -> bool {
        match self.frame_type {
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndHeaders),
            FrameType::Continuation(flags) => flags.contains(ContinuationFlags::EndHeaders),
            _ => false,
        }
    }

    /// Returns true if this frame has `EndStream` set
    pub fn is_end_stream(&self) -> bool {
        match self.frame_type {
            FrameType::Data(flags) => flags.contains(DataFlags::EndStream),
            FrameType::Headers(flags) => flags.contains(HeadersFlags::EndStream),
            _ => false,
        }
    }
}

/// The first bit is reserved, the rest is a 31-bit stream id (or window
/// increment, which shares the encoding).
pub fn parse_bit_and_u31(i: &[u8]) -> IResult<&[u8], (u8, u32)> {
    let (i, x) = be_u32(i)?;

    let bit = (x >> 31) as u8;
    let val = x & 0x7FFF_FFFF;

    Ok((i, (bit, val)))
}

fn parse_reserved_and_stream_id(i: &[u8]) -> IResult<&[u8], (u8, StreamId)> {
    parse_bit_and_u31(i).map(|(i, (reserved, stream_id))| (i, (reserved, StreamId(stream_id))))
}

/// Pack a bit and a u31 into a 4-byte array (big-endian)
pub fn pack_bit_and_u31(bit: u8, val: u32) -> [u8; 4] {
    assert_eq!(val & 0x7FFF_FFFF, val, "val is too large: {val:x}");
    assert_eq!(bit & 0x1, bit, "bit should be 0 or 1: {bit:x}");

    let mut bytes = val.to_be_bytes();
    if bit != 0 {
        bytes[0] |= 0x80;
    }

    bytes
}

pub fn pack_reserved_and_stream_id(reserved: u8, stream_id: StreamId) -> [u8; 4] {
    pack_bit_and_u31(reserved, stream_id.0)
}

// cf. https://httpwg.org/specs/rfc9113.html#HEADERS
#[derive(Debug)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub stream_dependency: StreamId,
    // 0-255 => 1-256
    pub weight: u8,
}

impl PrioritySpec {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        map(
            tuple((parse_reserved_and_stream_id, be_u8)),
            |((exclusive, stream_dependency), weight)| Self {
                exclusive: exclusive != 0,
                stream_dependency,
                weight,
            },
        )(i)
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_all(&pack_reserved_and_stream_id(
            self.exclusive as u8,
            self.stream_dependency,
        ))?;
        w.write_u8(self.weight)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Returns the underlying u32
    pub fn as_repr(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match KnownErrorCode::from_repr(self.0) {
            Some(e) => fmt::Debug::fmt(&e, f),
            None => write!(f, "ErrorCode(0x{:02x})", self.0),
        }
    }
}

impl From<KnownErrorCode> for ErrorCode {
    fn from(e: KnownErrorCode) -> Self {
        Self(e as u32)
    }
}

/// See <https://httpwg.org/specs/rfc9113.html#ErrorCodes>
#[EnumRepr(type = "u32")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownErrorCode {
    /// Graceful shutdown or no error at all.
    NoError = 0x00,

    /// Unspecific protocol violation.
    ProtocolError = 0x01,

    /// Unexpected internal error at the endpoint.
    InternalError = 0x02,

    /// The peer violated the flow-control protocol.
    FlowControlError = 0x03,

    /// SETTINGS went unacknowledged for too long.
    SettingsTimeout = 0x04,

    /// Frame received after a stream was half-closed.
    StreamClosed = 0x05,

    /// Frame with an invalid size.
    FrameSizeError = 0x06,

    /// Stream refused before any application processing; safe to retry.
    RefusedStream = 0x07,

    /// The stream is no longer needed.
    Cancel = 0x08,

    /// Field-section compression context cannot be maintained.
    CompressionError = 0x09,

    /// CONNECT-tunnelled connection reset or abnormally closed.
    ConnectError = 0x0a,

    /// The peer is generating excessive load (e.g. ping floods).
    EnhanceYourCalm = 0x0b,

    /// Transport properties below minimum security requirements.
    InadequateSecurity = 0x0c,

    /// HTTP/1.1 required instead of HTTP/2.
    Http1_1Required = 0x0d,
}

impl TryFrom<ErrorCode> for KnownErrorCode {
    type Error = ();

    fn try_from(e: ErrorCode) -> Result<Self, Self::Error> {
        KnownErrorCode::from_repr(e.0).ok_or(())
    }
}

/// cf. <https://httpwg.org/specs/rfc9113.html#SettingValues>, plus the
/// RPC transport extension settings carried in the 0xfe00 range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Maximum size of the header compression table used to decode field
    /// blocks, in octets. Initial value: 4,096.
    pub header_table_size: u32,

    /// Whether the sender accepts PUSH_PROMISE frames. An RPC transport
    /// never uses push, so this defaults to false on both sides.
    pub enable_push: bool,

    /// Directional limit on concurrent streams the sender permits the
    /// receiver to create. `None` means no limit announced.
    pub max_concurrent_streams: Option<u32>,

    /// Sender's initial window size for stream-level flow control, in
    /// octets. Initial value: 2^16-1. Values above 2^31-1 are a
    /// connection error of type FLOW_CONTROL_ERROR.
    pub initial_window_size: u32,

    /// Largest frame payload the sender is willing to receive, in
    /// octets. Must stay within [2^14, 2^24-1].
    pub max_frame_size: u32,

    /// Advisory maximum field-section size, in octets. 0 means unset.
    pub max_header_list_size: u32,

    /// Extension: whether the peer may use the "true binary" metadata
    /// encoding instead of base64.
    pub allow_true_binary_metadata: bool,

    /// Extension: advisory hint for the preferred size of received
    /// frames, in octets. 0 means no preference announced.
    pub preferred_receive_frame_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        // cf. https://httpwg.org/specs/rfc9113.html#SettingValues
        Self {
            header_table_size: 4096,
            enable_push: false,
            max_concurrent_streams: None,
            initial_window_size: (1 << 16) - 1,
            max_frame_size: 1 << 14,
            max_header_list_size: 0,
            allow_true_binary_metadata: false,
            preferred_receive_frame_size: 0,
        }
    }
}

impl Settings {
    /// Apply a setting to the current settings, returning an error if the
    /// setting is invalid.
    pub fn apply(&mut self, code: Setting, value: u32) -> Result<(), SettingsError> {
        match code {
            Setting::HeaderTableSize => {
                self.header_table_size = value;
            }
            Setting::EnablePush => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(SettingsError::InvalidEnablePushValue { actual: value }),
            },
            Setting::MaxConcurrentStreams => {
                self.max_concurrent_streams = Some(value);
            }
            Setting::InitialWindowSize => {
                if value > Self::MAX_INITIAL_WINDOW_SIZE {
                    return Err(SettingsError::InitialWindowSizeTooLarge { actual: value });
                }
                self.initial_window_size = value;
            }
            Setting::MaxFrameSize => {
                if !Self::MAX_FRAME_SIZE_ALLOWED_RANGE.contains(&value) {
                    return Err(SettingsError::SettingsMaxFrameSizeInvalid { actual: value });
                }
                self.max_frame_size = value;
            }
            Setting::MaxHeaderListSize => {
                self.max_header_list_size = value;
            }
            Setting::AllowTrueBinaryMetadata => match value {
                0 => self.allow_true_binary_metadata = false,
                1 => self.allow_true_binary_metadata = true,
                _ => return Err(SettingsError::InvalidAllowTrueBinaryValue { actual: value }),
            },
            Setting::PreferredReceiveFrameSize => {
                self.preferred_receive_frame_size = value;
            }
        }

        Ok(())
    }

    /// The settings that differ from `other`, in wire form. Used to
    /// announce local changes without re-sending every value.
    pub fn diff(&self, other: &Settings) -> Vec<(Setting, u32)> {
        let mut out = Vec::new();
        let pairs = [
            (Setting::HeaderTableSize, self.header_table_size, other.header_table_size),
            (Setting::EnablePush, self.enable_push as u32, other.enable_push as u32),
            (
                Setting::MaxConcurrentStreams,
                self.max_concurrent_streams.unwrap_or(u32::MAX),
                other.max_concurrent_streams.unwrap_or(u32::MAX),
            ),
            (Setting::InitialWindowSize, self.initial_window_size, other.initial_window_size),
            (Setting::MaxFrameSize, self.max_frame_size, other.max_frame_size),
            (Setting::MaxHeaderListSize, self.max_header_list_size, other.max_header_list_size),
            (
                Setting::AllowTrueBinaryMetadata,
                self.allow_true_binary_metadata as u32,
                other.allow_true_binary_metadata as u32,
            ),
            (
                Setting::PreferredReceiveFrameSize,
                self.preferred_receive_frame_size,
                other.preferred_receive_frame_size,
            ),
        ];
        for (id, ours, theirs) in pairs {
            if ours != theirs {
                out.push((id, ours));
            }
        }
        out
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("ENABLE_PUSH setting is supposed to be either 0 or 1, got {actual}")]
    InvalidEnablePushValue { actual: u32 },

    #[error("GRPC_ALLOW_TRUE_BINARY_METADATA is supposed to be either 0 or 1, got {actual}")]
    InvalidAllowTrueBinaryValue { actual: u32 },

    #[error("bad INITIAL_WINDOW_SIZE value {actual}, should be less than or equal to 2^31-1")]
    InitialWindowSizeTooLarge { actual: u32 },

    #[error(
        "bad SETTINGS_MAX_FRAME_SIZE value {actual}, should be between 2^14 and 2^24-1 inclusive"
    )]
    SettingsMaxFrameSizeInvalid { actual: u32 },
}

#[EnumRepr(type = "u16")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize = 0x01,
    EnablePush = 0x02,
    MaxConcurrentStreams = 0x03,
    InitialWindowSize = 0x04,
    MaxFrameSize = 0x05,
    MaxHeaderListSize = 0x06,
    // extension settings, cf. the 0xfe00-0xffff experimental range
    AllowTrueBinaryMetadata = 0xfe03,
    PreferredReceiveFrameSize = 0xfe04,
}

impl Settings {
    pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;
    pub const MAX_FRAME_SIZE_ALLOWED_RANGE: RangeInclusive<u32> = (1 << 14)..=((1 << 24) - 1);

    /// Parse a series of settings from a buffer, calling back for each
    /// known setting found. Unknown settings are ignored.
    ///
    /// Panics if the buf isn't a multiple of 6 bytes.
    pub fn parse<E>(
        buf: &[u8],
        mut callback: impl FnMut(Setting, u32) -> Result<(), E>,
    ) -> Result<(), E> {
        assert!(
            buf.len() % 6 == 0,
            "settings length must be a multiple of 6 bytes"
        );

        for chunk in buf.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            match Setting::from_repr(id) {
                None => {}
                Some(id) => {
                    callback(id, value)?;
                }
            }
        }

        Ok(())
    }
}

/// A borrowed list of settings to serialize into a SETTINGS payload.
pub struct SettingPairs<'a>(pub &'a [(Setting, u32)]);

impl<'a> SettingPairs<'a> {
    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        for (id, value) in self.0.iter() {
            w.write_u16::<BigEndian>(*id as u16)?;
            w.write_u32::<BigEndian>(*value)?;
        }
        Ok(())
    }

    pub fn wire_len(&self) -> usize {
        self.0.len() * 6
    }
}

impl<'a> From<&'a [(Setting, u32)]> for SettingPairs<'a> {
    fn from(value: &'a [(Setting, u32)]) -> Self {
        Self(value)
    }
}

/// Payload for a GOAWAY frame
#[derive(Debug)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub additional_debug_data: Vec<u8>,
}

impl GoAway {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, (last_stream_id, error_code)) = tuple((be_u32, be_u32))(i)?;

        Ok((
            &[][..],
            Self {
                last_stream_id: StreamId(last_stream_id & 0x7FFF_FFFF),
                error_code: ErrorCode(error_code),
                additional_debug_data: rest.to_vec(),
            },
        ))
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.last_stream_id.0)?;
        w.write_u32::<BigEndian>(self.error_code.0)?;
        w.write_all(&self.additional_debug_data)
    }

    pub fn wire_len(&self) -> usize {
        8 + self.additional_debug_data.len()
    }
}

/// Payload for a RST_STREAM frame
#[derive(Debug, Clone, Copy)]
pub struct RstStream {
    pub error_code: ErrorCode,
}

impl RstStream {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, error_code) = be_u32(i)?;
        Ok((
            rest,
            Self {
                error_code: ErrorCode(error_code),
            },
        ))
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.error_code.0)
    }
}

/// Payload for a PING frame: 8 opaque bytes, used here as a 64-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub opaque: u64,
}

impl Ping {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, opaque) = nom::number::streaming::be_u64(i)?;
        Ok((rest, Self { opaque }))
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_u64::<BigEndian>(self.opaque)
    }
}

/// Payload for a WINDOW_UPDATE frame
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdate {
    pub reserved: u8,
    pub increment: u32,
}

impl WindowUpdate {
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (rest, (reserved, increment)) = parse_bit_and_u31(i)?;
        Ok((
            rest,
            Self {
                reserved,
                increment,
            },
        ))
    }

    pub fn write_into(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        w.write_all(&pack_bit_and_u31(self.reserved, self.increment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pack_and_parse_bit_and_u31() {
        let test_cases = [
            (0, 0),
            (1, 0),
            (0, 1),
            (1, 1),
            (0, 0x7FFF_FFFF),
            (1, 0x7FFF_FFFF),
        ];

        for &(bit, number) in &test_cases {
            let packed = pack_bit_and_u31(bit, number);
            let (_, (parsed_bit, parsed_number)) = parse_bit_and_u31(&packed[..]).unwrap();
            assert_eq!(bit, parsed_bit);
            assert_eq!(number, parsed_number);
        }
    }

    #[test]
    #[should_panic(expected = "bit should be 0 or 1: 2")]
    fn test_pack_bit_and_u31_panic_not_a_bit() {
        pack_bit_and_u31(2, 0);
    }

    #[test]
    #[should_panic(expected = "val is too large: 80000000")]
    fn test_pack_bit_and_u31_panic_val_too_large() {
        pack_bit_and_u31(0, 1 << 31);
    }

    #[test]
    fn test_frame_header_roundtrip() {
        let frame = Frame::new(
            FrameType::Data(DataFlags::EndStream.into()),
            StreamId(7),
        )
        .with_len(1234);

        let mut buf = Vec::new();
        frame.write_into(&mut buf).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_LEN);

        let (rest, parsed) = Frame::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.len, 1234);
        assert_eq!(parsed.stream_id, StreamId(7));
        assert!(parsed.is_end_stream());
    }

    #[test]
    fn test_frame_header_incomplete() {
        let frame = Frame::new(FrameType::GoAway, StreamId::CONNECTION);
        let mut buf = Vec::new();
        frame.write_into(&mut buf).unwrap();

        for n in 0..FRAME_HEADER_LEN {
            assert!(Frame::parse(&buf[..n]).unwrap_err().is_incomplete());
        }
    }

    #[test]
    fn test_unknown_frame_type_preserved() {
        let mut buf = Vec::new();
        Frame::new(
            FrameType::Unknown(EncodedFrameType { ty: 0xf7, flags: 0x0a }),
            StreamId(3),
        )
        .write_into(&mut buf)
        .unwrap();

        let (_, parsed) = Frame::parse(&buf).unwrap();
        match parsed.frame_type {
            FrameType::Unknown(eft) => {
                assert_eq!(eft.ty, 0xf7);
                assert_eq!(eft.flags, 0x0a);
            }
            other => panic!("expected unknown frame type, got {other:?}"),
        }
    }

    #[test]
    fn test_settings_parse_ignores_unknown_ids() {
        let mut buf = Vec::new();
        SettingPairs(&[(Setting::MaxFrameSize, 65536)])
            .write_into(&mut buf)
            .unwrap();
        // an id we don't know about
        buf.extend_from_slice(&[0x0f, 0x00, 0, 0, 0, 1]);

        let mut seen = Vec::new();
        Settings::parse::<()>(&buf, |id, value| {
            seen.push((id, value));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(Setting::MaxFrameSize, 65536)]);
    }

    #[test]
    fn test_settings_validation() {
        let mut s = Settings::default();
        assert!(s.apply(Setting::EnablePush, 2).is_err());
        assert!(s.apply(Setting::InitialWindowSize, 1 << 31).is_err());
        assert!(s.apply(Setting::MaxFrameSize, 1).is_err());
        assert!(s.apply(Setting::MaxFrameSize, 1 << 24).is_err());
        assert!(s.apply(Setting::AllowTrueBinaryMetadata, 1).is_ok());
        assert!(s.allow_true_binary_metadata);
    }

    #[test]
    fn test_settings_diff() {
        let mut local = Settings::default();
        let sent = Settings::default();
        assert!(local.diff(&sent).is_empty());

        local.max_concurrent_streams = Some(64);
        local.initial_window_size = 1 << 20;
        let d = local.diff(&sent);
        assert_eq!(
            d,
            vec![
                (Setting::MaxConcurrentStreams, 64),
                (Setting::InitialWindowSize, 1 << 20),
            ]
        );
    }

    #[test]
    fn test_goaway_roundtrip() {
        let goaway = GoAway {
            last_stream_id: StreamId(41),
            error_code: KnownErrorCode::EnhanceYourCalm.into(),
            additional_debug_data: b"too many pings".to_vec(),
        };
        let mut buf = Vec::new();
        goaway.write_into(&mut buf).unwrap();
        assert_eq!(buf.len(), goaway.wire_len());

        let (_, parsed) = GoAway::parse(&buf).unwrap();
        assert_eq!(parsed.last_stream_id, StreamId(41));
        assert_eq!(
            KnownErrorCode::try_from(parsed.error_code),
            Ok(KnownErrorCode::EnhanceYourCalm)
        );
        assert_eq!(parsed.additional_debug_data, b"too many pings");
    }

    #[test]
    fn test_ping_roundtrip() {
        let ping = Ping {
            opaque: 0xdead_beef_0bad_cafe,
        };
        let mut buf = Vec::new();
        ping.write_into(&mut buf).unwrap();
        let (_, parsed) = Ping::parse(&buf).unwrap();
        assert_eq!(parsed, ping);
    }

}
