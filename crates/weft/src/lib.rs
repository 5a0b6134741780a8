//! Connection-level engine for an HTTP/2-based RPC transport.
//!
//! The heart of the crate is [Transport], a synchronous state machine for
//! one connection: it multiplexes streams, enforces flow control in both
//! directions, reassembles and emits header blocks, tracks settings and
//! pings, and sequences GOAWAY shutdown. Bytes go in through
//! [Transport::recv_bytes] and come out in write rounds via
//! [Transport::begin_write] / [Transport::end_write]; everything else
//! surfaces as [TransportEvent]s.
//!
//! [driver::Driver] wraps a transport and a socket in a tokio task,
//! serializing all access the way the engine expects, with keepalive and
//! deadline timers attached.
//!
//! Wire-format types live in [weft_h2] (re-exported as [h2]) and the
//! header string codec in [weft_hpack] (re-exported as [hpack]).

pub use weft_h2 as h2;
pub use weft_hpack as hpack;

pub mod driver;
mod deframer;
pub mod error;
pub mod flow;
pub mod headers;
mod lifecycle;
mod ping;
mod settings;
mod stream;
mod transport;
mod write;

pub use error::{ConnectionError, StreamError, TransportError};
pub use headers::HeaderBlockError;
pub use lifecycle::{GoawayState, KeepaliveConfig, KeepaliveState};
pub use ping::{PingCallback, PingPolicy};
pub use settings::SettingsSet;
pub use stream::MetadataField;
pub use transport::{Role, Transport, TransportConfig, TransportEvent, WriteState};
pub use write::WriteRound;
