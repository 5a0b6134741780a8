//! The per-connection actor.
//!
//! [Driver::run] owns the [Transport] and the endpoint and is the only
//! task that touches either, which is what serializes the whole engine.
//! Applications talk to it through a cloneable [Handle] (commands in) and
//! an event receiver (events out). Timers are armed from transport state
//! each loop turn and cancel idempotently: a timer that fires after the
//! state it guarded has moved on is a no-op inside the transport.

use std::future::pending;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use weft_h2::{KnownErrorCode, StreamId};

use crate::error::{ConnectionError, TransportError};
use crate::lifecycle::KeepaliveState;
use crate::stream::MetadataField;
use crate::transport::{Transport, TransportEvent};

/// Byte source and sink for one connection.
#[allow(async_fn_in_trait)]
pub trait Endpoint {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;
}

impl<T> Endpoint for T
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        AsyncReadExt::read(self, buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }
}

enum Command {
    OpenStream {
        reply: oneshot::Sender<Result<StreamId, TransportError>>,
    },
    SendInitialMetadata {
        stream_id: StreamId,
        fields: Vec<MetadataField>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    SendMessage {
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    SendTrailingMetadata {
        stream_id: StreamId,
        fields: Vec<MetadataField>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    TakeMessage {
        stream_id: StreamId,
        reply: oneshot::Sender<Option<Bytes>>,
    },
    Cancel {
        stream_id: StreamId,
        code: KnownErrorCode,
    },
    Ping {
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown {
        graceful: bool,
    },
}

/// Cheap cloneable handle to a running [Driver].
#[derive(Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
}

impl Handle {
    async fn round_trip<R>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        let gone = || TransportError::Connection(ConnectionError::GoingAway);
        self.commands.send(cmd).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    pub async fn open_stream(&self) -> Result<StreamId, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(Command::OpenStream { reply: tx }, rx).await
    }

    pub async fn send_initial_metadata(
        &self,
        stream_id: StreamId,
        fields: Vec<MetadataField>,
    ) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(
            Command::SendInitialMetadata {
                stream_id,
                fields,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn send_message(
        &self,
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(
            Command::SendMessage {
                stream_id,
                payload,
                end_stream,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn send_trailing_metadata(
        &self,
        stream_id: StreamId,
        fields: Vec<MetadataField>,
    ) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(
            Command::SendTrailingMetadata {
                stream_id,
                fields,
                reply: tx,
            },
            rx,
        )
        .await
    }

    pub async fn take_message(&self, stream_id: StreamId) -> Option<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::TakeMessage {
                stream_id,
                reply: tx,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn cancel(&self, stream_id: StreamId, code: KnownErrorCode) {
        let _ = self.commands.send(Command::Cancel { stream_id, code }).await;
    }

    /// Round-trip a PING to the peer.
    pub async fn ping(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.round_trip(Command::Ping { reply: tx }, rx).await
    }

    pub async fn shutdown(&self, graceful: bool) {
        let _ = self.commands.send(Command::Shutdown { graceful }).await;
    }
}

pub struct Driver<E: Endpoint> {
    transport: Transport,
    endpoint: E,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<TransportEvent>,
}

impl<E: Endpoint> Driver<E> {
    pub fn new(
        transport: Transport,
        endpoint: E,
    ) -> (Self, Handle, mpsc::Receiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ev_tx, ev_rx) = mpsc::channel(64);
        (
            Self {
                transport,
                endpoint,
                commands: cmd_rx,
                events: ev_tx,
            },
            Handle { commands: cmd_tx },
            ev_rx,
        )
    }

    /// Drive the connection until it closes. All transport errors surface
    /// as [TransportEvent::ConnectionClosed] on the event channel.
    pub async fn run(mut self) -> std::io::Result<()> {
        let mut read_buf = vec![0u8; 16 * 1024];

        loop {
            self.flush().await;
            self.pump_events().await;

            if self.transport.is_closed() {
                // One last flush gets the final GOAWAY out.
                self.flush().await;
                self.pump_events().await;
                debug!("driver exiting");
                return Ok(());
            }

            // Timer parameters are copied out so the timer futures don't
            // borrow the transport while an arm mutates it.
            let keepalive_interval = self.transport.keepalive_interval();
            let watchdog_timeout =
                (self.transport.keepalive_state() == KeepaliveState::Pinging)
                    .then(|| self.transport.keepalive_timeout());
            let next_deadline = self.transport.next_deadline();
            let reading = !self.transport.reading_paused();

            let keepalive = async move {
                match keepalive_interval {
                    Some(d) => tokio::time::sleep(d).await,
                    None => pending().await,
                }
            };
            let watchdog = async move {
                match watchdog_timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => pending().await,
                }
            };
            let deadline = async move {
                match next_deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                res = self.endpoint.read(&mut read_buf), if reading => {
                    match res {
                        Ok(0) => {
                            self.transport.close_with(ConnectionError::EndpointClosed {
                                message: "connection closed by peer".into(),
                            });
                        }
                        Ok(n) => {
                            trace!(n, "read bytes");
                            // recv_bytes tears the connection down itself
                            // on protocol errors; the next loop turn
                            // flushes the GOAWAY and exits.
                            let _ = self.transport.recv_bytes(&read_buf[..n]);
                        }
                        Err(e) => {
                            self.transport.close_with(ConnectionError::EndpointClosed {
                                message: e.to_string(),
                            });
                        }
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => apply_command(&mut self.transport, cmd),
                        // Every handle is gone: drain and leave.
                        None => self.transport.shutdown(true),
                    }
                }
                _ = keepalive => self.transport.keepalive_timer_fired(),
                _ = watchdog => self.transport.keepalive_watchdog_fired(),
                _ = deadline => self.transport.expire_deadlines(std::time::Instant::now()),
            }
        }
    }

    async fn flush(&mut self) {
        while self.transport.wants_write() {
            let Some(round) = self.transport.begin_write() else {
                break;
            };
            trace!(len = round.buf.len(), partial = round.partial, "writing round");
            let res = self.endpoint.write_all(&round.buf).await;
            if !self.transport.end_write(res) {
                break;
            }
        }
    }

    async fn pump_events(&mut self) {
        while let Some(event) = self.transport.poll_event() {
            if self.events.send(event).await.is_err() {
                // Receiver dropped; events are now fire-and-forget.
                return;
            }
        }
    }

}

fn apply_command(transport: &mut Transport, cmd: Command) {
    match cmd {
        Command::OpenStream { reply } => {
            let _ = reply.send(transport.open_stream());
        }
        Command::SendInitialMetadata {
            stream_id,
            fields,
            reply,
        } => {
            let _ = reply.send(transport.send_initial_metadata(stream_id, &fields));
        }
        Command::SendMessage {
            stream_id,
            payload,
            end_stream,
            reply,
        } => {
            let _ = reply.send(transport.send_message(stream_id, payload, end_stream));
        }
        Command::SendTrailingMetadata {
            stream_id,
            fields,
            reply,
        } => {
            let _ = reply.send(transport.send_trailing_metadata(stream_id, &fields));
        }
        Command::TakeMessage { stream_id, reply } => {
            let _ = reply.send(transport.take_message(stream_id));
        }
        Command::Cancel { stream_id, code } => {
            transport.cancel(stream_id, code);
        }
        Command::Ping { reply } => {
            transport.ping(Box::new(move |res| {
                let _ = reply.send(res);
            }));
        }
        Command::Shutdown { graceful } => {
            transport.shutdown(graceful);
        }
    }
}
