//! PING bookkeeping: outbound ping queues and the inbound abuse policy.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::TransportError;

/// Completion callback for a locally requested ping.
pub type PingCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Outbound pings. At most one PING is in flight; requests made while one
/// is outstanding wait in `next` and ride the following frame.
pub(crate) struct PingQueue {
    initiate: Vec<PingCallback>,
    next: Vec<PingCallback>,
    inflight: Vec<PingCallback>,
    inflight_id: Option<u64>,
    counter: u64,
}

/// What an inbound PING ack resolved to.
pub(crate) enum PingAck {
    /// The in-flight ping completed. `more` means another ping is already
    /// queued and a write round should be scheduled.
    Completed { more: bool },
    /// No in-flight ping matches this id.
    Unknown,
}

impl PingQueue {
    pub(crate) fn new() -> Self {
        Self {
            initiate: Vec::new(),
            next: Vec::new(),
            inflight: Vec::new(),
            inflight_id: None,
            counter: 0,
        }
    }

    pub(crate) fn request(&mut self, cb: PingCallback) {
        if self.inflight_id.is_some() {
            self.next.push(cb);
        } else {
            self.initiate.push(cb);
        }
    }

    /// Request a keepalive ping with no completion callback.
    pub(crate) fn request_empty(&mut self) {
        if self.inflight_id.is_none() && self.initiate.is_empty() {
            self.initiate.push(Box::new(|_| {}));
        }
    }

    pub(crate) fn wants_ping(&self) -> bool {
        self.inflight_id.is_none() && !self.initiate.is_empty()
    }

    /// Move the initiate queue in flight, returning the opaque id to put
    /// on the wire. `None` when a ping is already outstanding or nothing
    /// is waiting.
    pub(crate) fn promote(&mut self) -> Option<u64> {
        if !self.wants_ping() {
            return None;
        }
        self.counter += 1;
        let id = self.counter;
        self.inflight_id = Some(id);
        self.inflight = std::mem::take(&mut self.initiate);
        Some(id)
    }

    pub(crate) fn ack(&mut self, id: u64) -> PingAck {
        if self.inflight_id != Some(id) {
            return PingAck::Unknown;
        }
        self.inflight_id = None;
        for cb in self.inflight.drain(..) {
            cb(Ok(()));
        }
        self.initiate.append(&mut self.next);
        PingAck::Completed {
            more: !self.initiate.is_empty(),
        }
    }

    /// Fail every queued and in-flight ping, for connection teardown.
    pub(crate) fn fail_all(&mut self, error: &TransportError) {
        self.inflight_id = None;
        for cb in self
            .inflight
            .drain(..)
            .chain(self.initiate.drain(..))
            .chain(self.next.drain(..))
        {
            cb(Err(error.clone()));
        }
    }
}

/// Limits on ping traffic, mirroring the usual RPC channel arguments.
#[derive(Debug, Clone)]
pub struct PingPolicy {
    /// Keepalive pings we may send without intervening data before the
    /// sender throttles itself.
    pub max_pings_without_data: u32,
    /// Strikes before an abusive peer gets GOAWAY + ENHANCE_YOUR_CALM.
    pub max_ping_strikes: u32,
    /// Minimum spacing between peer pings while we have sent no data.
    pub min_recv_ping_interval_without_data: Duration,
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self {
            max_pings_without_data: 2,
            max_ping_strikes: 2,
            min_recv_ping_interval_without_data: Duration::from_secs(300),
        }
    }
}

/// The peer pinged too often; tear the connection down.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("peer sent {strikes} pings too close together without data")]
pub(crate) struct PingAbuse {
    pub strikes: u32,
}

/// Inbound ping rate tracking.
pub(crate) struct PingRecvState {
    last_ping: Option<Instant>,
    strikes: u32,
}

impl PingRecvState {
    pub(crate) fn new() -> Self {
        Self {
            last_ping: None,
            strikes: 0,
        }
    }

    /// Account for a peer PING. A ping is a strike when we have not sent
    /// any data since the previous one and it arrives inside the minimum
    /// interval.
    pub(crate) fn on_ping(
        &mut self,
        now: Instant,
        policy: &PingPolicy,
        sent_data_since_last: bool,
    ) -> Result<(), PingAbuse> {
        if sent_data_since_last {
            self.strikes = 0;
        } else if let Some(last) = self.last_ping {
            if now.duration_since(last) < policy.min_recv_ping_interval_without_data {
                self.strikes += 1;
                debug!(strikes = self.strikes, "ping strike");
                if self.strikes > policy.max_ping_strikes {
                    return Err(PingAbuse {
                        strikes: self.strikes,
                    });
                }
            }
        }
        self.last_ping = Some(now);
        Ok(())
    }
}
