//! Connection lifecycle: keepalive and GOAWAY sequencing.

use std::time::Duration;

use tracing::debug;

/// Keepalive configuration. `time: None` disables the mechanism.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings while the connection is idle.
    pub time: Option<Duration>,
    /// How long to wait for a ping ack before declaring the peer dead.
    pub timeout: Duration,
    /// Send keepalive pings even with no active streams.
    pub permit_without_calls: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time: None,
            timeout: Duration::from_secs(20),
            permit_without_calls: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    /// Timer armed, waiting for it to fire.
    Waiting,
    /// Keepalive ping sent, watchdog armed.
    Pinging,
    /// Watchdog fired before the ack; the connection is being torn down.
    Dying,
    /// No keepalive configured.
    Disabled,
}

/// What to do when the keepalive timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveAction {
    /// Send a ping and arm the watchdog.
    SendPing,
    /// Nothing to do this round, re-arm the timer.
    Rearm,
}

pub(crate) struct Keepalive {
    state: KeepaliveState,
    cfg: KeepaliveConfig,
}

impl Keepalive {
    pub(crate) fn new(cfg: KeepaliveConfig) -> Self {
        let state = if cfg.time.is_some() {
            KeepaliveState::Waiting
        } else {
            KeepaliveState::Disabled
        };
        Self { state, cfg }
    }

    pub(crate) fn state(&self) -> KeepaliveState {
        self.state
    }

    pub(crate) fn interval(&self) -> Option<Duration> {
        self.cfg.time
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.cfg.timeout
    }

    /// The keepalive timer fired. Timers cancel idempotently: a fire that
    /// races a state change is a no-op.
    pub(crate) fn timer_fired(&mut self, has_streams: bool) -> KeepaliveAction {
        if self.state != KeepaliveState::Waiting {
            return KeepaliveAction::Rearm;
        }
        if !has_streams && !self.cfg.permit_without_calls {
            return KeepaliveAction::Rearm;
        }
        self.state = KeepaliveState::Pinging;
        KeepaliveAction::SendPing
    }

    /// A ping ack arrived. Returns whether it closed out a keepalive
    /// probe (and the watchdog should be disarmed).
    pub(crate) fn ping_acked(&mut self) -> bool {
        if self.state == KeepaliveState::Pinging {
            self.state = KeepaliveState::Waiting;
            true
        } else {
            false
        }
    }

    /// The watchdog fired. Returns true if the peer is now considered
    /// dead; a fire after the ack already arrived is a no-op.
    pub(crate) fn watchdog_fired(&mut self) -> bool {
        if self.state == KeepaliveState::Pinging {
            debug!("keepalive watchdog fired with ping outstanding");
            self.state = KeepaliveState::Dying;
            true
        } else {
            false
        }
    }

    pub(crate) fn disable(&mut self) {
        self.state = KeepaliveState::Disabled;
    }
}

/// GOAWAY progression. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GoawayState {
    /// Normal operation.
    None,
    /// Graceful GOAWAY sent; existing streams drain, no new ones start.
    GracefulSent,
    /// A final GOAWAY is queued for the next write round.
    FinalScheduled,
    /// Final GOAWAY written. Nothing but teardown remains.
    FinalSent,
}

impl GoawayState {
    /// New streams may only start before any GOAWAY activity.
    pub(crate) fn allows_new_streams(self) -> bool {
        self == GoawayState::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive(permit_without_calls: bool) -> Keepalive {
        Keepalive::new(KeepaliveConfig {
            time: Some(Duration::from_secs(10)),
            timeout: Duration::from_secs(5),
            permit_without_calls,
        })
    }

    #[test]
    fn idle_connection_skips_ping_unless_permitted() {
        let mut ka = keepalive(false);
        assert_eq!(ka.timer_fired(false), KeepaliveAction::Rearm);
        assert_eq!(ka.state(), KeepaliveState::Waiting);

        let mut ka = keepalive(true);
        assert_eq!(ka.timer_fired(false), KeepaliveAction::SendPing);
        assert_eq!(ka.state(), KeepaliveState::Pinging);
    }

    #[test]
    fn ack_disarms_watchdog() {
        let mut ka = keepalive(false);
        assert_eq!(ka.timer_fired(true), KeepaliveAction::SendPing);
        assert!(ka.ping_acked());
        // The already-cancelled watchdog firing late changes nothing.
        assert!(!ka.watchdog_fired());
        assert_eq!(ka.state(), KeepaliveState::Waiting);
    }

    #[test]
    fn watchdog_kills_the_connection() {
        let mut ka = keepalive(false);
        ka.timer_fired(true);
        assert!(ka.watchdog_fired());
        assert_eq!(ka.state(), KeepaliveState::Dying);
        // Late ack after death is ignored.
        assert!(!ka.ping_acked());
    }

    #[test]
    fn disabled_keepalive_never_pings() {
        let mut ka = Keepalive::new(KeepaliveConfig::default());
        assert_eq!(ka.state(), KeepaliveState::Disabled);
        assert_eq!(ka.timer_fired(true), KeepaliveAction::Rearm);
    }

    #[test]
    fn goaway_states_are_ordered() {
        assert!(GoawayState::None.allows_new_streams());
        assert!(!GoawayState::GracefulSent.allows_new_streams());
        assert!(GoawayState::GracefulSent < GoawayState::FinalSent);
    }
}
