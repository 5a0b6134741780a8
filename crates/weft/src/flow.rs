//! Flow-control windows.
//!
//! Each direction is tracked separately. A [ReceiveWindow] is what we have
//! announced to the peer: it is debited when the peer's DATA arrives and
//! credited back when we send WINDOW_UPDATE. A [SendWindow] is what the peer
//! has announced to us: debited when we write DATA, credited when their
//! WINDOW_UPDATE arrives.
//!
//! Windows are kept as `i64` so that a mid-connection INITIAL_WINDOW_SIZE
//! decrease can push a window negative without wrapping.

/// Largest legal window value, per RFC 9113 section 6.9.1.
pub const MAX_WINDOW: i64 = (1 << 31) - 1;

/// Protocol-default window size for new streams and connections.
pub const DEFAULT_WINDOW: u32 = 65_535;

/// What the receiver should do after accounting for incoming DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlAction {
    /// Window is comfortably open, nothing to send.
    NoAction,
    /// Credit the peer in the next scheduled write round.
    QueueUpdate(u32),
    /// Window dropped below half its target: initiate a write round now.
    UpdateImmediately(u32),
}

/// The peer sent more than the window allowed.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("window debit of {debit} bytes with only {available} available")]
pub struct WindowDebitError {
    pub debit: u32,
    pub available: i64,
}

/// An increment or settings delta would push a window past 2^31-1.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("window increment of {increment} overflows {current}")]
pub struct WindowOverflowError {
    pub current: i64,
    pub increment: i64,
}

/// Inbound window: bytes the peer may still send us.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveWindow {
    /// Window size we aim to keep announced.
    target: u32,
    /// Bytes the peer may send before more WINDOW_UPDATE credit.
    available: i64,
}

impl ReceiveWindow {
    pub fn new(target: u32) -> Self {
        Self {
            target,
            available: target as i64,
        }
    }

    /// A window whose announced value differs from its target, e.g. the
    /// connection window which always starts at the protocol default and
    /// is grown with WINDOW_UPDATE.
    pub fn with_available(target: u32, available: u32) -> Self {
        Self {
            target,
            available: available as i64,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Debit the window for `n` bytes of incoming DATA (including padding)
    /// and decide whether the peer needs credit back.
    pub fn data_received(&mut self, n: u32) -> Result<FlowControlAction, WindowDebitError> {
        if (n as i64) > self.available {
            return Err(WindowDebitError {
                debit: n,
                available: self.available,
            });
        }
        self.available -= n as i64;
        Ok(self.pending_action())
    }

    /// Credit the peer was (or is about to be) given via WINDOW_UPDATE.
    pub fn update_sent(&mut self, credit: u32) {
        self.available += credit as i64;
    }

    /// Credit owed to the peer to restore the window to its target.
    pub fn pending_credit(&self) -> u32 {
        let deficit = self.target as i64 - self.available;
        if deficit > 0 {
            deficit as u32
        } else {
            0
        }
    }

    /// Re-evaluate what to do about the current deficit. Updates become
    /// urgent once less than half the target window remains announced.
    pub fn pending_action(&self) -> FlowControlAction {
        let credit = self.pending_credit();
        if credit == 0 {
            FlowControlAction::NoAction
        } else if self.available < (self.target as i64) / 2 {
            FlowControlAction::UpdateImmediately(credit)
        } else {
            FlowControlAction::QueueUpdate(credit)
        }
    }

    /// Retarget the window after a local INITIAL_WINDOW_SIZE change is
    /// acknowledged. The delta applies to the announced window too, so a
    /// shrink can leave `available` negative until the peer drains it.
    pub fn resize(&mut self, new_target: u32) {
        let delta = new_target as i64 - self.target as i64;
        self.target = new_target;
        self.available += delta;
    }
}

/// Outbound window: bytes we may still send to the peer.
#[derive(Debug, Clone, Copy)]
pub struct SendWindow {
    available: i64,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial as i64,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    /// Largest DATA payload the window currently allows.
    pub fn capacity(&self) -> u32 {
        self.available.clamp(0, u32::MAX as i64) as u32
    }

    /// Debit for DATA we are about to write. Callers never exceed
    /// [SendWindow::capacity].
    pub fn data_sent(&mut self, n: u32) {
        debug_assert!(n as i64 <= self.available);
        self.available -= n as i64;
    }

    /// Credit from a peer WINDOW_UPDATE.
    pub fn window_update(&mut self, increment: u32) -> Result<(), WindowOverflowError> {
        self.adjust(increment as i64)
    }

    /// Apply a settings-driven delta. May legally push the window negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowOverflowError> {
        let next = self.available + delta;
        if next > MAX_WINDOW {
            return Err(WindowOverflowError {
                current: self.available,
                increment: delta,
            });
        }
        self.available = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn receive_window_queues_then_escalates() {
        let mut w = ReceiveWindow::new(1000);

        // Small debit: over half the window remains, update can wait.
        assert_eq!(
            w.data_received(100).unwrap(),
            FlowControlAction::QueueUpdate(100)
        );

        // Cross the halfway mark: update becomes urgent and covers the
        // whole deficit.
        assert_eq!(
            w.data_received(450).unwrap(),
            FlowControlAction::UpdateImmediately(550)
        );

        w.update_sent(550);
        assert_eq!(w.pending_action(), FlowControlAction::NoAction);
        assert_eq!(w.available(), 1000);
    }

    #[test]
    fn receive_window_rejects_overdraw() {
        let mut w = ReceiveWindow::new(10);
        let err = w.data_received(11).unwrap_err();
        assert_eq!(err.debit, 11);
        assert_eq!(err.available, 10);
        // The violating debit is not applied.
        assert_eq!(w.available(), 10);
    }

    #[test]
    fn receive_window_shrink_goes_negative() {
        let mut w = ReceiveWindow::new(100);
        w.data_received(80).unwrap();
        w.resize(10);
        assert_eq!(w.available(), -70);
        assert_eq!(w.pending_credit(), 80);
    }

    #[test]
    fn send_window_overflow_detected() {
        let mut w = SendWindow::new(DEFAULT_WINDOW);
        w.window_update((MAX_WINDOW as u32) - DEFAULT_WINDOW).unwrap();
        assert_eq!(w.available(), MAX_WINDOW);
        assert!(w.window_update(1).is_err());
    }

    #[test]
    fn send_window_negative_after_settings_shrink() {
        let mut w = SendWindow::new(100);
        w.data_sent(60);
        w.adjust(-80).unwrap();
        assert_eq!(w.available(), -40);
        assert_eq!(w.capacity(), 0);
        w.window_update(50).unwrap();
        assert_eq!(w.capacity(), 10);
    }
}
