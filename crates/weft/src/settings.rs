//! SETTINGS bookkeeping.
//!
//! Four copies of the settings are tracked per connection: what the peer
//! announced (`peer`), what the application wants (`local`), what we last
//! put on the wire (`sent`), and what the peer has acknowledged (`acked`).
//! At most one un-acked SETTINGS frame is outstanding at a time; local
//! changes made while one is in flight wait for the ack.

use tracing::debug;
use weft_h2::{Setting, Settings, SettingsError};

use crate::error::ConnectionError;

/// Which of the four tracked settings copies to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSet {
    /// Last non-ack SETTINGS frame received from the peer.
    Peer,
    /// What the local application wants to announce.
    Local,
    /// Last SETTINGS frame we wrote, not yet acknowledged.
    Sent,
    /// Settings the peer has acknowledged.
    Acked,
}

pub(crate) struct SettingsSets {
    peer: Settings,
    local: Settings,
    sent: Settings,
    acked: Settings,
    /// `local` differs from `sent`.
    dirty: bool,
    /// A SETTINGS frame is on the wire awaiting ack.
    ack_pending: bool,
}

/// Outcome of a peer SETTINGS ack: values the transport must fan out now
/// that the peer has promised to honor them.
pub(crate) struct AckedSettings {
    pub initial_window_size: u32,
    pub max_frame_size: u32,
}

/// Outcome of a peer SETTINGS frame: deltas the transport must fan out.
pub(crate) struct PeerSettingsUpdate {
    /// Delta to apply to every stream's send window.
    pub initial_window_delta: i64,
}

impl SettingsSets {
    pub(crate) fn new(local: Settings) -> Self {
        Self {
            peer: Settings::default(),
            local,
            sent: Settings::default(),
            acked: Settings::default(),
            dirty: true,
            ack_pending: false,
        }
    }

    pub(crate) fn get(&self, set: SettingsSet) -> &Settings {
        match set {
            SettingsSet::Peer => &self.peer,
            SettingsSet::Local => &self.local,
            SettingsSet::Sent => &self.sent,
            SettingsSet::Acked => &self.acked,
        }
    }

    pub(crate) fn peer(&self) -> &Settings {
        &self.peer
    }

    pub(crate) fn local(&self) -> &Settings {
        &self.local
    }

    pub(crate) fn update_local(&mut self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.local);
        if self.local != self.sent {
            self.dirty = true;
        }
    }

    /// Setting pairs for the next SETTINGS frame, or `None` if nothing
    /// needs announcing or a previous frame is still un-acked.
    pub(crate) fn frame_to_send(&mut self) -> Option<Vec<(Setting, u32)>> {
        if !self.dirty || self.ack_pending {
            return None;
        }
        let pairs = self.local.diff(&self.sent);
        self.sent = self.local;
        self.dirty = false;
        self.ack_pending = true;
        Some(pairs)
    }

    /// Handle a SETTINGS ack from the peer: promote `sent` to `acked`.
    pub(crate) fn ack_received(&mut self) -> Result<AckedSettings, ConnectionError> {
        if !self.ack_pending {
            return Err(ConnectionError::UnexpectedSettingsAck);
        }
        self.ack_pending = false;
        self.acked = self.sent;
        debug!(acked = ?self.acked, "settings acknowledged");
        Ok(AckedSettings {
            initial_window_size: self.acked.initial_window_size,
            max_frame_size: self.acked.max_frame_size,
        })
    }

    /// Apply a peer SETTINGS frame payload (already length-validated).
    pub(crate) fn apply_peer(
        &mut self,
        payload: &[u8],
    ) -> Result<PeerSettingsUpdate, SettingsError> {
        let before = self.peer.initial_window_size;
        let mut next = self.peer;
        // Unknown settings are ignored by the parser.
        Settings::parse(payload, |setting, value| next.apply(setting, value))?;
        self.peer = next;
        Ok(PeerSettingsUpdate {
            initial_window_delta: self.peer.initial_window_size as i64 - before as i64,
        })
    }
}
