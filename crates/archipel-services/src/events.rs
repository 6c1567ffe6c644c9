//! Node events for the application layer.
//!
//! Everything the daemon wants an embedding application to know about goes
//! through one bounded channel. Emitting never blocks the protocol: if the
//! consumer falls behind, events are dropped with a warning.

use archipel_core::{short_id, NodeId};
use tokio::sync::mpsc;

use crate::peer::ConnectionState;
use crate::transfer::Progress;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityAlert {
    /// A peer presented a key different from the one pinned for it.
    KeyMismatch,
    /// A revocation for this peer was accepted.
    PeerRevoked,
    /// A frame failed signature verification.
    BadSignature,
}

#[derive(Debug, Clone)]
pub enum Event {
    PeerDiscovered {
        peer: NodeId,
    },
    PeerStateChanged {
        peer: NodeId,
        from: ConnectionState,
        to: ConnectionState,
    },
    PeerExpired {
        peer: NodeId,
    },
    ManifestAnnounced {
        peer: NodeId,
        content_hash: [u8; 32],
    },
    MessageReceived {
        peer: NodeId,
        text: String,
        sent_at: u64,
    },
    TransferProgress {
        content_hash: [u8; 32],
        progress: Progress,
    },
    TransferCompleted {
        content_hash: [u8; 32],
    },
    TransferFailed {
        content_hash: [u8; 32],
        reason: String,
    },
    SecurityAlert {
        peer: NodeId,
        alert: SecurityAlert,
    },
}

/// Non-blocking sender half. Clones share the channel.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = ?event_name(&event), "event channel full; dropping");
            }
            // Nobody listening.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn security(&self, peer: NodeId, alert: SecurityAlert) {
        tracing::warn!(peer = short_id(&peer), ?alert, "security alert");
        self.emit(Event::SecurityAlert { peer, alert });
    }

    /// A sender whose events go nowhere.
    pub fn disconnected() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }
}

pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx }, rx)
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::PeerDiscovered { .. } => "peer_discovered",
        Event::PeerStateChanged { .. } => "peer_state_changed",
        Event::PeerExpired { .. } => "peer_expired",
        Event::ManifestAnnounced { .. } => "manifest_announced",
        Event::MessageReceived { .. } => "message_received",
        Event::TransferProgress { .. } => "transfer_progress",
        Event::TransferCompleted { .. } => "transfer_completed",
        Event::TransferFailed { .. } => "transfer_failed",
        Event::SecurityAlert { .. } => "security_alert",
    }
}
