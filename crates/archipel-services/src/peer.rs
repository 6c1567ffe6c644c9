//! Peer table — everyone this node has seen, how to reach them, and where
//! each connection stands.
//!
//! Records are created on the first HELLO, PEER_LIST mention or inbound
//! connection, refreshed on every sighting, and evicted after a silence
//! timeout unless a session is live.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use archipel_core::NodeId;
use dashmap::DashMap;
use thiserror::Error;

/// Per-peer connection lifecycle.
///
/// ```text
/// Discovered ──► Handshaking ──► Established ──► Closed
///                    │                │            │
///                    ▼                ▼            ▼
///                 Rejected         Revoked    Handshaking (retry)
/// ```
///
/// Revoked is terminal and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Discovered,
    Handshaking,
    Established,
    Closed,
    Rejected,
    Revoked,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Revoked, _) => false,
            (_, Revoked) => true,
            (Discovered, Handshaking) => true,
            (Handshaking, Established | Rejected | Closed) => true,
            (Established, Closed) => true,
            (Closed | Rejected, Handshaking) => true,
            _ => false,
        }
    }

    /// A connection attempt may be started from this state.
    pub fn is_dialable(self) -> bool {
        matches!(
            self,
            ConnectionState::Discovered | ConnectionState::Closed | ConnectionState::Rejected
        )
    }
}

/// How a record was first learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Hello,
    PeerList,
    Inbound,
    Manual,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: NodeId,
    /// Transfer listener address.
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub state: ConnectionState,
    /// Smoothed round-trip estimate from PING/PONG.
    pub rtt: Option<Duration>,
    /// No new handshake before this instant.
    pub cooldown_until: Option<Instant>,
    /// Consecutive failed handshakes.
    pub failed_attempts: u32,
    pub source: PeerSource,
}

impl PeerRecord {
    pub fn new(identity: NodeId, addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            identity,
            addr,
            last_seen: Instant::now(),
            state: ConnectionState::Discovered,
            rtt: None,
            cooldown_until: None,
            failed_attempts: 0,
            source,
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Result of recording a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    New,
    Refreshed,
    /// Known peer now reachable at a different address.
    Moved,
}

/// The shared peer table. Clones share the same records.
#[derive(Clone, Default)]
pub struct PeerTable {
    records: Arc<DashMap<NodeId, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh the record for `identity` at `addr`.
    pub fn record_sighting(&self, identity: NodeId, addr: SocketAddr, source: PeerSource) -> Sighting {
        let mut outcome = Sighting::New;
        self.records
            .entry(identity)
            .and_modify(|r| {
                outcome = if r.addr != addr {
                    r.addr = addr;
                    Sighting::Moved
                } else {
                    Sighting::Refreshed
                };
                r.last_seen = Instant::now();
            })
            .or_insert_with(|| PeerRecord::new(identity, addr, source));
        outcome
    }

    /// Refresh last-seen without touching the address.
    pub fn touch(&self, identity: &NodeId) {
        if let Some(mut r) = self.records.get_mut(identity) {
            r.last_seen = Instant::now();
        }
    }

    /// Move a record to `next`. Returns the previous state.
    pub fn transition(
        &self,
        identity: &NodeId,
        next: ConnectionState,
    ) -> Result<ConnectionState, TransitionError> {
        let Some(mut record) = self.records.get_mut(identity) else {
            return Err(TransitionError {
                from: ConnectionState::Discovered,
                to: next,
            });
        };
        let prev = record.state;
        if prev == next {
            return Ok(prev);
        }
        if !prev.can_transition_to(next) {
            return Err(TransitionError { from: prev, to: next });
        }
        record.state = next;
        if next == ConnectionState::Established {
            record.failed_attempts = 0;
            record.cooldown_until = None;
        }
        Ok(prev)
    }

    /// Mark a failed handshake and hold the peer off for `cooldown`.
    pub fn record_failure(&self, identity: &NodeId, cooldown: Duration) -> u32 {
        match self.records.get_mut(identity) {
            Some(mut r) => {
                r.failed_attempts += 1;
                r.cooldown_until = Some(Instant::now() + cooldown);
                r.failed_attempts
            }
            None => 0,
        }
    }

    /// Fold a new RTT sample in (EWMA, α = 1/8).
    pub fn record_rtt(&self, identity: &NodeId, sample: Duration) {
        if let Some(mut r) = self.records.get_mut(identity) {
            r.rtt = Some(match r.rtt {
                None => sample,
                Some(prev) => (prev * 7 + sample) / 8,
            });
            r.last_seen = Instant::now();
        }
    }

    pub fn rtt(&self, identity: &NodeId) -> Option<Duration> {
        self.records.get(identity).and_then(|r| r.rtt)
    }

    pub fn state(&self, identity: &NodeId) -> Option<ConnectionState> {
        self.records.get(identity).map(|r| r.state)
    }

    pub fn get(&self, identity: &NodeId) -> Option<PeerRecord> {
        self.records.get(identity).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<PeerRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn established(&self) -> Vec<NodeId> {
        self.records
            .iter()
            .filter(|r| r.state == ConnectionState::Established)
            .map(|r| *r.key())
            .collect()
    }

    /// Evict records silent for longer than `silence`. Live and in-progress
    /// connections and revoked tombstones are kept. Returns evicted ids.
    pub fn expire(&self, silence: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.records.retain(|id, r| {
            let keep = matches!(
                r.state,
                ConnectionState::Established | ConnectionState::Handshaking | ConnectionState::Revoked
            ) || now.duration_since(r.last_seen) <= silence;
            if !keep {
                evicted.push(*id);
            }
            keep
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
