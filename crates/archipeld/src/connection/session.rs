//! Live sessions, one per peer identity.
//!
//! A session is a reader task and a writer task sharing one TCP connection.
//! The handle here is how the rest of the daemon reaches them: queue a
//! packet for the writer, or signal both tasks to stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use archipel_core::wire::PacketType;
use archipel_core::{short_id, NodeId};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

/// A plaintext packet queued for the writer, which seals and signs it.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub peer: NodeId,
    pub session_id: [u8; 32],
    /// Who dialled. Decides which of two racing connections survives.
    pub initiator: NodeId,
    pub remote_addr: SocketAddr,
    pub established_at: Instant,
    tx: mpsc::Sender<Outbound>,
    close: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn new(
        peer: NodeId,
        session_id: [u8; 32],
        initiator: NodeId,
        remote_addr: SocketAddr,
        tx: mpsc::Sender<Outbound>,
    ) -> Self {
        let (close, _) = watch::channel(false);
        Self {
            peer,
            session_id,
            initiator,
            remote_addr,
            established_at: Instant::now(),
            tx,
            close: Arc::new(close),
        }
    }

    /// Queue a packet, waiting for room. False once the session is gone.
    pub async fn send(&self, packet_type: PacketType, payload: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx
            .send(Outbound {
                packet_type,
                payload,
            })
            .await
            .is_ok()
    }

    /// Queue a packet only if there is room right now.
    pub fn try_send(&self, packet_type: PacketType, payload: Bytes) -> bool {
        !self.is_closed()
            && self
                .tx
                .try_send(Outbound {
                    packet_type,
                    payload,
                })
                .is_ok()
    }

    /// Tell the reader and writer to stop.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }
}

/// Outcome of registering a freshly established session.
pub enum Registered {
    /// No other session for this peer.
    New,
    /// Won against an existing session, which has been closed.
    Replaced,
    /// Lost against an existing session; the caller must close this one.
    Duplicate,
}

/// Peer identity → live session.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<DashMap<NodeId, SessionHandle>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, resolving a race with an existing one for the same
    /// peer. The connection dialled by the lower identity wins on both ends,
    /// so both nodes keep the same one. A reconnect from the same side
    /// replaces the old session.
    pub fn register(&self, handle: SessionHandle) -> Registered {
        match self.inner.entry(handle.peer) {
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Registered::New
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                let wins = existing.is_closed()
                    || handle.initiator == existing.initiator
                    || handle.initiator < existing.initiator;
                if wins {
                    let old = slot.insert(handle);
                    old.close();
                    tracing::debug!(peer = short_id(&old.peer), "replaced existing session");
                    Registered::Replaced
                } else {
                    Registered::Duplicate
                }
            }
        }
    }

    /// Remove the entry only if it is still this session.
    pub fn remove(&self, peer: &NodeId, session_id: &[u8; 32]) -> bool {
        self.inner
            .remove_if(peer, |_, h| h.session_id == *session_id)
            .is_some()
    }

    pub fn get(&self, peer: &NodeId) -> Option<SessionHandle> {
        self.inner.get(peer).map(|h| h.value().clone())
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.inner.contains_key(peer)
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.inner.iter().map(|h| *h.key()).collect()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.inner.iter().map(|h| h.value().clone()).collect()
    }

    /// Send to one peer. False when there is no session or it just closed.
    pub async fn send(&self, peer: &NodeId, packet_type: PacketType, payload: Bytes) -> bool {
        // Clone out first: never hold a shard lock across an await.
        match self.get(peer) {
            Some(handle) => handle.send(packet_type, payload).await,
            None => false,
        }
    }

    /// Send to every live session. Returns how many accepted it.
    pub async fn broadcast(&self, packet_type: PacketType, payload: Bytes) -> usize {
        let mut sent = 0;
        for handle in self.handles() {
            if handle.send(packet_type, payload.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Close and drop the session for `peer`, if any.
    pub fn close_peer(&self, peer: &NodeId) -> bool {
        match self.inner.remove(peer) {
            Some((_, handle)) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for handle in self.handles() {
            handle.close();
        }
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(peer: u8, session: u8, initiator: u8) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        let addr = SocketAddr::from(([127, 0, 0, 1], 7777));
        (
            SessionHandle::new([peer; 32], [session; 32], [initiator; 32], addr, tx),
            rx,
        )
    }

    #[test]
    fn lower_initiator_wins_a_race() {
        let table = SessionTable::new();
        let (theirs, _r1) = handle(5, 1, 5);
        let (ours, _r2) = handle(5, 2, 1);
        assert!(matches!(table.register(theirs.clone()), Registered::New));
        assert!(matches!(table.register(ours), Registered::Replaced));
        assert!(theirs.is_closed());
        assert_eq!(table.get(&[5; 32]).unwrap().session_id, [2; 32]);

        let (late, _r3) = handle(5, 3, 5);
        assert!(matches!(table.register(late), Registered::Duplicate));
    }

    #[test]
    fn remove_ignores_a_replaced_session() {
        let table = SessionTable::new();
        let (old, _r1) = handle(7, 1, 1);
        let (new, _r2) = handle(7, 2, 1);
        table.register(old);
        table.register(new);
        assert!(!table.remove(&[7; 32], &[1; 32]));
        assert!(table.contains(&[7; 32]));
        assert!(table.remove(&[7; 32], &[2; 32]));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn closed_session_refuses_sends() {
        let table = SessionTable::new();
        let (h, mut rx) = handle(8, 1, 1);
        table.register(h.clone());
        assert!(table.send(&[8; 32], PacketType::Ping, Bytes::from_static(b"x")).await);
        assert_eq!(rx.recv().await.unwrap().packet_type, PacketType::Ping);

        assert!(table.close_peer(&[8; 32]));
        assert!(h.is_closed());
        assert!(!h.send(PacketType::Ping, Bytes::new()).await);
        assert!(!table.send(&[8; 32], PacketType::Ping, Bytes::new()).await);
    }
}
