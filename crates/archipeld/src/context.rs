//! State shared by every daemon task.

use std::sync::Arc;

use archipel_core::config::ArchipelConfig;
use archipel_core::crypto::random_nonce;
use archipel_core::wire::{self, DecodeError, Flags, Packet, PacketType, WireError};
use archipel_core::{identity, short_id, Identity, NodeId};
use archipel_services::{
    ChunkStore, ConnectionState, Event, EventSender, ManifestCatalogue, PeerTable, TrustStore,
};

/// Cheap to clone; every table inside is shared.
#[derive(Clone)]
pub struct NodeContext {
    pub identity: Arc<Identity>,
    pub config: Arc<ArchipelConfig>,
    pub trust: TrustStore,
    pub peers: PeerTable,
    pub catalogue: ManifestCatalogue,
    pub store: ChunkStore,
    pub events: EventSender,
}

impl NodeContext {
    pub fn id(&self) -> NodeId {
        self.identity.public_id()
    }

    /// Sign and frame an unencrypted packet with a fresh random nonce.
    pub fn encode_plain(&self, packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        wire::encode(
            packet_type,
            Flags::NONE,
            &self.id(),
            &random_nonce(),
            payload,
            |bytes| self.identity.sign(bytes),
        )
    }

    /// Decode a frame, verifying the signature against its sender id.
    pub fn decode(&self, frame: &[u8]) -> Result<Packet, DecodeError> {
        wire::decode(frame, identity::verify)
    }

    /// Move a peer to `next` and publish the change. Illegal transitions are
    /// logged and ignored.
    pub fn set_state(&self, peer: &NodeId, next: ConnectionState) {
        match self.peers.transition(peer, next) {
            Ok(prev) if prev != next => {
                tracing::debug!(peer = short_id(peer), from = ?prev, to = ?next, "peer state");
                self.events.emit(Event::PeerStateChanged {
                    peer: *peer,
                    from: prev,
                    to: next,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::trace!(peer = short_id(peer), error = %e, "state change ignored"),
        }
    }
}
