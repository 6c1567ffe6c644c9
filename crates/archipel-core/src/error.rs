//! Protocol-level error taxonomy.
//!
//! Module errors (`DecodeError`, `CryptoError`, ...) say what went wrong in
//! one layer. `ProtocolError` says what the node does about it: drop the
//! packet, refuse the peer, reschedule the chunk, or give up.

use thiserror::Error;

use crate::wire::DecodeError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed, corrupt, unsigned or unknown packet. Dropped; the carrying
    /// connection survives.
    #[error("packet dropped: {0}")]
    Decode(#[from] DecodeError),

    /// A known identity presented a different key than the one pinned.
    /// Security event; the connection is refused.
    #[error("key mismatch for peer {peer}")]
    KeyMismatch { peer: String },

    /// Handshake could not complete. The connection is torn down and the
    /// peer cooled down before the next attempt.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A chunk did not hash to its manifest entry. The chunk is rescheduled.
    #[error("chunk {index} failed verification")]
    ChunkVerificationFailed { index: u32 },

    /// The peer is revoked. Sessions are torn down and refused from now on.
    #[error("peer {peer} is revoked")]
    PeerRevoked { peer: String },

    /// A bounded wait ran out after its retries.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl ProtocolError {
    /// Whether the carrying connection should stay open.
    pub fn connection_survives(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decode(_) | ProtocolError::ChunkVerificationFailed { .. }
        )
    }
}
