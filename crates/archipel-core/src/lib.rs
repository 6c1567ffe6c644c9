//! archipel-core — wire format, cryptographic primitives, identity and
//! configuration. All other Archipel crates depend on this one.

pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod message;
pub mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::ProtocolError;
pub use identity::Identity;
pub use manifest::FileManifest;
pub use wire::{Packet, PacketType};

/// A node's identity: its 32-byte Ed25519 public key.
pub type NodeId = [u8; 32];

/// Hex of the first 8 bytes of an id, for log fields.
pub fn short_id(id: &[u8; 32]) -> String {
    hex::encode(&id[..8])
}

pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
