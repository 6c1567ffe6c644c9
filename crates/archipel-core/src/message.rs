//! JSON payload schemas for session traffic.
//!
//! Fixed-layout bodies (HELLO, handshake, chunk references, PING, REVOKE)
//! live in `wire`. Everything variable-length and human-facing is JSON:
//! text messages, peer lists, error replies and manifests.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::NodeId;

/// Longest text a MESSAGE may carry, in bytes.
pub const MAX_TEXT_LEN: usize = 64 * 1024;

/// Most entries a PEER_LIST may carry.
pub const MAX_PEER_LIST: usize = 256;

/// MESSAGE payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub text: String,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub sent_at: u64,
}

/// One entry of a PEER_LIST payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListEntry {
    #[serde(with = "hex32")]
    pub id: NodeId,
    /// Address of the peer's transfer listener.
    pub addr: SocketAddr,
}

/// PEER_LIST payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<PeerListEntry>,
}

/// ERROR codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Requested manifest or chunk is not held here.
    NotFound,
    /// Handshake refused; the connection closes after this packet.
    HandshakeRejected,
    /// The receiver considers the sender revoked.
    Revoked,
    /// Payload could not be parsed.
    Malformed,
}

/// ERROR payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    /// Set when the error answers a CHUNK_REQUEST.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex32::option")]
    pub content_hash: Option<[u8; 32]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            content_hash: None,
            index: None,
        }
    }

    pub fn chunk_not_found(content_hash: [u8; 32], index: u32) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: "chunk not held".to_string(),
            content_hash: Some(content_hash),
            index: Some(index),
        }
    }
}

impl TextMessage {
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.text.len() > MAX_TEXT_LEN {
            return Err(MessageError::TooLong(self.text.len()));
        }
        Ok(())
    }
}

impl PeerList {
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.peers.len() > MAX_PEER_LIST {
            return Err(MessageError::TooManyPeers(self.peers.len()));
        }
        Ok(())
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(value).map_err(MessageError::Json)
}

pub fn from_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, MessageError> {
    serde_json::from_slice(payload).map_err(MessageError::Json)
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("payload is not valid JSON for this packet type: {0}")]
    Json(#[source] serde_json::Error),

    #[error("text of {0} bytes exceeds the message limit")]
    TooLong(usize),

    #[error("peer list of {0} entries exceeds the limit")]
    TooManyPeers(usize),
}

/// Serde adapter: `[u8; 32]` as a lowercase hex string.
pub mod hex32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        parse(&text).map_err(D::Error::custom)
    }

    pub(crate) fn parse(text: &str) -> Result<[u8; 32], String> {
        let raw = hex::decode(text).map_err(|e| e.to_string())?;
        raw.try_into()
            .map_err(|v: Vec<u8>| format!("expected 32 bytes, got {}", v.len()))
    }

    pub mod option {
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(bytes: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => s.serialize_some(&hex::encode(b)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(text) => super::parse(&text).map(Some).map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }

    pub mod vec {
        use serde::ser::SerializeSeq;
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(list: &[[u8; 32]], s: S) -> Result<S::Ok, S::Error> {
            let mut seq = s.serialize_seq(Some(list.len()))?;
            for item in list {
                seq.serialize_element(&hex::encode(item))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<[u8; 32]>, D::Error> {
            Vec::<String>::deserialize(d)?
                .iter()
                .map(|text| super::parse(text).map_err(D::Error::custom))
                .collect()
        }
    }
}
