//! Session handshake over any byte stream.
//!
//! ```text
//! initiator                                   responder
//!   HANDSHAKE_INIT {random_i, eph_i}  ──►
//!                                             is_acceptable(i), observe(i)
//!                                    ◄──  HANDSHAKE_ACK {random_r, eph_r, sig_r(transcript)}
//!   verify sig_r, observe(r), is_acceptable(r)
//!   PING (sealed under the new keys)   ──►
//!                                             open it: key confirmed
//! ```
//!
//! Both frames are signed by their sender's long-term key like every ARCK
//! frame. The responder additionally signs the transcript digest, which
//! binds its identity to both ephemerals. Session keys come from X25519 over
//! the ephemerals mixed with the transcript digest.
//!
//! A responder that refuses sends ERROR before returning; the caller closes
//! the stream. The responder returns a session only after the initiator's
//! first sealed frame opens, so a replayed INIT never yields one.

use std::time::Duration;

use archipel_core::crypto::{
    derive_session, random_bytes, random_nonce, CryptoError, EphemeralKeys, RecvHalf, Role,
    SendHalf, Transcript,
};
use archipel_core::message::{self, ErrorBody, ErrorCode};
use archipel_core::wire::{
    self, read_body, DecodeError, Flags, HandshakeAckBody, HandshakeInitBody, Packet, PacketType,
    PingBody, WireError,
};
use archipel_core::{identity, short_id, Identity, NodeId, ProtocolError};
use archipel_services::{TrustError, TrustStore};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use zerocopy::byteorder::U64;
use zerocopy::AsBytes;

use crate::framing::{read_frame, write_frame, FrameError};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,

    #[error("connection closed during handshake")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unexpected {0:?} during handshake")]
    Unexpected(PacketType),

    #[error("peer presented our own identity")]
    IdentityCollision,

    #[error("expected peer {expected} but {actual} answered")]
    UnexpectedPeer { expected: String, actual: String },

    #[error("transcript signature does not verify")]
    BadTranscript,

    #[error("initiator never proved it holds the session key")]
    Unconfirmed,

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error("rejected by peer ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl HandshakeError {
    pub fn is_key_mismatch(&self) -> bool {
        matches!(self, HandshakeError::Trust(TrustError::KeyMismatch { .. }))
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self, HandshakeError::Trust(TrustError::Revoked(_)))
            || matches!(
                self,
                HandshakeError::Rejected {
                    code: ErrorCode::Revoked,
                    ..
                }
            )
    }
}

impl From<HandshakeError> for ProtocolError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Trust(TrustError::KeyMismatch { identity, .. }) => {
                ProtocolError::KeyMismatch {
                    peer: short_id(&identity),
                }
            }
            HandshakeError::Trust(TrustError::Revoked(id)) => ProtocolError::PeerRevoked {
                peer: short_id(&id),
            },
            HandshakeError::Timeout => ProtocolError::Timeout("handshake".into()),
            other => ProtocolError::HandshakeFailed(other.to_string()),
        }
    }
}

/// A completed handshake: who is on the other end and the session keys.
pub struct Established {
    pub peer: NodeId,
    pub session_id: [u8; 32],
    pub send: SendHalf,
    pub recv: RecvHalf,
}

/// A verified HANDSHAKE_INIT, not yet accepted.
pub struct InitRequest {
    pub peer: NodeId,
    /// Frame nonce of the INIT; a second INIT with the same one is a replay.
    pub nonce: [u8; 12],
    body: HandshakeInitBody,
    deadline: Instant,
}

// ── Initiator ─────────────────────────────────────────────────────────────────

/// Run the initiator side. When `expected` is set, an ACK from any other
/// identity fails the handshake.
pub async fn initiate<S>(
    stream: &mut S,
    local: &Identity,
    trust: &TrustStore,
    expected: Option<NodeId>,
    limit: Duration,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + limit;
    let local_id = local.public_id();
    let ephemeral = EphemeralKeys::generate();
    let init = HandshakeInitBody {
        random: random_bytes(),
        ephemeral: ephemeral.public,
    };
    send_plain(stream, local, PacketType::HandshakeInit, init.as_bytes()).await?;
    tracing::trace!("sent HANDSHAKE_INIT");

    let packet = next_packet(stream, deadline).await?;
    match packet.packet_type {
        PacketType::HandshakeAck => {}
        PacketType::Error => {
            let body: ErrorBody = message::from_json(&packet.payload)
                .unwrap_or_else(|_| ErrorBody::new(ErrorCode::HandshakeRejected, "unreadable"));
            return Err(HandshakeError::Rejected {
                code: body.code,
                message: body.message,
            });
        }
        other => return Err(HandshakeError::Unexpected(other)),
    }

    let peer = packet.sender_id;
    if peer == local_id {
        return Err(HandshakeError::IdentityCollision);
    }
    if let Some(expected) = expected {
        if expected != peer {
            return Err(HandshakeError::UnexpectedPeer {
                expected: short_id(&expected),
                actual: short_id(&peer),
            });
        }
    }

    let ack: HandshakeAckBody = read_body(&packet.payload)?;
    let transcript = Transcript {
        initiator: local_id,
        responder: peer,
        initiator_random: init.random,
        initiator_ephemeral: init.ephemeral,
        responder_random: ack.random,
        responder_ephemeral: ack.ephemeral,
    };
    let digest = transcript.digest();
    if !identity::verify(&peer, &digest, &ack.transcript_signature) {
        return Err(HandshakeError::BadTranscript);
    }

    trust.observe(&peer, &peer)?;
    if !trust.is_acceptable(&peer) {
        return Err(TrustError::Revoked(peer).into());
    }

    let shared = ephemeral.agree(&ack.ephemeral)?;
    let keys = derive_session(Role::Initiator, &shared, &digest);
    let session_id = keys.session_id;
    let (mut send, recv) = keys.split();
    send_confirmation(stream, local, &mut send).await?;
    tracing::debug!(peer = short_id(&peer), "handshake complete (initiator)");
    Ok(Established {
        peer,
        session_id,
        send,
        recv,
    })
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Wait for a HANDSHAKE_INIT and check its signature. Frames that fail
/// checksum or signature are skipped until the deadline.
pub async fn read_init<S>(
    stream: &mut S,
    local: &Identity,
    limit: Duration,
) -> Result<InitRequest, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + limit;
    let packet = next_packet(stream, deadline).await?;
    if packet.packet_type != PacketType::HandshakeInit {
        return Err(HandshakeError::Unexpected(packet.packet_type));
    }
    if packet.sender_id == local.public_id() {
        reject(stream, local, ErrorCode::HandshakeRejected, "identity collision").await;
        return Err(HandshakeError::IdentityCollision);
    }
    let body: HandshakeInitBody = read_body(&packet.payload)?;
    Ok(InitRequest {
        peer: packet.sender_id,
        nonce: packet.nonce,
        body,
        deadline,
    })
}

/// Accept or refuse a HANDSHAKE_INIT. Revoked identities and key mismatches
/// get an ERROR frame and no session.
pub async fn accept<S>(
    stream: &mut S,
    local: &Identity,
    trust: &TrustStore,
    init: InitRequest,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = init.peer;
    if !trust.is_acceptable(&peer) {
        reject(stream, local, ErrorCode::Revoked, "identity is revoked").await;
        return Err(TrustError::Revoked(peer).into());
    }
    if let Err(e) = trust.observe(&peer, &peer) {
        reject(stream, local, ErrorCode::HandshakeRejected, "key does not match pin").await;
        return Err(e.into());
    }

    let local_id = local.public_id();
    let ephemeral = EphemeralKeys::generate();
    let ephemeral_public = ephemeral.public;
    let random = random_bytes();
    let transcript = Transcript {
        initiator: peer,
        responder: local_id,
        initiator_random: init.body.random,
        initiator_ephemeral: init.body.ephemeral,
        responder_random: random,
        responder_ephemeral: ephemeral_public,
    };
    let digest = transcript.digest();
    let shared = match ephemeral.agree(&init.body.ephemeral) {
        Ok(s) => s,
        Err(e) => {
            reject(stream, local, ErrorCode::HandshakeRejected, "bad ephemeral key").await;
            return Err(e.into());
        }
    };

    let ack = HandshakeAckBody {
        random,
        ephemeral: ephemeral_public,
        transcript_signature: local.sign(&digest),
    };
    send_plain(stream, local, PacketType::HandshakeAck, ack.as_bytes()).await?;

    let keys = derive_session(Role::Responder, &shared, &digest);
    let session_id = keys.session_id;
    let (send, mut recv) = keys.split();
    await_confirmation(stream, &peer, &mut recv, init.deadline).await?;
    tracing::debug!(peer = short_id(&peer), "handshake complete (responder)");
    Ok(Established {
        peer,
        session_id,
        send,
        recv,
    })
}

/// `read_init` followed by `accept`.
pub async fn respond<S>(
    stream: &mut S,
    local: &Identity,
    trust: &TrustStore,
    limit: Duration,
) -> Result<Established, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let init = read_init(stream, local, limit).await?;
    accept(stream, local, trust, init).await
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Encode, sign and write an unencrypted frame.
pub(crate) async fn send_plain<S>(
    stream: &mut S,
    local: &Identity,
    packet_type: PacketType,
    payload: &[u8],
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let frame = wire::encode(
        packet_type,
        Flags::NONE,
        &local.public_id(),
        &random_nonce(),
        payload,
        |bytes| local.sign(bytes),
    )?;
    write_frame(stream, &frame).await?;
    Ok(())
}

/// First sealed frame of a session: a PING with token 0.
async fn send_confirmation<S>(
    stream: &mut S,
    local: &Identity,
    send: &mut SendHalf,
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let local_id = local.public_id();
    let body = PingBody {
        token: U64::new(0),
    };
    let (nonce, ciphertext) = send.seal(PacketType::Ping.code(), &local_id, body.as_bytes())?;
    let frame = wire::encode(
        PacketType::Ping,
        Flags::ENCRYPTED,
        &local_id,
        &nonce,
        &ciphertext,
        |bytes| local.sign(bytes),
    )?;
    write_frame(stream, &frame).await?;
    Ok(())
}

/// Wait for the initiator's confirmation frame and open it with `recv`.
async fn await_confirmation<S>(
    stream: &mut S,
    peer: &NodeId,
    recv: &mut RecvHalf,
    deadline: Instant,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let packet = match next_packet(stream, deadline).await {
        Ok(packet) => packet,
        Err(HandshakeError::Timeout | HandshakeError::Closed) => {
            return Err(HandshakeError::Unconfirmed)
        }
        Err(e) => return Err(e),
    };
    if packet.sender_id != *peer
        || packet.packet_type != PacketType::Ping
        || !packet.flags.is_encrypted()
    {
        return Err(HandshakeError::Unconfirmed);
    }
    recv.open(
        packet.packet_type.code(),
        &packet.sender_id,
        &packet.nonce,
        &packet.payload,
    )
    .map_err(|_| HandshakeError::Unconfirmed)?;
    Ok(())
}

/// Best-effort ERROR before the caller drops the stream.
async fn reject<S>(stream: &mut S, local: &Identity, code: ErrorCode, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    let Ok(body) = message::to_json(&ErrorBody::new(code, reason)) else {
        return;
    };
    if let Err(e) = send_plain(stream, local, PacketType::Error, &body).await {
        tracing::debug!(error = %e, "failed to send handshake rejection");
    }
}

/// Next frame that decodes and verifies. Corrupt or forged frames are
/// dropped; the deadline still applies.
async fn next_packet<S>(stream: &mut S, deadline: Instant) -> Result<Packet, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let frame = timeout_at(deadline, read_frame(stream))
            .await
            .map_err(|_| HandshakeError::Timeout)??
            .ok_or(HandshakeError::Closed)?;
        match wire::decode(&frame, identity::verify) {
            Ok(packet) => return Ok(packet),
            Err(DecodeError::UnknownType(packet)) => {
                return Err(HandshakeError::Unexpected(packet.packet_type))
            }
            Err(e) => tracing::debug!(error = %e, "dropping frame during handshake"),
        }
    }
}
