//! ARCK v1 wire format — the framing every Archipel packet travels in.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format. Changing anything here is a breaking change
//! and requires a new `VERSION`.
//!
//! Frame layout:
//!
//! ```text
//! 0      4   5   6   7         11        15             47       59          59+n      123+n
//! | magic |ver|typ|flg|payload_len|checksum|  sender_id   | nonce  |  payload  | signature |
//! ```
//!
//! The checksum covers the header (minus the checksum field itself), the
//! payload and nothing else; the signature covers every byte before it,
//! checksum included. A receiver can therefore reject corrupt frames on the
//! cheap checksum before spending cycles on Ed25519.
//!
//! Fixed-layout structs are `#[repr(C, packed)]` with zerocopy derives and
//! big-endian integer fields. There is no unsafe code in this module.

use std::net::Ipv4Addr;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::NodeId;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Frame magic.
pub const MAGIC: [u8; 4] = *b"ARCK";

/// Current wire format version.
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 59;

/// Trailing Ed25519 signature size in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Smallest valid frame: header, empty payload, signature.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + SIGNATURE_LEN;

/// Largest payload a receiver will accept.
pub const MAX_PAYLOAD: usize = 2 * 1024 * 1024;

/// Largest chunk a manifest may declare. Leaves room for the CHUNK_DATA
/// prefix and the AEAD tag inside `MAX_PAYLOAD`.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Multicast group for HELLO announcements.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// UDP port HELLO announcements are sent to and received on.
pub const DISCOVERY_PORT: u16 = 6000;

/// TCP port for the per-peer transfer channel.
pub const TCP_PORT: u16 = 7777;

/// Default HELLO interval in seconds.
pub const HELLO_INTERVAL_SECS: u64 = 30;

// Byte offsets used by the checksum and the stream reader.
const CHECKSUM_START: usize = 11;
const CHECKSUM_END: usize = 15;

// ── Packet Header ─────────────────────────────────────────────────────────────

/// The 59-byte header that opens every frame.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// Always `MAGIC`.
    pub magic: [u8; 4],

    /// Always `VERSION`. Frames carrying another version are malformed.
    pub version: u8,

    /// Packet type code, see `PacketType`.
    pub packet_type: u8,

    /// Bit flags, see `Flags`.
    pub flags: u8,

    /// Payload length in bytes, not counting header or signature.
    pub payload_len: U32<BigEndian>,

    /// First four bytes of BLAKE3 over the frame minus this field and the signature.
    pub checksum: [u8; 4],

    /// Ed25519 public key of the sender. Doubles as the node identity.
    pub sender_id: [u8; 32],

    /// Unique per packet for this sender. Used as the AEAD nonce on
    /// encrypted packets.
    pub nonce: [u8; 12],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; HEADER_LEN]);

// ── Packet Type ───────────────────────────────────────────────────────────────

/// Packet type codes.
///
/// Closed set with an explicit `Unknown` variant: codes from a newer peer are
/// carried through decode untouched so higher layers decide what to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Hello,
    PeerList,
    HandshakeInit,
    HandshakeAck,
    Message,
    FileManifest,
    ChunkRequest,
    ChunkData,
    ChunkAck,
    Ping,
    Pong,
    Revoke,
    Error,
    Unknown(u8),
}

impl PacketType {
    pub fn code(self) -> u8 {
        match self {
            PacketType::Hello => 0x01,
            PacketType::PeerList => 0x02,
            PacketType::HandshakeInit => 0x03,
            PacketType::HandshakeAck => 0x04,
            PacketType::Message => 0x10,
            PacketType::FileManifest => 0x20,
            PacketType::ChunkRequest => 0x21,
            PacketType::ChunkData => 0x22,
            PacketType::ChunkAck => 0x23,
            PacketType::Ping => 0xF0,
            PacketType::Pong => 0xF1,
            PacketType::Revoke => 0xFE,
            PacketType::Error => 0xFF,
            PacketType::Unknown(code) => code,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, PacketType::Unknown(_))
    }

    /// Packets that only travel inside an established, encrypted session.
    pub fn requires_session(self) -> bool {
        matches!(
            self,
            PacketType::PeerList
                | PacketType::Message
                | PacketType::FileManifest
                | PacketType::ChunkRequest
                | PacketType::ChunkData
                | PacketType::ChunkAck
        )
    }
}

impl From<u8> for PacketType {
    fn from(code: u8) -> Self {
        match code {
            0x01 => PacketType::Hello,
            0x02 => PacketType::PeerList,
            0x03 => PacketType::HandshakeInit,
            0x04 => PacketType::HandshakeAck,
            0x10 => PacketType::Message,
            0x20 => PacketType::FileManifest,
            0x21 => PacketType::ChunkRequest,
            0x22 => PacketType::ChunkData,
            0x23 => PacketType::ChunkAck,
            0xF0 => PacketType::Ping,
            0xF1 => PacketType::Pong,
            0xFE => PacketType::Revoke,
            0xFF => PacketType::Error,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t.code()
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Header flag bits. Unknown bits are preserved, not rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);

    /// Payload is AEAD ciphertext under the session key.
    pub const ENCRYPTED: Flags = Flags(0x01);

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_encrypted(self) -> bool {
        self.contains(Flags::ENCRYPTED)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded, checksum- and signature-verified packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub flags: Flags,
    pub sender_id: NodeId,
    pub nonce: [u8; 12],
    /// Opaque bytes; ciphertext when `flags.is_encrypted()`.
    pub payload: Bytes,
    pub signature: [u8; 64],
}

/// Encode a frame.
///
/// `sign` receives every byte that precedes the signature and returns the
/// 64-byte Ed25519 signature over them. Encoding is deterministic for a
/// deterministic signer.
pub fn encode<F>(
    packet_type: PacketType,
    flags: Flags,
    sender_id: &NodeId,
    nonce: &[u8; 12],
    payload: &[u8],
    sign: F,
) -> Result<Vec<u8>, WireError>
where
    F: FnOnce(&[u8]) -> [u8; 64],
{
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let header = PacketHeader {
        magic: MAGIC,
        version: VERSION,
        packet_type: packet_type.code(),
        flags: flags.bits(),
        payload_len: U32::new(payload.len() as u32),
        checksum: [0u8; 4],
        sender_id: *sender_id,
        nonce: *nonce,
    };

    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);

    let checksum = compute_checksum(&frame);
    frame[CHECKSUM_START..CHECKSUM_END].copy_from_slice(&checksum);

    let signature = sign(&frame);
    frame.extend_from_slice(&signature);
    Ok(frame)
}

/// Decode and verify a frame.
///
/// Checks run cheapest first: header shape, checksum, then `verify`, which
/// receives `(sender_id, signed_bytes, signature)`. Only after both checks
/// pass is the type byte interpreted; an unrecognised type comes back as
/// `DecodeError::UnknownType` carrying the verified packet.
pub fn decode<F>(bytes: &[u8], verify: F) -> Result<Packet, DecodeError>
where
    F: FnOnce(&NodeId, &[u8], &[u8; 64]) -> bool,
{
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::MalformedHeader(HeaderFault::TooShort(bytes.len())));
    }

    let header = PacketHeader::read_from_prefix(bytes)
        .ok_or(DecodeError::MalformedHeader(HeaderFault::TooShort(bytes.len())))?;
    let payload_len = check_header(&header)?;

    let expected = MIN_FRAME_LEN + payload_len;
    if expected != bytes.len() {
        return Err(DecodeError::MalformedHeader(HeaderFault::LengthMismatch {
            declared: payload_len,
            available: bytes.len().saturating_sub(MIN_FRAME_LEN),
        }));
    }

    let signed_end = HEADER_LEN + payload_len;
    let signed = &bytes[..signed_end];

    let checksum = header.checksum;
    if compute_checksum(signed) != checksum {
        return Err(DecodeError::ChecksumMismatch);
    }

    let mut signature = [0u8; 64];
    signature.copy_from_slice(&bytes[signed_end..]);
    let sender_id = header.sender_id;
    if !verify(&sender_id, signed, &signature) {
        return Err(DecodeError::BadSignature);
    }

    let packet = Packet {
        packet_type: PacketType::from(header.packet_type),
        flags: Flags::from_bits(header.flags),
        sender_id,
        nonce: header.nonce,
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..signed_end]),
        signature,
    };

    if packet.packet_type.is_known() {
        Ok(packet)
    } else {
        Err(DecodeError::UnknownType(Box::new(packet)))
    }
}

/// Total frame length announced by a header, for stream readers that must
/// know how many more bytes to pull before calling `decode`.
///
/// Only the faults that make the length untrustworthy are reported here: a
/// bad magic or an oversized payload. Any other header fault (an unknown
/// version) still yields a length, so the reader can pull the whole frame and
/// let `decode` drop it without losing stream sync.
pub fn frame_len(header: &[u8; HEADER_LEN]) -> Result<usize, DecodeError> {
    let header = PacketHeader::read_from(&header[..])
        .ok_or(DecodeError::MalformedHeader(HeaderFault::TooShort(HEADER_LEN)))?;
    let magic = header.magic;
    if magic != MAGIC {
        return Err(DecodeError::MalformedHeader(HeaderFault::BadMagic(magic)));
    }
    let payload_len = header.payload_len.get() as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(DecodeError::MalformedHeader(HeaderFault::Oversized(payload_len)));
    }
    Ok(MIN_FRAME_LEN + payload_len)
}

fn check_header(header: &PacketHeader) -> Result<usize, DecodeError> {
    let magic = header.magic;
    if magic != MAGIC {
        return Err(DecodeError::MalformedHeader(HeaderFault::BadMagic(magic)));
    }
    let version = header.version;
    if version != VERSION {
        return Err(DecodeError::MalformedHeader(HeaderFault::BadVersion(version)));
    }
    let payload_len = header.payload_len.get() as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(DecodeError::MalformedHeader(HeaderFault::Oversized(payload_len)));
    }
    Ok(payload_len)
}

/// Checksum over `header ∥ payload` with the checksum field skipped.
fn compute_checksum(frame_without_signature: &[u8]) -> [u8; 4] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&frame_without_signature[..CHECKSUM_START]);
    hasher.update(&frame_without_signature[CHECKSUM_END..]);
    let digest = hasher.finalize();
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    out
}

// ── Payload Bodies ────────────────────────────────────────────────────────────

/// HELLO payload. Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HelloBody {
    /// TCP port the sender accepts transfer connections on.
    pub tcp_port: U16<BigEndian>,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: U64<BigEndian>,
}

assert_eq_size!(HelloBody, [u8; 12]);

/// HANDSHAKE_INIT payload. Wire size: 64 bytes.
///
/// The initiator's identity is the frame's `sender_id`; the packet signature
/// binds it to these values.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeInitBody {
    /// Fresh random value, part of the transcript.
    pub random: [u8; 32],
    /// Ephemeral X25519 public key.
    pub ephemeral: [u8; 32],
}

assert_eq_size!(HandshakeInitBody, [u8; 64]);

/// HANDSHAKE_ACK payload. Wire size: 128 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeAckBody {
    /// Responder's fresh random value.
    pub random: [u8; 32],
    /// Responder's ephemeral X25519 public key.
    pub ephemeral: [u8; 32],
    /// Responder's long-term signature over the full handshake transcript.
    /// Binds this ACK to the initiator's values so an old ACK cannot be replayed.
    pub transcript_signature: [u8; 64],
}

assert_eq_size!(HandshakeAckBody, [u8; 128]);

/// CHUNK_REQUEST and CHUNK_ACK payload, and the prefix of CHUNK_DATA.
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkRef {
    /// Whole-file content hash naming the manifest.
    pub content_hash: [u8; 32],
    /// Zero-based chunk index within the manifest.
    pub index: U32<BigEndian>,
}

assert_eq_size!(ChunkRef, [u8; 36]);

impl ChunkRef {
    pub fn new(content_hash: [u8; 32], index: u32) -> Self {
        Self {
            content_hash,
            index: U32::new(index),
        }
    }

    pub fn chunk_index(&self) -> u32 {
        self.index.get()
    }
}

/// PING / PONG payload. Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PingBody {
    /// Opaque token; PONG echoes the PING's token.
    pub token: U64<BigEndian>,
}

assert_eq_size!(PingBody, [u8; 8]);

/// REVOKE payload. Wire size: 136 bytes.
///
/// A self-contained certificate: it stays valid when relayed by a peer other
/// than the one it revokes.
#[derive(Debug, Clone, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RevocationBody {
    /// Identity being revoked.
    pub identity: [u8; 32],
    /// Identity that signed the certificate. Equal to `identity` for self-revocation.
    pub signer: [u8; 32],
    /// Issue time, milliseconds since the Unix epoch.
    pub issued_at_ms: U64<BigEndian>,
    /// Signer's Ed25519 signature over `signed_message()`.
    pub signature: [u8; 64],
}

assert_eq_size!(RevocationBody, [u8; 136]);

/// Domain separator for revocation signatures.
const REVOCATION_CONTEXT: &[u8; 16] = b"archipel/revoke1";

impl RevocationBody {
    /// Bytes covered by `signature`.
    pub fn signed_message(identity: &NodeId, signer: &NodeId, issued_at_ms: u64) -> [u8; 88] {
        let mut msg = [0u8; 88];
        msg[..16].copy_from_slice(REVOCATION_CONTEXT);
        msg[16..48].copy_from_slice(identity);
        msg[48..80].copy_from_slice(signer);
        msg[80..].copy_from_slice(&issued_at_ms.to_be_bytes());
        msg
    }

    pub fn message(&self) -> [u8; 88] {
        Self::signed_message(&self.identity, &self.signer, self.issued_at_ms.get())
    }

    pub fn is_self_signed(&self) -> bool {
        self.identity == self.signer
    }
}

/// Parse a fixed-size body, rejecting trailing bytes.
pub fn read_body<T: FromBytes>(payload: &[u8]) -> Result<T, WireError> {
    T::read_from(payload).ok_or(WireError::BadBodyLength {
        expected: std::mem::size_of::<T>(),
        actual: payload.len(),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderFault {
    #[error("frame of {0} bytes is shorter than the 123 byte minimum")]
    TooShort(usize),

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported version 0x{0:02x}")]
    BadVersion(u8),

    #[error("declared payload length {0} exceeds maximum")]
    Oversized(usize),

    #[error("declared payload length {declared} but {available} bytes present")]
    LengthMismatch { declared: usize, available: usize },
}

/// Decode-time failures. All are non-fatal to the connection that carried
/// the frame: the packet is dropped and processing continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed header: {0}")]
    MalformedHeader(HeaderFault),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("signature verification failed")]
    BadSignature,

    #[error("unknown packet type 0x{:02x}", .0.packet_type.code())]
    UnknownType(Box<Packet>),
}

/// Errors that arise when building or interpreting payload bodies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload length {0} exceeds maximum")]
    PayloadTooLarge(usize),

    #[error("body length {actual} does not match expected {expected}")]
    BadBodyLength { expected: usize, actual: usize },

    #[error("unexpected packet type 0x{0:02x}")]
    UnexpectedType(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
