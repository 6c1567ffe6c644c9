//! Cryptographic primitives for Archipel.
//!
//! Provides three things:
//!   1. BLAKE3 hashing — content hashes, chunk hashes, fingerprints, key derivation
//!   2. Session establishment — ephemeral X25519 agreement bound to a signed transcript
//!   3. Session transport — ChaCha20-Poly1305, one key per direction, replay windows
//!
//! Long-term identities are Ed25519 and live in `identity`. This module only
//! handles the ephemeral side and the symmetric session.
//!
//! All key material is zeroized on drop. There is no unsafe code in this module.

use std::collections::{HashSet, VecDeque};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::NodeId;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for content hashes, chunk hashes and identity fingerprints.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use archipel_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, archipel_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh random 12-byte packet nonce for unencrypted packets.
pub fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fresh random 32-byte value for handshake transcripts.
pub fn random_bytes() -> [u8; 32] {
    let mut out = [0u8; 32];
    OsRng.fill_bytes(&mut out);
    out
}

// ── Handshake ─────────────────────────────────────────────────────────────────

const TRANSCRIPT_CONTEXT: &str = "archipel v1 2024 handshake transcript";
const KEY_I2R_CONTEXT: &str = "archipel v1 2024 session key initiator to responder";
const KEY_R2I_CONTEXT: &str = "archipel v1 2024 session key responder to initiator";
const SESSION_ID_CONTEXT: &str = "archipel v1 2024 session id";

/// Which end of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// A one-shot X25519 keypair. Generated per handshake, consumed by `agree`.
pub struct EphemeralKeys {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl EphemeralKeys {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Diffie-Hellman with the peer's ephemeral public key.
    ///
    /// Rejects low-order points: a peer that forces the all-zero shared
    /// secret does not get a session.
    pub fn agree(self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

/// The values both ends of a handshake contributed, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub initiator: NodeId,
    pub responder: NodeId,
    pub initiator_random: [u8; 32],
    pub initiator_ephemeral: [u8; 32],
    pub responder_random: [u8; 32],
    pub responder_ephemeral: [u8; 32],
}

impl Transcript {
    /// Digest signed by the responder and mixed into every session key.
    pub fn digest(&self) -> [u8; 32] {
        let mut h = blake3::Hasher::new_derive_key(TRANSCRIPT_CONTEXT);
        h.update(&self.initiator);
        h.update(&self.responder);
        h.update(&self.initiator_random);
        h.update(&self.initiator_ephemeral);
        h.update(&self.responder_random);
        h.update(&self.responder_ephemeral);
        *h.finalize().as_bytes()
    }
}

/// Keys for one established session, from one side's point of view.
pub struct SessionKeys {
    pub session_id: [u8; 32],
    send: Zeroizing<[u8; 32]>,
    recv: Zeroizing<[u8; 32]>,
}

/// Derive both direction keys from the shared secret and transcript digest.
///
/// Both ends call this with the same inputs and their own `role`; the
/// initiator's send key is the responder's receive key and vice versa.
pub fn derive_session(role: Role, shared: &[u8; 32], transcript_digest: &[u8; 32]) -> SessionKeys {
    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm[..32].copy_from_slice(shared);
    ikm[32..].copy_from_slice(transcript_digest);

    let i2r = Zeroizing::new(blake3::derive_key(KEY_I2R_CONTEXT, &ikm[..]));
    let r2i = Zeroizing::new(blake3::derive_key(KEY_R2I_CONTEXT, &ikm[..]));
    let session_id = blake3::derive_key(SESSION_ID_CONTEXT, &ikm[..]);

    let (send, recv) = match role {
        Role::Initiator => (i2r, r2i),
        Role::Responder => (r2i, i2r),
    };
    SessionKeys {
        session_id,
        send,
        recv,
    }
}

impl SessionKeys {
    /// Split into independently owned halves so a reader task and a writer
    /// task can each hold one without sharing a lock.
    pub fn split(self) -> (SendHalf, RecvHalf) {
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&self.session_id[..4]);
        (
            SendHalf {
                cipher: ChaCha20Poly1305::new(Key::from_slice(&self.send[..])),
                prefix,
                counter: 0,
            },
            RecvHalf {
                cipher: ChaCha20Poly1305::new(Key::from_slice(&self.recv[..])),
                prefix,
                window: ReplayWindow::new(),
            },
        )
    }
}

// ── Session transport ─────────────────────────────────────────────────────────

/// AEAD associated data: the packet type and sender, so a ciphertext cannot
/// be replayed under a different header.
fn associated_data(packet_type: u8, sender_id: &NodeId) -> [u8; 33] {
    let mut aad = [0u8; 33];
    aad[0] = packet_type;
    aad[1..].copy_from_slice(sender_id);
    aad
}

/// Encrypting half of a session.
///
/// Packet nonce = 4-byte session prefix ∥ 8-byte big-endian counter. The
/// counter never repeats under this key; exhaustion is an error, not a wrap.
pub struct SendHalf {
    cipher: ChaCha20Poly1305,
    prefix: [u8; 4],
    counter: u64,
}

impl SendHalf {
    /// Encrypt `plaintext`. Returns the packet nonce to place in the header
    /// and the ciphertext (plaintext + 16-byte tag) to use as payload.
    pub fn seal(
        &mut self,
        packet_type: u8,
        sender_id: &NodeId,
        plaintext: &[u8],
    ) -> Result<([u8; 12], Vec<u8>), CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;

        let aad = associated_data(packet_type, sender_id);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Aead)?;
        Ok((nonce, ciphertext))
    }
}

/// Decrypting half of a session. Owns the replay window for its direction.
pub struct RecvHalf {
    cipher: ChaCha20Poly1305,
    prefix: [u8; 4],
    window: ReplayWindow,
}

impl RecvHalf {
    /// Verify and decrypt. Rejects foreign prefixes, replayed or too-old
    /// counters, and tag failures. The window only advances on success.
    pub fn open(
        &mut self,
        packet_type: u8,
        sender_id: &NodeId,
        nonce: &[u8; 12],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        if nonce[..4] != self.prefix {
            return Err(CryptoError::ForeignNonce);
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&nonce[4..]);
        let counter = u64::from_be_bytes(counter_bytes);

        if !self.window.check(counter) {
            return Err(CryptoError::Replay);
        }

        let aad = associated_data(packet_type, sender_id);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Aead)?;

        self.window.mark(counter);
        Ok(plaintext)
    }
}

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Sliding-window replay protection (RFC 6479 style).
///
/// Tracks the highest seen counter and a bitmap of the last 2048 counters.
/// Rejects duplicates and counters that fall behind the window.
const WINDOW_SIZE: u64 = 2048;

pub struct ReplayWindow {
    highest: u64,
    bitmap: Vec<u64>, // 2048 bits = 32 u64s
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: vec![0u64; (WINDOW_SIZE / 64) as usize],
        }
    }

    /// Returns true if the counter is acceptable (not replayed, not too old).
    pub fn check(&self, counter: u64) -> bool {
        if counter.saturating_add(WINDOW_SIZE) <= self.highest {
            return false; // too old
        }
        if counter > self.highest {
            return true; // ahead of window
        }
        let diff = self.highest - counter;
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Mark a counter as seen. Call after successful decrypt.
    pub fn mark(&mut self, counter: u64) {
        if counter > self.highest {
            let shift = counter - self.highest;
            self.shift_window(shift);
            self.highest = counter;
        }
        let diff = self.highest - counter;
        if diff >= WINDOW_SIZE {
            return;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] |= 1u64 << bit;
    }

    fn shift_window(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap.fill(0);
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;
        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            for w in &mut self.bitmap[..word_shift] {
                *w = 0;
            }
        }
        if bit_shift > 0 {
            let len = self.bitmap.len();
            for i in (1..len).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] << bit_shift) | (self.bitmap[i - 1] >> (64 - bit_shift));
            }
            self.bitmap[0] <<= bit_shift;
        }
    }
}

// ── Nonce Cache ───────────────────────────────────────────────────────────────

/// Bounded memory of recently seen `(sender_id, nonce)` pairs for packets
/// that travel outside a session (HELLO, handshake, PING/PONG, REVOKE).
///
/// Oldest entries are forgotten first once `capacity` is reached.
pub struct NonceCache {
    capacity: usize,
    order: VecDeque<(NodeId, [u8; 12])>,
    seen: HashSet<(NodeId, [u8; 12])>,
}

impl NonceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record the pair. Returns false if it was already present (a replay).
    pub fn insert(&mut self, sender_id: &NodeId, nonce: &[u8; 12]) -> bool {
        let key = (*sender_id, *nonce);
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(key);
        self.seen.insert(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("X25519 agreement produced a non-contributory shared secret")]
    NonContributory,

    #[error("AEAD seal or open failed")]
    Aead,

    #[error("ciphertext shorter than the 16-byte tag")]
    TooShort,

    #[error("nonce prefix does not belong to this session")]
    ForeignNonce,

    #[error("replayed or too-old nonce")]
    Replay,

    #[error("send counter exhausted; session must be re-established")]
    NonceExhausted,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(a: &EphemeralKeys, b: &EphemeralKeys) -> Transcript {
        Transcript {
            initiator: [0xA1; 32],
            responder: [0xB2; 32],
            initiator_random: [1; 32],
            initiator_ephemeral: a.public,
            responder_random: [2; 32],
            responder_ephemeral: b.public,
        }
    }

    /// Helper: run both sides of the key agreement and return
    /// (initiator send, initiator recv, responder send, responder recv).
    fn established() -> (SendHalf, RecvHalf, SendHalf, RecvHalf) {
        let i_eph = EphemeralKeys::generate();
        let r_eph = EphemeralKeys::generate();
        let digest = transcript(&i_eph, &r_eph).digest();
        let r_public = r_eph.public;
        let i_public = i_eph.public;

        let i_shared = i_eph.agree(&r_public).unwrap();
        let r_shared = r_eph.agree(&i_public).unwrap();
        assert_eq!(*i_shared, *r_shared);

        let i_keys = derive_session(Role::Initiator, &i_shared, &digest);
        let r_keys = derive_session(Role::Responder, &r_shared, &digest);
        assert_eq!(i_keys.session_id, r_keys.session_id);

        let (i_send, i_recv) = i_keys.split();
        let (r_send, r_recv) = r_keys.split();
        (i_send, i_recv, r_send, r_recv)
    }

    const ALICE: NodeId = [0xA1; 32];
    const BOB: NodeId = [0xB2; 32];

    // ── BLAKE3 ────────────────────────────────────────────────────────────────

    #[test]
    fn hash_known_vector() {
        // BLAKE3 official test vector for the empty input
        let expected = [
            0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc,
            0xc9, 0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca,
            0xe4, 0x1f, 0x32, 0x62,
        ];
        assert_eq!(hash(b""), expected);
    }

    #[test]
    fn incremental_hasher_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"hello ");
        h.update(b"world");
        assert_eq!(h.finalize(), hash(b"hello world"));
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    #[test]
    fn transcript_digest_binds_every_field() {
        let a = EphemeralKeys::generate();
        let b = EphemeralKeys::generate();
        let base = transcript(&a, &b);
        let mut swapped = base.clone();
        swapped.initiator_random = [9; 32];
        assert_ne!(base.digest(), swapped.digest());
        let mut roles = base.clone();
        std::mem::swap(&mut roles.initiator, &mut roles.responder);
        assert_ne!(base.digest(), roles.digest());
    }

    #[test]
    fn low_order_point_is_rejected() {
        let eph = EphemeralKeys::generate();
        assert_eq!(eph.agree(&[0u8; 32]).unwrap_err(), CryptoError::NonContributory);
    }

    #[test]
    fn direction_keys_differ() {
        let shared = [7u8; 32];
        let digest = [8u8; 32];
        let i = derive_session(Role::Initiator, &shared, &digest);
        assert_ne!(*i.send, *i.recv);
    }

    // ── Transport ─────────────────────────────────────────────────────────────

    #[test]
    fn seal_open_both_directions() {
        let (mut i_send, mut i_recv, mut r_send, mut r_recv) = established();

        let (nonce, ct) = i_send.seal(0x10, &ALICE, b"ping").unwrap();
        assert_eq!(ct.len(), 4 + TAG_LEN);
        assert_eq!(r_recv.open(0x10, &ALICE, &nonce, &ct).unwrap(), b"ping");

        let (nonce, ct) = r_send.seal(0x10, &BOB, b"pong").unwrap();
        assert_eq!(i_recv.open(0x10, &BOB, &nonce, &ct).unwrap(), b"pong");
    }

    #[test]
    fn nonces_are_unique_per_packet() {
        let (mut i_send, _, _, _) = established();
        let (n0, _) = i_send.seal(0x10, &ALICE, b"a").unwrap();
        let (n1, _) = i_send.seal(0x10, &ALICE, b"a").unwrap();
        assert_ne!(n0, n1);
        assert_eq!(&n1[4..], &1u64.to_be_bytes());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (mut i_send, _, _, mut r_recv) = established();
        let (nonce, mut ct) = i_send.seal(0x22, &ALICE, b"important data").unwrap();
        ct[3] ^= 0xFF;
        assert_eq!(r_recv.open(0x22, &ALICE, &nonce, &ct), Err(CryptoError::Aead));
    }

    #[test]
    fn header_rebinding_is_rejected() {
        let (mut i_send, _, _, mut r_recv) = established();
        let (nonce, ct) = i_send.seal(0x10, &ALICE, b"hi").unwrap();
        assert_eq!(r_recv.open(0x20, &ALICE, &nonce, &ct), Err(CryptoError::Aead));
        assert_eq!(r_recv.open(0x10, &BOB, &nonce, &ct), Err(CryptoError::Aead));
        // The window did not advance on failure, so the genuine packet still opens.
        assert!(r_recv.open(0x10, &ALICE, &nonce, &ct).is_ok());
    }

    #[test]
    fn replayed_packet_is_rejected() {
        let (mut i_send, _, _, mut r_recv) = established();
        let (nonce, ct) = i_send.seal(0x10, &ALICE, b"once only").unwrap();
        r_recv.open(0x10, &ALICE, &nonce, &ct).unwrap();
        assert_eq!(r_recv.open(0x10, &ALICE, &nonce, &ct), Err(CryptoError::Replay));
    }

    #[test]
    fn out_of_order_open() {
        let (mut i_send, _, _, mut r_recv) = established();
        let p0 = i_send.seal(0x10, &ALICE, b"msg0").unwrap();
        let p1 = i_send.seal(0x10, &ALICE, b"msg1").unwrap();
        let p2 = i_send.seal(0x10, &ALICE, b"msg2").unwrap();

        assert_eq!(r_recv.open(0x10, &ALICE, &p2.0, &p2.1).unwrap(), b"msg2");
        assert_eq!(r_recv.open(0x10, &ALICE, &p0.0, &p0.1).unwrap(), b"msg0");
        assert_eq!(r_recv.open(0x10, &ALICE, &p1.0, &p1.1).unwrap(), b"msg1");
    }

    #[test]
    fn other_session_nonce_is_foreign() {
        let (mut a_send, _, _, _) = established();
        let (_, _, _, mut other_recv) = established();
        let (nonce, ct) = a_send.seal(0x10, &ALICE, b"x").unwrap();
        assert!(matches!(
            other_recv.open(0x10, &ALICE, &nonce, &ct),
            Err(CryptoError::ForeignNonce) | Err(CryptoError::Aead)
        ));
    }

    #[test]
    fn too_short_ciphertext_rejected() {
        let (_, _, _, mut r_recv) = established();
        assert_eq!(
            r_recv.open(0x10, &ALICE, &[0u8; 12], &[0u8; 10]),
            Err(CryptoError::TooShort)
        );
    }

    // ── ReplayWindow ─────────────────────────────────────────────────────────

    #[test]
    fn replay_window_accepts_sequential_counters() {
        let mut w = ReplayWindow::new();
        for i in 0..100 {
            assert!(w.check(i), "counter {i} should be accepted");
            w.mark(i);
        }
    }

    #[test]
    fn replay_window_rejects_duplicate() {
        let mut w = ReplayWindow::new();
        w.mark(5);
        assert!(!w.check(5), "duplicate counter 5 should be rejected");
    }

    #[test]
    fn replay_window_rejects_too_old() {
        let mut w = ReplayWindow::new();
        w.mark(WINDOW_SIZE + 100);
        assert!(!w.check(0), "counter 0 should be too old");
    }

    #[test]
    fn replay_window_remembers_across_shift() {
        let mut w = ReplayWindow::new();
        w.mark(10);
        w.mark(75);
        assert!(!w.check(10), "counter 10 must still be remembered");
        assert!(w.check(11));
    }

    #[test]
    fn replay_window_advancement() {
        let mut w = ReplayWindow::new();
        for i in 0..10 {
            w.mark(i);
        }
        w.mark(5000);
        assert!(!w.check(0));
        assert!(w.check(4999));
    }

    // ── NonceCache ───────────────────────────────────────────────────────────

    #[test]
    fn nonce_cache_detects_replay() {
        let mut cache = NonceCache::new(8);
        assert!(cache.insert(&ALICE, &[1; 12]));
        assert!(!cache.insert(&ALICE, &[1; 12]));
        assert!(cache.insert(&BOB, &[1; 12]), "nonces are per sender");
    }

    #[test]
    fn nonce_cache_is_bounded() {
        let mut cache = NonceCache::new(2);
        cache.insert(&ALICE, &[1; 12]);
        cache.insert(&ALICE, &[2; 12]);
        cache.insert(&ALICE, &[3; 12]);
        assert_eq!(cache.len(), 2);
        // The oldest entry was forgotten.
        assert!(cache.insert(&ALICE, &[1; 12]));
    }
}
