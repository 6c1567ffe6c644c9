//! Trust store — trust-on-first-use key pinning with permanent revocation.
//!
//! Three states per identity:
//! - Unverified: pinned on first contact, allowed to talk (the default)
//! - Trusted:    promoted by an explicit user action after out-of-band checking
//! - Revoked:    terminal; handshakes refused, sessions torn down
//!
//! Entries are never deleted and a pinned key is never overwritten. The only
//! ways an entry changes state are `promote` and a valid `revoke`, and
//! nothing leaves `Revoked`.

use std::sync::Arc;

use archipel_core::identity;
use archipel_core::message::hex32;
use archipel_core::wire::RevocationBody;
use archipel_core::{short_id, unix_secs, NodeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::{Persistence, SaveOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    Unverified,
    Trusted,
    Revoked,
}

/// One record per identity ever observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    #[serde(with = "hex32")]
    pub identity: NodeId,
    /// Equal to `identity` for keys pinned by this version; stored separately
    /// so a rotated key shows up as a mismatch instead of a new peer.
    #[serde(with = "hex32")]
    pub pinned_key: [u8; 32],
    pub state: TrustState,
    /// Unix seconds.
    pub first_seen: u64,
    pub last_verified: u64,
    /// Who signed the revocation, when revoked.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex32::option")]
    pub revoked_by: Option<NodeId>,
}

impl TrustEntry {
    fn pinned(identity: NodeId, key: [u8; 32]) -> Self {
        let now = unix_secs();
        Self {
            identity,
            pinned_key: key,
            state: TrustState::Unverified,
            first_seen: now,
            last_verified: now,
            revoked_by: None,
        }
    }
}

/// Result of a successful `observe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First contact; a new Unverified entry now pins the key.
    Pinned,
    /// Known identity presenting its pinned key.
    Known(TrustState),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrustPolicy {
    /// Accept revocations signed by a Trusted third party.
    pub allow_introducer_revocation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    #[error("peer {} presented a key different from the pinned one", short_id(.identity))]
    KeyMismatch {
        identity: NodeId,
        pinned: [u8; 32],
        presented: [u8; 32],
    },

    #[error("peer {} is revoked", short_id(.0))]
    Revoked(NodeId),

    #[error("peer {} is not known", short_id(.0))]
    Unknown(NodeId),

    #[error("revocation signature does not verify")]
    BadRevocation,

    #[error("revocation signer {} is not allowed to revoke {}", short_id(.signer), short_id(.identity))]
    UnauthorizedRevoker { identity: NodeId, signer: NodeId },
}

/// Identity → pinned key + trust state.
///
/// Cheap to clone; clones share the same table. When constructed with a
/// persistence collaborator, the table is saved on every state change.
#[derive(Clone)]
pub struct TrustStore {
    entries: Arc<DashMap<NodeId, TrustEntry>>,
    policy: TrustPolicy,
    persistence: Option<Arc<dyn Persistence>>,
    save_order: Arc<SaveOrder>,
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new(TrustPolicy::default())
    }
}

impl TrustStore {
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            policy,
            persistence: None,
            save_order: Arc::default(),
        }
    }

    /// Create a store backed by `persistence`, loading whatever it holds.
    pub fn with_persistence(
        policy: TrustPolicy,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, crate::persist::PersistError> {
        let entries = DashMap::new();
        let loaded = persistence.load_trust_store()?;
        let count = loaded.len();
        for entry in loaded {
            entries.insert(entry.identity, entry);
        }
        if count > 0 {
            tracing::info!(count, "loaded persisted trust entries");
        }
        Ok(Self {
            entries: Arc::new(entries),
            policy,
            persistence: Some(persistence),
            save_order: Arc::default(),
        })
    }

    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// Record that `identity` was seen presenting `key`.
    ///
    /// Unknown identities are pinned as Unverified. A known identity with a
    /// different key is a `KeyMismatch`; the pin is left untouched.
    pub fn observe(&self, identity: &NodeId, key: &[u8; 32]) -> Result<Observation, TrustError> {
        let outcome = match self.entries.entry(*identity) {
            Entry::Vacant(slot) => {
                slot.insert(TrustEntry::pinned(*identity, *key));
                Observation::Pinned
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.pinned_key != *key {
                    return Err(TrustError::KeyMismatch {
                        identity: *identity,
                        pinned: entry.pinned_key,
                        presented: *key,
                    });
                }
                entry.last_verified = unix_secs();
                return Ok(Observation::Known(entry.state));
            }
        };
        // Entry guard is released; saving iterates the table.
        tracing::info!(peer = short_id(identity), "pinned new peer key");
        self.save();
        Ok(outcome)
    }

    /// Unverified → Trusted. Trusted stays Trusted. Revoked stays Revoked.
    pub fn promote(&self, identity: &NodeId) -> Result<TrustState, TrustError> {
        {
            let mut entry = self
                .entries
                .get_mut(identity)
                .ok_or(TrustError::Unknown(*identity))?;
            match entry.state {
                TrustState::Revoked => return Err(TrustError::Revoked(*identity)),
                TrustState::Trusted => return Ok(TrustState::Trusted),
                TrustState::Unverified => entry.state = TrustState::Trusted,
            }
        }
        tracing::info!(peer = short_id(identity), "peer promoted to trusted");
        self.save();
        Ok(TrustState::Trusted)
    }

    /// Apply a revocation certificate.
    ///
    /// Accepted when it verifies and is either self-signed or, under the
    /// introducer policy, signed by a Trusted peer. Returns `true` when the
    /// identity became Revoked now, `false` if it already was. An unknown
    /// identity gets a Revoked entry so a later first contact is refused.
    pub fn revoke(&self, cert: &RevocationBody) -> Result<bool, TrustError> {
        if !identity::verify_revocation(cert) {
            return Err(TrustError::BadRevocation);
        }
        let target = cert.identity;
        let signer = cert.signer;
        if !cert.is_self_signed() {
            let signer_trusted = self.state(&signer) == Some(TrustState::Trusted);
            if !(self.policy.allow_introducer_revocation && signer_trusted) {
                return Err(TrustError::UnauthorizedRevoker {
                    identity: target,
                    signer,
                });
            }
        }

        let newly = {
            let mut entry = self
                .entries
                .entry(target)
                .or_insert_with(|| TrustEntry::pinned(target, target));
            if entry.state == TrustState::Revoked {
                false
            } else {
                entry.state = TrustState::Revoked;
                entry.revoked_by = Some(signer);
                true
            }
        };
        if newly {
            tracing::warn!(
                peer = short_id(&target),
                signer = short_id(&signer),
                "peer revoked"
            );
            self.save();
        }
        Ok(newly)
    }

    /// False iff the identity is revoked. Unknown identities are acceptable.
    pub fn is_acceptable(&self, identity: &NodeId) -> bool {
        self.state(identity) != Some(TrustState::Revoked)
    }

    pub fn state(&self, identity: &NodeId) -> Option<TrustState> {
        self.entries.get(identity).map(|e| e.state)
    }

    pub fn get(&self, identity: &NodeId) -> Option<TrustEntry> {
        self.entries.get(identity).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<TrustEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// (unverified, trusted, revoked)
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for entry in self.entries.iter() {
            match entry.state {
                TrustState::Unverified => counts.0 += 1,
                TrustState::Trusted => counts.1 += 1,
                TrustState::Revoked => counts.2 += 1,
            }
        }
        counts
    }

    /// Pin and promote the configured peer keys (hex). Invalid or revoked
    /// entries are skipped with a warning.
    pub fn apply_config(&self, trusted_peers: &[String]) {
        for hex_key in trusted_peers {
            let Some(key) = decode_key(hex_key) else {
                tracing::warn!(value = %hex_key, "ignoring malformed trusted peer key");
                continue;
            };
            let result = self
                .observe(&key, &key)
                .and_then(|_| self.promote(&key));
            if let Err(e) = result {
                tracing::warn!(peer = short_id(&key), error = %e, "cannot pre-trust peer");
            }
        }
    }

    /// Snapshot the table to the persistence collaborator. Best-effort: logs on failure.
    fn save(&self) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        self.save_order.save(
            "trust store",
            || {
                let mut snapshot = self.list();
                snapshot.sort_by(|a, b| a.identity.cmp(&b.identity));
                snapshot
            },
            move |snapshot| persistence.save_trust_store(snapshot),
        );
    }
}

fn decode_key(text: &str) -> Option<[u8; 32]> {
    hex::decode(text).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistence;
    use archipel_core::Identity;

    #[test]
    fn first_observation_pins_unverified() {
        let store = TrustStore::default();
        let id = [1u8; 32];
        assert_eq!(store.observe(&id, &id), Ok(Observation::Pinned));
        assert_eq!(store.state(&id), Some(TrustState::Unverified));
        assert_eq!(
            store.observe(&id, &id),
            Ok(Observation::Known(TrustState::Unverified))
        );
    }

    #[test]
    fn different_key_is_mismatch_and_pin_survives() {
        let store = TrustStore::default();
        let id = [1u8; 32];
        store.observe(&id, &id).unwrap();
        let err = store.observe(&id, &[2u8; 32]).unwrap_err();
        assert!(matches!(err, TrustError::KeyMismatch { .. }));
        assert_eq!(store.get(&id).unwrap().pinned_key, id);
    }

    #[test]
    fn promote_requires_known_identity() {
        let store = TrustStore::default();
        assert_eq!(store.promote(&[9; 32]), Err(TrustError::Unknown([9; 32])));
        store.observe(&[9; 32], &[9; 32]).unwrap();
        assert_eq!(store.promote(&[9; 32]), Ok(TrustState::Trusted));
        assert_eq!(store.promote(&[9; 32]), Ok(TrustState::Trusted));
    }

    #[test]
    fn self_revocation_is_permanent() {
        let store = TrustStore::default();
        let peer = Identity::generate();
        let id = peer.public_id();
        store.observe(&id, &id).unwrap();
        store.promote(&id).unwrap();

        assert_eq!(store.revoke(&peer.revoke_self(1)), Ok(true));
        assert_eq!(store.revoke(&peer.revoke_self(2)), Ok(false));
        assert!(!store.is_acceptable(&id));

        // Nothing brings it back.
        assert_eq!(store.promote(&id), Err(TrustError::Revoked(id)));
        assert_eq!(
            store.observe(&id, &id),
            Ok(Observation::Known(TrustState::Revoked))
        );
        assert_eq!(store.state(&id), Some(TrustState::Revoked));
    }

    #[test]
    fn revoking_unknown_identity_blocks_first_contact() {
        let store = TrustStore::default();
        let peer = Identity::generate();
        assert_eq!(store.revoke(&peer.revoke_self(5)), Ok(true));
        assert!(!store.is_acceptable(&peer.public_id()));
    }

    #[test]
    fn forged_revocation_is_rejected() {
        let store = TrustStore::default();
        let peer = Identity::generate();
        let mut cert = peer.revoke_self(1);
        cert.signature[0] ^= 1;
        assert_eq!(store.revoke(&cert), Err(TrustError::BadRevocation));
    }

    #[test]
    fn introducer_revocation_needs_policy_and_trust() {
        let introducer = Identity::generate();
        let target = Identity::generate();
        let cert = introducer.sign_revocation(&target.public_id(), 1);

        let strict = TrustStore::default();
        strict
            .observe(&introducer.public_id(), &introducer.public_id())
            .unwrap();
        strict.promote(&introducer.public_id()).unwrap();
        assert!(matches!(
            strict.revoke(&cert),
            Err(TrustError::UnauthorizedRevoker { .. })
        ));

        let open = TrustStore::new(TrustPolicy {
            allow_introducer_revocation: true,
        });
        open.observe(&introducer.public_id(), &introducer.public_id())
            .unwrap();
        // Unverified introducer is not enough.
        assert!(open.revoke(&cert).is_err());
        open.promote(&introducer.public_id()).unwrap();
        assert_eq!(open.revoke(&cert), Ok(true));
        assert_eq!(
            open.get(&target.public_id()).unwrap().revoked_by,
            Some(introducer.public_id())
        );
    }

    #[test]
    fn apply_config_promotes_valid_keys() {
        let store = TrustStore::default();
        store.apply_config(&[hex::encode([4u8; 32]), "zz".into(), hex::encode([1u8; 3])]);
        assert_eq!(store.state(&[4u8; 32]), Some(TrustState::Trusted));
        assert_eq!(store.counts(), (0, 1, 0));
    }

    #[test]
    fn changes_persist_and_reload() {
        let persistence = Arc::new(MemoryPersistence::default());
        let peer = Identity::generate();
        let id = peer.public_id();
        {
            let store =
                TrustStore::with_persistence(TrustPolicy::default(), persistence.clone()).unwrap();
            store.observe(&[1; 32], &[1; 32]).unwrap();
            store.observe(&id, &id).unwrap();
            store.revoke(&peer.revoke_self(3)).unwrap();
        }
        let reloaded = TrustStore::with_persistence(TrustPolicy::default(), persistence).unwrap();
        assert_eq!(reloaded.state(&[1; 32]), Some(TrustState::Unverified));
        assert_eq!(reloaded.state(&id), Some(TrustState::Revoked));
    }

    #[test]
    fn concurrent_changes_all_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(crate::persist::JsonPersistence::new(dir.path()).unwrap());
        let store =
            TrustStore::with_persistence(TrustPolicy::default(), persistence.clone()).unwrap();
        std::thread::scope(|scope| {
            for t in 0..8u8 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..16u8 {
                        let id = [t * 16 + i + 1; 32];
                        store.observe(&id, &id).unwrap();
                    }
                });
            }
        });
        let reloaded = TrustStore::with_persistence(TrustPolicy::default(), persistence).unwrap();
        assert_eq!(reloaded.list().len(), 128);
    }
}
