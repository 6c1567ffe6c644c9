//! Node identity: a long-term Ed25519 signing key.
//!
//! The 32-byte verifying key IS the node id. It goes in every packet's
//! `sender_id` and every trust entry. The signing key never leaves this
//! struct except through `save`, which writes it to a 0600 file.
//!
//! On disk an identity is two JSON files in one directory:
//!
//! ```text
//! identity.json         node_name, node_id, public_key, fingerprint,
//!                       algorithm, created_at, private_key_seed
//! identity_public.json  the same without the seed; safe to share
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::byteorder::U64;
use zeroize::Zeroizing;

use crate::wire::RevocationBody;
use crate::{unix_secs, NodeId};

pub const PRIVATE_FILE: &str = "identity.json";
pub const PUBLIC_FILE: &str = "identity_public.json";
pub const ALGORITHM: &str = "Ed25519";

const PRIVATE_WARNING: &str = "Never share this file. Never commit it to version control.";

pub struct Identity {
    signing: SigningKey,
    public: NodeId,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id_hex())
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild from a stored 32-byte seed. The public key is always derived.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = signing.verifying_key().to_bytes();
        Self { signing, public }
    }

    pub fn public_id(&self) -> NodeId {
        self.public
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// The private seed, for persistence only.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }

    pub fn node_id_hex(&self) -> String {
        hex::encode(self.public)
    }

    /// A self-signed revocation certificate for this identity.
    pub fn revoke_self(&self, issued_at_ms: u64) -> RevocationBody {
        self.sign_revocation(&self.public, issued_at_ms)
    }

    /// A revocation certificate for `target` signed by this identity, used
    /// when acting as an introducer.
    pub fn sign_revocation(&self, target: &NodeId, issued_at_ms: u64) -> RevocationBody {
        let message = RevocationBody::signed_message(target, &self.public, issued_at_ms);
        RevocationBody {
            identity: *target,
            signer: self.public,
            issued_at_ms: U64::new(issued_at_ms),
            signature: self.sign(&message),
        }
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    /// Write both identity files into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path, node_name: &str) -> Result<(), IdentityError> {
        fs::create_dir_all(dir).map_err(|e| IdentityError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut record = IdentityFile {
            node_name: node_name.to_string(),
            node_id: self.node_id_hex(),
            public_key: self.node_id_hex(),
            fingerprint: self.fingerprint(),
            algorithm: ALGORITHM.to_string(),
            created_at: CreatedAt::Unix(unix_secs()),
            private_key_seed: None,
            warning: None,
        };

        let public_json = serde_json::to_vec_pretty(&record)?;
        write_atomic(&dir.join(PUBLIC_FILE), &public_json, false)?;

        record.private_key_seed = Some(hex::encode(*self.seed()));
        record.warning = Some(PRIVATE_WARNING.to_string());
        let private_json = Zeroizing::new(serde_json::to_vec_pretty(&record)?);
        write_atomic(&dir.join(PRIVATE_FILE), &private_json, true)?;
        Ok(())
    }

    /// Load the identity stored in `dir`.
    ///
    /// The stored public key must match the one derived from the seed. The
    /// stored fingerprint is display-only and not compared: files written by
    /// other tools carry a SHA-256 form instead of ours.
    pub fn load(dir: &Path) -> Result<Self, IdentityError> {
        let path = dir.join(PRIVATE_FILE);
        let raw = Zeroizing::new(fs::read(&path).map_err(|e| IdentityError::Io {
            path: path.clone(),
            source: e,
        })?);
        let record: IdentityFile = serde_json::from_slice(&raw)?;

        let seed_hex = record
            .private_key_seed
            .as_deref()
            .ok_or_else(|| IdentityError::BadKey("missing private_key_seed".into()))?;
        let seed = Zeroizing::new(decode_key(seed_hex, "private_key_seed")?);
        let identity = Identity::from_seed(&seed);

        let stored_public = decode_key(&record.public_key, "public_key")?;
        if stored_public != identity.public {
            return Err(IdentityError::Mismatch);
        }
        Ok(identity)
    }

    /// Load from `dir`, or generate and save a new identity if none exists.
    pub fn load_or_generate(dir: &Path, node_name: &str) -> Result<Self, IdentityError> {
        if dir.join(PRIVATE_FILE).exists() {
            return Self::load(dir);
        }
        let identity = Self::generate();
        identity.save(dir, node_name)?;
        Ok(identity)
    }
}

/// Verify an Ed25519 signature made by `signer`. Uses strict verification:
/// malleable encodings and small-order keys are refused.
pub fn verify(signer: &NodeId, message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(signer) else {
        return false;
    };
    key.verify_strict(message, &Signature::from_bytes(signature))
        .is_ok()
}

/// Check a revocation certificate's signature against its declared signer.
/// Whether that signer is *allowed* to revoke is the trust store's call.
pub fn verify_revocation(body: &RevocationBody) -> bool {
    verify(&body.signer, &body.message(), &body.signature)
}

/// Short human-comparable fingerprint: first 16 hex chars of BLAKE3(public key).
pub fn fingerprint(id: &NodeId) -> String {
    let digest = blake3::hash(id);
    hex::encode(&digest.as_bytes()[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityFile {
    node_name: String,
    node_id: String,
    public_key: String,
    fingerprint: String,
    algorithm: String,
    created_at: CreatedAt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key_seed: Option<String>,
    #[serde(default, rename = "WARNING", skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

/// Creation time: unix seconds when we write it, an ISO-8601 string in files
/// made by other tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CreatedAt {
    Unix(u64),
    Iso(String),
}

fn decode_key(hex_str: &str, field: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = Zeroizing::new(
        hex::decode(hex_str).map_err(|e| IdentityError::BadKey(format!("{field}: {e}")))?,
    );
    if bytes.len() != 32 {
        return Err(IdentityError::BadKey(format!(
            "{field}: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Write via a sibling temp file and rename, so a crash never leaves a
/// truncated identity behind.
fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), IdentityError> {
    let tmp = path.with_extension("json.tmp");
    let io_err = |e| IdentityError::Io {
        path: tmp.clone(),
        source: e,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&tmp).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| IdentityError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("identity file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid key material: {0}")]
    BadKey(String),

    #[error("stored public key does not match the private seed")]
    Mismatch,
}
