//! # Ambient Cryptographic Primitives
//!
//! The small set of cryptographic building blocks the wallet core needs for
//! itself. Everything heavier — key derivation schemes, DID network
//! anchoring, encryption at rest — belongs to external collaborators and is
//! deliberately absent here.
//!
//! Three concerns live in this module:
//!
//! 1. **Identity ids** — an identity id is the SHA-256 of its DID, hex
//!    encoded. Deterministic, so the same DID always maps to the same
//!    storage and replication key.
//! 2. **Key material** — plain serde-friendly carriers for hex-encoded
//!    Ed25519 key pairs, as exchanged with drivers and persisted (encrypted)
//!    by the storage collaborator.
//! 3. **Signer** — a lazily derived signing handle bound to one DID URL and
//!    one device's private key. Ed25519 via `ed25519-dalek`, RFC 8032
//!    compliant.

use ed25519_dalek::{Signature, Signer as _, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Byte length of an Ed25519 secret key.
const SECRET_KEY_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while deriving a [`Signer`].
#[derive(Debug, Error)]
pub enum SignerError {
    /// The device carries no private key material to derive a signer from.
    #[error("missing DID parameters: no private key material available")]
    MissingDidParameters,

    /// The key material is present but not a valid Ed25519 secret key.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

// ---------------------------------------------------------------------------
// Identity Ids
// ---------------------------------------------------------------------------

/// Compute the deterministic identity id for a DID.
///
/// The id is `hex(SHA-256(did))`. It doubles as the storage key suffix and
/// the replicated database scope, so determinism matters: importing the
/// same DID on two devices must land on the same replication key.
pub fn hash_identity_id(did: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(did.as_bytes());
    hex::encode(hasher.finalize())
}

/// Format a DID URL referencing a fragment of a DID document,
/// e.g. `did:hypns:abc#key-1`.
pub fn format_did_url(did: &str, fragment: &str) -> String {
    format!("{}#{}", did, fragment.trim_start_matches('#'))
}

// ---------------------------------------------------------------------------
// Key Material
// ---------------------------------------------------------------------------

/// A complete hex-encoded Ed25519 key pair.
///
/// Used for backup data exchanged with DID method drivers. Both halves are
/// always present — a backup without its private key is not a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// Hex-encoded public key.
    pub public_key: String,
    /// Hex-encoded private key.
    pub private_key: String,
}

/// Key material attached to a device.
///
/// The private half is optional: device records replicated to other devices
/// carry only the public key, while the local current-device record (stored
/// encrypted) keeps both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMaterial {
    /// Hex-encoded public key.
    pub public_key: String,
    /// Hex-encoded private key, present only on the owning device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl From<KeyPair> for KeyMaterial {
    fn from(pair: KeyPair) -> Self {
        Self {
            public_key: pair.public_key,
            private_key: Some(pair.private_key),
        }
    }
}

/// Generate a fresh Ed25519 key pair, hex encoded.
pub fn generate_key_pair() -> KeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    KeyPair {
        public_key: hex::encode(signing_key.verifying_key().as_bytes()),
        private_key: hex::encode(signing_key.to_bytes()),
    }
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// A signing handle bound to one DID URL.
///
/// Produced lazily by an identity from its current device's key material;
/// at most one instance exists per identity lifetime. Signatures are plain
/// Ed25519 over the caller-supplied bytes — payload framing is the caller's
/// concern.
pub struct Signer {
    did_url: String,
    signing_key: SigningKey,
}

impl Signer {
    /// Derive a signer from device key material.
    ///
    /// Fails with [`SignerError::MissingDidParameters`] when the private
    /// half is absent, and with [`SignerError::InvalidKeyMaterial`] when it
    /// does not decode to a 32-byte Ed25519 secret key.
    pub fn new(did_url: String, key_material: &KeyMaterial) -> Result<Self, SignerError> {
        let private_key = key_material
            .private_key
            .as_deref()
            .ok_or(SignerError::MissingDidParameters)?;

        let bytes = hex::decode(private_key)
            .map_err(|err| SignerError::InvalidKeyMaterial(err.to_string()))?;
        let bytes: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            SignerError::InvalidKeyMaterial(format!(
                "expected {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            ))
        })?;

        Ok(Self {
            did_url,
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// The DID URL identifying the verification key behind this signer.
    pub fn did_url(&self) -> &str {
        &self.did_url
    }

    /// Hex-encoded public key of the underlying key pair.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes with the device key.
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("Signer")
            .field("did_url", &self.did_url)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
