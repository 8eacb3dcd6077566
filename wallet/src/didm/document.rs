//! # DID Documents
//!
//! The document shape exchanged between the registry, its method drivers
//! and callers. Deliberately minimal: the wallet only ever inspects the
//! `publicKey` list (for key validation) and mutates it through the
//! `operations` callbacks passed to `create`/`update`. Anything else a
//! method puts in its documents rides along untouched by this crate.
//!
//! Field naming follows the W3C DID wire format (`@context`,
//! `publicKeyHex`, ...), hence the serde renames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON-LD context for DID documents.
pub const DID_DOCUMENT_CONTEXT: &str = "https://w3id.org/did/v1";

/// Verification key type for Ed25519 public keys, as registered by the
/// drivers in this crate.
pub const ED25519_KEY_TYPE: &str = "Ed25519VerificationKey2018";

// ---------------------------------------------------------------------------
// DidDocument
// ---------------------------------------------------------------------------

/// A DID document as returned by `resolve` and mutated during
/// `create`/`update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidDocument {
    /// JSON-LD context URI.
    #[serde(rename = "@context")]
    pub context: String,

    /// The DID this document describes.
    pub id: String,

    /// Public keys registered on the document. Absent on the wire means
    /// empty here.
    #[serde(rename = "publicKey", default, skip_serializing_if = "Vec::is_empty")]
    pub public_key: Vec<DocumentPublicKey>,

    /// When the document was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// When the document was last updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl DidDocument {
    /// Create an empty document for `did`.
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            context: DID_DOCUMENT_CONTEXT.to_owned(),
            id: did.into(),
            public_key: Vec::new(),
            created: Some(Utc::now()),
            updated: None,
        }
    }

    /// Register a public key, replacing any existing entry with the same id.
    pub fn add_public_key(&mut self, key: DocumentPublicKey) {
        self.public_key.retain(|existing| existing.id != key.id);
        self.public_key.push(key);
        self.updated = Some(Utc::now());
    }

    /// Remove a public key by id. Returns whether an entry was removed.
    pub fn revoke_public_key(&mut self, key_id: &str) -> bool {
        let before = self.public_key.len();
        self.public_key.retain(|key| key.id != key_id);
        let removed = self.public_key.len() != before;
        if removed {
            self.updated = Some(Utc::now());
        }
        removed
    }

    /// Whether the document carries a public key with the given id.
    pub fn has_public_key(&self, key_id: &str) -> bool {
        self.public_key.iter().any(|key| key.id == key_id)
    }
}

// ---------------------------------------------------------------------------
// DocumentPublicKey
// ---------------------------------------------------------------------------

/// One entry in a document's `publicKey` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPublicKey {
    /// Key identifier, usually a DID URL fragment.
    pub id: String,

    /// Key type (e.g. [`ED25519_KEY_TYPE`]).
    #[serde(rename = "type")]
    pub key_type: String,

    /// The DID controlling this key, when the method tracks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,

    /// Hex-encoded public key bytes.
    #[serde(rename = "publicKeyHex")]
    pub public_key_hex: String,
}

impl DocumentPublicKey {
    /// An Ed25519 entry with no explicit controller.
    pub fn ed25519(id: impl Into<String>, public_key_hex: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key_type: ED25519_KEY_TYPE.to_owned(),
            controller: None,
            public_key_hex: public_key_hex.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
