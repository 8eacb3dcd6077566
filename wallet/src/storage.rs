//! # Encrypted Storage Collaborator
//!
//! The wallet does not implement a storage engine. It consumes one through
//! the [`Storage`] trait: an ordered key-value store with optional
//! encryption-at-rest, supplied by the embedding application (typically a
//! LevelDB-style store behind an encryption wrapper).
//!
//! ## Key Namespacing
//!
//! Keys are namespaced by entity-kind prefix (`identity!`,
//! `identity-device!`, `identity-backup!`). Because the store is ordered,
//! a prefix range scan enumerates every record of one kind — that is how
//! the directory lists persisted identity descriptors on load.
//!
//! The storage handle is shared across all identities and the directory.
//! It provides no locking of its own; callers must not mutate the same key
//! concurrently from two paths.

use async_trait::async_trait;
use serde_json::Value;

/// Result alias for storage operations. Storage errors are opaque to the
/// wallet and propagate unchanged.
pub type StorageResult<T> = anyhow::Result<T>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Write options for [`Storage::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Encrypt the value at rest. Descriptors, device key material and
    /// backup data are always written encrypted.
    pub encrypt: bool,
}

impl SetOptions {
    /// Shorthand for `SetOptions { encrypt: true }`.
    pub fn encrypted() -> Self {
        Self { encrypt: true }
    }
}

/// An inclusive key range for [`Storage::list`].
#[derive(Debug, Clone)]
pub struct KeyRange {
    /// Lower bound, inclusive.
    pub gte: String,
    /// Upper bound, inclusive.
    pub lte: String,
}

impl KeyRange {
    /// Range covering every key starting with `prefix`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            gte: prefix.to_owned(),
            lte: format!("{prefix}\u{10FFFF}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// External ordered key-value storage with encryption-at-rest support.
///
/// All values are JSON. Implementations are expected to be cheap to clone
/// behind an `Arc` and safe to share across tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a value, or `None` when the key is absent.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Write a value, optionally encrypted at rest.
    async fn set(&self, key: &str, value: Value, options: SetOptions) -> StorageResult<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// List all values whose keys fall inside `range`, in key order.
    async fn list(&self, range: &KeyRange) -> StorageResult<Vec<Value>>;
}
