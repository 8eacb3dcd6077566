//! # Replication Linkage Collaborator
//!
//! Every identity owns one replicated database, synchronized over a peer
//! network by an external linkage layer (an OrbitDB-style multi-writer
//! store in the reference deployment). The wallet never implements
//! replication — it drives the lifecycle through these traits:
//!
//! - [`Linkage`] hands out and drops database handles, scoped by identity
//!   id.
//! - [`ReplicatedDb`] is one identity's database: named sub-stores, a
//!   replication switch, and an initial-sync barrier.
//! - [`KeyStore`] is one named sub-store (`profile`, `devices`, `apps`):
//!   a flat JSON key-value surface.
//!
//! A database handle is exclusively owned by its identity aggregate.
//! Stopping replication is part of the revocation cascade; dropping the
//! database is part of identity removal.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Result alias for linkage operations. Linkage errors are opaque to the
/// wallet and propagate unchanged.
pub type LinkageResult<T> = anyhow::Result<T>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Options for [`Linkage::get_db`].
#[derive(Debug, Clone, Copy)]
pub struct DbOptions {
    /// Start (or keep) replicating the database with peers. Disabled when
    /// loading a revoked identity and when tearing an identity down.
    pub replicate: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self { replicate: true }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The external replication layer: creates, loads and drops per-identity
/// replicated databases.
#[async_trait]
pub trait Linkage: Send + Sync {
    /// Obtain the database handle scoped to `id`, creating the database if
    /// it does not exist yet.
    async fn get_db(&self, id: &str, options: DbOptions) -> LinkageResult<Arc<dyn ReplicatedDb>>;

    /// Drop a database and everything it contains.
    async fn drop_db(&self, db: Arc<dyn ReplicatedDb>) -> LinkageResult<()>;
}

/// One identity's replicated database.
#[async_trait]
pub trait ReplicatedDb: Send + Sync {
    /// The identity id this handle is scoped to.
    fn id(&self) -> &str;

    /// Load (or create) a named sub-store.
    async fn load_store(&self, name: &str) -> LinkageResult<Arc<dyn KeyStore>>;

    /// Drop a named sub-store and its contents.
    async fn drop_store(&self, name: &str) -> LinkageResult<()>;

    /// Resolve once the database has completed its initial sync for `did`.
    /// Used when importing an identity whose state lives on other devices.
    async fn is_replicated(&self, did: &str) -> LinkageResult<()>;

    /// Stop replicating with peers. A revoked identity must not keep
    /// announcing itself on the network.
    async fn stop_replication(&self) -> LinkageResult<()>;
}

/// A flat JSON key-value sub-store inside a replicated database.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch a value, or `None` when absent.
    async fn get(&self, key: &str) -> LinkageResult<Option<Value>>;

    /// Write a value.
    async fn put(&self, key: &str, value: Value) -> LinkageResult<()>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> LinkageResult<()>;

    /// Snapshot of the whole store.
    async fn all(&self) -> LinkageResult<Map<String, Value>>;

    /// Drop the store and its contents.
    async fn drop_store(&self) -> LinkageResult<()>;
}
