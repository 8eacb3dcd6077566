//! In-memory collaborator doubles shared by the unit tests: local storage,
//! the replication linkage, a generic method driver and a hypns
//! node/session pair. Each supports targeted failure injection so error
//! paths are as testable as happy paths.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::crypto::{generate_key_pair, hash_identity_id, KeyPair};
use crate::didm::document::DidDocument;
use crate::didm::hypns::{HypnsNode, HypnsSession};
use crate::didm::{
    DidCreation, DocumentOperations, DriverResult, MethodDriver, MethodInfo, Purpose,
};
use crate::identities::identity::IdentityDescriptor;
use crate::linkage::{DbOptions, KeyStore, Linkage, LinkageResult, ReplicatedDb};
use crate::storage::{KeyRange, SetOptions, Storage, StorageResult};

/// A throwaway descriptor for sub-store tests.
pub(crate) fn test_descriptor(did: &str) -> IdentityDescriptor {
    IdentityDescriptor {
        id: hash_identity_id(did),
        did: did.to_owned(),
        added_at: Utc::now(),
        revoked: false,
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

struct StoredEntry {
    value: Value,
    encrypted: bool,
}

/// In-memory [`Storage`] with per-key encryption tracking and write-failure
/// injection.
pub(crate) struct MemoryStorage {
    entries: Mutex<BTreeMap<String, StoredEntry>>,
    fail_set: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            fail_set: Mutex::new(None),
        })
    }

    /// Make every subsequent `set` fail with `message`.
    pub(crate) fn fail_set(&self, message: &str) {
        *self.fail_set.lock() = Some(message.to_owned());
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub(crate) fn value(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).map(|entry| entry.value.clone())
    }

    /// Whether the key exists and was written with encryption requested.
    pub(crate) fn is_encrypted(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.encrypted)
    }

    /// Insert a value directly, bypassing the async surface.
    pub(crate) fn seed(&self, key: &str, value: Value) {
        self.entries.lock().insert(
            key.to_owned(),
            StoredEntry {
                value,
                encrypted: true,
            },
        );
    }

    /// Delete a key directly, bypassing the async surface.
    pub(crate) fn delete_sync(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: Value, options: SetOptions) -> StorageResult<()> {
        if let Some(message) = self.fail_set.lock().clone() {
            return Err(anyhow!(message));
        }
        self.entries.lock().insert(
            key.to_owned(),
            StoredEntry {
                value,
                encrypted: options.encrypt,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn list(&self, range: &KeyRange) -> StorageResult<Vec<Value>> {
        let entries = self.entries.lock();
        Ok(entries
            .range(range.gte.clone()..=range.lte.clone())
            .map(|(_, entry)| entry.value.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore / MemoryDb / MemoryLinkage
// ---------------------------------------------------------------------------

/// In-memory [`KeyStore`] tracking writes and drops.
pub(crate) struct MemoryStore {
    entries: Mutex<Map<String, Value>>,
    puts: AtomicUsize,
    dropped: AtomicBool,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Map::new()),
            puts: AtomicUsize::new(0),
            dropped: AtomicBool::new(false),
        })
    }

    pub(crate) fn value(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of `put` calls that reached the store.
    pub(crate) fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Insert a value directly, as replication from another device would.
    pub(crate) fn seed(&self, key: &str, value: Value) {
        self.entries.lock().insert(key.to_owned(), value);
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> LinkageResult<Option<Value>> {
        Ok(self.value(key))
    }

    async fn put(&self, key: &str, value: Value) -> LinkageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> LinkageResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn all(&self) -> LinkageResult<Map<String, Value>> {
        Ok(self.entries.lock().clone())
    }

    async fn drop_store(&self) -> LinkageResult<()> {
        self.dropped.store(true, Ordering::SeqCst);
        self.entries.lock().clear();
        Ok(())
    }
}

/// In-memory [`ReplicatedDb`] with replication-state introspection.
pub(crate) struct MemoryDb {
    id: String,
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
    replicating: AtomicBool,
    replication_stalled: AtomicBool,
    is_replicated_calls: AtomicUsize,
    fail_stop_replication: Mutex<Option<String>>,
}

impl MemoryDb {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            stores: Mutex::new(HashMap::new()),
            replicating: AtomicBool::new(true),
            replication_stalled: AtomicBool::new(false),
            is_replicated_calls: AtomicUsize::new(0),
            fail_stop_replication: Mutex::new(None),
        })
    }

    pub(crate) fn store(&self, name: &str) -> Option<Arc<MemoryStore>> {
        self.stores.lock().get(name).cloned()
    }

    fn store_or_create(&self, name: &str) -> Arc<MemoryStore> {
        self.stores
            .lock()
            .entry(name.to_owned())
            .or_insert_with(MemoryStore::new)
            .clone()
    }

    /// Create the `profile` store pre-populated with `details`, as if it
    /// had replicated from another device.
    pub(crate) fn seeded_profile_store(&self, details: &Map<String, Value>) -> Arc<MemoryStore> {
        let store = self.store_or_create(crate::identities::profile::DB_NAME);
        for (key, value) in details {
            store.seed(key, value.clone());
        }
        store
    }

    pub(crate) fn is_replicating(&self) -> bool {
        self.replicating.load(Ordering::SeqCst)
    }

    pub(crate) fn is_replicated_calls(&self) -> usize {
        self.is_replicated_calls.load(Ordering::SeqCst)
    }

    /// Make `is_replicated` hang forever, as a store with no peers would.
    pub(crate) fn stall_replication(&self) {
        self.replication_stalled.store(true, Ordering::SeqCst);
    }

    /// Make `stop_replication` fail with `message`.
    pub(crate) fn fail_stop_replication(&self, message: &str) {
        *self.fail_stop_replication.lock() = Some(message.to_owned());
    }
}

#[async_trait]
impl ReplicatedDb for MemoryDb {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_store(&self, name: &str) -> LinkageResult<Arc<dyn KeyStore>> {
        Ok(self.store_or_create(name))
    }

    async fn drop_store(&self, name: &str) -> LinkageResult<()> {
        if let Some(store) = self.stores.lock().remove(name) {
            store.dropped.store(true, Ordering::SeqCst);
            store.entries.lock().clear();
        }
        Ok(())
    }

    async fn is_replicated(&self, _did: &str) -> LinkageResult<()> {
        self.is_replicated_calls.fetch_add(1, Ordering::SeqCst);
        if self.replication_stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn stop_replication(&self) -> LinkageResult<()> {
        if let Some(message) = self.fail_stop_replication.lock().clone() {
            return Err(anyhow!(message));
        }
        self.replicating.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory [`Linkage`] handing out [`MemoryDb`] instances keyed by
/// identity id, with drop tracking.
pub(crate) struct MemoryLinkage {
    dbs: Mutex<HashMap<String, Arc<MemoryDb>>>,
    dropped: Mutex<HashSet<String>>,
    replicate_flags: Mutex<HashMap<String, bool>>,
}

impl MemoryLinkage {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            dbs: Mutex::new(HashMap::new()),
            dropped: Mutex::new(HashSet::new()),
            replicate_flags: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a database for `id` has ever been dropped.
    pub(crate) fn is_dropped(&self, id: &str) -> bool {
        self.dropped.lock().contains(id)
    }

    /// The `replicate` flag of the most recent `get_db` for `id`.
    pub(crate) fn last_replicate_flag(&self, id: &str) -> Option<bool> {
        self.replicate_flags.lock().get(id).copied()
    }
}

#[async_trait]
impl Linkage for MemoryLinkage {
    async fn get_db(&self, id: &str, options: DbOptions) -> LinkageResult<Arc<dyn ReplicatedDb>> {
        self.replicate_flags
            .lock()
            .insert(id.to_owned(), options.replicate);
        let db = self
            .dbs
            .lock()
            .entry(id.to_owned())
            .or_insert_with(|| MemoryDb::new(id))
            .clone();
        db.replicating.store(options.replicate, Ordering::SeqCst);
        Ok(db)
    }

    async fn drop_db(&self, db: Arc<dyn ReplicatedDb>) -> LinkageResult<()> {
        let id = db.id().to_owned();
        self.dbs.lock().remove(&id);
        self.dropped.lock().insert(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

/// A scriptable [`MethodDriver`] with a single in-memory document, call
/// recording and blanket failure injection.
pub(crate) struct MockDriver {
    method: String,
    purposes: Vec<Purpose>,
    document: Mutex<DidDocument>,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl MockDriver {
    pub(crate) fn new(method: &str, purposes: &[Purpose]) -> Arc<Self> {
        Arc::new(Self {
            method: method.to_owned(),
            purposes: purposes.to_vec(),
            document: Mutex::new(DidDocument::new(format!("did:{method}:abcdef"))),
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        })
    }

    /// Make every operation fail with `message`.
    pub(crate) fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_owned());
    }

    pub(crate) fn document(&self) -> DidDocument {
        self.document.lock().clone()
    }

    pub(crate) fn document_mut(&self, mutate: impl FnOnce(&mut DidDocument)) {
        mutate(&mut self.document.lock());
    }

    /// Operations dispatched to this driver, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn check_failure(&self) -> DriverResult<()> {
        match self.failure.lock().clone() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MethodDriver for MockDriver {
    fn info(&self) -> MethodInfo {
        MethodInfo {
            method: self.method.clone(),
            description: format!("Test driver for the {} method.", self.method),
            homepage_url: "https://example.org".to_owned(),
            icons: Vec::new(),
        }
    }

    fn purposes(&self) -> &[Purpose] {
        &self.purposes
    }

    async fn get_did(&self, _params: Value) -> DriverResult<String> {
        self.calls.lock().push("getDid".to_owned());
        self.check_failure()?;
        Ok(self.document.lock().id.clone())
    }

    async fn resolve(&self, did: &str) -> DriverResult<DidDocument> {
        self.calls.lock().push(format!("resolve {did}"));
        self.check_failure()?;
        Ok(self.document.lock().clone())
    }

    async fn create(
        &self,
        _params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidCreation> {
        self.calls.lock().push("create".to_owned());
        self.check_failure()?;

        let document = {
            let mut document = self.document.lock();
            operations(&mut document);
            document.clone()
        };
        Ok(DidCreation {
            did: document.id.clone(),
            did_document: document,
            backup_data: generate_key_pair(),
        })
    }

    async fn update(
        &self,
        did: &str,
        _params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidDocument> {
        self.calls.lock().push(format!("update {did}"));
        self.check_failure()?;

        let mut document = self.document.lock();
        operations(&mut document);
        Ok(document.clone())
    }

    async fn is_public_key_valid(&self, did: &str, key_id: &str) -> DriverResult<bool> {
        self.calls.lock().push(format!("isPublicKeyValid {did}"));
        self.check_failure()?;
        Ok(self.document.lock().has_public_key(key_id))
    }
}

// ---------------------------------------------------------------------------
// MockHypnsNode / MockHypnsSession
// ---------------------------------------------------------------------------

/// A scriptable [`HypnsNode`] with one pre-built session and a fixed
/// generated key pair.
pub(crate) struct MockHypnsNode {
    did: String,
    session: Arc<MockHypnsSession>,
    generated: KeyPair,
    sessions_created: AtomicUsize,
}

impl MockHypnsNode {
    pub(crate) fn new(did: &str) -> Arc<Self> {
        Arc::new(Self {
            did: did.to_owned(),
            session: Arc::new(MockHypnsSession::new(did)),
            generated: generate_key_pair(),
            sessions_created: AtomicUsize::new(0),
        })
    }

    /// The session handle, for scripting before it is ever established.
    pub(crate) fn session(&self) -> Arc<MockHypnsSession> {
        self.session.clone()
    }

    /// The pair `generate_key_pair` always returns.
    pub(crate) fn generated_pair(&self) -> KeyPair {
        self.generated.clone()
    }

    /// How many times a session was established.
    pub(crate) fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HypnsNode for MockHypnsNode {
    async fn create_session(&self) -> DriverResult<Arc<dyn HypnsSession>> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }

    fn generate_key_pair(&self) -> KeyPair {
        self.generated.clone()
    }

    async fn get_did(&self, _params: Value) -> DriverResult<String> {
        Ok(self.did.clone())
    }
}

/// A scriptable [`HypnsSession`] over a single in-memory document.
pub(crate) struct MockHypnsSession {
    did: String,
    document: Mutex<DidDocument>,
    fail_resolve: Mutex<Option<String>>,
    fail_create: Mutex<Option<String>>,
    fail_update: Mutex<Option<String>>,
}

impl MockHypnsSession {
    fn new(did: &str) -> Self {
        Self {
            did: did.to_owned(),
            document: Mutex::new(DidDocument::new(did)),
            fail_resolve: Mutex::new(None),
            fail_create: Mutex::new(None),
            fail_update: Mutex::new(None),
        }
    }

    pub(crate) fn fail_resolve(&self, message: &str) {
        *self.fail_resolve.lock() = Some(message.to_owned());
    }

    pub(crate) fn fail_create(&self, message: &str) {
        *self.fail_create.lock() = Some(message.to_owned());
    }

    pub(crate) fn fail_update(&self, message: &str) {
        *self.fail_update.lock() = Some(message.to_owned());
    }

    pub(crate) fn document_mut(&self, mutate: impl FnOnce(&mut DidDocument)) {
        mutate(&mut self.document.lock());
    }
}

#[async_trait]
impl HypnsSession for MockHypnsSession {
    async fn resolve(&self, _did: &str) -> DriverResult<DidDocument> {
        if let Some(message) = self.fail_resolve.lock().clone() {
            return Err(anyhow!(message));
        }
        Ok(self.document.lock().clone())
    }

    async fn create(
        &self,
        _params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidDocument> {
        // Failure must be checked before the caller's operations run.
        if let Some(message) = self.fail_create.lock().clone() {
            return Err(anyhow!(message));
        }

        let mut document = DidDocument::new(&*self.did);
        operations(&mut document);
        *self.document.lock() = document.clone();
        Ok(document)
    }

    async fn update(
        &self,
        _did: &str,
        _params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidDocument> {
        if let Some(message) = self.fail_update.lock().clone() {
            return Err(anyhow!(message));
        }

        let mut document = self.document.lock();
        operations(&mut document);
        Ok(document.clone())
    }
}
