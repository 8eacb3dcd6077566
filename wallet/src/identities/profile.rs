//! # Profile Property Store
//!
//! Each identity publishes a small profile — schema.org-flavored key/value
//! pairs — through its replicated database, so other devices and peers can
//! render it. This module owns the validation rules, the idempotent write
//! path, and the "peek" flow used to preview a profile before an identity
//! is actually imported.
//!
//! ## Peeking and deferred drops
//!
//! Peeking a not-yet-imported identity has to load its profile store,
//! which starts replicating data for an identity the user may never
//! import. To reclaim those resources without punishing a fast import, a
//! peeked store is dropped on a timer: a later peek of the same store
//! replaces the pending timer, and any real access (create/restore)
//! cancels it. The timer registry is scoped to the directory instance that
//! did the peeking, keyed by identity id — never process-wide.

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::identity::IdentityDescriptor;
use crate::linkage::{KeyStore, ReplicatedDb};

/// Name of the profile sub-store inside an identity's replicated database.
pub(crate) const DB_NAME: &str = "profile";

/// How long a peek waits for an empty profile store to finish its initial
/// sync before giving up.
pub(crate) const PEEK_REPLICATION_WAIT: Duration = Duration::from_secs(60);

/// Grace window between a peek and the drop of its store. A real import
/// within this window cancels the drop.
pub(crate) const PEEK_DROP_DELAY: Duration = Duration::from_secs(3 * 60);

/// Properties every profile with details must carry.
pub const MANDATORY_PROPERTIES: &[&str] = &["@context", "@type", "name"];

/// Allowed values for the `@type` property.
pub const PROFILE_TYPES: &[&str] = &["Person", "Organization", "Thing"];

/// Optional properties the wallet recognizes (beyond the mandatory ones).
pub const RECOGNIZED_PROPERTIES: &[&str] = &["image", "gender", "nationality", "address"];

/// Required value of the `@context` property.
const SCHEMA_CONTEXT: &str = "https://schema.org";

/// Store key linking the profile back to its DID. Written internally at
/// creation; not a settable property.
const IDENTIFIER_KEY: &str = "identifier";

/// A profile's details: property key to JSON value.
pub type ProfileDetails = Map<String, Value>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by profile operations.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// A property value failed validation.
    #[error("invalid profile property `{key}`: {reason}")]
    InvalidProperty {
        /// The offending property key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The property key is neither mandatory nor recognized.
    #[error("unknown profile property `{0}`")]
    UnknownProperty(String),

    /// Mandatory properties cannot be unset.
    #[error("profile property `{0}` is mandatory and cannot be unset")]
    MandatoryProperty(String),

    /// An imported profile did not replicate within the allowed window.
    #[error("timed out waiting for the profile of `{0}` to replicate")]
    ReplicationTimeout(String),

    /// A store/replication failure, passed through unchanged.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(key: &str, reason: impl Into<String>) -> ProfileError {
    ProfileError::InvalidProperty {
        key: key.to_owned(),
        reason: reason.into(),
    }
}

fn non_empty_string<'v>(key: &str, value: &'v Value) -> Result<&'v str, ProfileError> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(s),
        Some(_) => Err(invalid(key, "must not be empty")),
        None => Err(invalid(key, "must be a string")),
    }
}

/// Validate a single property key/value pair.
pub(crate) fn assert_property(key: &str, value: &Value) -> Result<(), ProfileError> {
    match key {
        "@context" => {
            if value != &json!(SCHEMA_CONTEXT) {
                return Err(invalid(key, format!("must be `{SCHEMA_CONTEXT}`")));
            }
        }
        "@type" => {
            let s = non_empty_string(key, value)?;
            if !PROFILE_TYPES.contains(&s) {
                return Err(invalid(key, format!("must be one of {PROFILE_TYPES:?}")));
            }
        }
        "name" => {
            non_empty_string(key, value)?;
        }
        key if RECOGNIZED_PROPERTIES.contains(&key) => {
            non_empty_string(key, value)?;
        }
        _ => return Err(ProfileError::UnknownProperty(key.to_owned())),
    }
    Ok(())
}

/// Validate a key for unsetting: it must be recognized and non-mandatory.
pub(crate) fn assert_non_mandatory(key: &str) -> Result<(), ProfileError> {
    if MANDATORY_PROPERTIES.contains(&key) {
        return Err(ProfileError::MandatoryProperty(key.to_owned()));
    }
    if !RECOGNIZED_PROPERTIES.contains(&key) {
        return Err(ProfileError::UnknownProperty(key.to_owned()));
    }
    Ok(())
}

/// Validate a full details map: every entry valid, every mandatory key
/// present.
pub(crate) fn assert_details(details: &ProfileDetails) -> Result<(), ProfileError> {
    for (key, value) in details {
        assert_property(key, value)?;
    }
    for key in MANDATORY_PROPERTIES {
        if !details.contains_key(*key) {
            return Err(invalid(key, "is mandatory and missing"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// An identity's profile, backed by the replicated `profile` store.
///
/// Details are cached in memory and kept in sync with every write going
/// through this handle. Writes from other devices land in the underlying
/// store; callers wanting those should re-read through the linkage layer's
/// own change surface (out of scope here).
pub struct Profile {
    store: Arc<dyn KeyStore>,
    details: RwLock<ProfileDetails>,
}

impl Profile {
    /// Open a profile over an already-loaded store, priming the cache.
    async fn open(store: Arc<dyn KeyStore>) -> Result<Self, ProfileError> {
        let details = store.all().await?;
        Ok(Self {
            store,
            details: RwLock::new(details),
        })
    }

    /// Snapshot of the profile details.
    pub fn details(&self) -> ProfileDetails {
        self.details.read().clone()
    }

    /// Set a property after validation.
    ///
    /// Writing a value deep-equal to the stored one is an idempotent
    /// no-op: the underlying store is not touched.
    pub async fn set_property(&self, key: &str, value: Value) -> Result<(), ProfileError> {
        assert_property(key, &value)?;
        self.save_property(key, value).await
    }

    /// Unset a non-mandatory property. Unsetting an absent property is a
    /// no-op.
    pub async fn unset_property(&self, key: &str) -> Result<(), ProfileError> {
        assert_non_mandatory(key)?;
        self.remove_property(key).await
    }

    /// Apply a batch of property writes strictly in input order, stopping
    /// at the first failure. `None` unsets the property. Non-transactional:
    /// entries before the failure stay applied.
    pub async fn set_properties(
        &self,
        properties: Vec<(String, Option<Value>)>,
    ) -> Result<(), ProfileError> {
        for (key, value) in properties {
            match value {
                Some(value) => self.set_property(&key, value).await?,
                None => self.unset_property(&key).await?,
            }
        }
        Ok(())
    }

    /// Write a key without property validation. Used for internal keys
    /// like `identifier`.
    async fn save_raw(&self, key: &str, value: Value) -> Result<(), ProfileError> {
        self.store.put(key, value.clone()).await?;
        self.details.write().insert(key.to_owned(), value);
        Ok(())
    }

    async fn save_property(&self, key: &str, value: Value) -> Result<(), ProfileError> {
        let unchanged = self.details.read().get(key) == Some(&value);
        if unchanged {
            return Ok(());
        }
        self.save_raw(key, value).await
    }

    async fn remove_property(&self, key: &str) -> Result<(), ProfileError> {
        let present = self.details.read().contains_key(key);
        if !present {
            return Ok(());
        }
        self.store.del(key).await?;
        self.details.write().remove(key);
        Ok(())
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("details", &*self.details.read())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create the profile store for a new or imported identity.
///
/// With details: writes the `identifier` link and then every property, in
/// order. Without details the identity is being imported, so its profile
/// lives on other devices — wait for the initial sync instead.
pub(crate) async fn create(
    details: Option<ProfileDetails>,
    descriptor: &IdentityDescriptor,
    db: &Arc<dyn ReplicatedDb>,
    registry: &Arc<PeekDropRegistry>,
) -> Result<Profile, ProfileError> {
    let store = db.load_store(DB_NAME).await?;
    registry.cancel(&descriptor.id);

    let profile = Profile::open(store).await?;

    match details {
        Some(details) => {
            assert_details(&details)?;
            profile.save_raw(IDENTIFIER_KEY, json!(descriptor.did)).await?;
            for (key, value) in details {
                profile.set_property(&key, value).await?;
            }
        }
        None => {
            db.is_replicated(&descriptor.did).await?;
        }
    }

    Ok(profile)
}

/// Restore the profile store of a persisted identity.
pub(crate) async fn restore(
    descriptor: &IdentityDescriptor,
    db: &Arc<dyn ReplicatedDb>,
    registry: &Arc<PeekDropRegistry>,
) -> Result<Profile, ProfileError> {
    let store = db.load_store(DB_NAME).await?;
    registry.cancel(&descriptor.id);
    Profile::open(store).await
}

/// Tear down the profile store during identity removal.
pub(crate) async fn remove(db: &Arc<dyn ReplicatedDb>) -> Result<(), ProfileError> {
    db.drop_store(DB_NAME).await?;
    Ok(())
}

/// Read-only preview of a not-yet-imported identity's profile.
///
/// Loads the store, waits (bounded) for the initial sync when it is still
/// empty, and schedules a deferred drop of the store so an abandoned peek
/// does not keep replicating forever.
pub(crate) async fn peek(
    descriptor: &IdentityDescriptor,
    db: &Arc<dyn ReplicatedDb>,
    registry: &Arc<PeekDropRegistry>,
) -> Result<ProfileDetails, ProfileError> {
    let store = db.load_store(DB_NAME).await?;
    registry.cancel(&descriptor.id);

    let mut details = store.all().await?;
    if details.is_empty() {
        let synced =
            tokio::time::timeout(PEEK_REPLICATION_WAIT, db.is_replicated(&descriptor.did)).await;
        match synced {
            Ok(result) => result?,
            Err(_) => {
                registry.schedule(descriptor.id.clone(), store);
                return Err(ProfileError::ReplicationTimeout(descriptor.did.clone()));
            }
        }
        details = store.all().await?;
    }

    registry.schedule(descriptor.id.clone(), store);
    Ok(details)
}

// ---------------------------------------------------------------------------
// Deferred Drop Registry
// ---------------------------------------------------------------------------

/// Pending deferred drops of peeked profile stores, keyed by identity id.
///
/// Owned by one identity directory; timers never leak across directory
/// instances. Scheduling for an id that already has a pending timer
/// replaces it rather than stacking drops.
pub(crate) struct PeekDropRegistry {
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PeekDropRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Cancel any pending drop for `id`.
    pub(crate) fn cancel(&self, id: &str) {
        if let Some(timer) = self.timers.lock().remove(id) {
            timer.abort();
        }
    }

    /// Schedule a deferred drop of `store`, replacing any pending timer
    /// for the same id.
    pub(crate) fn schedule(self: &Arc<Self>, id: String, store: Arc<dyn KeyStore>) {
        self.cancel(&id);

        let registry: Weak<Self> = Arc::downgrade(self);
        let key = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(PEEK_DROP_DELAY).await;

            if let Err(err) = store.drop_store().await {
                tracing::warn!(identity = %key, error = %err,
                    "unable to drop peeked profile store");
            }
            if let Some(registry) = registry.upgrade() {
                registry.timers.lock().remove(&key);
            }
        });

        self.timers.lock().insert(id, timer);
    }

    /// Whether a drop is pending for `id`.
    #[cfg(test)]
    pub(crate) fn is_pending(&self, id: &str) -> bool {
        self.timers.lock().contains_key(id)
    }
}

impl Drop for PeekDropRegistry {
    fn drop(&mut self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
