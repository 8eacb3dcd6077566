//! # Identity Directory
//!
//! The directory is the wallet's root collection: every identity the user
//! holds, keyed by its deterministic id (hex SHA-256 of the DID). It owns
//! the lifecycle operations — create, load, remove, peek — and coordinates
//! the per-identity sub-stores across local storage and the replication
//! linkage.
//!
//! ## Atomicity
//!
//! Creation is all-or-nothing to the caller: sub-stores are built strictly
//! in order (backup, profile, devices, apps) and any failure triggers a
//! best-effort teardown of everything already created before the original
//! error is returned. Teardown failures are logged, never surfaced — the
//! caller gets the error that actually broke the creation.
//!
//! ## Load isolation
//!
//! Loading the directory never fails wholesale because one identity is
//! corrupt: per-identity failures are logged and skipped, and the rest of
//! the wallet stays usable.

pub mod apps;
pub mod backup;
pub mod devices;
pub mod identity;
pub mod profile;

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{hash_identity_id, KeyPair, SignerError};
use crate::didm::document::DocumentPublicKey;
use crate::didm::{Didm, DidmError};
use crate::linkage::{DbOptions, Linkage, ReplicatedDb};
use crate::storage::{KeyRange, SetOptions, Storage};

use devices::DeviceInput;
use identity::{Identity, IdentityDescriptor};
use profile::{PeekDropRegistry, ProfileDetails, ProfileError};

/// Local-storage key prefix under which identity descriptors live.
pub(crate) const DESCRIPTOR_KEY_PREFIX: &str = "identity!";

pub(crate) fn descriptor_key(id: &str) -> String {
    format!("{DESCRIPTOR_KEY_PREFIX}{id}")
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Signing was requested on a revoked identity.
    #[error("unable to create signer for revoked identity: {0}")]
    Revoked(String),

    /// The device id is not linked to this identity.
    #[error("unknown device `{0}`")]
    UnknownDevice(String),

    /// The identity has no local record of its current device.
    #[error("no current device record found for this identity")]
    CurrentDeviceMissing,

    /// An application failed validation.
    #[error("invalid application: {0}")]
    InvalidApp(String),

    /// Signer derivation failed.
    #[error(transparent)]
    Signer(#[from] SignerError),

    /// A DID registry failure.
    #[error(transparent)]
    Didm(#[from] DidmError),

    /// A profile failure.
    #[error(transparent)]
    Profile(#[from] ProfileError),

    /// A record failed to (de)serialize.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A storage or linkage failure, passed through unchanged.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Everything needed to add an identity to the wallet, whether freshly
/// created on the DID network or imported from another device.
#[derive(Debug, Clone)]
pub struct IdentityInput {
    /// The identity's DID, already anchored on its method network.
    pub did: String,

    /// The device this wallet instance runs on.
    pub current_device: DeviceInput,

    /// Backup key pair still awaiting user backup, when there is one.
    pub backup_data: Option<KeyPair>,

    /// Initial profile details. `None` means the profile lives on other
    /// devices and will arrive by replication.
    pub profile_details: Option<ProfileDetails>,
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// The wallet's identity collection.
pub struct IdentityDirectory {
    storage: Arc<dyn Storage>,
    didm: Arc<Didm>,
    linkage: Arc<dyn Linkage>,
    peek_registry: Arc<PeekDropRegistry>,
    identities: RwLock<BTreeMap<String, Arc<Identity>>>,
}

impl IdentityDirectory {
    /// Build a directory over its collaborators. Call [`load_all`] next to
    /// materialize persisted identities.
    ///
    /// [`load_all`]: IdentityDirectory::load_all
    pub fn new(storage: Arc<dyn Storage>, didm: Arc<Didm>, linkage: Arc<dyn Linkage>) -> Self {
        Self {
            storage,
            didm,
            linkage,
            peek_registry: PeekDropRegistry::new(),
            identities: RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up a loaded identity by id.
    pub fn get(&self, id: &str) -> Option<Arc<Identity>> {
        self.identities.read().get(id).cloned()
    }

    /// All loaded identities, oldest first, ties broken by id.
    pub fn list(&self) -> Vec<Arc<Identity>> {
        let mut identities: Vec<Arc<Identity>> =
            self.identities.read().values().cloned().collect();
        identities.sort_by(|a, b| {
            let (da, db) = (a.descriptor(), b.descriptor());
            da.added_at.cmp(&db.added_at).then_with(|| da.id.cmp(&db.id))
        });
        identities
    }

    /// Whether an identity with this DID is loaded.
    pub fn has(&self, did: &str) -> bool {
        self.identities
            .read()
            .contains_key(&hash_identity_id(did))
    }

    /// Create a brand-new identity: anchor a DID on `method`, registering
    /// the device's public key on the new document, then add the resulting
    /// identity to the wallet.
    ///
    /// A driver failure propagates unchanged and leaves nothing persisted;
    /// the descriptor is only written once the DID exists.
    pub async fn create_did(
        &self,
        method: &str,
        params: Value,
        device: DeviceInput,
        profile_details: Option<ProfileDetails>,
    ) -> Result<Arc<Identity>, IdentityError> {
        let key_id = device.did_public_key_id.clone();
        let public_key = device.key_material.public_key.clone();

        let creation = self
            .didm
            .create(
                method,
                params,
                Box::new(move |doc| {
                    doc.add_public_key(DocumentPublicKey::ed25519(key_id, public_key));
                }),
            )
            .await?;

        self.create(IdentityInput {
            did: creation.did,
            current_device: device,
            backup_data: Some(creation.backup_data),
            profile_details,
        })
        .await
    }

    /// Add an identity whose DID already exists to the wallet.
    ///
    /// All-or-nothing: on failure everything already created is torn back
    /// down (best effort) and the original error returned.
    pub async fn create(&self, input: IdentityInput) -> Result<Arc<Identity>, IdentityError> {
        let descriptor = IdentityDescriptor {
            id: hash_identity_id(&input.did),
            did: input.did.clone(),
            added_at: chrono::Utc::now(),
            revoked: false,
        };

        self.storage
            .set(
                &descriptor_key(&descriptor.id),
                serde_json::to_value(&descriptor)?,
                SetOptions::encrypted(),
            )
            .await?;

        match self.create_stores(&descriptor, input).await {
            Ok(identity) => {
                self.identities
                    .write()
                    .insert(descriptor.id.clone(), identity.clone());
                Ok(identity)
            }
            Err(err) => {
                tracing::warn!(identity = %descriptor.id, error = %err,
                    "identity creation failed, rolling back");
                self.rollback_create(&descriptor.id).await;
                Err(err)
            }
        }
    }

    /// Remove an identity and everything it owns. Removing an unknown
    /// identity is a no-op, and removal of a partially-removed identity
    /// finishes the job.
    pub async fn remove(&self, id: &str) -> Result<(), IdentityError> {
        if self.storage.get(&descriptor_key(id)).await?.is_none() {
            return Ok(());
        }

        self.storage.remove(&descriptor_key(id)).await?;
        self.peek_registry.cancel(id);

        let db = self
            .linkage
            .get_db(id, DbOptions { replicate: false })
            .await?;
        devices::remove(id, self.storage.clone(), &db).await?;
        profile::remove(&db).await?;
        backup::remove(id, self.storage.clone()).await?;
        apps::remove(&db).await?;
        self.linkage.drop_db(db).await?;

        self.identities.write().remove(id);
        Ok(())
    }

    /// Load every persisted identity. Failures are isolated per identity:
    /// the broken one is logged and skipped, the rest load normally.
    pub async fn load_all(&self) -> Result<(), IdentityError> {
        let range = KeyRange::with_prefix(DESCRIPTOR_KEY_PREFIX);
        for value in self.storage.list(&range).await? {
            let descriptor: IdentityDescriptor = match serde_json::from_value(value) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    tracing::error!(error = %err, "skipping undecodable identity descriptor");
                    continue;
                }
            };

            let id = descriptor.id.clone();
            match self.load_identity(descriptor).await {
                Ok(identity) => {
                    self.identities.write().insert(id, identity);
                }
                Err(err) => {
                    tracing::error!(identity = %id, error = %err,
                        "skipping identity that failed to load");
                }
            }
        }
        Ok(())
    }

    /// Read-only preview of a not-yet-imported identity's profile, without
    /// building the aggregate.
    pub async fn peek(&self, did: &str) -> Result<ProfileDetails, IdentityError> {
        let id = hash_identity_id(did);
        if let Some(identity) = self.get(&id) {
            return Ok(identity.profile().details());
        }

        let descriptor = IdentityDescriptor {
            id,
            did: did.to_owned(),
            added_at: chrono::Utc::now(),
            revoked: false,
        };
        let db = self
            .linkage
            .get_db(&descriptor.id, DbOptions::default())
            .await?;
        Ok(profile::peek(&descriptor, &db, &self.peek_registry).await?)
    }

    async fn create_stores(
        &self,
        descriptor: &IdentityDescriptor,
        input: IdentityInput,
    ) -> Result<Arc<Identity>, IdentityError> {
        let db = self
            .linkage
            .get_db(&descriptor.id, DbOptions::default())
            .await?;

        let backup =
            backup::create(&descriptor.id, input.backup_data, self.storage.clone()).await?;
        let profile = profile::create(
            input.profile_details,
            descriptor,
            &db,
            &self.peek_registry,
        )
        .await?;
        let devices = devices::create(
            &descriptor.id,
            &descriptor.did,
            input.current_device,
            self.didm.clone(),
            self.storage.clone(),
            &db,
        )
        .await?;
        let apps = apps::create(&devices.current()?.id, &db).await?;

        Identity::new(
            descriptor.clone(),
            self.storage.clone(),
            db,
            devices,
            backup,
            profile,
            apps,
        )
        .await
    }

    /// Best-effort teardown after a failed creation. Every step is
    /// attempted; failures are logged and swallowed.
    async fn rollback_create(&self, id: &str) {
        let warn = |step: &str, err: &dyn std::fmt::Display| {
            tracing::warn!(identity = %id, step, error = %err, "creation rollback step failed");
        };

        if let Err(err) = self.storage.remove(&descriptor_key(id)).await {
            warn("descriptor", &err);
        }
        if let Err(err) = backup::remove(id, self.storage.clone()).await {
            warn("backup", &err);
        }

        match self.linkage.get_db(id, DbOptions { replicate: false }).await {
            Ok(db) => {
                if let Err(err) = devices::remove(id, self.storage.clone(), &db).await {
                    warn("devices", &err);
                }
                if let Err(err) = profile::remove(&db).await {
                    warn("profile", &err);
                }
                if let Err(err) = apps::remove(&db).await {
                    warn("apps", &err);
                }
                if let Err(err) = self.linkage.drop_db(db).await {
                    warn("database", &err);
                }
            }
            Err(err) => warn("database", &err),
        }
    }

    async fn load_identity(
        &self,
        descriptor: IdentityDescriptor,
    ) -> Result<Arc<Identity>, IdentityError> {
        let db = self
            .linkage
            .get_db(
                &descriptor.id,
                DbOptions {
                    replicate: !descriptor.revoked,
                },
            )
            .await?;

        let backup = backup::restore(&descriptor.id, self.storage.clone()).await?;
        let profile = profile::restore(&descriptor, &db, &self.peek_registry).await?;
        let devices = devices::restore(
            &descriptor.id,
            &descriptor.did,
            self.didm.clone(),
            self.storage.clone(),
            &db,
        )
        .await?;
        let apps = apps::create(&devices.current()?.id, &db).await?;

        Identity::new(
            descriptor,
            self.storage.clone(),
            db,
            devices,
            backup,
            profile,
            apps,
        )
        .await
    }
}

impl std::fmt::Debug for IdentityDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityDirectory")
            .field(
                "identities",
                &self.identities.read().keys().collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
