//! # Identity Aggregate
//!
//! One [`Identity`] ties a descriptor, a replicated database and the four
//! sub-stores (devices, backup, profile, apps) into a single handle. It
//! also owns the two identity-level behaviors the sub-stores cannot
//! provide on their own:
//!
//! - the lazily-derived, cached [`Signer`] for the current device, and
//! - the revocation cascade fired when the current device loses its place
//!   in the DID document.
//!
//! ## Revocation cascade
//!
//! When the current device is revoked the identity flips to revoked
//! exactly once, then persists the updated descriptor, stops replication
//! and notifies observers. Persistence and replication failures are
//! logged but never abort the cascade — a revoked identity must read as
//! revoked in memory even if the follow-up work failed.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

use super::{apps::Apps, backup::Backup, devices::Devices, profile::Profile};
use super::{descriptor_key, IdentityError};
use crate::crypto::{format_did_url, Signer};
use crate::linkage::ReplicatedDb;
use crate::storage::{SetOptions, Storage};

/// Observer invoked after a revocation cascade completes.
pub type RevokeListener = Arc<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// The persisted summary of an identity, stored encrypted in local
/// storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDescriptor {
    /// Identity id: hex SHA-256 of the DID.
    pub id: String,

    /// The identity's DID.
    pub did: String,

    /// When the identity was added to this wallet.
    pub added_at: DateTime<Utc>,

    /// Whether the identity has been revoked on this device.
    #[serde(default)]
    pub revoked: bool,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A fully materialized identity.
pub struct Identity {
    descriptor: RwLock<IdentityDescriptor>,
    storage: Arc<dyn Storage>,
    db: Arc<dyn ReplicatedDb>,
    devices: Devices,
    backup: Backup,
    profile: Profile,
    apps: Apps,
    signer: Mutex<Option<Arc<Signer>>>,
    revoke_listeners: Mutex<Vec<RevokeListener>>,
}

impl Identity {
    /// Assemble an identity from its parts, wiring the revocation cascade
    /// to the device registry.
    ///
    /// If the current device was already revoked remotely while this
    /// wallet was offline, the cascade runs right here so the identity
    /// never surfaces as active.
    pub(crate) async fn new(
        descriptor: IdentityDescriptor,
        storage: Arc<dyn Storage>,
        db: Arc<dyn ReplicatedDb>,
        devices: Devices,
        backup: Backup,
        profile: Profile,
        apps: Apps,
    ) -> Result<Arc<Self>, IdentityError> {
        let already_revoked = descriptor.revoked;
        let current_revoked = devices.current()?.is_revoked();

        let identity = Arc::new(Self {
            descriptor: RwLock::new(descriptor),
            storage,
            db,
            devices,
            backup,
            profile,
            apps,
            signer: Mutex::new(None),
            revoke_listeners: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&identity);
        identity.devices.on_current_revoke(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(identity) = weak.upgrade() {
                    identity.handle_current_revoke().await;
                }
            })
        }));

        if current_revoked && !already_revoked {
            identity.handle_current_revoke().await;
        }

        Ok(identity)
    }

    /// Snapshot of the descriptor.
    pub fn descriptor(&self) -> IdentityDescriptor {
        self.descriptor.read().clone()
    }

    /// The identity id (hex SHA-256 of the DID).
    pub fn id(&self) -> String {
        self.descriptor.read().id.clone()
    }

    /// The identity's DID.
    pub fn did(&self) -> String {
        self.descriptor.read().did.clone()
    }

    /// Whether the identity has been revoked on this device.
    pub fn is_revoked(&self) -> bool {
        self.descriptor.read().revoked
    }

    /// The device registry.
    pub fn devices(&self) -> &Devices {
        &self.devices
    }

    /// The backup custody.
    pub fn backup(&self) -> &Backup {
        &self.backup
    }

    /// The profile store.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// The linked-application registry.
    pub fn apps(&self) -> &Apps {
        &self.apps
    }

    /// Register an observer for the revocation cascade.
    pub fn on_revoke(&self, listener: RevokeListener) {
        self.revoke_listeners.lock().push(listener);
    }

    /// The signer bound to the current device's key, derived on first use
    /// and cached.
    ///
    /// Fails once the identity is revoked: a revoked device must not keep
    /// producing signatures.
    pub fn signer(&self) -> Result<Arc<Signer>, IdentityError> {
        if self.is_revoked() {
            return Err(IdentityError::Revoked(self.id()));
        }

        let mut cached = self.signer.lock();
        if let Some(signer) = cached.as_ref() {
            return Ok(signer.clone());
        }

        let current = self.devices.current()?;
        let did_url = format_did_url(&self.did(), &current.did_public_key_id);
        let signer = Arc::new(Signer::new(did_url, &self.devices.current_key_material())?);
        *cached = Some(signer.clone());
        Ok(signer)
    }

    /// The revocation cascade. Runs at most once per identity; later
    /// invocations return immediately.
    async fn handle_current_revoke(&self) {
        let descriptor = {
            let mut descriptor = self.descriptor.write();
            if descriptor.revoked {
                return;
            }
            descriptor.revoked = true;
            descriptor.clone()
        };

        tracing::info!(identity = %descriptor.id, did = %descriptor.did,
            "current device revoked, revoking identity");

        match serde_json::to_value(&descriptor) {
            Ok(value) => {
                if let Err(err) = self
                    .storage
                    .set(&descriptor_key(&descriptor.id), value, SetOptions::encrypted())
                    .await
                {
                    tracing::warn!(identity = %descriptor.id, error = %err,
                        "unable to persist revoked descriptor");
                }
            }
            Err(err) => {
                tracing::warn!(identity = %descriptor.id, error = %err,
                    "unable to serialize revoked descriptor");
            }
        }

        if let Err(err) = self.db.stop_replication().await {
            tracing::warn!(identity = %descriptor.id, error = %err,
                "unable to stop replication of revoked identity");
        }

        let listeners: Vec<RevokeListener> = self.revoke_listeners.lock().clone();
        for listener in listeners {
            listener();
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("descriptor", &*self.descriptor.read())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
