//! # Device Registry
//!
//! Every device linked to an identity gets an entry in the replicated
//! `devices` store, plus — on the device that owns the identity locally —
//! an encrypted record in local storage holding the current device's
//! private key material. The replicated entries never carry private keys.
//!
//! ## Revocation
//!
//! Revoking a device is a two-step commit: the device's public key is
//! first removed from the DID document through the method registry, and
//! only then is the local entry marked revoked. A registry failure leaves
//! the device untouched. When the revoked device is the *current* one the
//! identity-level revocation hook fires, and `revoke` does not return
//! until that cascade has completed.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::IdentityError;
use crate::crypto::KeyMaterial;
use crate::didm::Didm;
use crate::linkage::{KeyStore, ReplicatedDb};
use crate::storage::{SetOptions, Storage};

/// Name of the devices sub-store inside an identity's replicated database.
pub(crate) const DB_NAME: &str = "devices";

const CURRENT_DEVICE_KEY_PREFIX: &str = "identity-device!";

fn current_device_key(identity_id: &str) -> String {
    format!("{CURRENT_DEVICE_KEY_PREFIX}{identity_id}")
}

/// Hook invoked when the current device gets revoked. Awaited to
/// completion before `revoke` returns.
pub(crate) type CurrentRevokeHook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A device linked to an identity, as replicated to all devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable device identifier.
    pub id: String,

    /// Id of this device's public key in the DID document.
    pub did_public_key_id: String,

    /// Hex-encoded public key.
    pub public_key: String,

    /// When the device was linked.
    pub added_at: DateTime<Utc>,

    /// When the device was revoked, if it has been.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Whether this device has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Parameters describing the device an identity is created or imported on.
#[derive(Debug, Clone)]
pub struct DeviceInput {
    /// Stable device identifier.
    pub id: String,

    /// Id of this device's public key in the DID document.
    pub did_public_key_id: String,

    /// The device's key pair. The private half stays on this device.
    pub key_material: KeyMaterial,
}

/// The current device's private record, persisted encrypted in local
/// storage only.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentDeviceRecord {
    device_id: String,
    key_material: KeyMaterial,
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

struct DevicesInner {
    did: String,
    didm: Arc<Didm>,
    store: Arc<dyn KeyStore>,
    devices: RwLock<HashMap<String, Device>>,
    current_id: String,
    key_material: KeyMaterial,
    current_revoke_hook: Mutex<Option<CurrentRevokeHook>>,
}

/// The device registry of one identity.
pub struct Devices {
    inner: Arc<DevicesInner>,
}

impl Devices {
    /// List all devices, most recently added first, ties broken by id.
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.inner.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| b.added_at.cmp(&a.added_at).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// Look up a device by id.
    pub fn get(&self, id: &str) -> Option<Device> {
        self.inner.devices.read().get(id).cloned()
    }

    /// The device this wallet instance is running on.
    pub fn current(&self) -> Result<Device, IdentityError> {
        self.get(&self.inner.current_id)
            .ok_or(IdentityError::CurrentDeviceMissing)
    }

    /// Key material of the current device, private half included.
    pub(crate) fn current_key_material(&self) -> KeyMaterial {
        self.inner.key_material.clone()
    }

    /// Register the hook fired when the current device is revoked.
    /// Replaces any previously registered hook.
    pub(crate) fn on_current_revoke(&self, hook: CurrentRevokeHook) {
        *self.inner.current_revoke_hook.lock() = Some(hook);
    }

    /// Revoke a device.
    ///
    /// The device's key is removed from the DID document first; `params`
    /// carries whatever the DID method needs to authorize that update.
    /// Revoking an already revoked device is a no-op.
    pub async fn revoke(&self, id: &str, params: &Value) -> Result<(), IdentityError> {
        let device = self
            .get(id)
            .ok_or_else(|| IdentityError::UnknownDevice(id.to_owned()))?;
        if device.is_revoked() {
            return Ok(());
        }

        let key_id = device.did_public_key_id.clone();
        self.inner
            .didm
            .update(
                &self.inner.did,
                params.clone(),
                Box::new(move |doc| {
                    doc.revoke_public_key(&key_id);
                }),
            )
            .await?;

        let mut revoked = device;
        revoked.revoked_at = Some(Utc::now());
        self.inner
            .store
            .put(&revoked.id, serde_json::to_value(&revoked)?)
            .await?;
        self.inner
            .devices
            .write()
            .insert(revoked.id.clone(), revoked);

        if id == self.inner.current_id {
            self.fire_current_revoke_hook().await;
        }
        Ok(())
    }

    async fn fire_current_revoke_hook(&self) {
        // Await outside the lock so the hook can touch the registry.
        let fut = self
            .inner
            .current_revoke_hook
            .lock()
            .as_ref()
            .map(|hook| hook());
        if let Some(fut) = fut {
            fut.await;
        }
    }
}

impl std::fmt::Debug for Devices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Devices")
            .field("current_id", &self.inner.current_id)
            .field("devices", &*self.inner.devices.read())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create the device registry for a newly created or imported identity,
/// registering `current` as its first local device.
pub(crate) async fn create(
    identity_id: &str,
    did: &str,
    current: DeviceInput,
    didm: Arc<Didm>,
    storage: Arc<dyn Storage>,
    db: &Arc<dyn ReplicatedDb>,
) -> Result<Devices, IdentityError> {
    let store = db.load_store(DB_NAME).await?;

    let device = Device {
        id: current.id.clone(),
        did_public_key_id: current.did_public_key_id.clone(),
        public_key: current.key_material.public_key.clone(),
        added_at: Utc::now(),
        revoked_at: None,
    };
    store.put(&device.id, serde_json::to_value(&device)?).await?;

    let record = CurrentDeviceRecord {
        device_id: current.id.clone(),
        key_material: current.key_material.clone(),
    };
    storage
        .set(
            &current_device_key(identity_id),
            serde_json::to_value(&record)?,
            SetOptions::encrypted(),
        )
        .await?;

    load(identity_id, did, didm, storage, store).await
}

/// Restore the device registry of a persisted identity.
pub(crate) async fn restore(
    identity_id: &str,
    did: &str,
    didm: Arc<Didm>,
    storage: Arc<dyn Storage>,
    db: &Arc<dyn ReplicatedDb>,
) -> Result<Devices, IdentityError> {
    let store = db.load_store(DB_NAME).await?;
    load(identity_id, did, didm, storage, store).await
}

/// Tear down the device registry during identity removal.
pub(crate) async fn remove(
    identity_id: &str,
    storage: Arc<dyn Storage>,
    db: &Arc<dyn ReplicatedDb>,
) -> Result<(), IdentityError> {
    storage.remove(&current_device_key(identity_id)).await?;
    db.drop_store(DB_NAME).await?;
    Ok(())
}

async fn load(
    identity_id: &str,
    did: &str,
    didm: Arc<Didm>,
    storage: Arc<dyn Storage>,
    store: Arc<dyn KeyStore>,
) -> Result<Devices, IdentityError> {
    let record: CurrentDeviceRecord = storage
        .get(&current_device_key(identity_id))
        .await?
        .ok_or(IdentityError::CurrentDeviceMissing)
        .and_then(|value| serde_json::from_value(value).map_err(IdentityError::from))?;

    let mut devices = HashMap::new();
    for (id, value) in store.all().await? {
        let device: Device = serde_json::from_value(value)?;
        devices.insert(id, device);
    }

    Ok(Devices {
        inner: Arc::new(DevicesInner {
            did: did.to_owned(),
            didm,
            store,
            devices: RwLock::new(devices),
            current_id: record.device_id,
            key_material: record.key_material,
            current_revoke_hook: Mutex::new(None),
        }),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
