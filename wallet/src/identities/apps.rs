//! # Linked Applications
//!
//! Applications granted access to an identity are tracked in the
//! replicated `apps` store so every device sees the same grants. Each
//! record remembers which device made the grant.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::IdentityError;
use crate::linkage::{KeyStore, ReplicatedDb};

/// Name of the apps sub-store inside an identity's replicated database.
pub(crate) const DB_NAME: &str = "apps";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An application as presented by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Stable application identifier.
    pub id: String,

    /// Human-readable application name.
    pub name: String,

    /// Short description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Application homepage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage_url: Option<String>,

    /// Icon URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

/// A linked application as stored and replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    /// The application itself.
    #[serde(flatten)]
    pub app: App,

    /// Device that linked the application.
    pub device_id: String,

    /// When the application was linked.
    pub added_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Apps
// ---------------------------------------------------------------------------

/// The linked-application registry of one identity.
pub struct Apps {
    store: Arc<dyn KeyStore>,
    current_device_id: String,
    records: RwLock<HashMap<String, AppRecord>>,
}

impl Apps {
    /// List all linked applications, most recently linked first, ties
    /// broken by id.
    pub fn list(&self) -> Vec<AppRecord> {
        let mut records: Vec<AppRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| {
            b.added_at
                .cmp(&a.added_at)
                .then_with(|| a.app.id.cmp(&b.app.id))
        });
        records
    }

    /// Look up a linked application by id.
    pub fn get(&self, id: &str) -> Option<AppRecord> {
        self.records.read().get(id).cloned()
    }

    /// Link an application to this identity. Re-linking an already linked
    /// application refreshes its details and timestamp.
    pub async fn add(&self, app: App) -> Result<AppRecord, IdentityError> {
        if app.id.trim().is_empty() {
            return Err(IdentityError::InvalidApp("id must not be empty".into()));
        }
        if app.name.trim().is_empty() {
            return Err(IdentityError::InvalidApp("name must not be empty".into()));
        }

        let record = AppRecord {
            app,
            device_id: self.current_device_id.clone(),
            added_at: Utc::now(),
        };
        self.store
            .put(&record.app.id, serde_json::to_value(&record)?)
            .await?;
        self.records
            .write()
            .insert(record.app.id.clone(), record.clone());
        Ok(record)
    }

    /// Unlink an application. Unlinking an unknown application is a no-op.
    pub async fn remove(&self, id: &str) -> Result<(), IdentityError> {
        if !self.records.read().contains_key(id) {
            return Ok(());
        }
        self.store.del(id).await?;
        self.records.write().remove(id);
        Ok(())
    }
}

impl std::fmt::Debug for Apps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Apps")
            .field("apps", &self.records.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Open the apps registry, creating the store when absent.
pub(crate) async fn create(
    current_device_id: &str,
    db: &Arc<dyn ReplicatedDb>,
) -> Result<Apps, IdentityError> {
    let store = db.load_store(DB_NAME).await?;

    let mut records = HashMap::new();
    for (id, value) in store.all().await? {
        let record: AppRecord = serde_json::from_value(value)?;
        records.insert(id, record);
    }

    Ok(Apps {
        store,
        current_device_id: current_device_id.to_owned(),
        records: RwLock::new(records),
    })
}

/// Tear down the apps store during identity removal.
pub(crate) async fn remove(db: &Arc<dyn ReplicatedDb>) -> Result<(), IdentityError> {
    db.drop_store(DB_NAME).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
