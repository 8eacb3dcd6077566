//! # Backup Key Custody
//!
//! The backup key pair registered as the master key on an identity's DID
//! document is held — encrypted — in local storage until the user completes
//! their backup flow (writes the key down, exports it). Completing the
//! backup erases the local copy; from then on the wallet never sees the
//! private half again.

use parking_lot::RwLock;
use std::sync::Arc;

use super::IdentityError;
use crate::crypto::KeyPair;
use crate::storage::{SetOptions, Storage};

const BACKUP_KEY_PREFIX: &str = "identity-backup!";

fn backup_key(identity_id: &str) -> String {
    format!("{BACKUP_KEY_PREFIX}{identity_id}")
}

/// Custody of one identity's backup key pair.
pub struct Backup {
    storage: Arc<dyn Storage>,
    key: String,
    data: RwLock<Option<KeyPair>>,
}

impl Backup {
    /// The pending backup data, or `None` once the backup is complete.
    pub fn data(&self) -> Option<KeyPair> {
        self.data.read().clone()
    }

    /// Whether the user has completed their backup.
    pub fn is_complete(&self) -> bool {
        self.data.read().is_none()
    }

    /// Mark the backup complete, erasing the locally held pair. Completing
    /// an already complete backup is a no-op.
    pub async fn set_complete(&self) -> Result<(), IdentityError> {
        if self.is_complete() {
            return Ok(());
        }
        self.storage.remove(&self.key).await?;
        *self.data.write() = None;
        Ok(())
    }
}

impl std::fmt::Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup")
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Store backup data for a new identity. `None` means the identity was
/// imported with the backup already handled elsewhere.
pub(crate) async fn create(
    identity_id: &str,
    data: Option<KeyPair>,
    storage: Arc<dyn Storage>,
) -> Result<Backup, IdentityError> {
    let key = backup_key(identity_id);
    if let Some(pair) = &data {
        storage
            .set(&key, serde_json::to_value(pair)?, SetOptions::encrypted())
            .await?;
    }
    Ok(Backup {
        storage,
        key,
        data: RwLock::new(data),
    })
}

/// Restore the backup state of a persisted identity.
pub(crate) async fn restore(
    identity_id: &str,
    storage: Arc<dyn Storage>,
) -> Result<Backup, IdentityError> {
    let key = backup_key(identity_id);
    let data = match storage.get(&key).await? {
        Some(value) => Some(serde_json::from_value(value)?),
        None => None,
    };
    Ok(Backup {
        storage,
        key,
        data: RwLock::new(data),
    })
}

/// Erase any pending backup data during identity removal.
pub(crate) async fn remove(
    identity_id: &str,
    storage: Arc<dyn Storage>,
) -> Result<(), IdentityError> {
    storage.remove(&backup_key(identity_id)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
