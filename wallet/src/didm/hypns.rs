//! # HyPNS Method Driver
//!
//! Driver for the `hypns` DID method, which anchors DIDs on the HyPNS
//! peer naming system. The network itself is an external collaborator:
//! the driver talks to it through [`HypnsNode`] (the process-wide node)
//! and [`HypnsSession`] (a resolver session on that node).
//!
//! ## Session lifecycle
//!
//! Establishing a resolver session is expensive (it joins the swarm), so
//! the driver opens it lazily on first use and reuses it for every later
//! call — at most one session per driver instance, guarded by a
//! `tokio::sync::OnceCell` against concurrent first calls.
//!
//! ## Backup keys
//!
//! `create` always registers a backup key pair as the `idm-master`
//! verification key on the new document: either the pair the caller
//! supplied in `params.backupData`, or a fresh one generated by the node.
//! The pair is returned to the caller, who is responsible for getting it
//! backed up.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::document::{DidDocument, DocumentPublicKey};
use super::{DidCreation, DocumentOperations, DriverResult, MethodDriver, MethodInfo, Purpose};
use crate::crypto::KeyPair;

/// Key id under which the backup public key is registered on new
/// documents.
pub const MASTER_KEY_ID: &str = "idm-master";

/// Operations the hypns driver implements — the full set.
const PURPOSES: &[Purpose] = &[
    Purpose::GetDid,
    Purpose::Resolve,
    Purpose::Create,
    Purpose::Update,
    Purpose::IsPublicKeyValid,
];

// ---------------------------------------------------------------------------
// Network Collaborators
// ---------------------------------------------------------------------------

/// The HyPNS network node the driver is bound to.
#[async_trait]
pub trait HypnsNode: Send + Sync {
    /// Open a resolver session on the node. Called at most once per driver
    /// instance.
    async fn create_session(&self) -> DriverResult<Arc<dyn HypnsSession>>;

    /// Generate a fresh key pair with the node's key-pair generator.
    fn generate_key_pair(&self) -> KeyPair;

    /// Derive the DID for a method-specific instance handle.
    async fn get_did(&self, params: Value) -> DriverResult<String>;
}

/// A resolver session, good for the lifetime of the driver.
#[async_trait]
pub trait HypnsSession: Send + Sync {
    /// Resolve a DID to its document.
    async fn resolve(&self, did: &str) -> DriverResult<DidDocument>;

    /// Anchor a new document, invoking `operations` with the in-progress
    /// document before publishing. `operations` must not run when creation
    /// fails beforehand.
    async fn create(&self, params: Value, operations: DocumentOperations)
        -> DriverResult<DidDocument>;

    /// Update the document behind `did`, invoking `operations` with it
    /// before republishing.
    async fn update(
        &self,
        did: &str,
        params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidDocument>;
}

// ---------------------------------------------------------------------------
// Create Parameters
// ---------------------------------------------------------------------------

/// The subset of `create` parameters the driver inspects. Everything else
/// in `params` is forwarded to the session untouched.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CreateParams {
    backup_data: BackupDataParams,
}

/// Caller-supplied backup key material. Only used when both halves are
/// present; a partial pair falls back to generation.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BackupDataParams {
    public_key: Option<String>,
    private_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The `hypns` method driver.
pub struct HypnsMethod {
    node: Arc<dyn HypnsNode>,
    session: OnceCell<Arc<dyn HypnsSession>>,
}

impl HypnsMethod {
    /// Bind a driver to a network node.
    pub fn new(node: Arc<dyn HypnsNode>) -> Self {
        Self {
            node,
            session: OnceCell::new(),
        }
    }

    /// The lazily-established resolver session.
    async fn session(&self) -> DriverResult<&Arc<dyn HypnsSession>> {
        self.session
            .get_or_try_init(|| self.node.create_session())
            .await
    }

    /// The backup pair for a creation: caller-supplied when complete,
    /// generated otherwise.
    fn backup_pair(&self, params: &Value) -> KeyPair {
        let parsed: CreateParams = serde_json::from_value(params.clone()).unwrap_or_default();
        match (parsed.backup_data.public_key, parsed.backup_data.private_key) {
            (Some(public_key), Some(private_key)) => KeyPair {
                public_key,
                private_key,
            },
            _ => self.node.generate_key_pair(),
        }
    }
}

#[async_trait]
impl MethodDriver for HypnsMethod {
    fn info(&self) -> MethodInfo {
        MethodInfo {
            method: "hypns".to_owned(),
            description: "The hypns DID method anchors DIDs on the HyPNS peer naming system."
                .to_owned(),
            homepage_url: "https://hypns.org".to_owned(),
            icons: Vec::new(),
        }
    }

    fn purposes(&self) -> &[Purpose] {
        PURPOSES
    }

    async fn get_did(&self, params: Value) -> DriverResult<String> {
        self.node.get_did(params).await
    }

    async fn resolve(&self, did: &str) -> DriverResult<DidDocument> {
        let session = self.session().await?;
        session.resolve(did).await
    }

    async fn create(
        &self,
        params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidCreation> {
        let backup = self.backup_pair(&params);
        let session = self.session().await?;

        let master_public_key = backup.public_key.clone();
        let did_document = session
            .create(
                params,
                Box::new(move |document| {
                    document.add_public_key(DocumentPublicKey::ed25519(
                        MASTER_KEY_ID,
                        master_public_key,
                    ));
                    operations(document);
                }),
            )
            .await?;

        Ok(DidCreation {
            did: did_document.id.clone(),
            did_document,
            backup_data: backup,
        })
    }

    async fn update(
        &self,
        did: &str,
        params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidDocument> {
        let session = self.session().await?;
        session.update(did, params, operations).await
    }

    async fn is_public_key_valid(&self, did: &str, key_id: &str) -> DriverResult<bool> {
        let document = self.resolve(did).await?;
        Ok(document.has_public_key(key_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
