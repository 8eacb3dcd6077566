//! # DID Method Registry & Dispatch
//!
//! Every DID operation in the wallet funnels through one [`Didm`] registry.
//! The registry holds the method drivers registered at construction time,
//! answers capability queries, and dispatches operations after validating
//! them — never before.
//!
//! ## Dispatch Protocol
//!
//! Each dispatching operation runs the same three-step gate:
//!
//! 1. Parse the DID against the `did:<method>:<id>` grammar
//!    (`INVALID_DID` on mismatch).
//! 2. Look up the driver for `<method>` (`UNSUPPORTED_DID_METHOD` when
//!    unregistered).
//! 3. Confirm the driver exposes the requested purpose
//!    (`UNSUPPORTED_DID_METHOD_PURPOSE` otherwise).
//!
//! Only then are the arguments forwarded — unchanged — to the driver, and
//! driver failures propagate opaquely. Validation errors therefore never
//! leave partial side effects behind: the driver was never called.
//!
//! ## Immutability
//!
//! The registry and its drivers are frozen after construction. One driver
//! instance exists per registered method, each bound to its own network
//! handle. There is no dynamic (un)registration — a wallet's method set is
//! a deployment decision, not a runtime one.

pub mod document;
pub mod hypns;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::KeyPair;
use document::DidDocument;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by the dispatch layer, plus opaque driver failures.
#[derive(Debug, Error)]
pub enum DidmError {
    /// The DID string does not match the `did:<method>:<id>` grammar.
    #[error("invalid DID: {0}")]
    InvalidDid(String),

    /// No driver is registered for the method.
    #[error("Did method `{0}` is not supported")]
    UnsupportedDidMethod(String),

    /// The method is registered but its driver does not implement the
    /// requested operation.
    #[error("Purpose `{purpose}` is not currently supported for `{method}`")]
    UnsupportedDidMethodPurpose {
        /// The registered method.
        method: String,
        /// The operation the driver lacks.
        purpose: Purpose,
    },

    /// A failure inside a driver, passed through unchanged.
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

impl DidmError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            DidmError::InvalidDid(_) => "INVALID_DID",
            DidmError::UnsupportedDidMethod(_) => "UNSUPPORTED_DID_METHOD",
            DidmError::UnsupportedDidMethodPurpose { .. } => "UNSUPPORTED_DID_METHOD_PURPOSE",
            DidmError::Driver(_) => "DID_METHOD_ERROR",
        }
    }
}

/// Result alias for registry operations.
pub type DidmResult<T> = Result<T, DidmError>;

/// Result alias for driver operations. Driver errors are opaque to the
/// registry and its callers.
pub type DriverResult<T> = anyhow::Result<T>;

// ---------------------------------------------------------------------------
// DID Grammar
// ---------------------------------------------------------------------------

/// A DID split into its grammar components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDid {
    /// The method name (`hypns` in `did:hypns:abc`).
    pub method: String,
    /// The method-specific identifier.
    pub identifier: String,
}

/// Parse a DID against the `did:<method>:<method-specific-id>` grammar.
///
/// The method must be non-empty lowercase alphanumeric and the identifier
/// non-empty; any other shape fails with [`DidmError::InvalidDid`].
pub fn parse_did(did: &str) -> DidmResult<ParsedDid> {
    let invalid = || DidmError::InvalidDid(did.to_owned());

    let mut parts = did.splitn(3, ':');
    let scheme = parts.next().ok_or_else(invalid)?;
    let method = parts.next().ok_or_else(invalid)?;
    let identifier = parts.next().ok_or_else(invalid)?;

    if scheme != "did" || identifier.is_empty() {
        return Err(invalid());
    }
    if method.is_empty()
        || !method
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(invalid());
    }

    Ok(ParsedDid {
        method: method.to_owned(),
        identifier: identifier.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Purposes & Method Descriptors
// ---------------------------------------------------------------------------

/// The operations a method driver may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Purpose {
    /// Derive the DID for a method-specific handle.
    GetDid,
    /// Resolve a DID to its document.
    Resolve,
    /// Create a new DID and document.
    Create,
    /// Update an existing document.
    Update,
    /// Check a public key id against the resolved document.
    IsPublicKeyValid,
}

impl Purpose {
    /// The wire/UI name of this purpose.
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::GetDid => "getDid",
            Purpose::Resolve => "resolve",
            Purpose::Create => "create",
            Purpose::Update => "update",
            Purpose::IsPublicKeyValid => "isPublicKeyValid",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a DID method, for display surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfo {
    /// The method name as it appears in DIDs.
    pub method: String,
    /// Human-readable description.
    pub description: String,
    /// Project homepage.
    pub homepage_url: String,
    /// Icon URLs, largest first.
    pub icons: Vec<String>,
}

/// A registered method as reported by [`Didm::get_methods`]: its static
/// info plus the operations its driver actually implements.
#[derive(Debug, Clone, Serialize)]
pub struct MethodDescriptor {
    /// Static method information.
    pub info: MethodInfo,
    /// Supported operation set.
    pub purposes: Vec<Purpose>,
}

// ---------------------------------------------------------------------------
// Driver Contract
// ---------------------------------------------------------------------------

/// A document mutation callback handed to `create`/`update`.
///
/// Drivers invoke it with the in-progress document so the caller can add
/// keys and claims. It must never be invoked when the underlying operation
/// fails before reaching the document.
pub type DocumentOperations = Box<dyn FnOnce(&mut DidDocument) + Send>;

/// Result of a successful `create` dispatch.
#[derive(Debug, Clone)]
pub struct DidCreation {
    /// The newly created DID.
    pub did: String,
    /// The document as anchored on the method network.
    pub did_document: DidDocument,
    /// The backup key pair registered as the master key (caller-supplied
    /// or generated by the driver).
    pub backup_data: KeyPair,
}

/// One pluggable DID method implementation.
///
/// A driver may implement any subset of the operations; the subset is
/// advertised through [`MethodDriver::purposes`] and enforced by the
/// registry before dispatch. The default bodies exist only so partial
/// drivers stay small — the registry never routes an operation to a driver
/// that does not list it.
#[async_trait]
pub trait MethodDriver: Send + Sync {
    /// Static information about the method.
    fn info(&self) -> MethodInfo;

    /// The operations this driver implements.
    fn purposes(&self) -> &[Purpose];

    /// Derive the DID for method-specific parameters.
    async fn get_did(&self, params: Value) -> DriverResult<String> {
        let _ = params;
        Err(anyhow::anyhow!("getDid is not implemented by this driver"))
    }

    /// Resolve a DID to its document.
    async fn resolve(&self, did: &str) -> DriverResult<DidDocument> {
        let _ = did;
        Err(anyhow::anyhow!("resolve is not implemented by this driver"))
    }

    /// Create a new DID, running `operations` against the in-progress
    /// document.
    async fn create(
        &self,
        params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidCreation> {
        let _ = (params, operations);
        Err(anyhow::anyhow!("create is not implemented by this driver"))
    }

    /// Update an existing document, running `operations` against it.
    async fn update(
        &self,
        did: &str,
        params: Value,
        operations: DocumentOperations,
    ) -> DriverResult<DidDocument> {
        let _ = (did, params, operations);
        Err(anyhow::anyhow!("update is not implemented by this driver"))
    }

    /// Whether the resolved document carries a public key with `key_id`.
    async fn is_public_key_valid(&self, did: &str, key_id: &str) -> DriverResult<bool> {
        let _ = (did, key_id);
        Err(anyhow::anyhow!(
            "isPublicKeyValid is not implemented by this driver"
        ))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The DID method registry: validated dispatch over statically registered
/// drivers.
pub struct Didm {
    drivers: BTreeMap<String, Arc<dyn MethodDriver>>,
}

impl Didm {
    /// Build a registry from driver instances, keyed by their method name.
    /// Registering two drivers for the same method keeps the last one.
    pub fn new(drivers: impl IntoIterator<Item = Arc<dyn MethodDriver>>) -> Self {
        let drivers = drivers
            .into_iter()
            .map(|driver| (driver.info().method, driver))
            .collect();
        Self { drivers }
    }

    /// All registered methods with their static info and supported
    /// operation sets.
    pub fn get_methods(&self) -> BTreeMap<String, MethodDescriptor> {
        self.drivers
            .iter()
            .map(|(method, driver)| {
                (
                    method.clone(),
                    MethodDescriptor {
                        info: driver.info(),
                        purposes: driver.purposes().to_vec(),
                    },
                )
            })
            .collect()
    }

    /// Whether `method` is registered and its driver implements `purpose`.
    pub fn is_supported(&self, method: &str, purpose: Purpose) -> bool {
        self.drivers
            .get(method)
            .is_some_and(|driver| driver.purposes().contains(&purpose))
    }

    /// Derive the DID for method-specific parameters.
    pub async fn get_did(&self, method: &str, params: Value) -> DidmResult<String> {
        let driver = self.driver_for(method, Purpose::GetDid)?;
        Ok(driver.get_did(params).await?)
    }

    /// Resolve a DID to its document.
    pub async fn resolve(&self, did: &str) -> DidmResult<DidDocument> {
        let parsed = parse_did(did)?;
        let driver = self.driver_for(&parsed.method, Purpose::Resolve)?;
        Ok(driver.resolve(did).await?)
    }

    /// Create a new DID with the given method.
    pub async fn create(
        &self,
        method: &str,
        params: Value,
        operations: DocumentOperations,
    ) -> DidmResult<DidCreation> {
        let driver = self.driver_for(method, Purpose::Create)?;
        Ok(driver.create(params, operations).await?)
    }

    /// Update the document behind `did`.
    pub async fn update(
        &self,
        did: &str,
        params: Value,
        operations: DocumentOperations,
    ) -> DidmResult<DidDocument> {
        let parsed = parse_did(did)?;
        let driver = self.driver_for(&parsed.method, Purpose::Update)?;
        Ok(driver.update(did, params, operations).await?)
    }

    /// Whether the document behind `did` carries a public key with
    /// `key_id`.
    pub async fn is_public_key_valid(&self, did: &str, key_id: &str) -> DidmResult<bool> {
        let parsed = parse_did(did)?;
        let driver = self.driver_for(&parsed.method, Purpose::IsPublicKeyValid)?;
        Ok(driver.is_public_key_valid(did, key_id).await?)
    }

    /// The validation gate shared by every dispatch path: method must be
    /// registered and its driver must expose the purpose.
    fn driver_for(&self, method: &str, purpose: Purpose) -> DidmResult<&Arc<dyn MethodDriver>> {
        let driver = self
            .drivers
            .get(method)
            .ok_or_else(|| DidmError::UnsupportedDidMethod(method.to_owned()))?;

        if !driver.purposes().contains(&purpose) {
            return Err(DidmError::UnsupportedDidMethodPurpose {
                method: method.to_owned(),
                purpose,
            });
        }

        Ok(driver)
    }
}

impl fmt::Debug for Didm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Didm")
            .field("methods", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
