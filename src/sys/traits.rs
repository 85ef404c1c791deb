// src/sys/traits.rs
//
// 🏗️ Collaborator contracts. The rotator only ever talks to these traits, so
// the Secret Manager client and the metadata lookup can be swapped for
// in-memory doubles under test.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

// ==============================================================================
// 1. Addressing
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretLocator {
    pub project: String,
    pub name: String,
}

impl SecretLocator {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    /// Version-agnostic parent, `projects/{p}/secrets/{n}`. New versions are
    /// added here and the store assigns the number.
    pub fn parent(&self) -> String {
        format!("projects/{}/secrets/{}", self.project, self.name)
    }

    pub fn latest(&self) -> String {
        format!("{}/versions/latest", self.parent())
    }
}

impl fmt::Display for SecretLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parent())
    }
}

// ==============================================================================
// 2. Secret Store
// ==============================================================================

/// The latest stored blob together with the version it was read from.
pub struct StoredSecret {
    pub data: Zeroizing<Vec<u8>>,
    /// Fully-qualified version name, e.g. `projects/1/secrets/s/versions/7`.
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionHandle {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("store rejected payload checksum")]
    ChecksumRejected,

    #[error("write conflict: expected latest version {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("store request failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch_latest(&self, locator: &SecretLocator) -> Result<StoredSecret, StoreError>;

    /// Adds `payload` as a new version under `locator.parent()`.
    /// 🛡️ When `expected_version` is set, the store refuses with
    /// `StoreError::Conflict` unless that is still the latest version.
    async fn add_version(
        &self,
        locator: &SecretLocator,
        payload: &[u8],
        checksum: u32,
        expected_version: Option<&str>,
    ) -> Result<VersionHandle, StoreError>;
}

// ==============================================================================
// 3. Identity
// ==============================================================================

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_project_id(&self) -> Result<String, String>;
}
