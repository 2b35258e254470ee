//! Permission management for extensions.
//!
//! This module provides:
//! - `Permission` - A single manifest permission (`"storage"`, `"tabs"`, ...)
//! - `PermissionSet` - The set of permissions granted to an extension
//! - `PermissionGate` - The runtime check every privileged API call goes through
//!
//! The gate holds no persistence. The host grants a set on activation and
//! revokes it on deactivation.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ExtensionError, ExtensionResult};
use super::ExtensionId;

/// A manifest permission name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Permission {
    Storage,
    UnlimitedStorage,
    Tabs,
    /// Any permission this runtime does not interpret itself.
    Other(String),
}

impl Permission {
    pub fn as_str(&self) -> &str {
        match self {
            Permission::Storage => "storage",
            Permission::UnlimitedStorage => "unlimitedStorage",
            Permission::Tabs => "tabs",
            Permission::Other(name) => name,
        }
    }
}

impl From<&str> for Permission {
    fn from(name: &str) -> Self {
        match name {
            "storage" => Permission::Storage,
            "unlimitedStorage" => Permission::UnlimitedStorage,
            "tabs" => Permission::Tabs,
            other => Permission::Other(other.to_string()),
        }
    }
}

impl From<String> for Permission {
    fn from(name: String) -> Self {
        Permission::from(name.as_str())
    }
}

impl From<Permission> for String {
    fn from(permission: Permission) -> Self {
        permission.as_str().to_string()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of permissions granted to an extension.
///
/// Serializes as the manifest's `"permissions"` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PermissionSet {
    permissions: BTreeSet<Permission>,
}

impl PermissionSet {
    /// Create a new empty permission set (all denied).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a permission set from a manifest `"permissions"` list.
    pub fn from_manifest<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            permissions: names
                .into_iter()
                .map(|name| Permission::from(name.as_ref()))
                .collect(),
        }
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.permissions.insert(permission)
    }

    pub fn remove(&mut self, permission: &Permission) -> bool {
        self.permissions.remove(permission)
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    /// Check that every permission in `required` is present.
    ///
    /// Fails with the first missing permission, in the order given.
    pub fn check_all(&self, required: &[Permission]) -> ExtensionResult<()> {
        match required.iter().find(|p| !self.contains(p)) {
            Some(missing) => Err(ExtensionError::InsufficientPermission(
                missing.as_str().to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Get a list of all permission names in the set.
    pub fn enabled_permissions(&self) -> Vec<&str> {
        self.permissions.iter().map(Permission::as_str).collect()
    }
}

/// Runtime permission checks, shared by every privileged API.
///
/// Grants are fixed per activation. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct PermissionGate {
    grants: Arc<RwLock<HashMap<ExtensionId, PermissionSet>>>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the granted set for an extension.
    pub fn grant(&self, extension: ExtensionId, permissions: PermissionSet) {
        debug!(
            extension = %extension,
            permissions = ?permissions.enabled_permissions(),
            "granted permissions"
        );
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(extension, permissions);
    }

    /// Drop every grant for an extension.
    pub fn revoke(&self, extension: &ExtensionId) {
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(extension);
    }

    pub fn granted(&self, extension: &ExtensionId) -> PermissionSet {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(extension)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_permission(&self, extension: &ExtensionId, permission: &Permission) -> bool {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(extension)
            .is_some_and(|set| set.contains(permission))
    }

    /// Fail with `InsufficientPermission` naming the first missing entry.
    /// An empty requirement always passes.
    pub fn require_permission(
        &self,
        extension: &ExtensionId,
        required: &[Permission],
    ) -> ExtensionResult<()> {
        if required.is_empty() {
            return Ok(());
        }
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        match grants.get(extension) {
            Some(set) => set.check_all(required),
            None => Err(ExtensionError::InsufficientPermission(
                required[0].as_str().to_string(),
            )),
        }
    }
}
