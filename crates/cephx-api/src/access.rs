//! API-key authentication and per-endpoint permissions.

use std::collections::{BTreeSet, HashMap};

use subtle::ConstantTimeEq;

use crate::config::ApiKeyEntry;
use crate::error::{ApiError, ApiResult};

pub const FS_READ: &str = "fs:read";
pub const FS_WRITE: &str = "fs:write";
pub const AUTH_READ: &str = "auth:read";
pub const AUTH_WRITE: &str = "auth:write";
pub const CLUSTER_READ: &str = "cluster:read";
pub const OSD_READ: &str = "osd:read";
pub const OSD_WRITE: &str = "osd:write";

/// Grants every permission.
pub const WILDCARD: &str = "*";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub permissions: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, S>(user: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user: user.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(WILDCARD) || self.permissions.contains(permission)
    }

    pub fn require(&self, permission: &str) -> ApiResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            tracing::warn!(user = %self.user, permission, "permission denied");
            Err(ApiError::Forbidden(permission.to_string()))
        }
    }
}

/// Configured API keys.
///
/// Lookup compares the presented key against every stored key in constant
/// time, so the response time does not reveal which prefix matched.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: Vec<(String, Principal)>,
}

impl ApiKeyStore {
    pub fn from_config(keys: &HashMap<String, ApiKeyEntry>) -> Self {
        let keys = keys
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    Principal::new(entry.name.clone(), entry.permissions.iter().cloned()),
                )
            })
            .collect();
        Self { keys }
    }

    pub fn authenticate(&self, presented: &str) -> Option<Principal> {
        let mut found = None;
        for (key, principal) in &self.keys {
            if bool::from(key.as_bytes().ct_eq(presented.as_bytes())) {
                found = Some(principal.clone());
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ApiKeyStore {
        let mut keys = HashMap::new();
        keys.insert(
            "admin-key".to_string(),
            ApiKeyEntry {
                name: "admin".into(),
                permissions: vec!["*".into()],
            },
        );
        keys.insert(
            "reader-key".to_string(),
            ApiKeyEntry {
                name: "reader".into(),
                permissions: vec![FS_READ.into(), CLUSTER_READ.into()],
            },
        );
        ApiKeyStore::from_config(&keys)
    }

    #[test]
    fn resolves_known_keys() {
        let store = store();
        assert_eq!(store.authenticate("reader-key").unwrap().user, "reader");
        assert!(store.authenticate("reader-ke").is_none());
        assert!(store.authenticate("").is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn wildcard_grants_everything() {
        let admin = store().authenticate("admin-key").unwrap();
        assert!(admin.has_permission(OSD_WRITE));
        assert!(admin.has_permission("anything"));
    }

    #[test]
    fn exact_permissions_only() {
        let reader = store().authenticate("reader-key").unwrap();
        assert!(reader.require(FS_READ).is_ok());
        let err = reader.require(FS_WRITE).unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
        assert_eq!(err.details()["required_permission"], "fs:write");
    }
}
