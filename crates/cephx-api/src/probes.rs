//! Existence checks used as guards before mutations.
//!
//! A probe answers "no" when the cluster reports the resource missing; every
//! other failure propagates.

use serde_json::Value;

use crate::error::CephResult;
use crate::executor::CephClient;

/// A filesystem as reported by `ceph fs ls`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FilesystemDescriptor {
    pub name: String,
    pub metadata_pool: String,
    pub data_pools: Vec<String>,
    pub mds_count: u64,
}

/// Parses `fs ls` output, which is either an array or an object with a
/// `filesystems` array.
pub fn parse_fs_list(value: &Value) -> Vec<FilesystemDescriptor> {
    let entries = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("filesystems")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };

    entries
        .iter()
        .filter_map(|fs| {
            let name = fs.get("name")?.as_str()?.to_string();
            let metadata_pool = fs
                .get("metadata_pool")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let data_pools = fs
                .get("data_pools")
                .and_then(Value::as_array)
                .map(|pools| {
                    pools
                        .iter()
                        .filter_map(|p| p.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let mds_count = fs.get("mds_count").and_then(Value::as_u64).unwrap_or(0);
            Some(FilesystemDescriptor {
                name,
                metadata_pool,
                data_pools,
                mds_count,
            })
        })
        .collect()
}

fn names_in(value: &Value, key: &str) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    other => other.get(key).and_then(Value::as_str).map(String::from),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Probe operations over a shared client.
#[derive(Clone)]
pub struct Probes {
    client: CephClient,
}

impl Probes {
    pub fn new(client: CephClient) -> Self {
        Self { client }
    }

    pub async fn list_filesystems(&self) -> CephResult<Vec<FilesystemDescriptor>> {
        let value = self.client.json(["fs", "ls"]).await?;
        Ok(parse_fs_list(&value))
    }

    pub async fn filesystem(&self, name: &str) -> CephResult<Option<FilesystemDescriptor>> {
        match self.list_filesystems().await {
            Ok(list) => Ok(list.into_iter().find(|fs| fs.name == name)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn filesystem_exists(&self, name: &str) -> CephResult<bool> {
        Ok(self.filesystem(name).await?.is_some())
    }

    pub async fn pool_exists(&self, name: &str) -> CephResult<bool> {
        match self.client.json(["osd", "pool", "ls"]).await {
            Ok(value) => Ok(names_in(&value, "pool_name").iter().any(|p| p == name)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn crush_rule_exists(&self, name: &str) -> CephResult<bool> {
        match self.client.json(["osd", "crush", "rule", "ls"]).await {
            Ok(value) => Ok(names_in(&value, "rule_name").iter().any(|r| r == name)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn auth_entity_exists(&self, entity: &str) -> CephResult<bool> {
        match self.client.json(["auth", "get", entity]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
