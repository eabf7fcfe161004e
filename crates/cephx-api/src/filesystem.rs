//! Read-only filesystem queries.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::audit::{AuditOperation, AuditOutcome, AuditRecord, AuditSink};
use crate::error::{ApiResult, CephError, CephResult, ResourceKind};
use crate::executor::CephClient;
use crate::probes::{FilesystemDescriptor, Probes};

const TIB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolUsage {
    /// Bytes stored before replication.
    pub stored_bytes: u64,
    pub stored_tb: f64,
    /// Bytes used after replication.
    pub used_bytes: u64,
    pub objects: u64,
    pub percent_used: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilesystemSummary {
    #[serde(flatten)]
    pub info: FilesystemDescriptor,
    pub usage: Option<PoolUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilesystemList {
    pub filesystems: Vec<FilesystemSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilesystemUsage {
    pub name: String,
    pub usage: PoolUsage,
}

/// Usage for `pool` from `ceph df detail` output.
pub fn pool_usage(df: &Value, pool: &str) -> Option<PoolUsage> {
    let entry = df
        .get("pools")?
        .as_array()?
        .iter()
        .find(|p| p.get("name").and_then(Value::as_str) == Some(pool))?;
    let stats = entry.get("stats");
    let int = |key: &str| {
        stats
            .and_then(|s| s.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let stored = int("stored");
    Some(PoolUsage {
        stored_bytes: stored,
        stored_tb: ((stored as f64 / TIB) * 1000.0).round() / 1000.0,
        used_bytes: int("bytes_used"),
        objects: int("objects"),
        percent_used: stats
            .and_then(|s| s.get("percent_used"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    })
}

#[derive(Clone)]
pub struct FilesystemQueries {
    client: CephClient,
    probes: Probes,
    audit: Arc<dyn AuditSink>,
}

impl FilesystemQueries {
    pub fn new(client: CephClient, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            probes: Probes::new(client.clone()),
            client,
            audit,
        }
    }

    fn audit(&self, resource: String, actor: &str, outcome: AuditOutcome) -> AuditRecord {
        AuditRecord::new(AuditOperation::Read, resource, actor, outcome)
    }

    pub async fn list(&self, include_usage: bool, actor: &str) -> ApiResult<FilesystemList> {
        let result = self.list_inner(include_usage).await;
        let mut record = self
            .audit("filesystem:*".to_string(), actor, AuditOutcome::of(&result))
            .detail("include_usage", include_usage);
        if let Ok(ref list) = result {
            record = record.detail("count", list.count);
        }
        self.audit.log_operation(record);
        Ok(result?)
    }

    async fn list_inner(&self, include_usage: bool) -> CephResult<FilesystemList> {
        let filesystems = self.probes.list_filesystems().await?;
        let df = if include_usage {
            Some(self.client.json(["df", "detail"]).await?)
        } else {
            None
        };

        let filesystems: Vec<FilesystemSummary> = filesystems
            .into_iter()
            .map(|info| {
                let usage = df.as_ref().and_then(|df| {
                    info.data_pools
                        .first()
                        .and_then(|pool| pool_usage(df, pool))
                });
                FilesystemSummary { info, usage }
            })
            .collect();
        Ok(FilesystemList {
            count: filesystems.len(),
            filesystems,
        })
    }

    pub async fn get(&self, name: &str, actor: &str) -> ApiResult<FilesystemDescriptor> {
        let result = self.get_inner(name).await;
        self.audit.log_operation(self.audit(
            format!("filesystem:{}", name),
            actor,
            AuditOutcome::of(&result),
        ));
        Ok(result?)
    }

    async fn get_inner(&self, name: &str) -> CephResult<FilesystemDescriptor> {
        self.client
            .json(["fs", "volume", "info", name])
            .await
            .map_err(|e| e.not_found_as(ResourceKind::Filesystem, name))?;
        self.probes
            .list_filesystems()
            .await?
            .into_iter()
            .find(|fs| fs.name == name)
            .ok_or_else(|| not_found(name))
    }

    pub async fn usage(&self, name: &str, actor: &str) -> ApiResult<FilesystemUsage> {
        let result = self.usage_inner(name).await;
        self.audit.log_operation(self.audit(
            format!("filesystem:{}/usage", name),
            actor,
            AuditOutcome::of(&result),
        ));
        Ok(result?)
    }

    async fn usage_inner(&self, name: &str) -> CephResult<FilesystemUsage> {
        let fs = self.probes.filesystem(name).await?.ok_or_else(|| not_found(name))?;
        let df = self.client.json(["df", "detail"]).await?;

        let data_pool = fs.data_pools.first().ok_or_else(|| CephError::CommandFailed {
            command: format!("get filesystem usage for {}", name),
            exit_code: 1,
            stderr: "No data pools found for filesystem".to_string(),
            stdout: String::new(),
        })?;
        let usage = pool_usage(&df, data_pool).ok_or_else(|| CephError::CommandFailed {
            command: format!("get pool usage for {}", data_pool),
            exit_code: 1,
            stderr: format!("Pool '{}' not found in df output", data_pool),
            stdout: String::new(),
        })?;

        Ok(FilesystemUsage {
            name: name.to_string(),
            usage,
        })
    }
}

fn not_found(name: &str) -> CephError {
    CephError::NotFound {
        kind: ResourceKind::Filesystem,
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, AuditTrail};
    use crate::testing::ScriptedRunner;
    use serde_json::json;

    fn df() -> Value {
        json!({
            "stats": {"total_bytes": 100},
            "pools": [
                {"name": "cephfs.a.data", "stats": {
                    "stored": 1649267441664u64,
                    "bytes_used": 4947802324992u64,
                    "objects": 42,
                    "percent_used": 0.25
                }},
                {"name": "cephfs.a.meta", "stats": {"stored": 10}}
            ]
        })
    }

    fn cluster() -> ScriptedRunner {
        let runner = ScriptedRunner::new();
        runner.ok_json(
            "fs ls",
            json!([
                {"name": "a", "metadata_pool": "cephfs.a.meta", "data_pools": ["cephfs.a.data"]},
                {"name": "b", "metadata_pool": "cephfs.b.meta", "data_pools": []}
            ]),
        );
        runner.ok_json("df detail", df());
        runner
    }

    fn queries(runner: &ScriptedRunner) -> (FilesystemQueries, Arc<AuditTrail>) {
        let trail = Arc::new(AuditTrail::new());
        (FilesystemQueries::new(runner.client(), trail.clone()), trail)
    }

    #[test]
    fn usage_is_reported_in_tib() {
        let usage = pool_usage(&df(), "cephfs.a.data").unwrap();
        assert_eq!(usage.stored_bytes, 1649267441664);
        assert_eq!(usage.stored_tb, 1.5);
        assert_eq!(usage.used_bytes, 4947802324992);
        assert_eq!(usage.objects, 42);
        assert_eq!(usage.percent_used, 0.25);

        let meta = pool_usage(&df(), "cephfs.a.meta").unwrap();
        assert_eq!(meta.objects, 0);
        assert!(pool_usage(&df(), "missing").is_none());
    }

    #[tokio::test]
    async fn list_without_usage_skips_df() {
        let runner = cluster();
        let (q, trail) = queries(&runner);
        let list = q.list(false, "admin").await.unwrap();
        assert_eq!(list.count, 2);
        assert!(list.filesystems.iter().all(|f| f.usage.is_none()));
        assert_eq!(runner.calls(), vec!["fs ls --format json"]);
        assert_eq!(trail.query(&AuditFilter::default())[0].resource, "filesystem:*");
    }

    #[tokio::test]
    async fn list_with_usage() {
        let runner = cluster();
        let (q, _) = queries(&runner);
        let list = q.list(true, "admin").await.unwrap();
        assert_eq!(list.filesystems[0].usage.as_ref().unwrap().objects, 42);
        assert!(list.filesystems[1].usage.is_none());
    }

    #[tokio::test]
    async fn get_maps_missing_volume_to_filesystem_not_found() {
        let runner = cluster();
        runner.fail("fs volume info", 2, "Error ENOENT: volume 'zzz' not found");
        let (q, trail) = queries(&runner);
        let err = q.get("zzz", "admin").await.unwrap_err();
        assert_eq!(err.code(), "FS_NOT_FOUND");
        assert_eq!(
            trail.query(&AuditFilter::default())[0].outcome,
            AuditOutcome::Failed
        );
    }

    #[tokio::test]
    async fn get_returns_descriptor() {
        let runner = cluster();
        let (q, _) = queries(&runner);
        let fs = q.get("a", "admin").await.unwrap();
        assert_eq!(fs.metadata_pool, "cephfs.a.meta");
    }

    #[tokio::test]
    async fn usage_of_filesystem() {
        let runner = cluster();
        let (q, _) = queries(&runner);
        let usage = q.usage("a", "admin").await.unwrap();
        assert_eq!(usage.usage.stored_tb, 1.5);

        let err = q.usage("b", "admin").await.unwrap_err();
        assert_eq!(err.code(), "CEPH_COMMAND_FAILED");

        let err = q.usage("nope", "admin").await.unwrap_err();
        assert_eq!(err.code(), "FS_NOT_FOUND");
    }
}
