//! Cluster-wide status, capacity and monitor queries, cached per endpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::audit::{AuditOperation, AuditOutcome, AuditRecord, AuditSink};
use crate::cache::{CacheKey, Clock, TtlCache};
use crate::config::CacheSettings;
use crate::error::{ApiResult, CephResult};
use crate::executor::CephClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonStatus {
    pub epoch: u64,
    pub num_mons: usize,
    pub quorum: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsdSummary {
    pub num_osds: u64,
    pub num_up_osds: u64,
    pub num_in_osds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgStatus {
    pub num_pgs: u64,
    pub num_active_clean: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub health: String,
    pub mon_status: MonStatus,
    pub osd_status: OsdSummary,
    pub pg_status: PgStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub total_bytes: u64,
    pub total_used_bytes: u64,
    pub total_avail_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub stored: u64,
    pub objects: u64,
    pub kb_used: u64,
    pub bytes_used: u64,
    pub percent_used: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub id: u64,
    pub stats: PoolStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDf {
    pub stats: ClusterStats,
    pub pools: Vec<PoolInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub name: String,
    pub addr: String,
    pub rank: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitors {
    pub monitors: Vec<MonitorInfo>,
    pub total: usize,
}

fn u64_at(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn array_at<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Interprets `ceph status` output.
///
/// Older releases nest the OSD counters as `osdmap.osdmap`; newer ones put
/// them directly under `osdmap`.
pub fn parse_status(status: &Value) -> ClusterStatus {
    let health = status
        .get("health")
        .and_then(|h| h.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();

    let monmap = status.get("monmap").unwrap_or(&Value::Null);
    let mon_status = MonStatus {
        epoch: u64_at(monmap, "epoch"),
        num_mons: array_at(monmap, "mons").len(),
        quorum: array_at(status, "quorum")
            .iter()
            .filter_map(Value::as_u64)
            .collect(),
    };

    let osdmap = status.get("osdmap").unwrap_or(&Value::Null);
    let osdmap = match osdmap.get("osdmap") {
        Some(nested) => nested,
        None => osdmap,
    };
    let osd_status = OsdSummary {
        num_osds: u64_at(osdmap, "num_osds"),
        num_up_osds: u64_at(osdmap, "num_up_osds"),
        num_in_osds: u64_at(osdmap, "num_in_osds"),
    };

    let pgmap = status.get("pgmap").unwrap_or(&Value::Null);
    let num_active_clean = array_at(pgmap, "pgs_by_state")
        .iter()
        .find(|s| s.get("state_name").and_then(Value::as_str) == Some("active+clean"))
        .map(|s| u64_at(s, "count"))
        .unwrap_or(0);

    ClusterStatus {
        health,
        mon_status,
        osd_status,
        pg_status: PgStatus {
            num_pgs: u64_at(pgmap, "num_pgs"),
            num_active_clean,
        },
    }
}

pub fn parse_df(df: &Value) -> ClusterDf {
    let stats = df.get("stats").unwrap_or(&Value::Null);
    let pools = array_at(df, "pools")
        .iter()
        .map(|pool| {
            let s = pool.get("stats").unwrap_or(&Value::Null);
            PoolInfo {
                name: pool
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                id: u64_at(pool, "id"),
                stats: PoolStats {
                    stored: u64_at(s, "stored"),
                    objects: u64_at(s, "objects"),
                    kb_used: u64_at(s, "kb_used"),
                    bytes_used: u64_at(s, "bytes_used"),
                    percent_used: s.get("percent_used").and_then(Value::as_f64).unwrap_or(0.0),
                },
            }
        })
        .collect();

    ClusterDf {
        stats: ClusterStats {
            total_bytes: u64_at(stats, "total_bytes"),
            total_used_bytes: u64_at(stats, "total_used_bytes"),
            total_avail_bytes: u64_at(stats, "total_avail_bytes"),
        },
        pools,
    }
}

pub fn parse_monitors(status: &Value) -> Monitors {
    let monmap = status.get("monmap").unwrap_or(&Value::Null);
    let monitors: Vec<MonitorInfo> = array_at(monmap, "mons")
        .iter()
        .map(|mon| {
            let addr = mon.get("addr").and_then(Value::as_str).unwrap_or_default();
            // "10.10.1.1:6789/0" -> "10.10.1.1:6789"
            let addr = addr.split('/').next().unwrap_or_default();
            MonitorInfo {
                name: mon
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                addr: addr.to_string(),
                rank: u64_at(mon, "rank"),
            }
        })
        .collect();
    Monitors {
        total: monitors.len(),
        monitors,
    }
}

pub struct ClusterService {
    client: CephClient,
    audit: Arc<dyn AuditSink>,
    settings: CacheSettings,
    status: TtlCache<ClusterStatus>,
    df: TtlCache<ClusterDf>,
    monitors: TtlCache<Monitors>,
}

impl ClusterService {
    pub fn new(
        client: CephClient,
        audit: Arc<dyn AuditSink>,
        settings: CacheSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            audit,
            settings,
            status: TtlCache::new(clock.clone()),
            df: TtlCache::new(clock.clone()),
            monitors: TtlCache::new(clock),
        }
    }

    pub async fn status(&self, actor: &str) -> ApiResult<ClusterStatus> {
        let ttl = Duration::from_secs(self.settings.status_ttl_secs);
        let result = cached(&self.status, "status", ttl, || async {
            self.client.json(["status"]).await.map(|v| parse_status(&v))
        })
        .await;
        let record = self.record("cluster:status", actor, &result);
        let record = match &result {
            Ok(s) => record.detail("health", s.health.as_str()),
            Err(_) => record,
        };
        self.audit.log_operation(record);
        Ok(result?)
    }

    pub async fn df(&self, actor: &str) -> ApiResult<ClusterDf> {
        let ttl = Duration::from_secs(self.settings.df_ttl_secs);
        let result = cached(&self.df, "df", ttl, || async {
            self.client.json(["df", "detail"]).await.map(|v| parse_df(&v))
        })
        .await;
        let record = self.record("cluster:df", actor, &result);
        self.audit.log_operation(record);
        Ok(result?)
    }

    pub async fn monitors(&self, actor: &str) -> ApiResult<Monitors> {
        let ttl = Duration::from_secs(self.settings.monitors_ttl_secs);
        let result = cached(&self.monitors, "monitors", ttl, || async {
            self.client.json(["status"]).await.map(|v| parse_monitors(&v))
        })
        .await;
        let record = self.record("cluster:monitors", actor, &result);
        let record = match &result {
            Ok(m) => record.detail("monitor_count", m.total),
            Err(_) => record,
        };
        self.audit.log_operation(record);
        Ok(result?)
    }

    fn record<T>(&self, resource: &str, actor: &str, result: &CephResult<T>) -> AuditRecord {
        let record = AuditRecord::new(
            AuditOperation::Read,
            resource,
            actor,
            AuditOutcome::of(result),
        );
        match result {
            Err(e) => record.detail("error", e.code()),
            Ok(_) => record,
        }
    }
}

/// Serves `operation` from `cache` or runs `fetch` and stores its result.
/// Failures are never cached.
async fn cached<T, F, Fut>(
    cache: &TtlCache<T>,
    operation: &'static str,
    ttl: Duration,
    fetch: F,
) -> CephResult<T>
where
    T: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CephResult<T>>,
{
    let key = CacheKey::new(operation);
    if let Some(hit) = cache.get(&key) {
        debug!(operation, "cache hit");
        return Ok(hit);
    }
    debug!(operation, "cache miss");
    let value = fetch().await?;
    cache.insert(key, value.clone(), ttl);
    Ok(value)
}
