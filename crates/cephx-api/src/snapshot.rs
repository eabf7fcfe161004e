//! Snapshot schedules on CephFS paths, via the `snap_schedule` mgr module.
//!
//! Adding a schedule with retention issues the schedule command followed by
//! one command per retention bucket. A failure part way through leaves the
//! schedule and any earlier buckets in place.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::audit::{AuditOperation, AuditOutcome, AuditRecord, AuditSink};
use crate::error::{ApiError, ApiResult, CephError, ResourceKind};
use crate::executor::CephClient;
use crate::probes::Probes;
use crate::validation;

fn root_path() -> String {
    "/".to_string()
}

/// Snapshots to keep per period. Absent buckets are left unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yearly: Option<u32>,
}

impl RetentionPolicy {
    /// `(bucket name, ceph unit, count, max)` for each configured bucket, in
    /// hourly to yearly order.
    fn buckets(&self) -> Vec<(&'static str, &'static str, u32, u64)> {
        [
            ("hourly", "h", self.hourly, 8760),
            ("daily", "d", self.daily, 3650),
            ("weekly", "w", self.weekly, 520),
            ("monthly", "m", self.monthly, 120),
            ("yearly", "y", self.yearly, 100),
        ]
        .into_iter()
        .filter_map(|(name, unit, count, max)| count.map(|c| (name, unit, c, max)))
        .collect()
    }

    fn validate(&self) -> ApiResult<()> {
        for (name, _, count, max) in self.buckets() {
            validation::in_range(name, u64::from(count), 1, max)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddScheduleRequest {
    #[serde(default = "root_path")]
    pub path: String,
    pub schedule: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
}

impl AddScheduleRequest {
    fn validate(&self) -> ApiResult<()> {
        validation::fs_path(&self.path)?;
        validation::schedule(&self.schedule)?;
        if let Some(start) = &self.start_time {
            validation::start_time(start)?;
        }
        if let Some(retention) = &self.retention {
            retention.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleAdded {
    pub path: String,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
    pub fs_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub path: String,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subvol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleList {
    pub schedules: Vec<ScheduleInfo>,
    pub count: usize,
    pub fs_name: String,
}

/// Parses `fs snap-schedule status` output. Anything but an array is
/// treated as no schedules.
pub fn parse_schedules(value: &Value, default_path: &str) -> Vec<ScheduleInfo> {
    let text = |item: &Value, key: &str| item.get(key).and_then(Value::as_str).map(String::from);
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| ScheduleInfo {
                    path: text(item, "path").unwrap_or_else(|| default_path.to_string()),
                    schedule: text(item, "schedule").unwrap_or_default(),
                    retention: item
                        .get("retention")
                        .filter(|r| r.as_object().is_some_and(|m| !m.is_empty()))
                        .cloned(),
                    start: text(item, "start"),
                    subvol: text(item, "subvol"),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct SnapshotService {
    client: CephClient,
    probes: Probes,
    audit: Arc<dyn AuditSink>,
}

impl SnapshotService {
    pub fn new(client: CephClient, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            probes: Probes::new(client.clone()),
            client,
            audit,
        }
    }

    fn record<T>(
        &self,
        operation: AuditOperation,
        fs_name: &str,
        path: &str,
        actor: &str,
        result: &ApiResult<T>,
    ) -> AuditRecord {
        let record = AuditRecord::new(
            operation,
            format!("snapshot-schedule:{}:{}", fs_name, path),
            actor,
            AuditOutcome::of(result),
        );
        match result {
            Err(e) => record.detail("error", e.code()),
            Ok(_) => record,
        }
    }

    async fn require_filesystem(&self, fs_name: &str) -> ApiResult<()> {
        if !self.probes.filesystem_exists(fs_name).await? {
            return Err(CephError::NotFound {
                kind: ResourceKind::Filesystem,
                name: fs_name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub async fn add_schedule(
        &self,
        fs_name: &str,
        request: AddScheduleRequest,
        actor: &str,
    ) -> ApiResult<ScheduleAdded> {
        let result = self.add_inner(fs_name, &request).await;
        let record = self
            .record(AuditOperation::Create, fs_name, &request.path, actor, &result)
            .detail("schedule", request.schedule.as_str());
        self.audit.log_operation(record);
        result?;

        Ok(ScheduleAdded {
            path: request.path,
            schedule: request.schedule,
            start_time: request.start_time,
            retention: request.retention,
            fs_name: fs_name.to_string(),
            message: "Snapshot schedule added successfully".to_string(),
        })
    }

    async fn add_inner(&self, fs_name: &str, request: &AddScheduleRequest) -> ApiResult<()> {
        request.validate()?;
        self.require_filesystem(fs_name).await?;

        let mut args = vec![
            "fs".to_string(),
            "snap-schedule".to_string(),
            "add".to_string(),
            request.path.clone(),
            request.schedule.clone(),
        ];
        if let Some(start) = &request.start_time {
            args.push(start.clone());
        }
        args.extend(["--fs".to_string(), fs_name.to_string()]);
        info!(fs = fs_name, path = %request.path, schedule = %request.schedule, "adding snapshot schedule");
        self.client.text(args).await?;

        let buckets = request
            .retention
            .as_ref()
            .map(RetentionPolicy::buckets)
            .unwrap_or_default();
        for (_, unit, count, _) in buckets {
            info!(fs = fs_name, path = %request.path, unit, count, "adding retention");
            let count = count.to_string();
            self.client
                .text([
                    "fs",
                    "snap-schedule",
                    "retention",
                    "add",
                    request.path.as_str(),
                    unit,
                    count.as_str(),
                    "--fs",
                    fs_name,
                ])
                .await?;
        }
        Ok(())
    }

    pub async fn list_schedules(
        &self,
        fs_name: &str,
        path: &str,
        actor: &str,
    ) -> ApiResult<ScheduleList> {
        let result = self.list_inner(fs_name, path).await;
        let record = self.record(AuditOperation::Read, fs_name, path, actor, &result);
        self.audit.log_operation(record);
        result
    }

    async fn list_inner(&self, fs_name: &str, path: &str) -> ApiResult<ScheduleList> {
        validation::fs_path(path)?;
        self.require_filesystem(fs_name).await?;

        let schedules = match self
            .client
            .json(["fs", "snap-schedule", "status", path, "--fs", fs_name])
            .await
        {
            Ok(value) => parse_schedules(&value, path),
            Err(e) if e.is_not_found() => {
                info!(fs = fs_name, path, "no snapshot schedules");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ScheduleList {
            count: schedules.len(),
            schedules,
            fs_name: fs_name.to_string(),
        })
    }

    /// Removes one schedule, or every schedule on `path` when `schedule` is
    /// `None`.
    pub async fn remove_schedule(
        &self,
        fs_name: &str,
        path: &str,
        schedule: Option<&str>,
        actor: &str,
    ) -> ApiResult<()> {
        let result = self.remove_inner(fs_name, path, schedule).await;
        let record = self
            .record(AuditOperation::Delete, fs_name, path, actor, &result)
            .detail("schedule", schedule);
        self.audit.log_operation(record);
        result
    }

    async fn remove_inner(&self, fs_name: &str, path: &str, schedule: Option<&str>) -> ApiResult<()> {
        validation::fs_path(path)?;
        if let Some(schedule) = schedule {
            validation::schedule(schedule)?;
        }
        self.require_filesystem(fs_name).await?;

        let mut args = vec!["fs", "snap-schedule", "remove", path];
        args.extend(schedule);
        args.extend(["--fs", fs_name]);
        let label = match schedule {
            Some(s) => format!("{} ({})", path, s),
            None => path.to_string(),
        };
        self.client
            .text(args)
            .await
            .map_err(|e| e.not_found_as(ResourceKind::SnapshotSchedule, &label))?;
        Ok(())
    }

    /// Snapshot enumeration needs access to `.snap` directories, which the
    /// ceph CLI does not expose.
    pub fn list_snapshots(&self, fs_name: &str, path: &str) -> ApiResult<Value> {
        let mut details = Map::new();
        details.insert(
            "reason".into(),
            json!("Listing snapshots requires mounting the filesystem or libcephfs access to .snap directories"),
        );
        details.insert(
            "alternatives".into(),
            json!([
                format!("ls <mountpoint>{}/.snap", path.trim_end_matches('/')),
                "GET /api/v1/snapshots/fs/{name}/snapshot-schedule",
            ]),
        );
        details.insert(
            "requested_params".into(),
            json!({"fs_name": fs_name, "path": path}),
        );
        Err(ApiError::NotImplemented {
            feature: "Snapshot listing".to_string(),
            details,
        })
    }
}
