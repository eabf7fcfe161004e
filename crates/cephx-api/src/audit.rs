use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const MAX_EVENTS: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOperation {
    Create,
    Read,
    Update,
    Delete,
    List,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOutcome {
    Success,
    Failed,
}

impl AuditOutcome {
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failed
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub resource: String,
    pub actor: String,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl AuditRecord {
    pub fn new(
        operation: AuditOperation,
        resource: impl Into<String>,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resource: resource.into(),
            actor: actor.into(),
            outcome,
            details: Map::new(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for audit records.
///
/// Logging is fire-and-forget: a sink that cannot persist a record reports it
/// through `tracing` and returns normally.
pub trait AuditSink: Send + Sync {
    fn log_operation(&self, record: AuditRecord);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn log_operation(&self, _record: AuditRecord) {}
}

#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub operation: Option<AuditOperation>,
    pub resource_prefix: Option<String>,
    pub failures_only: bool,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref actor) = self.actor {
            if &record.actor != actor {
                return false;
            }
        }
        if let Some(op) = self.operation {
            if record.operation != op {
                return false;
            }
        }
        if let Some(ref prefix) = self.resource_prefix {
            if !record.resource.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.failures_only && record.outcome != AuditOutcome::Failed {
            return false;
        }
        true
    }
}

/// Bounded in-memory audit log; the oldest records are dropped first.
pub struct AuditTrail {
    records: Mutex<VecDeque<AuditRecord>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(1024)),
        }
    }

    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for AuditTrail {
    fn log_operation(&self, record: AuditRecord) {
        tracing::info!(
            target: "audit",
            operation = ?record.operation,
            resource = %record.resource,
            actor = %record.actor,
            outcome = ?record.outcome,
            "audit record"
        );
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= MAX_EVENTS {
            records.pop_front();
        }
        records.push_back(record);
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlAuditLog {
    file: Mutex<File>,
}

impl JsonlAuditLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditLog {
    fn log_operation(&self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::error!(error = %e, resource = %record.resource, "failed to write audit record");
        }
    }
}
