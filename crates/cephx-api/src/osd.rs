use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::{AuditOperation, AuditOutcome, AuditRecord, AuditSink};
use crate::error::{ApiResult, CephError, CephResult, ResourceKind};
use crate::executor::CephClient;

/// Cluster-wide OSD flags this service may toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsdFlag {
    Noout,
    Norebalance,
}

impl OsdFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsdFlag::Noout => "noout",
            OsdFlag::Norebalance => "norebalance",
        }
    }
}

impl fmt::Display for OsdFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagAction {
    Set,
    Unset,
}

impl FlagAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagAction::Set => "set",
            FlagAction::Unset => "unset",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsdFlagRequest {
    pub flag: OsdFlag,
    pub action: FlagAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsdFlagResponse {
    pub ok: bool,
    pub message: String,
}

/// `up` / `in` are reported as 1 or 0, as ceph does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsdState {
    pub osd: u32,
    pub up: u8,
    #[serde(rename = "in")]
    pub in_: u8,
}

/// Finds `osd_id` in `ceph osd dump` output.
pub fn find_osd(dump: &Value, osd_id: u32) -> Option<OsdState> {
    let flag = |entry: &Value, key: &str| -> u8 {
        match entry.get(key) {
            Some(Value::Bool(b)) => u8::from(*b),
            Some(v) => u8::from(v.as_u64().unwrap_or(0) != 0),
            None => 0,
        }
    };
    dump.get("osds")?
        .as_array()?
        .iter()
        .find(|e| e.get("osd").and_then(Value::as_u64) == Some(u64::from(osd_id)))
        .map(|e| OsdState {
            osd: osd_id,
            up: flag(e, "up"),
            in_: flag(e, "in"),
        })
}

#[derive(Clone)]
pub struct OsdService {
    client: CephClient,
    audit: Arc<dyn AuditSink>,
}

impl OsdService {
    pub fn new(client: CephClient, audit: Arc<dyn AuditSink>) -> Self {
        Self { client, audit }
    }

    pub async fn status(&self, osd_id: u32, actor: &str) -> ApiResult<OsdState> {
        let result = self.status_inner(osd_id).await;
        let mut record = AuditRecord::new(
            AuditOperation::Read,
            format!("osd:{}", osd_id),
            actor,
            AuditOutcome::of(&result),
        );
        if let Ok(ref state) = result {
            record = record.detail("up", state.up).detail("in", state.in_);
        }
        self.audit.log_operation(record);
        Ok(result?)
    }

    async fn status_inner(&self, osd_id: u32) -> CephResult<OsdState> {
        let dump = self.client.json(["osd", "dump"]).await?;
        find_osd(&dump, osd_id).ok_or_else(|| CephError::NotFound {
            kind: ResourceKind::Osd,
            name: osd_id.to_string(),
        })
    }

    pub async fn set_flag(&self, request: OsdFlagRequest, actor: &str) -> ApiResult<OsdFlagResponse> {
        let result = self
            .client
            .text(["osd", request.action.as_str(), request.flag.as_str()])
            .await;
        let record = AuditRecord::new(
            AuditOperation::Write,
            format!("osd:flag:{}", request.flag),
            actor,
            AuditOutcome::of(&result),
        )
        .detail("flag", request.flag.as_str())
        .detail("action", request.action.as_str());
        self.audit.log_operation(record);
        result?;

        Ok(OsdFlagResponse {
            ok: true,
            message: format!("{} is {}", request.flag, request.action.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, AuditTrail};
    use crate::testing::ScriptedRunner;
    use serde_json::json;

    fn dump() -> Value {
        json!({"epoch": 40, "osds": [
            {"osd": 0, "up": 1, "in": 1},
            {"osd": 1, "up": 0, "in": 1},
            {"osd": 2, "up": true, "in": false}
        ]})
    }

    #[test]
    fn finds_osd_state() {
        assert_eq!(find_osd(&dump(), 1), Some(OsdState { osd: 1, up: 0, in_: 1 }));
        assert_eq!(find_osd(&dump(), 2), Some(OsdState { osd: 2, up: 1, in_: 0 }));
        assert_eq!(find_osd(&dump(), 9), None);
        assert_eq!(find_osd(&json!({}), 0), None);
    }

    #[test]
    fn state_serializes_in_field() {
        let v = serde_json::to_value(OsdState { osd: 3, up: 1, in_: 0 }).unwrap();
        assert_eq!(v, json!({"osd": 3, "up": 1, "in": 0}));
    }

    #[test]
    fn flag_request_rejects_unknown_flags() {
        let ok: OsdFlagRequest =
            serde_json::from_value(json!({"flag": "noout", "action": "set"})).unwrap();
        assert_eq!(ok.flag, OsdFlag::Noout);
        assert!(serde_json::from_value::<OsdFlagRequest>(json!({"flag": "pause", "action": "set"})).is_err());
        assert!(serde_json::from_value::<OsdFlagRequest>(json!({"flag": "noout", "action": "toggle"})).is_err());
    }

    #[tokio::test]
    async fn missing_osd_is_not_found() {
        let runner = ScriptedRunner::new();
        runner.ok_json("osd dump", dump());
        let svc = OsdService::new(runner.client(), Arc::new(AuditTrail::new()));
        let err = svc.status(7, "admin").await.unwrap_err();
        assert_eq!(err.code(), "OSD_NOT_FOUND");
        assert_eq!(svc.status(0, "admin").await.unwrap().up, 1);
    }

    #[tokio::test]
    async fn toggles_flag() {
        let runner = ScriptedRunner::new();
        let trail = Arc::new(AuditTrail::new());
        let svc = OsdService::new(runner.client(), trail.clone());
        let resp = svc
            .set_flag(
                OsdFlagRequest {
                    flag: OsdFlag::Norebalance,
                    action: FlagAction::Unset,
                },
                "ops",
            )
            .await
            .unwrap();
        assert_eq!(resp.message, "norebalance is unset");
        assert_eq!(runner.calls(), vec!["osd unset norebalance"]);
        let records = trail.query(&AuditFilter::default());
        assert_eq!(records[0].resource, "osd:flag:norebalance");
        assert_eq!(records[0].operation, AuditOperation::Write);
    }
}
