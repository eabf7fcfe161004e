//! CephX auth entity management.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::{AuditOperation, AuditOutcome, AuditRecord, AuditSink};
use crate::error::{ApiError, ApiResult, CephError, CephResult, ResourceKind};
use crate::executor::CephClient;
use crate::probes::Probes;
use crate::validation;

/// Entities never shown in listings.
const SYSTEM_PREFIXES: &[&str] = &["client.admin", "mgr.", "osd.", "mds.", "mon."];

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

/// Adds the `client.` prefix when missing.
pub fn normalize_entity(client: &str) -> String {
    if client.starts_with("client.") {
        client.to_string()
    } else {
        format!("client.{}", client)
    }
}

/// Per-subsystem capability strings. Blank strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mds: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgr: Option<String>,
}

impl Capabilities {
    /// Present capabilities as `(subsystem, cap)` pairs in mds, mon, osd,
    /// mgr order, trimmed.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        [
            ("mds", &self.mds),
            ("mon", &self.mon),
            ("osd", &self.osd),
            ("mgr", &self.mgr),
        ]
        .into_iter()
        .filter_map(|(subsystem, cap)| {
            cap.as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(|c| (subsystem, c.to_string()))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }

    fn to_map(&self) -> BTreeMap<String, String> {
        self.pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAuthRequest {
    pub client_name: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCapsRequest {
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthEntity {
    pub entity: String,
    pub key: String,
    pub caps: BTreeMap<String, String>,
}

impl AuthEntity {
    fn from_json(value: &Value, fallback_entity: &str) -> Self {
        let caps = value
            .get("caps")
            .and_then(Value::as_object)
            .map(|caps| {
                caps.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            entity: value
                .get("entity")
                .and_then(Value::as_str)
                .unwrap_or(fallback_entity)
                .to_string(),
            key: value
                .get("key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            caps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapsUpdate {
    pub entity: String,
    pub caps: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthListQuery {
    pub filter: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthList {
    pub clients: Vec<AuthEntity>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// First entity of a response that is either an object or an array.
fn single_entity(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.first(),
        Value::Object(map) if !map.is_empty() => Some(value),
        _ => None,
    }
}

/// Drops system and non-client entities, then applies the name-prefix
/// filter. Paging happens afterwards, over the full filtered list.
pub fn filter_clients(entries: &[Value], filter: Option<&str>) -> Vec<AuthEntity> {
    entries
        .iter()
        .filter_map(|entry| {
            let entity = entry.get("entity").and_then(Value::as_str)?;
            if SYSTEM_PREFIXES.iter().any(|p| entity.starts_with(p)) {
                return None;
            }
            let name = entity.strip_prefix("client.")?;
            if let Some(prefix) = filter.filter(|f| !f.is_empty()) {
                if !name.starts_with(prefix) {
                    return None;
                }
            }
            Some(AuthEntity::from_json(entry, entity))
        })
        .collect()
}

#[derive(Clone)]
pub struct AuthService {
    client: CephClient,
    probes: Probes,
    audit: Arc<dyn AuditSink>,
}

impl AuthService {
    pub fn new(client: CephClient, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            probes: Probes::new(client.clone()),
            client,
            audit,
        }
    }

    fn log<T>(
        &self,
        operation: AuditOperation,
        resource: String,
        actor: &str,
        result: &ApiResult<T>,
    ) -> AuditRecord {
        let record = AuditRecord::new(operation, resource, actor, AuditOutcome::of(result));
        match result {
            Err(e) => record.detail("error", e.code()),
            Ok(_) => record,
        }
    }

    pub async fn create(&self, request: CreateAuthRequest, actor: &str) -> ApiResult<AuthEntity> {
        let name = request
            .client_name
            .strip_prefix("client.")
            .unwrap_or(request.client_name.as_str())
            .to_string();
        let entity = format!("client.{}", name);
        let caps = request.capabilities.to_map();

        let result = self.create_inner(&name, &entity, &request.capabilities).await;
        let mut record = self.log(AuditOperation::Create, format!("auth:{}", entity), actor, &result);
        if result.is_ok() {
            record = record.detail("capabilities", serde_json::to_value(&caps).unwrap_or_default());
        }
        self.audit.log_operation(record);
        result
    }

    async fn create_inner(
        &self,
        name: &str,
        entity: &str,
        capabilities: &Capabilities,
    ) -> ApiResult<AuthEntity> {
        validation::identifier("client_name", name)?;
        let pairs = capabilities.pairs();
        if pairs.is_empty() {
            return Err(ApiError::validation(
                "At least one capability must be specified",
            ));
        }

        if self.probes.auth_entity_exists(entity).await? {
            return Err(CephError::AlreadyExists {
                kind: ResourceKind::AuthEntity,
                name: entity.to_string(),
            }
            .into());
        }

        let mut args = vec!["auth".to_string(), "get-or-create".to_string(), entity.to_string()];
        for (subsystem, cap) in pairs {
            args.push(subsystem.to_string());
            args.push(cap);
        }
        let value = self.client.json(args).await?;
        let created = single_entity(&value).ok_or_else(|| CephError::InvalidResponse {
            command: format!("ceph auth get-or-create {}", entity),
            output: value.to_string(),
            reason: "expected an auth entity object".to_string(),
        })?;
        Ok(AuthEntity::from_json(created, entity))
    }

    async fn fetch(&self, entity: &str) -> CephResult<AuthEntity> {
        let value = self
            .client
            .json(["auth", "get", entity])
            .await
            .map_err(|e| e.not_found_as(ResourceKind::AuthEntity, entity))?;
        let found = single_entity(&value).ok_or_else(|| CephError::NotFound {
            kind: ResourceKind::AuthEntity,
            name: entity.to_string(),
        })?;
        Ok(AuthEntity::from_json(found, entity))
    }

    pub async fn get(&self, client: &str, actor: &str) -> ApiResult<AuthEntity> {
        let entity = normalize_entity(client);
        let result = self.fetch(&entity).await.map_err(ApiError::from);
        let record = self.log(AuditOperation::Read, format!("auth:{}", entity), actor, &result);
        self.audit.log_operation(record);
        result
    }

    async fn require_existing(&self, entity: &str) -> ApiResult<()> {
        if !self.probes.auth_entity_exists(entity).await? {
            return Err(CephError::NotFound {
                kind: ResourceKind::AuthEntity,
                name: entity.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Replaces an entity's capabilities. An empty set suspends the entity by
    /// explicitly clearing every subsystem.
    pub async fn update_caps(
        &self,
        client: &str,
        request: UpdateCapsRequest,
        actor: &str,
    ) -> ApiResult<CapsUpdate> {
        let entity = normalize_entity(client);
        let result = self.update_caps_inner(&entity, &request.capabilities).await;
        let record = self
            .log(AuditOperation::Update, format!("auth:{}", entity), actor, &result)
            .detail("suspended", request.capabilities.is_empty());
        self.audit.log_operation(record);
        result
    }

    async fn update_caps_inner(
        &self,
        entity: &str,
        capabilities: &Capabilities,
    ) -> ApiResult<CapsUpdate> {
        self.require_existing(entity).await?;

        let mut args = vec!["auth".to_string(), "caps".to_string(), entity.to_string()];
        let pairs = capabilities.pairs();
        if pairs.is_empty() {
            for subsystem in ["mon", "osd", "mds", "mgr"] {
                args.push(subsystem.to_string());
                args.push(String::new());
            }
        } else {
            for (subsystem, cap) in pairs {
                args.push(subsystem.to_string());
                args.push(cap);
            }
        }
        self.client
            .text(args)
            .await
            .map_err(|e| e.not_found_as(ResourceKind::AuthEntity, entity))?;

        let caps = match self.fetch(entity).await {
            Ok(updated) => updated.caps,
            Err(e) if e.is_not_found() => capabilities.to_map(),
            Err(e) => return Err(e.into()),
        };
        Ok(CapsUpdate {
            entity: entity.to_string(),
            caps,
        })
    }

    pub async fn delete(&self, client: &str, actor: &str) -> ApiResult<()> {
        let entity = normalize_entity(client);
        let result = self.delete_inner(&entity).await;
        let record = self.log(AuditOperation::Delete, format!("auth:{}", entity), actor, &result);
        self.audit.log_operation(record);
        result
    }

    async fn delete_inner(&self, entity: &str) -> ApiResult<()> {
        self.require_existing(entity).await?;
        self.client
            .text(["auth", "del", entity])
            .await
            .map_err(|e| e.not_found_as(ResourceKind::AuthEntity, entity))?;
        Ok(())
    }

    pub async fn list(&self, query: AuthListQuery, actor: &str) -> ApiResult<AuthList> {
        let result = self.list_inner(&query).await;
        let mut record = self
            .log(AuditOperation::List, "auth:*".to_string(), actor, &result)
            .detail("filter", query.filter.clone());
        if let Ok(ref list) = result {
            record = record
                .detail("total", list.total)
                .detail("limit", list.limit)
                .detail("offset", list.offset);
        }
        self.audit.log_operation(record);
        result
    }

    async fn list_inner(&self, query: &AuthListQuery) -> ApiResult<AuthList> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        validation::in_range("limit", limit as u64, 1, MAX_LIST_LIMIT as u64)?;
        let offset = query.offset.unwrap_or(0);

        let value = self.client.json(["auth", "ls"]).await?;
        let entries = match &value {
            Value::Array(items) => items.as_slice(),
            other => other
                .get("auth_dump")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        };

        let clients = filter_clients(entries, query.filter.as_deref());
        let total = clients.len();
        let clients = clients.into_iter().skip(offset).take(limit).collect();
        Ok(AuthList {
            clients,
            total,
            offset,
            limit,
        })
    }
}
