//! CephFS creation and removal.
//!
//! Creation is a strictly sequential chain of ceph commands. What has been
//! created so far is tracked in a [`ProvisioningState`]; when any step fails,
//! the completed steps are undone in reverse dependency order and the
//! original error is returned unchanged.
//!
//! Removal deletes the filesystem (and optionally its client auth) but never
//! the pools behind it. Only creation rollback removes pools.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::audit::{AuditOperation, AuditOutcome, AuditRecord, AuditSink};
use crate::config::FilesystemDefaults;
use crate::error::{ApiError, ApiResult, CephError, CephResult, ResourceKind};
use crate::executor::CephClient;
use crate::probes::Probes;
use crate::validation;

pub fn metadata_pool_name(fs_name: &str) -> String {
    format!("cephfs.{}.meta", fs_name)
}

pub fn data_pool_name(fs_name: &str) -> String {
    format!("cephfs.{}.data", fs_name)
}

pub fn client_entity(client_name: &str) -> String {
    format!("client.{}", client_name)
}

/// Pulls the secret out of `fs authorize` keyring output.
///
/// The first line mentioning `key` and containing `=` holds it; everything
/// after the first `=` is the key, trimmed.
pub fn extract_auth_key(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("key") && line.contains('='))
        .and_then(|line| line.split_once('='))
        .map(|(_, key)| key.trim().to_string())
}

/// Body of a create request. Omitted fields take the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateFilesystemRequest {
    pub name: String,
    #[serde(default)]
    pub crush_rule: Option<String>,
    #[serde(default)]
    pub meta_pool_pg: Option<u32>,
    #[serde(default)]
    pub data_pool_type: Option<String>,
    #[serde(default)]
    pub enable_snapshots: Option<bool>,
    #[serde(default)]
    pub create_auth: Option<bool>,
    #[serde(default)]
    pub auth_client_name: Option<String>,
}

/// A validated create request with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemPlan {
    pub name: String,
    pub crush_rule: String,
    pub pg_num: u32,
    pub data_pool_type: String,
    pub enable_snapshots: bool,
    pub create_auth: bool,
    pub auth_client_name: String,
}

impl FilesystemPlan {
    pub fn resolve(
        request: CreateFilesystemRequest,
        defaults: &FilesystemDefaults,
    ) -> ApiResult<Self> {
        validation::identifier("name", &request.name)?;
        if let Some(ref client) = request.auth_client_name {
            validation::identifier("auth_client_name", client)?;
        }
        let pg_num = request.meta_pool_pg.unwrap_or(defaults.meta_pool_pg);
        validation::in_range("meta_pool_pg", u64::from(pg_num), 1, 32768)?;

        let data_pool_type = request
            .data_pool_type
            .unwrap_or_else(|| defaults.data_pool_type.clone());
        if data_pool_type != "replicated" {
            return Err(ApiError::validation(format!(
                "data_pool_type '{}' is not supported; only 'replicated' is",
                data_pool_type
            )));
        }

        let crush_rule = request
            .crush_rule
            .unwrap_or_else(|| defaults.crush_rule.clone());
        if crush_rule.trim().is_empty() {
            return Err(ApiError::validation("crush_rule must not be empty"));
        }

        let auth_client_name = request
            .auth_client_name
            .unwrap_or_else(|| request.name.clone());

        Ok(Self {
            name: request.name,
            crush_rule,
            pg_num,
            data_pool_type,
            enable_snapshots: request.enable_snapshots.unwrap_or(defaults.enable_snapshots),
            create_auth: request.create_auth.unwrap_or(defaults.create_auth),
            auth_client_name,
        })
    }
}

/// Result of a successful creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedFilesystem {
    pub name: String,
    pub metadata_pool: String,
    pub data_pool: String,
    pub snapshots_enabled: bool,
    pub auth_created: bool,
    pub auth_client_name: Option<String>,
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    CreatingMetaPool,
    CreatingDataPool,
    CreatingFilesystem,
    SettingFlags,
    CreatingAuth,
    Done,
    RollingBack,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::CreatingMetaPool => "creating_meta_pool",
            Stage::CreatingDataPool => "creating_data_pool",
            Stage::CreatingFilesystem => "creating_filesystem",
            Stage::SettingFlags => "setting_flags",
            Stage::CreatingAuth => "creating_auth",
            Stage::Done => "done",
            Stage::RollingBack => "rolling_back",
        }
    }
}

/// What one creation request has built so far. Each flag is set only after
/// its command succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningState {
    pub stage: Stage,
    pub fs_name: String,
    pub metadata_pool: String,
    pub data_pool: String,
    pub auth_client: String,
    pub metadata_pool_created: bool,
    pub data_pool_created: bool,
    pub filesystem_created: bool,
    pub auth_created: bool,
}

impl ProvisioningState {
    pub fn new(plan: &FilesystemPlan) -> Self {
        Self {
            stage: Stage::Validating,
            fs_name: plan.name.clone(),
            metadata_pool: metadata_pool_name(&plan.name),
            data_pool: data_pool_name(&plan.name),
            auth_client: plan.auth_client_name.clone(),
            metadata_pool_created: false,
            data_pool_created: false,
            filesystem_created: false,
            auth_created: false,
        }
    }

    fn nothing_created(&self) -> bool {
        !(self.metadata_pool_created
            || self.data_pool_created
            || self.filesystem_created
            || self.auth_created)
    }
}

/// Creates and removes filesystems, auditing every attempt.
#[derive(Clone)]
pub struct FilesystemWorkflow {
    client: CephClient,
    probes: Probes,
    audit: Arc<dyn AuditSink>,
    defaults: FilesystemDefaults,
}

impl FilesystemWorkflow {
    pub fn new(client: CephClient, audit: Arc<dyn AuditSink>, defaults: FilesystemDefaults) -> Self {
        Self {
            probes: Probes::new(client.clone()),
            client,
            audit,
            defaults,
        }
    }

    pub async fn create(
        &self,
        request: CreateFilesystemRequest,
        actor: &str,
    ) -> ApiResult<ProvisionedFilesystem> {
        let resource = format!("filesystem:{}", request.name);
        let result = self.provision(request, actor).await;

        let record = AuditRecord::new(
            AuditOperation::Create,
            resource,
            actor,
            AuditOutcome::of(&result),
        );
        let record = match &result {
            Ok(fs) => record
                .detail("metadata_pool", fs.metadata_pool.as_str())
                .detail("data_pool", fs.data_pool.as_str())
                .detail("snapshots_enabled", fs.snapshots_enabled)
                .detail("auth_created", fs.auth_created),
            Err(e) => record.detail("error", e.code()),
        };
        self.audit.log_operation(record);
        result
    }

    async fn provision(
        &self,
        request: CreateFilesystemRequest,
        actor: &str,
    ) -> ApiResult<ProvisionedFilesystem> {
        let plan = FilesystemPlan::resolve(request, &self.defaults)?;
        self.validate(&plan).await?;

        info!(fs = %plan.name, user = %actor, "creating filesystem");
        let mut state = ProvisioningState::new(&plan);
        match self.run_steps(&plan, &mut state).await {
            Ok(created) => {
                state.stage = Stage::Done;
                Ok(created)
            }
            Err(e) => {
                warn!(
                    fs = %plan.name,
                    stage = state.stage.as_str(),
                    error = %e,
                    "filesystem creation failed, rolling back"
                );
                self.rollback(&mut state).await;
                Err(e.into())
            }
        }
    }

    /// Checks that run before anything is created.
    async fn validate(&self, plan: &FilesystemPlan) -> ApiResult<()> {
        if self.probes.filesystem_exists(&plan.name).await? {
            return Err(CephError::AlreadyExists {
                kind: ResourceKind::Filesystem,
                name: plan.name.clone(),
            }
            .into());
        }
        if !self.probes.crush_rule_exists(&plan.crush_rule).await? {
            return Err(ApiError::InvalidCrushRule(plan.crush_rule.clone()));
        }
        for pool in [metadata_pool_name(&plan.name), data_pool_name(&plan.name)] {
            if self.probes.pool_exists(&pool).await? {
                return Err(CephError::AlreadyExists {
                    kind: ResourceKind::Pool,
                    name: pool,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        plan: &FilesystemPlan,
        state: &mut ProvisioningState,
    ) -> CephResult<ProvisionedFilesystem> {
        let pg = plan.pg_num.to_string();

        state.stage = Stage::CreatingMetaPool;
        self.client
            .text([
                "osd",
                "pool",
                "create",
                state.metadata_pool.as_str(),
                pg.as_str(),
                "replicated",
                plan.crush_rule.as_str(),
            ])
            .await?;
        state.metadata_pool_created = true;

        state.stage = Stage::CreatingDataPool;
        self.client
            .text([
                "osd",
                "pool",
                "create",
                state.data_pool.as_str(),
                pg.as_str(),
                plan.data_pool_type.as_str(),
                plan.crush_rule.as_str(),
            ])
            .await?;
        state.data_pool_created = true;

        state.stage = Stage::CreatingFilesystem;
        self.client
            .text([
                "fs",
                "new",
                plan.name.as_str(),
                state.metadata_pool.as_str(),
                state.data_pool.as_str(),
            ])
            .await?;
        state.filesystem_created = true;

        if plan.enable_snapshots {
            state.stage = Stage::SettingFlags;
            self.client
                .text(["fs", "set", plan.name.as_str(), "allow_new_snaps", "true"])
                .await?;
        }

        let mut auth_key = None;
        if plan.create_auth {
            state.stage = Stage::CreatingAuth;
            let entity = client_entity(&plan.auth_client_name);
            let output = self
                .client
                .text(["fs", "authorize", plan.name.as_str(), entity.as_str(), "/", "rw"])
                .await?;
            let key = extract_auth_key(&output).ok_or_else(|| CephError::CommandFailed {
                command: format!("ceph fs authorize {} {} / rw", plan.name, entity),
                exit_code: 1,
                stderr: "Failed to extract auth key from output".to_string(),
                stdout: String::new(),
            })?;
            state.auth_created = true;
            auth_key = Some(key);
        }

        Ok(ProvisionedFilesystem {
            name: plan.name.clone(),
            metadata_pool: state.metadata_pool.clone(),
            data_pool: state.data_pool.clone(),
            snapshots_enabled: plan.enable_snapshots,
            auth_created: plan.create_auth,
            auth_client_name: plan.create_auth.then(|| plan.auth_client_name.clone()),
            auth_key,
        })
    }

    /// Undoes completed steps, newest first. Failures are logged and the
    /// remaining steps still run.
    async fn rollback(&self, state: &mut ProvisioningState) {
        state.stage = Stage::RollingBack;
        if state.nothing_created() {
            return;
        }

        if state.filesystem_created {
            warn!(fs = %state.fs_name, "rollback: removing filesystem");
            self.compensate(remove_filesystem_args(&state.fs_name)).await;
        }
        if state.auth_created {
            let entity = client_entity(&state.auth_client);
            warn!(entity = %entity, "rollback: deleting client auth");
            self.compensate(vec!["auth".into(), "del".into(), entity]).await;
        }
        if state.data_pool_created {
            warn!(pool = %state.data_pool, "rollback: deleting data pool");
            self.compensate(delete_pool_args(&state.data_pool)).await;
        }
        if state.metadata_pool_created {
            warn!(pool = %state.metadata_pool, "rollback: deleting metadata pool");
            self.compensate(delete_pool_args(&state.metadata_pool)).await;
        }
    }

    async fn compensate(&self, args: Vec<String>) {
        if let Err(e) = self.client.text(args.clone()).await {
            error!(command = %args.join(" "), error = %e, "rollback step failed");
        }
    }

    /// Removes a filesystem after the caller confirmed by repeating its name.
    pub async fn delete(
        &self,
        name: &str,
        confirm: Option<&str>,
        delete_auth: bool,
        actor: &str,
    ) -> ApiResult<()> {
        let result = self.teardown(name, confirm, delete_auth, actor).await;
        let mut record = AuditRecord::new(
            AuditOperation::Delete,
            format!("filesystem:{}", name),
            actor,
            AuditOutcome::of(&result),
        )
        .detail("delete_auth", delete_auth);
        if let Err(ref e) = result {
            record = record.detail("error", e.code());
        }
        self.audit.log_operation(record);
        result
    }

    async fn teardown(
        &self,
        name: &str,
        confirm: Option<&str>,
        delete_auth: bool,
        actor: &str,
    ) -> ApiResult<()> {
        if confirm != Some(name) {
            return Err(ApiError::ConfirmationRequired {
                expected: name.to_string(),
                provided: confirm.map(String::from),
            });
        }

        if !self.probes.filesystem_exists(name).await? {
            return Err(CephError::NotFound {
                kind: ResourceKind::Filesystem,
                name: name.to_string(),
            }
            .into());
        }

        info!(fs = %name, user = %actor, delete_auth, "deleting filesystem");
        if delete_auth {
            let entity = client_entity(name);
            match self.client.text(["auth", "del", entity.as_str()]).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    info!(entity = %entity, "client auth already absent");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.client.text(remove_filesystem_args(name)).await?;
        Ok(())
    }
}

fn remove_filesystem_args(name: &str) -> Vec<String> {
    ["fs", "volume", "rm", name, "--yes-i-really-mean-it"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn delete_pool_args(pool: &str) -> Vec<String> {
    ["osd", "pool", "delete", pool, pool, "--yes-i-really-really-mean-it"]
        .into_iter()
        .map(String::from)
        .collect()
}
