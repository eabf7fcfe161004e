use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::access::{self, ApiKeyStore, Principal};
use crate::audit::{AuditSink, AuditTrail, JsonlAuditLog, NullAudit};
use crate::cache::{Clock, SystemClock};
use crate::cephx::{AuthListQuery, AuthService, CreateAuthRequest, UpdateCapsRequest};
use crate::cluster::ClusterService;
use crate::config::{ApiConfig, AuditSettings};
use crate::error::{ApiError, ApiResult};
use crate::executor::CephClient;
use crate::filesystem::FilesystemQueries;
use crate::osd::{OsdFlagRequest, OsdService};
use crate::provision::{CreateFilesystemRequest, FilesystemWorkflow};
use crate::security::{security_headers_middleware, AuthRateLimiter};
use crate::snapshot::{AddScheduleRequest, SnapshotService};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Default, Deserialize)]
struct ListFilesystemsQuery {
    #[serde(default)]
    include_usage: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteFilesystemQuery {
    confirm: Option<String>,
    delete_auth: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ScheduleQuery {
    path: Option<String>,
    schedule: Option<String>,
}

impl ScheduleQuery {
    fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }
}

/// The REST service and everything it dispatches to.
pub struct CephApi {
    bind_addr: SocketAddr,
    filesystems: FilesystemWorkflow,
    queries: FilesystemQueries,
    auth: AuthService,
    snapshots: SnapshotService,
    osd: OsdService,
    cluster: ClusterService,
    keys: ApiKeyStore,
    rate_limiter: AuthRateLimiter,
}

impl CephApi {
    pub fn new(
        config: &ApiConfig,
        client: CephClient,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bind_addr: config.bind_addr,
            filesystems: FilesystemWorkflow::new(
                client.clone(),
                audit.clone(),
                config.filesystem.clone(),
            ),
            queries: FilesystemQueries::new(client.clone(), audit.clone()),
            auth: AuthService::new(client.clone(), audit.clone()),
            snapshots: SnapshotService::new(client.clone(), audit.clone()),
            osd: OsdService::new(client.clone(), audit.clone()),
            cluster: ClusterService::new(client, audit, config.cache.clone(), clock.clone()),
            keys: ApiKeyStore::from_config(&config.api_keys),
            rate_limiter: AuthRateLimiter::new(clock),
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        let protected = Router::new()
            .route("/api/v1/fs", post(create_filesystem).get(list_filesystems))
            .route("/api/v1/fs/{name}", get(get_filesystem).delete(delete_filesystem))
            .route("/api/v1/fs/{name}/usage", get(filesystem_usage))
            .route("/api/v1/auth", post(create_auth).get(list_auth))
            .route("/api/v1/auth/{client}", get(get_auth).delete(delete_auth))
            .route("/api/v1/auth/{client}/caps", put(update_auth_caps))
            .route("/api/v1/cluster/status", get(cluster_status))
            .route("/api/v1/cluster/df", get(cluster_df))
            .route("/api/v1/cluster/monitors", get(cluster_monitors))
            .route("/api/v1/ceph/osd/{id}/status", get(osd_status))
            .route("/api/v1/ceph/osd/flags", post(osd_flags))
            .route(
                "/api/v1/snapshots/fs/{name}/snapshot-schedule",
                post(add_schedule).get(list_schedules).delete(remove_schedule),
            )
            .route("/api/v1/snapshots/fs/{name}/snapshots", get(list_snapshots))
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                require_api_key,
            ));

        let public = Router::new().route("/health", get(health));

        Router::new()
            .merge(protected)
            .merge(public)
            .layer(axum::middleware::from_fn(security_headers_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.bind_addr;
        let api = Arc::new(self);

        let sweeper = api.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticks.tick().await;
                sweeper.rate_limiter.prune();
            }
        });

        let router = api.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("ceph API listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

fn audit_sink(settings: &AuditSettings) -> anyhow::Result<Arc<dyn AuditSink>> {
    if !settings.enabled {
        return Ok(Arc::new(NullAudit));
    }
    let sink: Arc<dyn AuditSink> = match settings.log_file {
        Some(ref path) => Arc::new(JsonlAuditLog::open(path)?),
        None => Arc::new(AuditTrail::new()),
    };
    Ok(sink)
}

/// Loads configuration and runs the API until the listener fails.
pub async fn serve_from_config(config_path: Option<&FsPath>) -> anyhow::Result<()> {
    let config = ApiConfig::load_or_default(config_path)?;
    if config.api_keys.is_empty() {
        tracing::warn!("no API keys configured; every protected request will be rejected");
    }
    tracing::info!(
        binary = %config.ceph.binary.display(),
        timeout_secs = config.ceph.timeout_secs,
        "using ceph CLI"
    );

    let client = CephClient::with_tokio(&config.ceph);
    let audit = audit_sink(&config.audit)?;
    CephApi::new(&config, client, audit, Arc::new(SystemClock))
        .serve()
        .await
}

fn success<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(serde_json::json!({ "status": "success", "data": data })),
    )
        .into_response()
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::validation(e.body_text()))
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(v)| v)
        .map_err(|e| ApiError::validation(e.body_text()))
}

fn client_address(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn require_api_key(
    State(api): State<Arc<CephApi>>,
    mut request: Request,
    next: Next,
) -> Response {
    let client = client_address(&request);
    if api.rate_limiter.is_rate_limited(&client) {
        return ApiError::RateLimited.into_response();
    }

    let principal = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|key| api.keys.authenticate(key));

    match principal {
        Some(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => {
            api.rate_limiter.record_failure(&client);
            tracing::warn!(client = %client, path = %request.uri().path(), "rejected API key");
            ApiError::InvalidApiKey.into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

async fn create_filesystem(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<CreateFilesystemRequest>, JsonRejection>,
) -> ApiResult<Response> {
    principal.require(access::FS_WRITE)?;
    let request = json_body(body)?;
    let created = api.filesystems.create(request, &principal.user).await?;
    Ok(success(StatusCode::CREATED, created))
}

async fn list_filesystems(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    params: Result<Query<ListFilesystemsQuery>, QueryRejection>,
) -> ApiResult<Response> {
    principal.require(access::FS_READ)?;
    let params = query(params)?;
    let list = api.queries.list(params.include_usage, &principal.user).await?;
    Ok(success(StatusCode::OK, list))
}

async fn get_filesystem(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    principal.require(access::FS_READ)?;
    let fs = api.queries.get(&name, &principal.user).await?;
    Ok(success(StatusCode::OK, fs))
}

async fn filesystem_usage(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    principal.require(access::FS_READ)?;
    let usage = api.queries.usage(&name, &principal.user).await?;
    Ok(success(StatusCode::OK, usage))
}

async fn delete_filesystem(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    params: Result<Query<DeleteFilesystemQuery>, QueryRejection>,
) -> ApiResult<StatusCode> {
    principal.require(access::FS_WRITE)?;
    let params = query(params)?;
    api.filesystems
        .delete(
            &name,
            params.confirm.as_deref(),
            params.delete_auth.unwrap_or(true),
            &principal.user,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_auth(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<CreateAuthRequest>, JsonRejection>,
) -> ApiResult<Response> {
    principal.require(access::AUTH_WRITE)?;
    let request = json_body(body)?;
    let created = api.auth.create(request, &principal.user).await?;
    Ok(success(StatusCode::CREATED, created))
}

async fn list_auth(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    params: Result<Query<AuthListQuery>, QueryRejection>,
) -> ApiResult<Response> {
    principal.require(access::AUTH_READ)?;
    let params = query(params)?;
    let list = api.auth.list(params, &principal.user).await?;
    Ok(success(StatusCode::OK, list))
}

async fn get_auth(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(client): Path<String>,
) -> ApiResult<Response> {
    principal.require(access::AUTH_READ)?;
    let entity = api.auth.get(&client, &principal.user).await?;
    Ok(success(StatusCode::OK, entity))
}

async fn update_auth_caps(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(client): Path<String>,
    body: Result<Json<UpdateCapsRequest>, JsonRejection>,
) -> ApiResult<Response> {
    principal.require(access::AUTH_WRITE)?;
    let request = json_body(body)?;
    let updated = api.auth.update_caps(&client, request, &principal.user).await?;
    Ok(success(StatusCode::OK, updated))
}

async fn delete_auth(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(client): Path<String>,
) -> ApiResult<StatusCode> {
    principal.require(access::AUTH_WRITE)?;
    api.auth.delete(&client, &principal.user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cluster_status(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    principal.require(access::CLUSTER_READ)?;
    Ok(success(StatusCode::OK, api.cluster.status(&principal.user).await?))
}

async fn cluster_df(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    principal.require(access::CLUSTER_READ)?;
    Ok(success(StatusCode::OK, api.cluster.df(&principal.user).await?))
}

async fn cluster_monitors(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Response> {
    principal.require(access::CLUSTER_READ)?;
    Ok(success(StatusCode::OK, api.cluster.monitors(&principal.user).await?))
}

async fn osd_status(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    id: Result<Path<u32>, PathRejection>,
) -> ApiResult<Response> {
    principal.require(access::OSD_READ)?;
    let Path(id) = id.map_err(|e| ApiError::validation(e.body_text()))?;
    Ok(success(StatusCode::OK, api.osd.status(id, &principal.user).await?))
}

async fn osd_flags(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<OsdFlagRequest>, JsonRejection>,
) -> ApiResult<Response> {
    principal.require(access::OSD_WRITE)?;
    let request = json_body(body)?;
    Ok(success(StatusCode::OK, api.osd.set_flag(request, &principal.user).await?))
}

async fn add_schedule(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    body: Result<Json<AddScheduleRequest>, JsonRejection>,
) -> ApiResult<Response> {
    principal.require(access::FS_WRITE)?;
    let request = json_body(body)?;
    let added = api
        .snapshots
        .add_schedule(&name, request, &principal.user)
        .await?;
    Ok(success(StatusCode::CREATED, added))
}

async fn list_schedules(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    params: Result<Query<ScheduleQuery>, QueryRejection>,
) -> ApiResult<Response> {
    principal.require(access::FS_READ)?;
    let params = query(params)?;
    let list = api
        .snapshots
        .list_schedules(&name, params.path(), &principal.user)
        .await?;
    Ok(success(StatusCode::OK, list))
}

async fn remove_schedule(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    params: Result<Query<ScheduleQuery>, QueryRejection>,
) -> ApiResult<StatusCode> {
    principal.require(access::FS_WRITE)?;
    let params = query(params)?;
    api.snapshots
        .remove_schedule(
            &name,
            params.path(),
            params.schedule.as_deref(),
            &principal.user,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_snapshots(
    State(api): State<Arc<CephApi>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    params: Result<Query<ScheduleQuery>, QueryRejection>,
) -> ApiResult<Response> {
    principal.require(access::FS_READ)?;
    let params = query(params)?;
    let snapshots = api.snapshots.list_snapshots(&name, params.path())?;
    Ok(success(StatusCode::OK, snapshots))
}
