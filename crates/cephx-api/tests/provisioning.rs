//! Filesystem provisioning and teardown against a simulated cluster.

mod common;

use std::sync::Arc;

use cephx_api::audit::{AuditFilter, AuditOperation, AuditOutcome, AuditTrail};
use cephx_api::config::FilesystemDefaults;
use cephx_api::provision::{CreateFilesystemRequest, FilesystemWorkflow};
use common::SimulatedCeph;

fn workflow(ceph: &SimulatedCeph) -> (FilesystemWorkflow, Arc<AuditTrail>) {
    let trail = Arc::new(AuditTrail::new());
    let workflow = FilesystemWorkflow::new(ceph.client(), trail.clone(), FilesystemDefaults::default());
    (workflow, trail)
}

fn request(name: &str) -> CreateFilesystemRequest {
    CreateFilesystemRequest {
        name: name.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_then_delete_keeps_pools() {
    let ceph = SimulatedCeph::new();
    let (wf, trail) = workflow(&ceph);

    let created = wf.create(request("home"), "admin").await.unwrap();
    assert_eq!(created.metadata_pool, "cephfs.home.meta");
    assert_eq!(created.data_pool, "cephfs.home.data");
    assert!(created.auth_key.as_deref().is_some_and(|k| k.starts_with("AQSIM")));
    assert_eq!(ceph.filesystems(), vec!["home"]);
    assert!(ceph.has_entity("client.home"));

    wf.delete("home", Some("home"), true, "admin").await.unwrap();
    assert!(ceph.filesystems().is_empty());
    assert!(!ceph.has_entity("client.home"));
    assert_eq!(ceph.pools(), vec!["cephfs.home.data", "cephfs.home.meta"]);

    let ops: Vec<_> = trail
        .query(&AuditFilter::default())
        .into_iter()
        .map(|r| (r.operation, r.outcome))
        .collect();
    assert_eq!(
        ops,
        vec![
            (AuditOperation::Create, AuditOutcome::Success),
            (AuditOperation::Delete, AuditOutcome::Success),
        ]
    );
}

#[tokio::test]
async fn failed_filesystem_creation_leaves_no_pools() {
    let ceph = SimulatedCeph::new();
    ceph.fail("fs new", 22, "Error EINVAL: pool 'cephfs.data.data' has id 0");
    let (wf, trail) = workflow(&ceph);

    let err = wf.create(request("data"), "admin").await.unwrap_err();
    assert_eq!(err.code(), "CEPH_COMMAND_FAILED");
    assert!(ceph.pools().is_empty());
    assert!(ceph.filesystems().is_empty());

    let tail: Vec<String> = ceph.mutations().into_iter().rev().take(2).collect();
    assert_eq!(
        tail,
        vec![
            "osd pool delete cephfs.data.meta cephfs.data.meta --yes-i-really-really-mean-it",
            "osd pool delete cephfs.data.data cephfs.data.data --yes-i-really-really-mean-it",
        ]
    );
    let record = &trail.query(&AuditFilter::default())[0];
    assert_eq!(record.outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn failed_authorize_removes_filesystem_then_pools() {
    let ceph = SimulatedCeph::new();
    ceph.fail("fs authorize", 13, "Error EACCES: permission denied");
    let (wf, _) = workflow(&ceph);

    let err = wf.create(request("scratch"), "admin").await.unwrap_err();
    assert_eq!(err.code(), "CEPH_PERMISSION_DENIED");
    assert!(ceph.filesystems().is_empty());
    assert!(ceph.pools().is_empty());
    assert!(!ceph.mutations().iter().any(|c| c.starts_with("auth del")));
}

#[tokio::test]
async fn rollback_continues_past_failed_step() {
    let ceph = SimulatedCeph::new();
    ceph.fail("fs set", 1, "Error EIO: mds unavailable");
    ceph.fail("osd pool delete cephfs.x.data", 1, "Error EBUSY: pool is in use");
    let (wf, _) = workflow(&ceph);

    let err = wf.create(request("x"), "admin").await.unwrap_err();
    assert_eq!(err.code(), "CEPH_COMMAND_FAILED");
    assert_eq!(err.details()["command"], "ceph fs set x allow_new_snaps true");
    assert_eq!(err.details()["stderr"], "Error EIO: mds unavailable");
    assert!(ceph.filesystems().is_empty());
    assert_eq!(ceph.pools(), vec!["cephfs.x.data"]);
}

#[tokio::test]
async fn second_create_conflicts_without_side_effects() {
    let ceph = SimulatedCeph::new();
    let (wf, _) = workflow(&ceph);
    wf.create(request("home"), "admin").await.unwrap();
    let before = ceph.mutations().len();

    let err = wf.create(request("home"), "admin").await.unwrap_err();
    assert_eq!(err.code(), "FS_ALREADY_EXISTS");
    assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    assert_eq!(ceph.mutations().len(), before);
}

#[tokio::test]
async fn leftover_pool_blocks_creation() {
    let ceph = SimulatedCeph::new();
    ceph.add_pool("cephfs.home.data");
    let (wf, _) = workflow(&ceph);

    let err = wf.create(request("home"), "admin").await.unwrap_err();
    assert_eq!(err.code(), "POOL_ALREADY_EXISTS");
    assert!(ceph.mutations().is_empty());
}

#[tokio::test]
async fn unknown_crush_rule_is_rejected() {
    let ceph = SimulatedCeph::new();
    let (wf, _) = workflow(&ceph);
    let mut req = request("home");
    req.crush_rule = Some("ssd_only".into());

    let err = wf.create(req, "admin").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_CRUSH_RULE");
    assert!(ceph.mutations().is_empty());
}

#[tokio::test]
async fn unreachable_cluster_fails_before_mutation() {
    let ceph = SimulatedCeph::new();
    ceph.unreachable("fs ls");
    let (wf, _) = workflow(&ceph);

    let err = wf.create(request("home"), "admin").await.unwrap_err();
    assert_eq!(err.code(), "CEPH_CLUSTER_UNAVAILABLE");
    assert_eq!(ceph.calls(), vec!["fs ls --format json"]);
}

#[tokio::test]
async fn delete_tolerates_missing_auth() {
    let ceph = SimulatedCeph::new();
    let (wf, _) = workflow(&ceph);
    let mut req = request("home");
    req.create_auth = Some(false);
    wf.create(req, "admin").await.unwrap();
    assert!(!ceph.has_entity("client.home"));

    wf.delete("home", Some("home"), true, "admin").await.unwrap();
    assert!(ceph.filesystems().is_empty());
}

#[tokio::test]
async fn delete_requires_matching_confirmation() {
    let ceph = SimulatedCeph::new();
    let (wf, _) = workflow(&ceph);
    wf.create(request("home"), "admin").await.unwrap();
    let before = ceph.calls().len();

    let err = wf.delete("home", Some("Home"), true, "admin").await.unwrap_err();
    assert_eq!(err.code(), "CONFIRMATION_REQUIRED");
    assert_eq!(ceph.calls().len(), before);
    assert_eq!(ceph.filesystems(), vec!["home"]);
}
