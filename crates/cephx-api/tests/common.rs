//! Common test utilities: an in-process stand-in for the ceph CLI.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use cephx_api::audit::{AuditSink, AuditTrail};
use cephx_api::cache::ManualClock;
use cephx_api::config::{ApiConfig, ApiKeyEntry, CephSettings};
use cephx_api::{CephApi, CephClient, ProcessOutput, ProcessRunner, RunnerError};
use serde_json::{json, Value};

pub const ADMIN_KEY: &str = "test-admin-key";
pub const READER_KEY: &str = "test-reader-key";

#[derive(Default)]
struct ClusterState {
    pools: BTreeSet<String>,
    crush_rules: BTreeSet<String>,
    /// name -> (metadata pool, data pool)
    filesystems: BTreeMap<String, (String, String)>,
    /// entity -> (key, caps)
    auth: BTreeMap<String, (String, BTreeMap<String, String>)>,
    next_key: u32,
}

enum Fault {
    Fail { exit_code: i32, stderr: String },
    Unreachable,
}

/// Tracks pools, filesystems and auth entities the way a small cluster
/// would, answering the subset of ceph commands the service issues.
#[derive(Clone)]
pub struct SimulatedCeph {
    state: Arc<Mutex<ClusterState>>,
    faults: Arc<Mutex<Vec<(Vec<String>, Fault)>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

fn ok(stdout: impl Into<String>) -> ProcessOutput {
    ProcessOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn err(exit_code: i32, stderr: impl Into<String>) -> ProcessOutput {
    ProcessOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

impl SimulatedCeph {
    pub fn new() -> Self {
        let mut state = ClusterState::default();
        state.crush_rules.insert("replicated_rule".into());
        state.crush_rules.insert("replicated_mach2".into());
        state.auth.insert(
            "client.admin".into(),
            ("AQADMIN==".into(), BTreeMap::from([("mon".into(), "allow *".into())])),
        );
        state.auth.insert("osd.0".into(), ("AQOSD0==".into(), BTreeMap::new()));
        Self {
            state: Arc::new(Mutex::new(state)),
            faults: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn client(&self) -> CephClient {
        CephClient::new(&CephSettings::default(), Arc::new(self.clone()))
    }

    /// Every command whose arguments start with `prefix` fails.
    pub fn fail(&self, prefix: &str, exit_code: i32, stderr: &str) {
        self.faults.lock().unwrap().push((
            prefix.split_whitespace().map(String::from).collect(),
            Fault::Fail {
                exit_code,
                stderr: stderr.to_string(),
            },
        ));
    }

    /// Commands starting with `prefix` behave as if the binary were missing.
    pub fn unreachable(&self, prefix: &str) {
        self.faults.lock().unwrap().push((
            prefix.split_whitespace().map(String::from).collect(),
            Fault::Unreachable,
        ));
    }

    pub fn add_pool(&self, name: &str) {
        self.state.lock().unwrap().pools.insert(name.to_string());
    }

    pub fn pools(&self) -> Vec<String> {
        self.state.lock().unwrap().pools.iter().cloned().collect()
    }

    pub fn filesystems(&self) -> Vec<String> {
        self.state.lock().unwrap().filesystems.keys().cloned().collect()
    }

    pub fn has_entity(&self, entity: &str) -> bool {
        self.state.lock().unwrap().auth.contains_key(entity)
    }

    pub fn caps(&self, entity: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .auth
            .get(entity)
            .map(|(_, caps)| caps.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands that are not `--format json` reads.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.ends_with("--format json") || c.starts_with("auth get-or-create"))
            .collect()
    }

    fn handle(&self, args: &[String]) -> ProcessOutput {
        let mut cmd: Vec<&str> = args.iter().map(String::as_str).collect();
        if cmd.ends_with(&["--format", "json"]) {
            cmd.truncate(cmd.len() - 2);
        }
        let mut state = self.state.lock().unwrap();

        match cmd.as_slice() {
            ["fs", "ls"] => {
                let list: Vec<Value> = state
                    .filesystems
                    .iter()
                    .map(|(name, (meta, data))| {
                        json!({"name": name, "metadata_pool": meta, "data_pools": [data]})
                    })
                    .collect();
                ok(Value::Array(list).to_string())
            }
            ["fs", "volume", "info", name] => match state.filesystems.get(*name) {
                Some((meta, data)) => ok(json!({
                    "mon_addrs": ["10.0.0.1:6789"],
                    "pools": {
                        "metadata": [{"name": meta}],
                        "data": [{"name": data}]
                    }
                })
                .to_string()),
                None => err(2, format!("Error ENOENT: volume '{}' not found", name)),
            },
            ["fs", "volume", "rm", name, ..] => match state.filesystems.remove(*name) {
                Some(_) => ok(""),
                None => err(2, format!("Error ENOENT: volume '{}' does not exist", name)),
            },
            ["fs", "new", name, meta, data] => {
                if state.filesystems.contains_key(*name) {
                    return err(17, format!("Error EEXIST: filesystem '{}' already exists", name));
                }
                if !state.pools.contains(*meta) || !state.pools.contains(*data) {
                    return err(2, "Error ENOENT: pool does not exist");
                }
                state
                    .filesystems
                    .insert(name.to_string(), (meta.to_string(), data.to_string()));
                ok("")
            }
            ["fs", "set", name, ..] => {
                if state.filesystems.contains_key(*name) {
                    ok("")
                } else {
                    err(2, format!("Error ENOENT: filesystem '{}' not found", name))
                }
            }
            ["fs", "authorize", fs, entity, path, perms] => {
                if !state.filesystems.contains_key(*fs) {
                    return err(2, format!("Error ENOENT: filesystem '{}' not found", fs));
                }
                state.next_key += 1;
                let key = format!("AQSIM{:04}==", state.next_key);
                let caps = BTreeMap::from([
                    ("mds".to_string(), format!("allow {} fsname={} path={}", perms, fs, path)),
                    ("mon".to_string(), format!("allow r fsname={}", fs)),
                    ("osd".to_string(), format!("allow {} tag cephfs data={}", perms, fs)),
                ]);
                state.auth.insert(entity.to_string(), (key.clone(), caps));
                ok(format!("[{}]\n\tkey = {}\n", entity, key))
            }
            ["fs", "snap-schedule", ..] => ok(""),
            ["osd", "pool", "ls"] => {
                ok(json!(state.pools.iter().collect::<Vec<_>>()).to_string())
            }
            ["osd", "pool", "create", name, ..] => {
                state.pools.insert(name.to_string());
                ok(format!("pool '{}' created", name))
            }
            ["osd", "pool", "delete", name, ..] => {
                state.pools.remove(*name);
                ok(format!("pool '{}' removed", name))
            }
            ["osd", "crush", "rule", "ls"] => {
                ok(json!(state.crush_rules.iter().collect::<Vec<_>>()).to_string())
            }
            ["auth", "get", entity] => match state.auth.get(*entity) {
                Some((key, caps)) => {
                    ok(json!([{"entity": entity, "key": key, "caps": caps}]).to_string())
                }
                None => err(2, format!("Error ENOENT: entity {} does not exist", entity)),
            },
            ["auth", "get-or-create", entity, caps @ ..] => {
                state.next_key += 1;
                let key = format!("AQSIM{:04}==", state.next_key);
                let caps: BTreeMap<String, String> = caps
                    .chunks(2)
                    .filter_map(|pair| match pair {
                        [subsystem, cap] => Some((subsystem.to_string(), cap.to_string())),
                        _ => None,
                    })
                    .collect();
                state
                    .auth
                    .entry(entity.to_string())
                    .or_insert((key, caps.clone()));
                let (key, caps) = &state.auth[*entity];
                ok(json!([{"entity": entity, "key": key, "caps": caps}]).to_string())
            }
            ["auth", "caps", entity, caps @ ..] => match state.auth.get_mut(*entity) {
                Some((_, current)) => {
                    *current = caps
                        .chunks(2)
                        .filter_map(|pair| match pair {
                            [subsystem, cap] if !cap.is_empty() => {
                                Some((subsystem.to_string(), cap.to_string()))
                            }
                            _ => None,
                        })
                        .collect();
                    ok(format!("updated caps for {}", entity))
                }
                None => err(2, format!("Error ENOENT: entity {} does not exist", entity)),
            },
            ["auth", "del", entity] => match state.auth.remove(*entity) {
                Some(_) => ok(""),
                None => err(2, format!("Error ENOENT: entity {} does not exist", entity)),
            },
            ["auth", "ls"] => {
                let dump: Vec<Value> = state
                    .auth
                    .iter()
                    .map(|(entity, (key, caps))| json!({"entity": entity, "key": key, "caps": caps}))
                    .collect();
                ok(json!({ "auth_dump": dump }).to_string())
            }
            _ => err(22, format!("Error EINVAL: unrecognized command: {}", args.join(" "))),
        }
    }
}

#[async_trait]
impl ProcessRunner for SimulatedCeph {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        _timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError> {
        self.calls.lock().unwrap().push(args.join(" "));
        {
            let faults = self.faults.lock().unwrap();
            if let Some((_, fault)) = faults.iter().rev().find(|(p, _)| args.starts_with(p)) {
                return match fault {
                    Fault::Fail { exit_code, stderr } => Ok(err(*exit_code, stderr.as_str())),
                    Fault::Unreachable => Err(RunnerError::Spawn {
                        program: program.display().to_string(),
                        source: std::io::Error::from(std::io::ErrorKind::NotFound),
                    }),
                };
            }
        }
        Ok(self.handle(args))
    }
}

pub fn test_config() -> ApiConfig {
    let mut config = ApiConfig::default();
    config.api_keys.insert(
        ADMIN_KEY.into(),
        ApiKeyEntry {
            name: "admin".into(),
            permissions: vec!["*".into()],
        },
    );
    config.api_keys.insert(
        READER_KEY.into(),
        ApiKeyEntry {
            name: "reader".into(),
            permissions: vec!["fs:read".into(), "auth:read".into(), "cluster:read".into()],
        },
    );
    config
}

/// A router over `ceph` with an in-memory audit trail it also returns.
pub fn test_router(ceph: &SimulatedCeph) -> (Router, Arc<AuditTrail>) {
    let trail = Arc::new(AuditTrail::new());
    let router = router_with_audit(ceph, trail.clone());
    (router, trail)
}

pub fn router_with_audit(ceph: &SimulatedCeph, audit: Arc<dyn AuditSink>) -> Router {
    let api = CephApi::new(
        &test_config(),
        ceph.client(),
        audit,
        Arc::new(ManualClock::new()),
    );
    Arc::new(api).router()
}
