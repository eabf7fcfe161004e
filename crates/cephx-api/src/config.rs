use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub ceph: CephSettings,
    pub filesystem: FilesystemDefaults,
    /// API key -> key holder.
    pub api_keys: HashMap<String, ApiKeyEntry>,
    pub audit: AuditSettings,
    pub cache: CacheSettings,
}

/// How the `ceph` binary is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CephSettings {
    pub binary: PathBuf,
    pub timeout_secs: u64,
    pub max_concurrent_commands: usize,
}

/// Defaults applied to filesystem creation requests that omit a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemDefaults {
    pub crush_rule: String,
    pub meta_pool_pg: u32,
    pub data_pool_type: String,
    pub enable_snapshots: bool,
    pub create_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    /// When set, records are appended as JSON lines to this file instead of
    /// the in-memory trail.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub status_ttl_secs: u64,
    pub df_ttl_secs: u64,
    pub monitors_ttl_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ceph: CephSettings::default(),
            filesystem: FilesystemDefaults::default(),
            api_keys: HashMap::new(),
            audit: AuditSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl Default for CephSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/bin/ceph"),
            timeout_secs: 30,
            max_concurrent_commands: 16,
        }
    }
}

impl CephSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FilesystemDefaults {
    fn default() -> Self {
        Self {
            crush_rule: String::from("replicated_mach2"),
            meta_pool_pg: 16,
            data_pool_type: String::from("replicated"),
            enable_snapshots: true,
            create_auth: true,
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: None,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            status_ttl_secs: 30,
            df_ttl_secs: 30,
            monitors_ttl_secs: 300,
        }
    }
}

impl ApiConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ApiConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise falls back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            Some(p) => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ceph.timeout_secs == 0 {
            anyhow::bail!("ceph.timeout_secs must be greater than zero");
        }
        if self.ceph.max_concurrent_commands == 0 {
            anyhow::bail!("ceph.max_concurrent_commands must be greater than zero");
        }
        if !(1..=32768).contains(&self.filesystem.meta_pool_pg) {
            anyhow::bail!(
                "filesystem.meta_pool_pg must be between 1 and 32768, got {}",
                self.filesystem.meta_pool_pg
            );
        }
        Ok(())
    }
}
