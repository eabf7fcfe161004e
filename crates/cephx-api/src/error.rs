//! Error taxonomy for ceph command execution and the REST boundary.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// The kind of cluster resource an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A CephFS filesystem.
    Filesystem,
    /// A RADOS pool.
    Pool,
    /// A CRUSH placement rule.
    CrushRule,
    /// A CephX auth entity such as `client.foo`.
    AuthEntity,
    /// An OSD daemon.
    Osd,
    /// A snapshot schedule on a filesystem path.
    SnapshotSchedule,
    /// Anything the command could not be attributed to.
    Resource,
}

impl ResourceKind {
    fn code_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Filesystem => "FS",
            ResourceKind::Pool => "POOL",
            ResourceKind::CrushRule => "CRUSH_RULE",
            ResourceKind::AuthEntity => "AUTH",
            ResourceKind::Osd => "OSD",
            ResourceKind::SnapshotSchedule => "SCHEDULE",
            ResourceKind::Resource => "CEPH",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Filesystem => "filesystem",
            ResourceKind::Pool => "pool",
            ResourceKind::CrushRule => "CRUSH rule",
            ResourceKind::AuthEntity => "auth entity",
            ResourceKind::Osd => "OSD",
            ResourceKind::SnapshotSchedule => "snapshot schedule",
            ResourceKind::Resource => "resource",
        };
        f.write_str(name)
    }
}

/// A classified failure of a single ceph invocation.
///
/// Raw exit codes never leave the command layer; every non-zero result is
/// turned into exactly one of these variants.
#[derive(Debug, Error)]
pub enum CephError {
    /// The referenced resource does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// What kind of resource was missing.
        kind: ResourceKind,
        /// Its identifier.
        name: String,
    },

    /// The resource to be created already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// What kind of resource collided.
        kind: ResourceKind,
        /// Its identifier.
        name: String,
    },

    /// The cluster refused the operation.
    #[error("Permission denied: {}", redact_secrets(.message))]
    PermissionDenied {
        /// Text reported by the tool.
        message: String,
    },

    /// The binary is missing or the monitors cannot be reached.
    #[error("Ceph cluster is unavailable: {}", redact_secrets(.message))]
    ClusterUnavailable {
        /// Why the cluster was considered unreachable.
        message: String,
    },

    /// The command did not finish within its timeout.
    #[error("Command timed out after {}s: {command}", timeout.as_secs())]
    Timeout {
        /// The command line that was killed.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The command succeeded but its output could not be interpreted.
    #[error("Invalid response from `{command}`: {reason}")]
    InvalidResponse {
        /// The command line that produced the output.
        command: String,
        /// Raw output text.
        output: String,
        /// Parse failure description.
        reason: String,
    },

    /// Any other non-zero exit.
    #[error("Ceph command failed: {command}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Process exit code, -1 when killed by a signal.
        exit_code: i32,
        /// Captured standard error.
        stderr: String,
        /// Captured standard output.
        stdout: String,
    },
}

impl CephError {
    /// Returns true for the not-found classification, regardless of kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CephError::NotFound { .. })
    }

    /// Re-labels a not-found error with a concrete resource, leaving other
    /// variants untouched.
    pub fn not_found_as(self, kind: ResourceKind, name: &str) -> Self {
        match self {
            CephError::NotFound { .. } => CephError::NotFound {
                kind,
                name: name.to_string(),
            },
            other => other,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> String {
        match self {
            CephError::NotFound { kind, .. } => format!("{}_NOT_FOUND", kind.code_prefix()),
            CephError::AlreadyExists { kind, .. } => {
                format!("{}_ALREADY_EXISTS", kind.code_prefix())
            }
            CephError::PermissionDenied { .. } => "CEPH_PERMISSION_DENIED".to_string(),
            CephError::ClusterUnavailable { .. } => "CEPH_CLUSTER_UNAVAILABLE".to_string(),
            CephError::Timeout { .. } => "CEPH_TIMEOUT".to_string(),
            CephError::InvalidResponse { .. } => "CEPH_INVALID_RESPONSE".to_string(),
            CephError::CommandFailed { .. } => "CEPH_COMMAND_FAILED".to_string(),
        }
    }

    /// HTTP status used at the REST boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            CephError::NotFound { .. } => StatusCode::NOT_FOUND,
            CephError::AlreadyExists { .. } => StatusCode::CONFLICT,
            CephError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            CephError::ClusterUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CephError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CephError::InvalidResponse { .. } | CephError::CommandFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Structured context for the error envelope. Output text is redacted.
    pub fn details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        match self {
            CephError::NotFound { kind, name } | CephError::AlreadyExists { kind, name } => {
                details.insert("resource".into(), json!(kind.to_string()));
                details.insert("name".into(), json!(name));
            }
            CephError::PermissionDenied { message } | CephError::ClusterUnavailable { message } => {
                details.insert("reason".into(), json!(redact_secrets(message)));
            }
            CephError::Timeout { command, timeout } => {
                details.insert("command".into(), json!(command));
                details.insert("timeout_secs".into(), json!(timeout.as_secs()));
            }
            CephError::InvalidResponse {
                command,
                output,
                reason,
            } => {
                details.insert("command".into(), json!(command));
                details.insert("output".into(), json!(redact_secrets(output)));
                details.insert("reason".into(), json!(reason));
            }
            CephError::CommandFailed {
                command,
                exit_code,
                stderr,
                stdout,
            } => {
                details.insert("command".into(), json!(command));
                details.insert("exit_code".into(), json!(exit_code));
                details.insert("stderr".into(), json!(redact_secrets(stderr)));
                details.insert("stdout".into(), json!(redact_secrets(stdout)));
            }
        }
        details
    }
}

/// Errors surfaced at the API boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A classified ceph failure, passed through unchanged.
    #[error(transparent)]
    Ceph(#[from] CephError),

    /// Request input failed validation before anything was executed.
    #[error("Validation failed: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// The requested CRUSH rule is not defined on the cluster.
    #[error("CRUSH rule '{0}' does not exist or is invalid")]
    InvalidCrushRule(String),

    /// A destructive operation was not confirmed.
    #[error("Confirmation failed: parameter 'confirm' must equal '{expected}'")]
    ConfirmationRequired {
        /// The value that would have confirmed the operation.
        expected: String,
        /// What the caller supplied.
        provided: Option<String>,
    },

    /// Missing or unknown API key.
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// The caller's key lacks the permission an endpoint needs.
    #[error("Permission denied. Required permission: {0}")]
    Forbidden(String),

    /// Too many failed authentication attempts from one client.
    #[error("Too many failed authentication attempts")]
    RateLimited,

    /// The endpoint exists but has no implementation.
    #[error("{feature} is not implemented")]
    NotImplemented {
        /// What was requested.
        feature: String,
        /// Extra context for the caller.
        details: Map<String, Value>,
    },
}

impl ApiError {
    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> String {
        match self {
            ApiError::Ceph(e) => e.code(),
            ApiError::Validation { .. } => "VALIDATION_ERROR".to_string(),
            ApiError::InvalidCrushRule(_) => "INVALID_CRUSH_RULE".to_string(),
            ApiError::ConfirmationRequired { .. } => "CONFIRMATION_REQUIRED".to_string(),
            ApiError::InvalidApiKey => "INVALID_API_KEY".to_string(),
            ApiError::Forbidden(_) => "PERMISSION_DENIED".to_string(),
            ApiError::RateLimited => "RATE_LIMITED".to_string(),
            ApiError::NotImplemented { .. } => "NOT_IMPLEMENTED".to_string(),
        }
    }

    /// HTTP status used at the REST boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Ceph(e) => e.status(),
            ApiError::Validation { .. }
            | ApiError::InvalidCrushRule(_)
            | ApiError::ConfirmationRequired { .. } => StatusCode::BAD_REQUEST,
            ApiError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Structured context for the error envelope.
    pub fn details(&self) -> Map<String, Value> {
        match self {
            ApiError::Ceph(e) => e.details(),
            ApiError::InvalidCrushRule(rule) => {
                let mut details = Map::new();
                details.insert("crush_rule".into(), json!(rule));
                details
            }
            ApiError::ConfirmationRequired { expected, provided } => {
                let mut details = Map::new();
                details.insert("required".into(), json!(expected));
                details.insert("provided".into(), json!(provided));
                details
            }
            ApiError::Forbidden(permission) => {
                let mut details = Map::new();
                details.insert("required_permission".into(), json!(permission));
                details
            }
            ApiError::NotImplemented { details, .. } => details.clone(),
            _ => Map::new(),
        }
    }

    /// The error envelope sent to clients.
    pub fn to_body(&self) -> Value {
        json!({
            "status": "error",
            "code": self.code(),
            "message": self.to_string(),
            "details": Value::Object(self.details()),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = %self.code(), "{}", self);
        } else {
            tracing::debug!(code = %self.code(), "{}", self);
        }
        (status, Json(self.to_body())).into_response()
    }
}

/// Result alias for command-layer operations.
pub type CephResult<T> = std::result::Result<T, CephError>;

/// Result alias for API operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

const REDACTED: &str = "<redacted>";

/// Masks secret keys in captured command output.
///
/// Handles the keyring text form (`key = AQ...`) and the JSON form
/// (`"key": "AQ..."`).
pub fn redact_secrets(text: &str) -> String {
    text.lines()
        .map(redact_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn redact_line(line: &str) -> String {
    if let Some(pos) = line.find("\"key\"") {
        let (head, tail) = line.split_at(pos + "\"key\"".len());
        let Some(colon) = tail.find(':') else {
            return line.to_string();
        };
        let after_colon = &tail[colon + 1..];
        let Some(open) = after_colon.find('"') else {
            return line.to_string();
        };
        let value_start = &after_colon[open + 1..];
        let Some(close) = value_start.find('"') else {
            return line.to_string();
        };
        let rest = redact_line(&value_start[close + 1..]);
        return format!(
            "{}{}\"{}\"{}",
            head,
            &tail[..colon + 1 + open],
            REDACTED,
            rest
        );
    }

    let trimmed = line.trim_start();
    if trimmed.starts_with("key") {
        if let Some(eq) = line.find('=') {
            return format!("{}= {}", &line[..eq], REDACTED);
        }
    }
    line.to_string()
}
