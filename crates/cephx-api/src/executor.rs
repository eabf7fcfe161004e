//! Runs the `ceph` binary and turns its exit status into typed results.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::classify::{classify, command_line};
use crate::config::CephSettings;
use crate::error::{CephError, CephResult};

/// One invocation of the ceph binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CephCommand {
    args: Vec<String>,
    json: bool,
    timeout: Option<Duration>,
}

impl CephCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            json: false,
            timeout: None,
        }
    }

    /// Request structured output. `--format json` is appended unless the
    /// caller already supplied a `--format`.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Overrides the configured per-command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn into_argv(self) -> Vec<String> {
        let mut argv = self.args;
        if self.json && !argv.iter().any(|a| a == "--format") {
            argv.push("--format".to_string());
            argv.push("json".to_string());
        }
        argv
    }
}

/// Output of a successful invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Present when structured output was requested.
    pub json: Option<Value>,
}

/// Raw outcome of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Failures that prevent a process from producing an exit status.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process did not exit within {0:?}")]
    TimedOut(Duration),

    #[error("failed to collect process output: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam between the client and the operating system.
///
/// Implementations must pass `args` as a literal vector; nothing may be
/// interpreted by a shell.
#[async_trait]
pub trait ProcessRunner: Send + Sync + 'static {
    /// Runs `program` with `args`, killing it once `timeout` elapses.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        // dropping the wait future on timeout kills the child
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RunnerError::TimedOut(timeout))??;

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Executes ceph commands with a bounded number of concurrent processes.
#[derive(Clone)]
pub struct CephClient {
    runner: Arc<dyn ProcessRunner>,
    binary: PathBuf,
    default_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl CephClient {
    pub fn new(settings: &CephSettings, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            binary: settings.binary.clone(),
            default_timeout: settings.timeout(),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_commands.max(1))),
        }
    }

    pub fn with_tokio(settings: &CephSettings) -> Self {
        Self::new(settings, Arc::new(TokioProcessRunner))
    }

    /// Runs `command`. Any non-zero exit is classified; no retries are made.
    pub async fn execute(&self, command: CephCommand) -> CephResult<CommandResult> {
        let timeout = command.timeout.unwrap_or(self.default_timeout);
        let want_json = command.json;
        let argv = command.into_argv();
        let line = command_line(&argv);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CephError::ClusterUnavailable {
                message: "command executor is shut down".to_string(),
            })?;

        info!(command = %line, "executing ceph command");
        let output = match self.runner.run(&self.binary, &argv, timeout).await {
            Ok(output) => output,
            Err(RunnerError::Spawn { program, source }) => {
                return Err(CephError::ClusterUnavailable {
                    message: format!("could not start {}: {}", program, source),
                });
            }
            Err(RunnerError::TimedOut(_)) => {
                return Err(CephError::Timeout {
                    command: line,
                    timeout,
                });
            }
            Err(RunnerError::Io(e)) => {
                return Err(CephError::CommandFailed {
                    command: line,
                    exit_code: -1,
                    stderr: e.to_string(),
                    stdout: String::new(),
                });
            }
        };
        debug!(
            command = %line,
            exit_code = output.exit_code,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "ceph command finished"
        );

        if output.exit_code != 0 {
            return Err(classify(
                output.exit_code,
                &output.stderr,
                &output.stdout,
                &argv,
            ));
        }

        let json = if want_json {
            Some(parse_structured(&line, &output.stdout)?)
        } else {
            None
        };

        Ok(CommandResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            json,
        })
    }

    /// Runs a structured-output command and returns the parsed payload.
    pub async fn json<I, S>(&self, args: I) -> CephResult<Value>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let result = self.execute(CephCommand::new(args).json()).await?;
        Ok(result.json.unwrap_or_else(empty_payload))
    }

    /// Runs a text-output command and returns its stdout.
    pub async fn text<I, S>(&self, args: I) -> CephResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let result = self.execute(CephCommand::new(args)).await?;
        Ok(result.stdout)
    }
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

fn parse_structured(command: &str, stdout: &str) -> CephResult<Value> {
    if stdout.trim().is_empty() {
        return Ok(empty_payload());
    }
    serde_json::from_str(stdout).map_err(|e| CephError::InvalidResponse {
        command: command.to_string(),
        output: stdout.to_string(),
        reason: e.to_string(),
    })
}
