//! Scripted process runner for unit tests.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::CephSettings;
use crate::executor::{CephClient, ProcessOutput, ProcessRunner, RunnerError};

#[derive(Clone)]
enum Reply {
    Output(ProcessOutput),
    Hang,
    MissingBinary,
}

struct Rule {
    prefix: Vec<String>,
    reply: Reply,
}

/// Answers commands by argument prefix and records every argument vector.
///
/// Later rules take precedence over earlier ones; unmatched commands exit 0
/// with empty output.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> CephClient {
        CephClient::new(&CephSettings::default(), Arc::new(self.clone()))
    }

    fn push(&self, prefix: &str, reply: Reply) {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.split_whitespace().map(String::from).collect(),
            reply,
        });
    }

    pub fn ok(&self, prefix: &str, stdout: &str) {
        self.push(
            prefix,
            Reply::Output(ProcessOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        );
    }

    pub fn ok_json(&self, prefix: &str, value: Value) {
        self.ok(prefix, &value.to_string());
    }

    pub fn fail(&self, prefix: &str, exit_code: i32, stderr: &str) {
        self.push(
            prefix,
            Reply::Output(ProcessOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        );
    }

    pub fn hang(&self, prefix: &str) {
        self.push(prefix, Reply::Hang);
    }

    pub fn missing_binary(&self, prefix: &str) {
        self.push(prefix, Reply::MissingBinary);
    }

    /// Every command issued so far, space-joined.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Issued commands that change cluster state.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.ends_with("--format json") || c.starts_with("auth get-or-create"))
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError> {
        self.calls.lock().unwrap().push(args.join(" "));
        let reply = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| args.starts_with(&r.prefix))
            .map(|r| r.reply.clone());
        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Hang) => Err(RunnerError::TimedOut(timeout)),
            Some(Reply::MissingBinary) => Err(RunnerError::Spawn {
                program: program.display().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            None => Ok(ProcessOutput::default()),
        }
    }
}
