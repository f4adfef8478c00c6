//! Jobs and their lifecycle hooks.
//!
//! A job is driven through `setup -> install -> script -> after_success |
//! after_failure -> cleanup`. Setup and cleanup belong to the builder; the
//! four middle hooks belong to the job and default to doing nothing, so a job
//! only implements the steps it needs.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::command::{CommandLine, OutputStream, WaitOptions};
use crate::deadline::Deadline;
use crate::worker::Worker;
use crate::{Error, Result};

/// Where a build's sources come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildSource {
    /// Build in an existing directory on the worker.
    #[display("local:{path}")]
    Local { path: String },
    #[display("git:{url}")]
    Git {
        url: String,
        branch: Option<String>,
        commit: Option<String>,
    },
    #[display("hg:{url}")]
    Mercurial {
        url: String,
        branch: Option<String>,
        commit: Option<String>,
    },
}

impl Default for BuildSource {
    fn default() -> Self {
        BuildSource::Local {
            path: ".".to_string(),
        }
    }
}

impl BuildSource {
    /// Value of `ARTISAN_BUILD_TYPE`.
    pub fn build_type(&self) -> &'static str {
        match self {
            BuildSource::Local { .. } => "local",
            BuildSource::Git { .. } => "git",
            BuildSource::Mercurial { .. } => "mercurial",
        }
    }
}

/// What started a build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BuildTrigger {
    #[default]
    #[display("manual")]
    Manual,
    #[display("push")]
    Push,
    #[display("pull_request")]
    PullRequest,
    #[display("schedule")]
    Schedule,
    #[display("api")]
    Api,
}

impl std::str::FromStr for BuildTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(BuildTrigger::Manual),
            "push" => Ok(BuildTrigger::Push),
            "pull_request" => Ok(BuildTrigger::PullRequest),
            "schedule" => Ok(BuildTrigger::Schedule),
            "api" => Ok(BuildTrigger::Api),
            other => Err(Error::InvalidInput(format!("unknown build trigger: {}", other))),
        }
    }
}

/// A named script run against a worker.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn source(&self) -> BuildSource {
        BuildSource::default()
    }

    /// Variables exported onto the worker before `install`.
    fn environment(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn install(&self, _worker: &dyn Worker) -> Result<()> {
        Ok(())
    }

    async fn script(&self, _worker: &dyn Worker) -> Result<()> {
        Ok(())
    }

    async fn after_success(&self, _worker: &dyn Worker) -> Result<()> {
        Ok(())
    }

    async fn after_failure(&self, _worker: &dyn Worker) -> Result<()> {
        Ok(())
    }
}

/// A job whose hooks are lists of shell commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptJob {
    pub name: String,
    pub source: BuildSource,
    pub env: HashMap<String, String>,
    pub install: Vec<String>,
    pub script: Vec<String>,
    pub after_success: Vec<String>,
    pub after_failure: Vec<String>,
    /// Per-command limit; `None` lets commands run indefinitely.
    pub timeout: Option<Duration>,
}

/// How often a running step's output is flushed to the log.
const OUTPUT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

impl ScriptJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: BuildSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_install(mut self, command: impl Into<String>) -> Self {
        self.install.push(command.into());
        self
    }

    pub fn with_script(mut self, command: impl Into<String>) -> Self {
        self.script.push(command.into());
        self
    }

    pub fn with_after_success(mut self, command: impl Into<String>) -> Self {
        self.after_success.push(command.into());
        self
    }

    pub fn with_after_failure(mut self, command: impl Into<String>) -> Self {
        self.after_failure.push(command.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run_steps(&self, step: &str, worker: &dyn Worker, commands: &[String]) -> Result<()> {
        for line in commands {
            info!(job = %self.name, step, command = %line, "Running command");
            self.run_one(worker, line).await?;
        }
        Ok(())
    }

    /// Run one command, logging output while it runs.
    async fn run_one(&self, worker: &dyn Worker, line: &str) -> Result<()> {
        let cmd = worker.execute(CommandLine::shell(line), None).await?;
        let deadline = Deadline::after(self.timeout);

        loop {
            let slice = deadline.slice(OUTPUT_FLUSH_INTERVAL);
            let finished = cmd.wait(WaitOptions::new().timeout(slice)).await?;

            for stream in [OutputStream::Stdout, OutputStream::Stderr] {
                let data = cmd.take_output(stream).await?;
                for text in String::from_utf8_lossy(&data).lines() {
                    info!(target: "artisan::output", job = %self.name, %stream, "{}", text);
                }
            }

            if finished {
                break;
            }
            if deadline.is_expired() {
                let _ = cmd.cancel().await;
                return Err(Error::Timeout(format!(
                    "'{}' still running after {:?}",
                    line,
                    self.timeout.unwrap_or_default()
                )));
            }
        }

        match cmd.exit_status().await? {
            Some(0) => Ok(()),
            Some(status) => {
                debug!(job = %self.name, command = %line, status, "Command failed");
                Err(Error::NonZeroExit { status })
            }
            None => Err(Error::Internal(format!("'{}' finished without a status", line))),
        }
    }
}

#[async_trait]
impl Job for ScriptJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> BuildSource {
        self.source.clone()
    }

    fn environment(&self) -> HashMap<String, String> {
        self.env.clone()
    }

    async fn install(&self, worker: &dyn Worker) -> Result<()> {
        self.run_steps("install", worker, &self.install).await
    }

    async fn script(&self, worker: &dyn Worker) -> Result<()> {
        self.run_steps("script", worker, &self.script).await
    }

    async fn after_success(&self, worker: &dyn Worker) -> Result<()> {
        self.run_steps("after_success", worker, &self.after_success)
            .await
    }

    async fn after_failure(&self, worker: &dyn Worker) -> Result<()> {
        self.run_steps("after_failure", worker, &self.after_failure)
            .await
    }
}
