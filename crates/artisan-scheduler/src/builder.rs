//! Builder - drives a job through its lifecycle on a worker.

use artisan_core::command::{CommandLine, WaitOptions};
use artisan_core::path::{join, shell_quote};
use artisan_core::{BuildSource, BuildTrigger, Error, Job, ResourceId, Result, Worker};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle step a build failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    #[display("setup")]
    Setup,
    #[display("install")]
    Install,
    #[display("script")]
    Script,
    #[display("after_success")]
    AfterSuccess,
    #[display("after_failure")]
    AfterFailure,
}

/// Outcome of one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub build_id: ResourceId,
    pub job: String,
    pub worker: String,
    pub success: bool,
    pub failed_step: Option<BuildStep>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BuildResult {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Variables every build exports onto its worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    pub fn new(trigger: BuildTrigger, source: &BuildSource, build_dir: &str) -> Self {
        let mut vars = BTreeMap::new();
        for flag in ["ARTISAN", "CI", "CONTINUOUS_INTEGRATION"] {
            vars.insert(flag.to_string(), "true".to_string());
        }
        vars.insert("ARTISAN_BUILD_TRIGGER".to_string(), trigger.to_string());
        vars.insert(
            "ARTISAN_VERSION".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        vars.insert("ARTISAN_BUILD_DIR".to_string(), build_dir.to_string());
        vars.insert(
            "ARTISAN_BUILD_TYPE".to_string(),
            source.build_type().to_string(),
        );

        let vcs = match source {
            BuildSource::Local { .. } => None,
            BuildSource::Git {
                url,
                branch,
                commit,
            } => Some(("GIT", url, branch, commit)),
            BuildSource::Mercurial {
                url,
                branch,
                commit,
            } => Some(("MERCURIAL", url, branch, commit)),
        };
        if let Some((prefix, url, branch, commit)) = vcs {
            vars.insert(format!("ARTISAN_{}_URL", prefix), url.clone());
            if let Some(branch) = branch {
                vars.insert(format!("ARTISAN_{}_BRANCH", prefix), branch.clone());
            }
            if let Some(commit) = commit {
                vars.insert(format!("ARTISAN_{}_COMMIT", prefix), commit.clone());
            }
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuilderConfig {
    pub trigger: BuildTrigger,
    /// Parent of per-build checkout directories; `~/.artisan/builds` on the worker by default.
    pub build_root: Option<String>,
    pub keep_build_dir: bool,
    /// Limit for the builder's own commands (clone, checkout, mkdir).
    pub step_timeout: Option<Duration>,
}

/// What setup changed on the worker, so cleanup can undo it.
#[derive(Debug, Default)]
struct Workspace {
    previous_cwd: Option<String>,
    previous_env: Vec<(String, Option<String>)>,
    created_dir: Option<String>,
}

/// Runs jobs against workers.
pub struct Builder {
    config: BuilderConfig,
}

impl Builder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Run `job` on `worker` from setup through cleanup.
    ///
    /// Cleanup always runs. Its failures are logged and never replace the
    /// job's own result.
    pub async fn run(&self, job: &dyn Job, worker: &dyn Worker) -> BuildResult {
        let build_id = ResourceId::new();
        let started_at = Utc::now();
        info!(build_id = %build_id, job = job.name(), worker = worker.host(), "Build started");

        let mut workspace = Workspace::default();
        let outcome = self.drive(job, worker, &build_id, &mut workspace).await;
        if let Err(e) = self.cleanup(worker, &workspace).await {
            warn!(build_id = %build_id, error = %e, "Cleanup failed");
        }

        let (success, failed_step, error) = match outcome {
            Ok(()) => {
                info!(build_id = %build_id, job = job.name(), "Build succeeded");
                (true, None, None)
            }
            Err((step, e)) => {
                error!(build_id = %build_id, job = job.name(), step = %step, error = %e, "Build failed");
                (false, Some(step), Some(e.to_string()))
            }
        };

        BuildResult {
            build_id,
            job: job.name().to_string(),
            worker: worker.host().to_string(),
            success,
            failed_step,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn drive(
        &self,
        job: &dyn Job,
        worker: &dyn Worker,
        build_id: &ResourceId,
        workspace: &mut Workspace,
    ) -> std::result::Result<(), (BuildStep, Error)> {
        self.setup(job, worker, build_id, workspace)
            .await
            .map_err(|e| (BuildStep::Setup, e))?;

        let main = match job.install(worker).await {
            Ok(()) => job
                .script(worker)
                .await
                .map_err(|e| (BuildStep::Script, e)),
            Err(e) => Err((BuildStep::Install, e)),
        };

        match main {
            Ok(()) => job
                .after_success(worker)
                .await
                .map_err(|e| (BuildStep::AfterSuccess, e)),
            Err(failure) => {
                if let Err(e) = job.after_failure(worker).await {
                    warn!(job = job.name(), error = %e, "after_failure failed");
                }
                Err(failure)
            }
        }
    }

    async fn setup(
        &self,
        job: &dyn Job,
        worker: &dyn Worker,
        build_id: &ResourceId,
        workspace: &mut Workspace,
    ) -> Result<()> {
        workspace.previous_cwd = Some(worker.cwd().await?);
        let source = job.source();
        let platform = worker.platform().await?;

        match &source {
            BuildSource::Local { path } => worker.change_directory(path).await?,
            BuildSource::Git { .. } | BuildSource::Mercurial { .. } => {
                let root = match &self.config.build_root {
                    Some(root) => root.clone(),
                    None => join(
                        &join(&worker.home().await?, ".artisan", &platform),
                        "builds",
                        &platform,
                    ),
                };
                let dir = join(&root, &build_id.to_string(), &platform);
                self.create_build_dir(worker, &dir).await?;
                workspace.created_dir = Some(dir.clone());
                worker.change_directory(&dir).await?;
            }
        }

        let build_dir = worker.cwd().await?;
        debug!(build_id = %build_id, build_dir = %build_dir, "Build directory ready");

        let current = worker.environment().await?;
        let environment = BuildEnvironment::new(self.config.trigger, &source, &build_dir);
        let exports = environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(job.environment());
        for (key, value) in exports {
            if !workspace.previous_env.iter().any(|(k, _)| *k == key) {
                workspace
                    .previous_env
                    .push((key.clone(), current.get(&key).cloned()));
            }
            worker.set_environment_variable(&key, &value).await?;
        }

        self.fetch_sources(worker, &source).await
    }

    async fn fetch_sources(&self, worker: &dyn Worker, source: &BuildSource) -> Result<()> {
        match source {
            BuildSource::Local { .. } => Ok(()),
            BuildSource::Git {
                url,
                branch,
                commit,
            } => {
                let mut clone = vec!["git".to_string(), "clone".to_string()];
                if let Some(branch) = branch {
                    clone.extend(["--branch".to_string(), branch.clone()]);
                }
                clone.extend([url.clone(), ".".to_string()]);
                self.run_command(worker, CommandLine::Argv(clone)).await?;
                if let Some(commit) = commit {
                    self.run_command(worker, CommandLine::argv(["git", "checkout", commit.as_str()]))
                        .await?;
                }
                Ok(())
            }
            BuildSource::Mercurial {
                url,
                branch,
                commit,
            } => {
                let mut clone = vec!["hg".to_string(), "clone".to_string()];
                if let Some(branch) = branch {
                    clone.extend(["--branch".to_string(), branch.clone()]);
                }
                clone.extend([url.clone(), ".".to_string()]);
                self.run_command(worker, CommandLine::Argv(clone)).await?;
                if let Some(commit) = commit {
                    self.run_command(worker, CommandLine::argv(["hg", "update", "-r", commit.as_str()]))
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn create_build_dir(&self, worker: &dyn Worker, dir: &str) -> Result<()> {
        match worker.create_directory(dir, true).await {
            Err(Error::Unsupported(_)) => {
                let platform = worker.platform().await?;
                let line = if platform.is_windows() {
                    format!("mkdir {}", shell_quote(dir, &platform))
                } else {
                    format!("mkdir -p {}", shell_quote(dir, &platform))
                };
                self.run_command(worker, CommandLine::shell(line)).await
            }
            other => other,
        }
    }

    async fn remove_build_dir(&self, worker: &dyn Worker, dir: &str) -> Result<()> {
        match worker.remove_directory(dir, true).await {
            Err(Error::Unsupported(_)) => {
                let platform = worker.platform().await?;
                let line = if platform.is_windows() {
                    format!("rmdir /s /q {}", shell_quote(dir, &platform))
                } else {
                    format!("rm -rf {}", shell_quote(dir, &platform))
                };
                self.run_command(worker, CommandLine::shell(line)).await
            }
            other => other,
        }
    }

    async fn run_command(&self, worker: &dyn Worker, command: CommandLine) -> Result<()> {
        let mut options = WaitOptions::new().error_on_exit();
        if let Some(timeout) = self.config.step_timeout {
            options = options.timeout(timeout);
        }
        debug!(worker = worker.host(), command = %command, "Running build command");
        let output = worker.run(command, options).await?;
        if !output.stderr.is_empty() {
            debug!(worker = worker.host(), stderr = %output.stderr_lossy().trim_end(), "Build command stderr");
        }
        Ok(())
    }

    /// Undo setup: restore cwd and environment, then remove the build directory.
    async fn cleanup(&self, worker: &dyn Worker, workspace: &Workspace) -> Result<()> {
        let mut first_error = None;

        if let Some(cwd) = &workspace.previous_cwd {
            if let Err(e) = worker.change_directory(cwd).await {
                warn!(cwd = %cwd, error = %e, "Could not restore working directory");
                first_error.get_or_insert(e);
            }
        }

        for (key, previous) in &workspace.previous_env {
            let restored = match previous {
                Some(value) => worker.set_environment_variable(key, value).await,
                None => worker.unset_environment_variable(key).await,
            };
            if let Err(e) = restored {
                first_error.get_or_insert(e);
            }
        }

        if let Some(dir) = &workspace.created_dir {
            if self.config.keep_build_dir {
                info!(build_dir = %dir, "Keeping build directory");
            } else if let Err(e) = self.remove_build_dir(worker, dir).await {
                warn!(build_dir = %dir, error = %e, "Could not remove build directory");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
