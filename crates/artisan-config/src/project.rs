//! Project configuration parsing.

use crate::{ConfigError, ConfigResult};
use artisan_core::{BuildSource, ScriptJob};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Settings for `artisan agent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub listen: String,
}

/// Where builds check out their sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSettings {
    pub root: Option<String>,
    pub keep: bool,
    pub step_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    Local,
    Ssh {
        url: Url,
        identity: Option<String>,
        options: Vec<String>,
    },
    Remote {
        url: Url,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    pub kind: WorkerKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub name: String,
    pub agent: Option<AgentConfig>,
    pub builds: BuildSettings,
    pub workers: Vec<WorkerConfig>,
    pub jobs: Vec<ScriptJob>,
}

impl ProjectConfig {
    pub fn worker(&self, name: &str) -> ConfigResult<&WorkerConfig> {
        self.workers
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| ConfigError::InvalidReference(format!("unknown worker '{}'", name)))
    }

    pub fn job(&self, name: &str) -> ConfigResult<&ScriptJob> {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| ConfigError::InvalidReference(format!("unknown job '{}'", name)))
    }
}

/// Read and parse a project file.
pub fn load_project(path: impl AsRef<Path>) -> ConfigResult<ProjectConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_project(&text)
}

/// Parse a project configuration from KDL text.
pub fn parse_project(kdl: &str) -> ConfigResult<ProjectConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = None;
    let mut agent = None;
    let mut builds = BuildSettings::default();
    let mut workers = Vec::new();
    let mut jobs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                name = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?,
                );
            }
            "agent" => {
                let listen = get_string_prop(node, "listen").unwrap_or_else(|| {
                    format!("0.0.0.0:{}", artisan_core::protocol::DEFAULT_AGENT_PORT)
                });
                agent = Some(AgentConfig { listen });
            }
            "builds" => {
                builds = BuildSettings {
                    root: get_string_prop(node, "root"),
                    keep: get_bool_prop(node, "keep").unwrap_or(false),
                    step_timeout: get_seconds_prop(node, "step-timeout")?,
                };
            }
            "worker" => workers.push(parse_worker(node)?),
            "job" => jobs.push(parse_job(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let name = name.ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;

    let mut seen = HashSet::new();
    for worker in &workers {
        if !seen.insert(worker.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("worker '{}'", worker.name)));
        }
    }
    let mut seen = HashSet::new();
    for job in &jobs {
        if !seen.insert(job.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
    }

    Ok(ProjectConfig {
        name,
        agent,
        builds,
        workers,
        jobs,
    })
}

fn parse_url(value: &str, field: &str, scheme: &str) -> ConfigResult<Url> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })?;
    if url.scheme() != scheme {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a {}:// url, got {}", scheme, value),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("{} has no host", value),
        });
    }
    Ok(url)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;
    let kind = get_string_prop(node, "type").unwrap_or_else(|| "local".to_string());
    let field = format!("url of worker '{}'", name);

    let kind = match kind.as_str() {
        "local" => WorkerKind::Local,
        "ssh" => {
            let url = get_string_prop(node, "url")
                .ok_or_else(|| ConfigError::MissingField(field.clone()))?;
            let mut options = Vec::new();
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    if child.name().value() == "option" {
                        options.extend(get_all_string_args(child));
                    }
                }
            }
            WorkerKind::Ssh {
                url: parse_url(&url, &field, "ssh")?,
                identity: get_string_prop(node, "identity"),
                options,
            }
        }
        "remote" => {
            let url = get_string_prop(node, "url")
                .ok_or_else(|| ConfigError::MissingField(field.clone()))?;
            WorkerKind::Remote {
                url: parse_url(&url, &field, "tcp")?,
            }
        }
        other => {
            return Err(ConfigError::InvalidValue {
                field: format!("type of worker '{}'", name),
                message: format!("unknown worker type: {}", other),
            });
        }
    };

    Ok(WorkerConfig { name, kind })
}

fn parse_source(node: &KdlNode, job: &str) -> ConfigResult<BuildSource> {
    let kind = get_string_prop(node, "type").unwrap_or_else(|| "local".to_string());
    let url = || {
        get_string_prop(node, "url")
            .ok_or_else(|| ConfigError::MissingField(format!("source url of job '{}'", job)))
    };

    match kind.as_str() {
        "local" => Ok(BuildSource::Local {
            path: get_string_prop(node, "path").unwrap_or_else(|| ".".to_string()),
        }),
        "git" => Ok(BuildSource::Git {
            url: url()?,
            branch: get_string_prop(node, "branch"),
            commit: get_string_prop(node, "commit"),
        }),
        "hg" | "mercurial" => Ok(BuildSource::Mercurial {
            url: url()?,
            branch: get_string_prop(node, "branch"),
            commit: get_string_prop(node, "commit"),
        }),
        other => Err(ConfigError::InvalidValue {
            field: format!("source type of job '{}'", job),
            message: format!("unknown source type: {}", other),
        }),
    }
}

fn parse_job(node: &KdlNode) -> ConfigResult<ScriptJob> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let mut job = ScriptJob::new(name.clone());
    job.timeout = get_seconds_prop(node, "timeout")?;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "source" => job.source = parse_source(child, &name)?,
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            if let Some(val) = get_first_string_arg(gc) {
                                job.env.insert(key, val);
                            }
                        }
                    }
                }
                "install" => job.install.extend(get_all_string_args(child)),
                "script" => job.script.extend(get_all_string_args(child)),
                "after_success" | "after-success" => {
                    job.after_success.extend(get_all_string_args(child))
                }
                "after_failure" | "after-failure" => {
                    job.after_failure.extend(get_all_string_args(child))
                }
                _ => {}
            }
        }
    }

    if job.script.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "script for job '{}'",
            name
        )));
    }

    Ok(job)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_seconds_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|n| u64::try_from(n).ok())
        .map(|secs| Some(Duration::from_secs(secs)))
        .ok_or_else(|| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("expected a non-negative number of seconds, got {:?}", value),
        })
}
