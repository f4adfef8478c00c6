//! CLI command implementations.

pub mod exec;
pub mod run;

use anyhow::{Context, Result};
use artisan_agent::RemoteWorkerAgent;
use artisan_config::load_project;
use artisan_core::protocol::DEFAULT_AGENT_PORT;
use std::path::Path;

pub fn validate(path: &str) -> Result<()> {
    match load_project(path) {
        Ok(project) => {
            println!(
                "Configuration is valid: project '{}', {} worker(s), {} job(s)",
                project.name,
                project.workers.len(),
                project.jobs.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Serve the local machine until Ctrl-C.
///
/// The listen address comes from the flag, then the project's `agent` node
/// when a config file exists, then the default port on all interfaces.
pub async fn agent(config_path: &str, listen: Option<String>) -> Result<()> {
    let configured = if Path::new(config_path).exists() {
        load_project(config_path)
            .with_context(|| format!("Failed to load config file: {}", config_path))?
            .agent
            .map(|a| a.listen)
    } else {
        None
    };
    let listen = listen
        .or(configured)
        .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_AGENT_PORT));

    let agent = RemoteWorkerAgent::bind(listen.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    println!("Agent listening on {}", agent.local_addr()?);

    agent
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
