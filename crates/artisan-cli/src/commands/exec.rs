//! One-off command execution with live output.

use anyhow::{Context, Result};
use artisan_config::load_project;
use artisan_core::{Command, CommandLine, OutputStream, WaitOptions, Worker};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::workers;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run `args` on a worker, echoing its output as it arrives.
///
/// A single argument is handed to the worker's shell; several run as argv.
/// Returns the command's exit status.
pub async fn exec(
    config_path: &str,
    worker_name: Option<&str>,
    timeout: Option<u64>,
    args: Vec<String>,
) -> Result<i32> {
    let worker = open_worker(config_path, worker_name).await?;
    let line = command_line(args);
    debug!(command = ?line, "Executing");

    let cmd = worker.execute(line, None).await?;
    let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs(secs));

    let status = loop {
        let out = cmd.read(OutputStream::Stdout, None, Some(POLL_INTERVAL)).await?;
        echo(&out, &cmd.take_output(OutputStream::Stderr).await?)?;

        if cmd.wait(WaitOptions::new().timeout(Duration::ZERO)).await? {
            flush_rest(&cmd).await?;
            break cmd.exit_status().await?.unwrap_or(1);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            cmd.cancel().await?;
            flush_rest(&cmd).await?;
            worker.close().await?;
            anyhow::bail!("Command timed out after {}s", timeout.unwrap_or_default());
        }
    };

    worker.close().await?;
    Ok(status)
}

fn echo(stdout: &[u8], stderr: &[u8]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(stdout)?;
    out.flush()?;
    let mut err = std::io::stderr().lock();
    err.write_all(stderr)?;
    err.flush()?;
    Ok(())
}

async fn flush_rest(cmd: &Arc<dyn Command>) -> Result<()> {
    let stdout = cmd.take_output(OutputStream::Stdout).await?;
    let stderr = cmd.take_output(OutputStream::Stderr).await?;
    echo(&stdout, &stderr)
}

async fn open_worker(config_path: &str, worker_name: Option<&str>) -> Result<Arc<dyn Worker>> {
    let Some(name) = worker_name else {
        return Ok(Arc::new(artisan_worker::LocalWorker::new()?));
    };
    if !Path::new(config_path).exists() {
        anyhow::bail!("Worker '{}' requested but {} does not exist", name, config_path);
    }
    let project = load_project(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path))?;
    let entry = project.worker(name)?;
    Ok(workers::connect(entry).await?)
}

pub fn command_line(mut args: Vec<String>) -> CommandLine {
    if args.len() == 1 {
        CommandLine::shell(args.remove(0))
    } else {
        CommandLine::argv(args)
    }
}

/// Map a command status onto a process exit code. Deaths by signal are
/// reported as negative statuses and become `128 + signal`.
pub fn process_exit_code(status: i32) -> i32 {
    if status < 0 { 128 - status } else { status }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_argument_uses_shell() {
        let line = command_line(vec!["echo hi | wc -c".to_string()]);
        assert!(line.is_shell());
    }

    #[test]
    fn test_several_arguments_use_argv() {
        let line = command_line(vec!["ls".to_string(), "-la".to_string()]);
        assert!(!line.is_shell());
    }

    #[test]
    fn test_process_exit_code() {
        assert_eq!(process_exit_code(0), 0);
        assert_eq!(process_exit_code(3), 3);
        assert_eq!(process_exit_code(-15), 143);
    }

    #[tokio::test]
    async fn test_exec_local_returns_status() {
        let status = exec(
            "does-not-exist.kdl",
            None,
            Some(10),
            vec!["exit 7".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(status, 7);
    }
}
