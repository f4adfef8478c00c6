//! The worker contract: one execution environment and its filesystem.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::command::{Command, CommandLine, CommandOutput, OutputStream, WaitOptions};
use crate::platform::Platform;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Metadata returned by `Worker::stat_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits (`0o755` style).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    /// Create or append.
    Append,
}

/// An open file on a worker.
#[async_trait]
pub trait WorkerFile: Send + Sync {
    /// Read up to `max` bytes. Empty at end of file.
    async fn read(&mut self, max: usize) -> Result<Bytes>;

    async fn write(&mut self, data: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        loop {
            let chunk = self.read(64 * 1024).await?;
            if chunk.is_empty() {
                return Ok(buffer.freeze());
            }
            buffer.extend_from_slice(&chunk);
        }
    }
}

/// One execution environment: a local machine, an SSH host or a remote agent.
///
/// A worker owns a current directory and an environment map. Every path
/// argument is resolved against those, never against the calling process.
/// Workers are driven by one logical caller; no concurrent-writer guarantees
/// are made for `cwd` or the environment.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Host identifier used in logs.
    fn host(&self) -> &str;

    /// Spawn a command with the minimum environment applied.
    async fn execute(
        &self,
        command: CommandLine,
        environment: Option<HashMap<String, String>>,
    ) -> Result<Arc<dyn Command>>;

    async fn cwd(&self) -> Result<String>;

    async fn change_directory(&self, path: &str) -> Result<()>;

    async fn environment(&self) -> Result<HashMap<String, String>>;

    async fn set_environment_variable(&self, key: &str, value: &str) -> Result<()>;

    async fn unset_environment_variable(&self, key: &str) -> Result<()>;

    /// Entry names in a directory, sorted.
    async fn list_directory(&self, path: &str) -> Result<Vec<String>>;

    /// Copy a worker file to the local filesystem.
    async fn get_file(&self, remote: &str, local: &Path) -> Result<()>;

    /// Copy a local file onto the worker.
    async fn put_file(&self, local: &Path, remote: &str) -> Result<()>;

    async fn change_file_mode(&self, path: &str, mode: u32) -> Result<()>;

    async fn change_file_owner(&self, path: &str, uid: u32) -> Result<()>;

    async fn change_file_group(&self, path: &str, gid: u32) -> Result<()>;

    async fn stat_file(&self, path: &str, follow_symlinks: bool) -> Result<FileStat>;

    async fn is_directory(&self, path: &str) -> Result<bool> {
        kind_matches(self.stat_file(path, true).await, FileKind::Directory)
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        kind_matches(self.stat_file(path, true).await, FileKind::File)
    }

    async fn is_symlink(&self, path: &str) -> Result<bool> {
        kind_matches(self.stat_file(path, false).await, FileKind::Symlink)
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<Box<dyn WorkerFile>>;

    async fn create_directory(&self, path: &str, parents: bool) -> Result<()>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    async fn remove_directory(&self, path: &str, recursive: bool) -> Result<()>;

    /// Create `link` pointing at `target`.
    async fn create_symlink(&self, target: &str, link: &str) -> Result<()>;

    async fn platform(&self) -> Result<Platform>;

    async fn hostname(&self) -> Result<String>;

    async fn home(&self) -> Result<String>;

    fn closed(&self) -> bool;

    /// Release backend resources. A second call fails with `AlreadyClosed`.
    async fn close(&self) -> Result<()>;

    /// Execute a command, wait for it and collect its output.
    ///
    /// A command still running when the wait ends is cancelled and reported
    /// as a `Timeout`.
    async fn run(&self, command: CommandLine, options: WaitOptions) -> Result<CommandOutput> {
        let description = command.to_string();
        let cmd = self.execute(command, None).await?;
        let finished = cmd.wait(options).await?;
        if !finished {
            let _ = cmd.cancel().await;
            return Err(Error::Timeout(format!("'{}' did not finish", description)));
        }
        Ok(CommandOutput {
            exit_status: cmd.exit_status().await?,
            stdout: cmd.take_output(OutputStream::Stdout).await?,
            stderr: cmd.take_output(OutputStream::Stderr).await?,
        })
    }
}

fn kind_matches(stat: Result<FileStat>, kind: FileKind) -> Result<bool> {
    match stat {
        Ok(stat) => Ok(stat.kind == kind),
        Err(Error::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
