//! Worker backed by the machine the controller runs on.

use artisan_core::command::{Command, CommandLine, minimum_environment};
use artisan_core::path::{expand_user, expand_vars, resolve};
use artisan_core::worker::{FileKind, FileStat, OpenMode, Worker, WorkerFile};
use artisan_core::{Error, Platform, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::process::{ChildProcess, ProcessBackend, ProcessCommand};

#[derive(Debug, Clone)]
struct Context {
    cwd: String,
    env: HashMap<String, String>,
}

/// Runs commands as child processes of the current process.
///
/// The worker starts with the process's directory and environment but keeps
/// its own copies: changing either never touches the controller process.
pub struct LocalWorker {
    host: String,
    platform: Platform,
    context: RwLock<Context>,
    closed: AtomicBool,
}

impl LocalWorker {
    pub fn new() -> Result<Self> {
        let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
        Ok(Self::with_context(cwd, std::env::vars().collect()))
    }

    /// Start in `directory` instead of the process's current directory.
    pub fn with_directory(directory: impl Into<String>) -> Result<Self> {
        let worker = Self::new()?;
        worker.write_context().cwd = directory.into();
        Ok(worker)
    }

    fn with_context(cwd: String, env: HashMap<String, String>) -> Self {
        Self {
            host: local_hostname(),
            platform: Platform::current(),
            context: RwLock::new(Context { cwd, env }),
            closed: AtomicBool::new(false),
        }
    }

    fn read_context(&self) -> std::sync::RwLockReadGuard<'_, Context> {
        self.context.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_context(&self) -> std::sync::RwLockWriteGuard<'_, Context> {
        self.context.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed(format!("worker {} is closed", self.host)));
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> String {
        let context = self.read_context();
        resolve(&context.cwd, path, &context.env, &self.platform)
    }

    fn build_process(
        &self,
        command: &CommandLine,
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> Result<tokio::process::Command> {
        let mut process = match command {
            CommandLine::Shell(line) if self.platform.is_windows() => {
                let mut p = tokio::process::Command::new("cmd");
                p.arg("/C").arg(line);
                p
            }
            CommandLine::Shell(line) => {
                let mut p = tokio::process::Command::new("/bin/sh");
                p.arg("-c").arg(line);
                p
            }
            CommandLine::Argv(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| Error::InvalidInput("empty argument vector".to_string()))?;
                // Bare names are left for PATH lookup.
                let program = if program.contains(['/', '\\']) {
                    resolve(cwd, program, env, &self.platform)
                } else {
                    program.clone()
                };
                let mut p = tokio::process::Command::new(program);
                p.args(args);
                p
            }
        };
        process.current_dir(cwd).env_clear().envs(env);
        Ok(process)
    }
}

fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Some(name) = name.to_str() {
                return name.to_string();
            }
        }
    }
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn fs_error(path: &str, err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
        _ => Error::Io(err),
    }
}

fn file_stat(metadata: &std::fs::Metadata) -> FileStat {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileStat {
            kind,
            size: metadata.len(),
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            modified,
        }
    }
    #[cfg(not(unix))]
    {
        let mode = if metadata.permissions().readonly() {
            0o444
        } else {
            0o644
        };
        FileStat {
            kind,
            size: metadata.len(),
            mode,
            uid: 0,
            gid: 0,
            modified,
        }
    }
}

#[cfg(unix)]
fn chown(path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    std::os::unix::fs::chown(path, uid, gid).map_err(|e| fs_error(path, e))
}

#[cfg(not(unix))]
fn chown(_path: &str, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
    Err(Error::Unsupported(
        "file ownership is not supported on this platform".to_string(),
    ))
}

#[async_trait]
impl Worker for LocalWorker {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(
        &self,
        command: CommandLine,
        environment: Option<HashMap<String, String>>,
    ) -> Result<Arc<dyn Command>> {
        self.ensure_open()?;
        if command.is_empty() {
            return Err(Error::InvalidInput("empty command".to_string()));
        }

        let context = self.read_context().clone();
        let env = minimum_environment(&context.env, &self.platform, environment);
        let process = self.build_process(&command, &context.cwd, &env)?;
        info!(host = %self.host, cwd = %context.cwd, command = %command, "Executing locally");

        let child = ChildProcess::spawn(process)?;
        Ok(Arc::new(ProcessCommand::new(
            command,
            env,
            ProcessBackend::Local,
            child,
        )))
    }

    async fn cwd(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.read_context().cwd.clone())
    }

    async fn change_directory(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let target = self.resolve(path);
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|e| fs_error(&target, e))?;
        if !metadata.is_dir() {
            return Err(Error::InvalidInput(format!("{} is not a directory", target)));
        }
        debug!(host = %self.host, cwd = %target, "Changed directory");
        self.write_context().cwd = target;
        Ok(())
    }

    async fn environment(&self) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        Ok(self.read_context().env.clone())
    }

    async fn set_environment_variable(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        self.write_context()
            .env
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn unset_environment_variable(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.write_context().env.remove(key);
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let target = self.resolve(path);
        let mut entries = tokio::fs::read_dir(&target)
            .await
            .map_err(|e| fs_error(&target, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<()> {
        self.ensure_open()?;
        let source = self.resolve(remote);
        tokio::fs::copy(&source, local)
            .await
            .map_err(|e| fs_error(&source, e))?;
        Ok(())
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        self.ensure_open()?;
        let target = self.resolve(remote);
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| fs_error(&local.to_string_lossy(), e))?;
        Ok(())
    }

    async fn change_file_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.ensure_open()?;
        let target = self.resolve(path);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| fs_error(&target, e))
        }
        #[cfg(not(unix))]
        {
            let _ = (target, mode);
            Err(Error::Unsupported(
                "file modes are not supported on this platform".to_string(),
            ))
        }
    }

    async fn change_file_owner(&self, path: &str, uid: u32) -> Result<()> {
        self.ensure_open()?;
        chown(&self.resolve(path), Some(uid), None)
    }

    async fn change_file_group(&self, path: &str, gid: u32) -> Result<()> {
        self.ensure_open()?;
        chown(&self.resolve(path), None, Some(gid))
    }

    async fn stat_file(&self, path: &str, follow_symlinks: bool) -> Result<FileStat> {
        self.ensure_open()?;
        let target = self.resolve(path);
        let metadata = if follow_symlinks {
            tokio::fs::metadata(&target).await
        } else {
            tokio::fs::symlink_metadata(&target).await
        };
        metadata
            .map(|m| file_stat(&m))
            .map_err(|e| fs_error(&target, e))
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<Box<dyn WorkerFile>> {
        self.ensure_open()?;
        let target = self.resolve(path);
        let mut options = tokio::fs::OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
        };
        let file = options
            .open(&target)
            .await
            .map_err(|e| fs_error(&target, e))?;
        Ok(Box::new(LocalFile {
            path: target,
            file: Some(file),
        }))
    }

    async fn create_directory(&self, path: &str, parents: bool) -> Result<()> {
        self.ensure_open()?;
        let target = self.resolve(path);
        let result = if parents {
            tokio::fs::create_dir_all(&target).await
        } else {
            tokio::fs::create_dir(&target).await
        };
        result.map_err(|e| fs_error(&target, e))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let target = self.resolve(path);
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| fs_error(&target, e))
    }

    async fn remove_directory(&self, path: &str, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let target = self.resolve(path);
        let result = if recursive {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_dir(&target).await
        };
        result.map_err(|e| fs_error(&target, e))
    }

    async fn create_symlink(&self, target: &str, link: &str) -> Result<()> {
        self.ensure_open()?;
        // The target is stored as written so relative links stay relative.
        let target = {
            let context = self.read_context();
            expand_vars(
                &expand_user(target, &context.env, &self.platform),
                &context.env,
                &self.platform,
            )
        };
        let link = self.resolve(link);
        #[cfg(unix)]
        {
            tokio::fs::symlink(&target, &link)
                .await
                .map_err(|e| fs_error(&link, e))
        }
        #[cfg(windows)]
        {
            tokio::fs::symlink_file(&target, &link)
                .await
                .map_err(|e| fs_error(&link, e))
        }
        #[cfg(not(any(unix, windows)))]
        {
            let _ = (target, link);
            Err(Error::Unsupported(
                "symlinks are not supported on this platform".to_string(),
            ))
        }
    }

    async fn platform(&self) -> Result<Platform> {
        Ok(self.platform.clone())
    }

    async fn hostname(&self) -> Result<String> {
        Ok(self.host.clone())
    }

    async fn home(&self) -> Result<String> {
        let key = if self.platform.is_windows() {
            "USERPROFILE"
        } else {
            "HOME"
        };
        self.read_context()
            .env
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::NotFound(format!("{} is not set", key)))
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed(format!("worker {} is closed", self.host)));
        }
        info!(host = %self.host, "Local worker closed");
        Ok(())
    }
}

/// Largest buffer a single `LocalFile::read` allocates.
const MAX_READ: usize = artisan_core::protocol::MAX_DATA_CHUNK;

/// An open file on the local filesystem.
pub struct LocalFile {
    path: String,
    file: Option<tokio::fs::File>,
}

impl LocalFile {
    fn handle(&mut self) -> Result<&mut tokio::fs::File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::AlreadyClosed(format!("{} is closed", self.path)))
    }
}

#[async_trait]
impl WorkerFile for LocalFile {
    async fn read(&mut self, max: usize) -> Result<Bytes> {
        let file = self.handle()?;
        let mut buffer = vec![0u8; max.min(MAX_READ)];
        let n = file.read(&mut buffer).await?;
        buffer.truncate(n);
        Ok(Bytes::from(buffer))
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.handle()?.write_all(&data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::AlreadyClosed(format!("{} is closed", self.path)))?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artisan_core::ResourceId;
    use artisan_core::command::{OutputStream, WaitOptions};
    use std::path::PathBuf;
    use std::time::Duration;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("artisan-test-{}", ResourceId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::canonicalize(dir).unwrap()
    }

    #[tokio::test]
    async fn test_run_echo() {
        let worker = LocalWorker::new().unwrap();
        let output = worker
            .run(CommandLine::shell("echo hello"), WaitOptions::new())
            .await
            .unwrap();
        assert_eq!(output.exit_status, Some(0));
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_argv_preserves_arguments() {
        let worker = LocalWorker::new().unwrap();
        let output = worker
            .run(CommandLine::argv(["printf", "%s", "a b"]), WaitOptions::new())
            .await
            .unwrap();
        assert_eq!(output.stdout_lossy(), "a b");
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let worker = LocalWorker::new().unwrap();
        let err = worker
            .execute(CommandLine::Argv(vec![]), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let worker = LocalWorker::new().unwrap();
        let cmd = worker.execute(CommandLine::shell("exit 3"), None).await.unwrap();
        assert!(cmd.wait(WaitOptions::new()).await.unwrap());
        assert_eq!(cmd.exit_status().await.unwrap(), Some(3));

        let cmd = worker.execute(CommandLine::shell("exit 3"), None).await.unwrap();
        let err = cmd.wait(WaitOptions::new().error_on_exit()).await.unwrap_err();
        assert!(matches!(err, Error::NonZeroExit { status: 3 }));
    }

    #[tokio::test]
    async fn test_wait_timeout_then_cancel() {
        let worker = LocalWorker::new().unwrap();
        let cmd = worker.execute(CommandLine::shell("sleep 5"), None).await.unwrap();

        let finished = cmd
            .wait(WaitOptions::new().timeout(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(!finished);
        assert_eq!(cmd.exit_status().await.unwrap(), None);

        let err = cmd
            .wait(
                WaitOptions::new()
                    .timeout(Duration::from_millis(50))
                    .error_on_timeout(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        cmd.cancel().await.unwrap();
        assert!(cmd.cancelled().await.unwrap());
        assert!(cmd.wait(WaitOptions::new()).await.unwrap());
        assert!(matches!(cmd.cancel().await, Err(Error::AlreadyClosed(_))));
        assert!(matches!(
            cmd.write_stdin(Bytes::from_static(b"x")).await,
            Err(Error::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_short_timeout_then_completion() {
        let worker = LocalWorker::new().unwrap();
        let cmd = worker.execute(CommandLine::shell("sleep 1"), None).await.unwrap();

        let early = cmd
            .wait(WaitOptions::new().timeout(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(!early);

        let finished = cmd
            .wait(WaitOptions::new().timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(finished);
        assert_eq!(cmd.exit_status().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_commands_run_in_parallel() {
        let worker = LocalWorker::new().unwrap();
        let started = std::time::Instant::now();

        let mut commands = Vec::new();
        for _ in 0..3 {
            commands.push(worker.execute(CommandLine::shell("sleep 1"), None).await.unwrap());
        }
        for cmd in &commands {
            assert!(cmd.wait(WaitOptions::new().timeout(Duration::from_secs(5))).await.unwrap());
            assert_eq!(cmd.exit_status().await.unwrap(), Some(0));
        }

        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_cancel_keeps_output_produced_before() {
        let worker = LocalWorker::new().unwrap();
        let cmd = worker
            .execute(CommandLine::shell("echo before; sleep 5; echo after"), None)
            .await
            .unwrap();

        let first = cmd
            .read(OutputStream::Stdout, Some(7), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(&first[..], b"before\n");

        cmd.cancel().await.unwrap();
        assert!(cmd.wait(WaitOptions::new().timeout(Duration::from_secs(2))).await.unwrap());
        assert_eq!(cmd.exit_status().await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cmd.wait(WaitOptions::new()).await.unwrap());
        assert_eq!(cmd.exit_status().await.unwrap(), None);
        let rest = cmd
            .read(OutputStream::Stdout, None, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_output_reads_empty() {
        let worker = LocalWorker::new().unwrap();
        let cmd = worker
            .execute(CommandLine::shell("sleep 5; echo late"), None)
            .await
            .unwrap();
        cmd.cancel().await.unwrap();

        assert!(cmd.wait(WaitOptions::new()).await.unwrap());
        assert_eq!(cmd.exit_status().await.unwrap(), None);
        let out = cmd.read(OutputStream::Stdout, None, None).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let worker = LocalWorker::new().unwrap();
        let err = worker
            .run(
                CommandLine::shell("sleep 5"),
                WaitOptions::new().timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_stdin_round_trip() {
        let worker = LocalWorker::new().unwrap();
        let cmd = worker.execute(CommandLine::shell("cat"), None).await.unwrap();
        cmd.write_stdin(Bytes::from_static(b"abc")).await.unwrap();
        cmd.write_stdin(Bytes::from_static(b"def")).await.unwrap();
        cmd.close_stdin().await.unwrap();

        assert!(cmd.wait(WaitOptions::new().timeout(Duration::from_secs(5))).await.unwrap());
        let out = cmd.take_output(OutputStream::Stdout).await.unwrap();
        assert_eq!(&out[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_stderr_is_separate() {
        let worker = LocalWorker::new().unwrap();
        let output = worker
            .run(CommandLine::shell("echo out; echo err >&2"), WaitOptions::new())
            .await
            .unwrap();
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
    }

    #[tokio::test]
    async fn test_explicit_environment_replaces_worker_env() {
        let worker = LocalWorker::new().unwrap();
        worker.set_environment_variable("ARTISAN_ONLY_WORKER", "1").await.unwrap();

        let env = HashMap::from([("FOO".to_string(), "bar".to_string())]);
        let cmd = worker
            .execute(
                CommandLine::shell("echo \"$FOO:$ARTISAN_ONLY_WORKER\""),
                Some(env),
            )
            .await
            .unwrap();
        assert!(cmd.environment().contains_key("PATH"));
        assert!(!cmd.environment().contains_key("ARTISAN_ONLY_WORKER"));

        cmd.wait(WaitOptions::new()).await.unwrap();
        let out = cmd.take_output(OutputStream::Stdout).await.unwrap();
        assert_eq!(&out[..], b"bar:\n");
    }

    #[tokio::test]
    async fn test_worker_env_is_inherited() {
        let worker = LocalWorker::new().unwrap();
        worker.set_environment_variable("ARTISAN_GREETING", "hi").await.unwrap();
        let output = worker
            .run(CommandLine::shell("echo $ARTISAN_GREETING"), WaitOptions::new())
            .await
            .unwrap();
        assert_eq!(output.stdout_lossy(), "hi\n");

        worker.unset_environment_variable("ARTISAN_GREETING").await.unwrap();
        assert!(!worker.environment().await.unwrap().contains_key("ARTISAN_GREETING"));
    }

    #[tokio::test]
    async fn test_change_directory() {
        let dir = scratch_dir();
        let worker = LocalWorker::new().unwrap();
        worker.change_directory(&dir.to_string_lossy()).await.unwrap();
        worker.create_directory("nested", false).await.unwrap();
        worker.change_directory("nested").await.unwrap();

        let expected = dir.join("nested").to_string_lossy().into_owned();
        assert_eq!(worker.cwd().await.unwrap(), expected);

        let output = worker
            .run(CommandLine::shell("pwd -P"), WaitOptions::new())
            .await
            .unwrap();
        assert_eq!(output.stdout_lossy().trim(), expected);

        worker.change_directory("..").await.unwrap();
        assert_eq!(worker.cwd().await.unwrap(), dir.to_string_lossy());
        assert!(matches!(
            worker.change_directory("missing").await,
            Err(Error::NotFound(_))
        ));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_operations() {
        let dir = scratch_dir();
        let worker = LocalWorker::with_directory(dir.to_string_lossy()).unwrap();
        worker.set_environment_variable("SUB", "work").await.unwrap();

        worker.create_directory("$SUB/deep", true).await.unwrap();
        assert!(worker.is_directory("work/deep").await.unwrap());
        assert!(!worker.is_file("work/deep").await.unwrap());
        assert!(!worker.is_directory("work/none").await.unwrap());

        let mut file = worker
            .open_file("${SUB}/notes.txt", OpenMode::Write)
            .await
            .unwrap();
        file.write(Bytes::from_static(b"line one\n")).await.unwrap();
        file.close().await.unwrap();
        assert!(matches!(file.close().await, Err(Error::AlreadyClosed(_))));

        let mut file = worker.open_file("work/notes.txt", OpenMode::Append).await.unwrap();
        file.write(Bytes::from_static(b"line two\n")).await.unwrap();
        file.close().await.unwrap();

        let mut file = worker.open_file("work/notes.txt", OpenMode::Read).await.unwrap();
        assert_eq!(&file.read_to_end().await.unwrap()[..], b"line one\nline two\n");

        let stat = worker.stat_file("work/notes.txt", true).await.unwrap();
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 18);
        assert!(stat.modified.is_some());

        worker.create_symlink("notes.txt", "work/link").await.unwrap();
        assert!(worker.is_symlink("work/link").await.unwrap());
        assert!(worker.is_file("work/link").await.unwrap());

        assert_eq!(
            worker.list_directory("work").await.unwrap(),
            vec!["deep", "link", "notes.txt"]
        );

        worker.remove_file("work/link").await.unwrap();
        assert!(matches!(
            worker.remove_file("work/link").await,
            Err(Error::NotFound(_))
        ));
        worker.remove_directory("work", true).await.unwrap();
        assert!(worker.list_directory(".").await.unwrap().is_empty());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_change_file_mode() {
        let dir = scratch_dir();
        let worker = LocalWorker::with_directory(dir.to_string_lossy()).unwrap();
        let mut file = worker.open_file("run.sh", OpenMode::Write).await.unwrap();
        file.write(Bytes::from_static(b"#!/bin/sh\n")).await.unwrap();
        file.close().await.unwrap();

        worker.change_file_mode("run.sh", 0o750).await.unwrap();
        assert_eq!(worker.stat_file("run.sh", true).await.unwrap().mode, 0o750);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_get_and_put_file() {
        let dir = scratch_dir();
        let worker = LocalWorker::with_directory(dir.to_string_lossy()).unwrap();
        let local = dir.join("source.txt");
        std::fs::write(&local, b"payload").unwrap();

        worker.put_file(&local, "copy.txt").await.unwrap();
        let back = dir.join("back.txt");
        worker.get_file("copy.txt", &back).await.unwrap();
        assert_eq!(std::fs::read(back).unwrap(), b"payload");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_file_read_caps_buffer() {
        let dir = scratch_dir();
        let worker = LocalWorker::with_directory(dir.to_string_lossy()).unwrap();
        std::fs::write(dir.join("small.txt"), b"tiny").unwrap();

        let mut file = worker.open_file("small.txt", OpenMode::Read).await.unwrap();
        assert_eq!(&file.read(usize::MAX).await.unwrap()[..], b"tiny");
        assert!(file.read(usize::MAX).await.unwrap().is_empty());
        file.close().await.unwrap();

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_terminates_command() {
        let worker = LocalWorker::new().unwrap();
        let cmd = worker
            .execute(CommandLine::argv(["sleep", "5"]), None)
            .await
            .unwrap();
        assert!(cmd.pid().await.unwrap().is_some());
        assert!(!cmd.is_shell());

        cmd.signal(15).await.unwrap();
        assert!(cmd.wait(WaitOptions::new().timeout(Duration::from_secs(5))).await.unwrap());
        assert_eq!(cmd.exit_status().await.unwrap(), Some(-15));
        assert!(matches!(cmd.signal(15).await, Err(Error::AlreadyClosed(_))));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let worker = LocalWorker::new().unwrap();
        assert!(!worker.closed());
        worker.close().await.unwrap();
        assert!(worker.closed());
        assert!(matches!(worker.close().await, Err(Error::AlreadyClosed(_))));
        assert!(matches!(
            worker.execute(CommandLine::shell("true"), None).await,
            Err(Error::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_home_and_platform() {
        let worker = LocalWorker::new().unwrap();
        worker.set_environment_variable("HOME", "/home/ci").await.unwrap();
        if !Platform::current().is_windows() {
            assert_eq!(worker.home().await.unwrap(), "/home/ci");
        }
        assert_eq!(worker.platform().await.unwrap(), Platform::current());
        assert!(!worker.hostname().await.unwrap().is_empty());
    }
}
