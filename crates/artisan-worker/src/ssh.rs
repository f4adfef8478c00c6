//! Worker reached through the system `ssh` client.
//!
//! Each command runs in its own `ssh` process, so the local drain machinery
//! applies unchanged. The remote cwd and environment live on this side and are
//! applied by wrapping every command line before it is sent.

use artisan_core::command::{Command, CommandLine, minimum_environment};
use artisan_core::path::{resolve, shell_quote};
use artisan_core::worker::{FileStat, OpenMode, Worker, WorkerFile};
use artisan_core::{Error, Platform, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::process::{ChildProcess, ProcessBackend, ProcessCommand};

/// Exit status `ssh` itself uses for connection failures.
const SSH_CONNECTION_FAILED: i32 = 255;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How to reach an SSH host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`.
    pub options: Vec<String>,
    pub connect_timeout: Duration,
    /// Client binary, `ssh` unless overridden.
    pub program: String,
}

impl SshConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            options: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            program: "ssh".to_string(),
        }
    }

    /// Parse `ssh://[user@]host[:port]`.
    pub fn from_url(url: &Url) -> Result<Self> {
        if url.scheme() != "ssh" {
            return Err(Error::InvalidInput(format!(
                "expected an ssh:// url, got {}",
                url
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("{} has no host", url)))?;

        let mut config = Self::new(host);
        if !url.username().is_empty() {
            config.user = Some(url.username().to_string());
        }
        config.port = url.port();
        Ok(config)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<String>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    /// `user@host` or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Client arguments up to and including the destination.
    pub fn client_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(self.destination());
        args
    }

    fn client(&self, remote_command: &str) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(self.client_args()).arg(remote_command);
        command
    }

    /// Run a short probe and capture its output.
    async fn capture(&self, remote_command: &str) -> Result<(i32, String)> {
        let output = self
            .client(remote_command)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::WorkerUnavailable(format!("cannot start {}: {}", self.program, e))
            })?;
        let status = output.status.code().unwrap_or(SSH_CONNECTION_FAILED);
        if status == SSH_CONNECTION_FAILED {
            return Err(Error::WorkerUnavailable(format!(
                "ssh to {} failed: {}",
                self.destination(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok((status, String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

/// Parse `KEY=VALUE` lines as printed by `env` or `SET`.
fn parse_environment(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let (key, value) = line.split_once('=')?;
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Build the remote command line: change into `cwd`, then run `command`
/// under exactly `env`.
pub fn wrap_command(
    command: &CommandLine,
    cwd: &str,
    env: &HashMap<String, String>,
    platform: &Platform,
) -> String {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();

    if platform.is_windows() {
        let mut parts = vec![format!("cd /d {}", shell_quote(cwd, platform))];
        for key in keys {
            parts.push(format!("set \"{}={}\"", key, env[key]));
        }
        parts.push(match command {
            CommandLine::Shell(line) => line.clone(),
            CommandLine::Argv(argv) => argv
                .iter()
                .map(|a| shell_quote(a, platform))
                .collect::<Vec<_>>()
                .join(" "),
        });
        return parts.join(" && ");
    }

    let assignments: Vec<String> = keys
        .into_iter()
        .map(|k| shell_quote(&format!("{}={}", k, env[k]), platform))
        .collect();
    let program = match command {
        CommandLine::Shell(line) => format!("sh -c {}", shell_quote(line, platform)),
        CommandLine::Argv(argv) => argv
            .iter()
            .map(|a| shell_quote(a, platform))
            .collect::<Vec<_>>()
            .join(" "),
    };
    let mut wrapped = format!("cd {} && exec env -i", shell_quote(cwd, platform));
    for assignment in assignments {
        wrapped.push(' ');
        wrapped.push_str(&assignment);
    }
    wrapped.push(' ');
    wrapped.push_str(&program);
    wrapped
}

#[derive(Debug, Clone)]
struct Context {
    cwd: String,
    env: HashMap<String, String>,
}

/// A remote host driven over SSH.
pub struct SshWorker {
    config: SshConfig,
    context: RwLock<Context>,
    platform: OnceCell<Platform>,
    hostname: OnceCell<String>,
    closed: AtomicBool,
}

impl SshWorker {
    /// Probe the host and capture its login environment.
    pub async fn connect(config: SshConfig) -> Result<Self> {
        info!(destination = %config.destination(), "Connecting over ssh");

        let (status, output) = config.capture("env").await?;
        let env = if status == 0 && !output.trim().is_empty() {
            parse_environment(&output)
        } else {
            let (status, output) = config.capture("SET").await?;
            if status != 0 {
                return Err(Error::WorkerUnavailable(format!(
                    "cannot read the environment of {}",
                    config.destination()
                )));
            }
            parse_environment(&output)
        };

        let cwd = env
            .get("HOME")
            .or_else(|| env.get("USERPROFILE"))
            .cloned()
            .unwrap_or_else(|| ".".to_string());
        debug!(destination = %config.destination(), cwd = %cwd, vars = env.len(), "Probed ssh environment");

        Ok(Self {
            config,
            context: RwLock::new(Context { cwd, env }),
            platform: OnceCell::new(),
            hostname: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn read_context(&self) -> std::sync::RwLockReadGuard<'_, Context> {
        self.context.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_context(&self) -> std::sync::RwLockWriteGuard<'_, Context> {
        self.context.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed(format!(
                "worker {} is closed",
                self.config.host
            )));
        }
        Ok(())
    }

    fn unsupported(&self, operation: &str) -> Error {
        Error::Unsupported(format!("{} is not available over ssh", operation))
    }

    async fn detect_platform(&self) -> Result<Platform> {
        let (status, output) = self.config.capture("uname -s").await?;
        if status == 0 {
            return Ok(Platform::from_uname(&output));
        }
        let (status, output) = self.config.capture("ver").await?;
        if status == 0 && output.to_ascii_lowercase().contains("windows") {
            return Ok(Platform::Windows);
        }
        warn!(host = %self.config.host, "Could not identify remote platform");
        Ok(Platform::Other("unknown".to_string()))
    }
}

#[async_trait]
impl Worker for SshWorker {
    fn host(&self) -> &str {
        &self.config.host
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

        let platform = self.platform().await?;
        let context = self.read_context().clone();
        let env = minimum_environment(&context.env, &platform, environment);
        let wrapped = wrap_command(&command, &context.cwd, &env, &platform);
        info!(host = %self.config.host, cwd = %context.cwd, command = %command, "Executing over ssh");

        let child = ChildProcess::spawn(self.config.client(&wrapped))?;
        Ok(Arc::new(ProcessCommand::new(
            command,
            env,
            ProcessBackend::Ssh {
                host: self.config.host.clone(),
            },
            child,
        )))
    }

    async fn cwd(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.read_context().cwd.clone())
    }

    async fn change_directory(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let platform = self.platform().await?;
        let mut context = self.write_context();
        context.cwd = resolve(&context.cwd, path, &context.env, &platform);
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

    async fn list_directory(&self, _path: &str) -> Result<Vec<String>> {
        Err(self.unsupported("list_directory"))
    }

    async fn get_file(&self, _remote: &str, _local: &Path) -> Result<()> {
        Err(self.unsupported("get_file"))
    }

    async fn put_file(&self, _local: &Path, _remote: &str) -> Result<()> {
        Err(self.unsupported("put_file"))
    }

    async fn change_file_mode(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(self.unsupported("change_file_mode"))
    }

    async fn change_file_owner(&self, _path: &str, _uid: u32) -> Result<()> {
        Err(self.unsupported("change_file_owner"))
    }

    async fn change_file_group(&self, _path: &str, _gid: u32) -> Result<()> {
        Err(self.unsupported("change_file_group"))
    }

    async fn stat_file(&self, _path: &str, _follow_symlinks: bool) -> Result<FileStat> {
        Err(self.unsupported("stat_file"))
    }

    async fn open_file(&self, _path: &str, _mode: OpenMode) -> Result<Box<dyn WorkerFile>> {
        Err(self.unsupported("open_file"))
    }

    async fn create_directory(&self, _path: &str, _parents: bool) -> Result<()> {
        Err(self.unsupported("create_directory"))
    }

    async fn remove_file(&self, _path: &str) -> Result<()> {
        Err(self.unsupported("remove_file"))
    }

    async fn remove_directory(&self, _path: &str, _recursive: bool) -> Result<()> {
        Err(self.unsupported("remove_directory"))
    }

    async fn create_symlink(&self, _target: &str, _link: &str) -> Result<()> {
        Err(self.unsupported("create_symlink"))
    }

    async fn platform(&self) -> Result<Platform> {
        self.platform
            .get_or_try_init(|| self.detect_platform())
            .await
            .cloned()
    }

    async fn hostname(&self) -> Result<String> {
        self.hostname
            .get_or_try_init(|| async {
                let (status, output) = self.config.capture("hostname").await?;
                if status == 0 && !output.trim().is_empty() {
                    Ok(output.trim().to_string())
                } else {
                    Ok(self.config.host.clone())
                }
            })
            .await
            .cloned()
    }

    async fn home(&self) -> Result<String> {
        let context = self.read_context();
        context
            .env
            .get("HOME")
            .or_else(|| context.env.get("USERPROFILE"))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no home directory on {}", self.config.host)))
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed(format!(
                "worker {} is closed",
                self.config.host
            )));
        }
        info!(host = %self.config.host, "SSH worker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artisan_core::command::WaitOptions;

    #[test]
    fn test_config_from_url() {
        let url = Url::parse("ssh://ci@10.0.0.5:2222").unwrap();
        let config = SshConfig::from_url(&url).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.user.as_deref(), Some("ci"));
        assert_eq!(config.port, Some(2222));
        assert_eq!(config.destination(), "ci@10.0.0.5");

        let url = Url::parse("tcp://10.0.0.5:2222").unwrap();
        assert!(SshConfig::from_url(&url).is_err());
    }

    #[test]
    fn test_client_args() {
        let config = SshConfig::new("build-01")
            .with_user("ci")
            .with_identity_file("/keys/id")
            .with_option("StrictHostKeyChecking=accept-new");
        let args = config.client_args();
        assert_eq!(&args[..2], &["-o", "BatchMode=yes"]);
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id"]));
        assert!(
            args.windows(2)
                .any(|w| w == ["-o", "StrictHostKeyChecking=accept-new"])
        );
        assert_eq!(args.last().map(String::as_str), Some("ci@build-01"));
    }

    #[test]
    fn test_parse_environment() {
        let env = parse_environment("HOME=/home/ci\nPATH=/usr/bin:/bin\nEQ=a=b\r\nnoise\n");
        assert_eq!(env.get("HOME").map(String::as_str), Some("/home/ci"));
        assert_eq!(env.get("EQ").map(String::as_str), Some("a=b"));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_wrap_posix_shell() {
        let env = HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("MSG".to_string(), "hello world".to_string()),
        ]);
        let wrapped = wrap_command(
            &CommandLine::shell("echo $MSG"),
            "/home/ci/my project",
            &env,
            &Platform::Linux,
        );
        assert_eq!(
            wrapped,
            "cd '/home/ci/my project' && exec env -i 'MSG=hello world' PATH=/usr/bin sh -c 'echo $MSG'"
        );
    }

    #[test]
    fn test_wrap_posix_argv() {
        let wrapped = wrap_command(
            &CommandLine::argv(["printf", "%s", "it's"]),
            "/tmp",
            &HashMap::new(),
            &Platform::Linux,
        );
        assert_eq!(wrapped, "cd /tmp && exec env -i printf %s 'it'\"'\"'s'");
    }

    #[test]
    fn test_wrap_windows() {
        let env = HashMap::from([("PATH".to_string(), "C:\\bin".to_string())]);
        let wrapped = wrap_command(
            &CommandLine::shell("dir"),
            "C:\\Users\\ci",
            &env,
            &Platform::Windows,
        );
        assert_eq!(wrapped, "cd /d C:\\Users\\ci && set \"PATH=C:\\bin\" && dir");
    }

    /// Write an executable stand-in for the `ssh` client into `dir`.
    ///
    /// A subprocess writes the script so no descriptor open for writing can
    /// leak into a concurrently spawned child.
    #[cfg(unix)]
    fn stub_client(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake-ssh");
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg("printf '%s\\n' \"$1\" > \"$2\" && chmod 755 \"$2\"")
            .arg("sh")
            .arg(body)
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("artisan-ssh-{}", artisan_core::ResourceId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::canonicalize(dir).unwrap()
    }

    /// A client that logs the remote command line and runs it locally.
    #[cfg(unix)]
    fn local_stub(dir: &std::path::Path) -> (SshConfig, std::path::PathBuf) {
        let log = dir.join("calls.log");
        let body = format!(
            "#!/bin/sh\nfor last; do :; done\nprintf '%s\\n' \"$last\" >> '{}'\nexec sh -c \"$last\"",
            log.display()
        );
        let mut config = SshConfig::new("stub-host");
        config.program = stub_client(dir, &body);
        (config, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stub_client_runs_wrapped_command() {
        let dir = scratch_dir();
        let (config, _log) = local_stub(&dir);
        let worker = SshWorker::connect(config).await.unwrap();
        assert!(worker.environment().await.unwrap().contains_key("PATH"));

        worker.change_directory(&dir.to_string_lossy()).await.unwrap();
        worker.set_environment_variable("ARTISAN_MSG", "over stub").await.unwrap();
        let output = worker
            .run(CommandLine::shell("echo \"$ARTISAN_MSG\"; pwd -P"), WaitOptions::new())
            .await
            .unwrap();
        assert_eq!(
            output.stdout_lossy(),
            format!("over stub\n{}\n", dir.display())
        );

        let cmd = worker.execute(CommandLine::shell("exit 4"), None).await.unwrap();
        let err = cmd.wait(WaitOptions::new().error_on_exit()).await.unwrap_err();
        assert!(matches!(err, Error::NonZeroExit { status: 4 }));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_read_at_connect() {
        let dir = scratch_dir();
        let body = "#!/bin/sh\nprintf 'HOME=/home/ci\\nPATH=/usr/bin:/bin\\nLANG=C\\n'";
        let mut config = SshConfig::new("stub-host");
        config.program = stub_client(&dir, body);

        let worker = SshWorker::connect(config).await.unwrap();
        let env = worker.environment().await.unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert_eq!(worker.cwd().await.unwrap(), "/home/ci");
        assert_eq!(worker.home().await.unwrap(), "/home/ci");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_platform_detected_once() {
        let dir = scratch_dir();
        let (config, log) = local_stub(&dir);
        let worker = SshWorker::connect(config).await.unwrap();

        assert_eq!(worker.platform().await.unwrap(), Platform::current());
        worker.run(CommandLine::shell("true"), WaitOptions::new()).await.unwrap();
        worker.run(CommandLine::shell("true"), WaitOptions::new()).await.unwrap();
        assert_eq!(worker.platform().await.unwrap(), Platform::current());

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().next(), Some("env"));
        assert_eq!(calls.lines().filter(|line| *line == "uname -s").count(), 1);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_filesystem_operations_unsupported() {
        let dir = scratch_dir();
        let (config, _log) = local_stub(&dir);
        let worker = SshWorker::connect(config).await.unwrap();

        assert!(matches!(worker.list_directory(".").await, Err(Error::Unsupported(_))));
        assert!(matches!(worker.stat_file("x", true).await, Err(Error::Unsupported(_))));
        assert!(matches!(
            worker.open_file("x", OpenMode::Read).await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            worker.get_file("x", &dir.join("x")).await,
            Err(Error::Unsupported(_))
        ));

        let cmd = worker.execute(CommandLine::shell("sleep 5"), None).await.unwrap();
        assert!(matches!(cmd.signal(15).await, Err(Error::Unsupported(_))));
        cmd.cancel().await.unwrap();

        worker.close().await.unwrap();
        assert!(matches!(worker.cwd().await, Err(Error::AlreadyClosed(_))));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_exit_255_is_unavailable() {
        let dir = scratch_dir();
        let body = "#!/bin/sh\necho 'Connection refused' >&2\nexit 255";
        let mut config = SshConfig::new("stub-host");
        config.program = stub_client(&dir, body);

        let err = SshWorker::connect(config).await.err().unwrap();
        assert!(matches!(&err, Error::WorkerUnavailable(m) if m.contains("Connection refused")));

        std::fs::remove_dir_all(dir).unwrap();
    }

    /// Requires an SSH host reachable without a password prompt.
    /// Run with `ARTISAN_TEST_SSH_HOST=user@host cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_ssh_round_trip() {
        let Ok(target) = std::env::var("ARTISAN_TEST_SSH_HOST") else {
            return;
        };
        let config = match target.split_once('@') {
            Some((user, host)) => SshConfig::new(host).with_user(user),
            None => SshConfig::new(target),
        };
        let worker = SshWorker::connect(config).await.unwrap();
        worker.set_environment_variable("ARTISAN_MSG", "over ssh").await.unwrap();

        let output = worker
            .run(CommandLine::shell("echo $ARTISAN_MSG"), WaitOptions::new())
            .await
            .unwrap();
        assert_eq!(output.stdout_lossy().trim(), "over ssh");
        assert!(worker.platform().await.unwrap().is_posix());

        let cmd = worker.execute(CommandLine::shell("sleep 1"), None).await.unwrap();
        assert!(matches!(cmd.signal(15).await, Err(Error::Unsupported(_))));
        cmd.cancel().await.unwrap();
    }

    /// Connection failures surface as `WorkerUnavailable`.
    /// Requires the `ssh` client to be installed.
    #[tokio::test]
    #[ignore]
    async fn test_unreachable_host() {
        let mut config = SshConfig::new("unreachable.invalid");
        config.connect_timeout = Duration::from_secs(1);
        let err = SshWorker::connect(config).await.err().unwrap();
        assert!(matches!(err, Error::WorkerUnavailable(_)));
    }
}
