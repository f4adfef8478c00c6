//! The command contract shared by every worker backend.
//!
//! A command is one in-flight or finished execution. Backends differ in how
//! they move bytes (child pipes, an ssh client, a wire proxy) but all expose
//! the same polling `wait`, `cancel`, `signal` and buffered output reads.

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::platform::Platform;
use crate::{Error, Result};

/// What to run: a single string for the worker's shell, or a literal argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn shell(command: impl Into<String>) -> Self {
        CommandLine::Shell(command.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Argv(args.into_iter().map(Into::into).collect())
    }

    /// True when the command is interpreted by a shell, in which case the
    /// reported pid belongs to the shell rather than the program it runs.
    pub fn is_shell(&self) -> bool {
        matches!(self, CommandLine::Shell(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CommandLine::Shell(s) => s.trim().is_empty(),
            CommandLine::Argv(args) => args.is_empty(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(s) => f.write_str(s),
            CommandLine::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(s: &str) -> Self {
        CommandLine::Shell(s.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(s: String) -> Self {
        CommandLine::Shell(s)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(args: Vec<String>) -> Self {
        CommandLine::Argv(args)
    }
}

impl From<&[&str]> for CommandLine {
    fn from(args: &[&str]) -> Self {
        CommandLine::argv(args.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    #[display("stdout")]
    Stdout,
    #[display("stderr")]
    Stderr,
}

/// How long `wait` may block and which outcomes become errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOptions {
    /// `None` blocks until the command finishes.
    pub timeout: Option<Duration>,
    /// Fail with `NonZeroExit` when the command exits non-zero.
    pub error_on_exit: bool,
    /// Fail with `Timeout` instead of returning `false`.
    pub error_on_timeout: bool,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn error_on_exit(mut self) -> Self {
        self.error_on_exit = true;
        self
    }

    pub fn error_on_timeout(mut self) -> Self {
        self.error_on_timeout = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    Running,
    Exited(i32),
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::Running)
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            CommandState::Exited(status) => Some(*status),
            _ => None,
        }
    }
}

/// Everything a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: Option<i32>,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// One execution spawned by a worker.
#[async_trait]
pub trait Command: Send + Sync {
    fn command_line(&self) -> &CommandLine;

    /// Environment the command was started with.
    fn environment(&self) -> &HashMap<String, String>;

    fn is_shell(&self) -> bool {
        self.command_line().is_shell()
    }

    /// Best-effort process id. For shell commands this is the shell's pid.
    async fn pid(&self) -> Result<Option<u32>>;

    /// `None` while running, and forever if cancelled before exiting.
    async fn exit_status(&self) -> Result<Option<i32>>;

    async fn cancelled(&self) -> Result<bool>;

    async fn state(&self) -> Result<CommandState> {
        if let Some(status) = self.exit_status().await? {
            return Ok(CommandState::Exited(status));
        }
        if self.cancelled().await? {
            return Ok(CommandState::Cancelled);
        }
        Ok(CommandState::Running)
    }

    /// Drain output and poll for completion until the deadline.
    ///
    /// Returns `true` once the command reached a terminal state. Calling it
    /// again after completion returns `true` immediately.
    async fn wait(&self, options: WaitOptions) -> Result<bool>;

    /// Forcibly stop the command. Buffered output is kept; a second call
    /// fails with `AlreadyClosed`.
    async fn cancel(&self) -> Result<()>;

    async fn signal(&self, signal: i32) -> Result<()>;

    /// Drain, then read from the buffered output stream.
    async fn read(
        &self,
        stream: OutputStream,
        chunk_size: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Bytes>;

    /// Everything buffered right now, without waiting.
    async fn take_output(&self, stream: OutputStream) -> Result<Bytes> {
        self.read(stream, None, Some(Duration::ZERO)).await
    }

    /// Queue bytes for the command's stdin.
    async fn write_stdin(&self, data: Bytes) -> Result<()>;

    /// Signal end of input once queued bytes are flushed.
    async fn close_stdin(&self) -> Result<()>;
}

/// Apply a wait's error policy to the outcome of the polling loop.
pub fn finish_wait(
    finished: bool,
    exit_status: Option<i32>,
    options: &WaitOptions,
    command: &CommandLine,
) -> Result<bool> {
    if !finished {
        if options.error_on_timeout {
            return Err(Error::Timeout(format!(
                "'{}' still running after {:?}",
                command,
                options.timeout.unwrap_or_default()
            )));
        }
        return Ok(false);
    }

    match exit_status {
        Some(status) if status != 0 && options.error_on_exit => Err(Error::NonZeroExit { status }),
        _ => Ok(true),
    }
}

/// Environment a new command starts with.
///
/// Without an explicit environment the worker's is copied. An explicit one
/// always gets the worker's `PATH`, and `SYSTEMROOT` on Windows, when it
/// lacks them: most programs fail to start without those.
pub fn minimum_environment(
    worker_env: &HashMap<String, String>,
    platform: &Platform,
    explicit: Option<HashMap<String, String>>,
) -> HashMap<String, String> {
    let Some(mut env) = explicit else {
        return worker_env.clone();
    };

    let mut required = vec!["PATH"];
    if platform.is_windows() {
        required.push("SYSTEMROOT");
    }

    for key in required {
        let present = env
            .keys()
            .any(|k| k == key || (platform.is_windows() && k.eq_ignore_ascii_case(key)));
        if present {
            continue;
        }
        let inherited = worker_env
            .iter()
            .find(|(k, _)| *k == key || (platform.is_windows() && k.eq_ignore_ascii_case(key)));
        if let Some((k, v)) = inherited {
            env.insert(k.clone(), v.clone());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_env() -> HashMap<String, String> {
        HashMap::from([
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("HOME".to_string(), "/home/ci".to_string()),
            ("SystemRoot".to_string(), "C:\\Windows".to_string()),
        ])
    }

    #[test]
    fn test_minimum_environment_copies_worker_env() {
        let env = minimum_environment(&worker_env(), &Platform::Linux, None);
        assert_eq!(env, worker_env());
    }

    #[test]
    fn test_minimum_environment_adds_path() {
        let explicit = HashMap::from([("FOO".to_string(), "bar".to_string())]);
        let env = minimum_environment(&worker_env(), &Platform::Linux, Some(explicit));
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert!(!env.contains_key("HOME"));
        assert!(!env.contains_key("SystemRoot"));
    }

    #[test]
    fn test_minimum_environment_keeps_explicit_path() {
        let explicit = HashMap::from([("PATH".to_string(), "/opt/bin".to_string())]);
        let env = minimum_environment(&worker_env(), &Platform::Linux, Some(explicit));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/opt/bin"));
    }

    #[test]
    fn test_minimum_environment_windows_systemroot() {
        let env = minimum_environment(&worker_env(), &Platform::Windows, Some(HashMap::new()));
        assert_eq!(env.get("SystemRoot").map(String::as_str), Some("C:\\Windows"));
        assert!(env.contains_key("PATH"));
    }

    #[test]
    fn test_finish_wait_escalation() {
        let cmd = CommandLine::shell("exit 3");
        let plain = WaitOptions::new();
        let strict = WaitOptions::new().error_on_exit().error_on_timeout();

        assert!(!finish_wait(false, None, &plain, &cmd).unwrap());
        assert!(matches!(
            finish_wait(false, None, &strict, &cmd),
            Err(Error::Timeout(_))
        ));
        assert!(finish_wait(true, Some(3), &plain, &cmd).unwrap());
        assert!(matches!(
            finish_wait(true, Some(3), &strict, &cmd),
            Err(Error::NonZeroExit { status: 3 })
        ));
        assert!(finish_wait(true, Some(0), &strict, &cmd).unwrap());
        assert!(finish_wait(true, None, &strict, &cmd).unwrap());
    }

    #[test]
    fn test_command_line_forms() {
        let shell: CommandLine = "echo hi".into();
        assert!(shell.is_shell());
        let argv: CommandLine = ["echo", "hi"].as_slice().into();
        assert!(!argv.is_shell());
        assert_eq!(argv.to_string(), "echo hi");
        assert!(CommandLine::argv(Vec::<String>::new()).is_empty());
    }
}
