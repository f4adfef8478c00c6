//! Child-process commands shared by the local and SSH backends.
//!
//! Each stream of the child gets its own reader task that copies bytes into a
//! `ByteStream` as soon as they arrive, so a child blocked writing to stderr
//! can never stall a reader waiting on stdout. Stdin is fed by a writer task
//! from an unbounded queue. Completion is polled with `try_wait`.

use artisan_core::command::{Command, CommandLine, OutputStream, WaitOptions, finish_wait};
use artisan_core::deadline::{Deadline, poll_until};
use artisan_core::{ByteStream, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// How long output may keep arriving after the child exited before the exit
/// status is published anyway (a background grandchild can hold the pipes).
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 8192;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exit code of a finished child; signal deaths are reported as the negated signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, stream: Arc<ByteStream>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if stream.write(&buffer[..n]).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
    stream.close();
}

async fn feed(mut stdin: ChildStdin, mut queue: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = queue.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            debug!(error = %e, "Stdin write failed");
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

#[derive(Debug, Default)]
struct ProcessState {
    /// Exit code and the moment `try_wait` first saw it.
    reaped: Option<(i32, Instant)>,
    /// Published exit status; immutable once set.
    exit_status: Option<i32>,
    cancelled: bool,
}

/// A spawned child with its output streams being drained.
pub(crate) struct ChildProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    stdout: Arc<ByteStream>,
    stderr: Arc<ByteStream>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    stdin: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    feeder: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<ProcessState>,
}

impl ChildProcess {
    pub(crate) fn spawn(mut command: tokio::process::Command) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let stdout = Arc::new(ByteStream::new());
        let stderr = Arc::new(ByteStream::new());
        let mut readers = Vec::with_capacity(2);
        match child.stdout.take() {
            Some(pipe) => readers.push(tokio::spawn(pump(pipe, stdout.clone()))),
            None => stdout.close(),
        }
        match child.stderr.take() {
            Some(pipe) => readers.push(tokio::spawn(pump(pipe, stderr.clone()))),
            None => stderr.close(),
        }

        let (stdin, feeder) = match child.stdin.take() {
            Some(pipe) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(tokio::spawn(feed(pipe, rx))))
            }
            None => (None, None),
        };

        Ok(Self {
            pid: child.id(),
            child: Mutex::new(child),
            stdout,
            stderr,
            readers: Mutex::new(readers),
            stdin: Mutex::new(stdin),
            feeder: Mutex::new(feeder),
            state: Mutex::new(ProcessState::default()),
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn exit_status(&self) -> Option<i32> {
        lock(&self.state).exit_status
    }

    pub(crate) fn cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    pub(crate) fn stream(&self, stream: OutputStream) -> &ByteStream {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    fn reap(&self, state: &mut ProcessState) -> Result<()> {
        if state.reaped.is_none() {
            if let Some(status) = lock(&self.child).try_wait()? {
                state.reaped = Some((exit_code(status), Instant::now()));
            }
        }
        Ok(())
    }

    /// One non-blocking drain/poll step. Returns whether the command is terminal.
    pub(crate) fn poll(&self) -> Result<bool> {
        let mut state = lock(&self.state);
        if state.cancelled || state.exit_status.is_some() {
            return Ok(true);
        }
        self.reap(&mut state)?;

        if let Some((code, reaped_at)) = state.reaped {
            let drained = lock(&self.readers).iter().all(|r| r.is_finished());
            if drained || reaped_at.elapsed() >= DRAIN_GRACE {
                state.exit_status = Some(code);
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(crate) async fn wait(&self, deadline: Deadline) -> Result<bool> {
        poll_until(deadline, move || async move { self.poll() }).await
    }

    pub(crate) fn cancel(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.cancelled {
                return Err(Error::AlreadyClosed("command already cancelled".to_string()));
            }
            state.cancelled = true;
        }

        if let Err(e) = lock(&self.child).start_kill() {
            debug!(pid = ?self.pid, error = %e, "Kill failed");
        }
        lock(&self.stdin).take();
        if let Some(feeder) = lock(&self.feeder).take() {
            feeder.abort();
        }
        for reader in lock(&self.readers).drain(..) {
            reader.abort();
        }
        self.stdout.close();
        self.stderr.close();
        Ok(())
    }

    pub(crate) fn signal(&self, signal: i32) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.cancelled {
                return Err(Error::AlreadyClosed("command was cancelled".to_string()));
            }
            self.reap(&mut state)?;
            if state.reaped.is_some() {
                return Err(Error::AlreadyClosed("command already exited".to_string()));
            }
        }
        let pid = self
            .pid
            .ok_or_else(|| Error::AlreadyClosed("command has no pid".to_string()))?;
        deliver_signal(pid, signal)
    }

    pub(crate) fn write_stdin(&self, data: Bytes) -> Result<()> {
        if self.cancelled() {
            return Err(Error::AlreadyClosed("command was cancelled".to_string()));
        }
        match lock(&self.stdin).as_ref() {
            Some(queue) => queue
                .send(data)
                .map_err(|_| Error::AlreadyClosed("stdin is closed".to_string())),
            None => Err(Error::AlreadyClosed("stdin is closed".to_string())),
        }
    }

    pub(crate) fn close_stdin(&self) {
        lock(&self.stdin).take();
    }
}

#[cfg(unix)]
fn deliver_signal(pid: u32, signal: i32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = Signal::try_from(signal)
        .map_err(|_| Error::InvalidInput(format!("invalid signal number {}", signal)))?;
    let pid = i32::try_from(pid).map_err(|_| Error::Internal(format!("pid {} out of range", pid)))?;
    kill(Pid::from_raw(pid), signal).map_err(|e| Error::Io(e.into()))
}

#[cfg(not(unix))]
fn deliver_signal(_pid: u32, _signal: i32) -> Result<()> {
    Err(Error::Unsupported(
        "signals are only supported on POSIX workers".to_string(),
    ))
}

/// Which backend produced a [`ProcessCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessBackend {
    Local,
    /// The child is an `ssh` client running the command on `host`.
    Ssh { host: String },
}

/// A command backed by a local child process.
///
/// For the SSH backend the child is the `ssh` client: cancelling it closes
/// the channel and the reported pid is the client's.
pub struct ProcessCommand {
    command_line: CommandLine,
    environment: HashMap<String, String>,
    backend: ProcessBackend,
    process: ChildProcess,
}

impl ProcessCommand {
    pub(crate) fn new(
        command_line: CommandLine,
        environment: HashMap<String, String>,
        backend: ProcessBackend,
        process: ChildProcess,
    ) -> Self {
        info!(command = %command_line, pid = ?process.pid(), backend = ?backend, "Command started");
        Self {
            command_line,
            environment,
            backend,
            process,
        }
    }

    pub fn backend(&self) -> &ProcessBackend {
        &self.backend
    }

    /// Direct access to the buffered output.
    pub fn stdout(&self) -> &ByteStream {
        self.process.stream(OutputStream::Stdout)
    }

    pub fn stderr(&self) -> &ByteStream {
        self.process.stream(OutputStream::Stderr)
    }
}

#[async_trait]
impl Command for ProcessCommand {
    fn command_line(&self) -> &CommandLine {
        &self.command_line
    }

    fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    async fn pid(&self) -> Result<Option<u32>> {
        Ok(self.process.pid())
    }

    async fn exit_status(&self) -> Result<Option<i32>> {
        Ok(self.process.exit_status())
    }

    async fn cancelled(&self) -> Result<bool> {
        Ok(self.process.cancelled())
    }

    async fn wait(&self, options: WaitOptions) -> Result<bool> {
        let finished = self.process.wait(Deadline::after(options.timeout)).await?;
        finish_wait(
            finished,
            self.process.exit_status(),
            &options,
            &self.command_line,
        )
    }

    async fn cancel(&self) -> Result<()> {
        self.process.cancel()?;
        info!(command = %self.command_line, pid = ?self.process.pid(), "Command cancelled");
        Ok(())
    }

    async fn signal(&self, signal: i32) -> Result<()> {
        match &self.backend {
            ProcessBackend::Local => self.process.signal(signal),
            ProcessBackend::Ssh { host } => {
                if self.process.cancelled() {
                    return Err(Error::AlreadyClosed("command was cancelled".to_string()));
                }
                Err(Error::Unsupported(format!(
                    "signals cannot be delivered over ssh to {}",
                    host
                )))
            }
        }
    }

    async fn read(
        &self,
        stream: OutputStream,
        chunk_size: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.process.poll()?;
        Ok(self.process.stream(stream).read(chunk_size, timeout).await)
    }

    async fn write_stdin(&self, data: Bytes) -> Result<()> {
        self.process.write_stdin(data)
    }

    async fn close_stdin(&self) -> Result<()> {
        self.process.close_stdin();
        Ok(())
    }
}
