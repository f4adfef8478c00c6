//! Client proxies for a worker served by `artisan-agent`.
//!
//! A [`RemoteWorker`] owns one TCP connection. Commands and files it creates
//! are proxies addressed by object id on that same connection; every method
//! call is one request/response round trip.

use artisan_core::command::{Command, CommandLine, OutputStream, WaitOptions, finish_wait};
use artisan_core::deadline::Deadline;
use artisan_core::protocol::{
    Call, MAX_DATA_CHUNK, MAX_FRAME_LENGTH, ROOT_OBJECT, Reply, Request, Response, StreamOutput,
    timeout_to_wire,
};
use artisan_core::worker::{FileStat, OpenMode, Worker, WorkerFile};
use artisan_core::{Error, Platform, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use url::Url;

/// Longest a single round trip may take before the connection is abandoned.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Unbounded waits and reads are split into calls of at most this length,
/// shortened further when the response timeout is tight.
pub const CALL_SLICE: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Codec used on both ends of an agent connection.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// One framed connection to an agent.
pub struct Connection {
    peer: String,
    framed: Mutex<Framed<TcpStream, LengthDelimitedCodec>>,
    broken: AtomicBool,
    response_timeout: Duration,
    call_slice: Duration,
}

/// Longest server-side wait that still leaves half the response timeout
/// for the round trip itself.
fn call_slice_for(response_timeout: Duration) -> Duration {
    CALL_SLICE.min(response_timeout / 2)
}

async fn exchange(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    body: Bytes,
) -> std::io::Result<Option<BytesMut>> {
    framed.send(body).await?;
    framed.next().await.transpose()
}

impl Connection {
    pub fn new(stream: TcpStream, peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            framed: Mutex::new(Framed::new(stream, frame_codec())),
            broken: AtomicBool::new(false),
            response_timeout: RESPONSE_TIMEOUT,
            call_slice: call_slice_for(RESPONSE_TIMEOUT),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self.call_slice = call_slice_for(timeout);
        self
    }

    pub fn call_slice(&self) -> Duration {
        self.call_slice
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn fail(&self, err: Error) -> Error {
        self.broken.store(true, Ordering::SeqCst);
        err
    }

    /// Send one call and wait for its response.
    ///
    /// A timed out or failed exchange leaves the stream out of step, so the
    /// connection is marked broken and every later call fails fast.
    pub async fn call(&self, object: u64, call: Call) -> Result<Reply> {
        if self.is_broken() {
            return Err(Error::Transport(format!(
                "connection to {} is broken",
                self.peer
            )));
        }

        let name = call.name();
        let body = serde_json::to_vec(&Request { object, call })
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let mut framed = self.framed.lock().await;
        let frame = match tokio::time::timeout(
            self.response_timeout,
            exchange(&mut framed, Bytes::from(body)),
        )
        .await
        {
            Err(_) => {
                warn!(peer = %self.peer, call = name, "Agent did not respond");
                return Err(self.fail(Error::ResponseTimeout(self.response_timeout)));
            }
            Ok(Err(e)) => {
                return Err(self.fail(Error::Transport(format!("{}: {}", self.peer, e))));
            }
            Ok(Ok(None)) => {
                return Err(self.fail(Error::Transport(format!(
                    "connection to {} closed by the agent",
                    self.peer
                ))));
            }
            Ok(Ok(Some(frame))) => frame,
        };
        drop(framed);

        let response: Response = serde_json::from_slice(&frame)
            .map_err(|e| self.fail(Error::Protocol(format!("bad response to {}: {}", name, e))))?;
        match response {
            Response::Ok(reply) => Ok(reply),
            Response::Err(err) => {
                debug!(peer = %self.peer, call = name, kind = ?err.kind, "Agent returned an error");
                Err(err.into())
            }
        }
    }

    async fn shutdown(&self) {
        self.broken.store(true, Ordering::SeqCst);
        if let Err(e) = SinkExt::<Bytes>::close(&mut *self.framed.lock().await).await {
            debug!(peer = %self.peer, error = %e, "Connection shutdown failed");
        }
    }

    /// Release an object without waiting, for use from `Drop`.
    fn release_later(self: &Arc<Self>, object: u64) {
        if self.is_broken() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = self.clone();
        handle.spawn(async move {
            if let Err(e) = connection.call(object, Call::Release).await {
                debug!(object, error = %e, "Release failed");
            }
        });
    }
}

/// A worker living in an agent process.
pub struct RemoteWorker {
    connection: Arc<Connection>,
    closed: AtomicBool,
}

impl RemoteWorker {
    /// Connect to an agent at `host:port`.
    pub async fn connect(address: &str) -> Result<Self> {
        Self::connect_with_timeout(address, RESPONSE_TIMEOUT).await
    }

    pub async fn connect_with_timeout(address: &str, response_timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::WorkerUnavailable(format!(
                    "cannot connect to agent at {}: {}",
                    address, e
                )));
            }
            Err(_) => {
                return Err(Error::WorkerUnavailable(format!(
                    "timed out connecting to agent at {}",
                    address
                )));
            }
        };
        stream.set_nodelay(true)?;
        info!(agent = %address, "Connected to agent");

        let connection = Connection::new(stream, address).with_response_timeout(response_timeout);
        Ok(Self {
            connection: Arc::new(connection),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect using a `tcp://host[:port]` url.
    pub async fn from_url(url: &Url) -> Result<Self> {
        if url.scheme() != "tcp" {
            return Err(Error::InvalidInput(format!(
                "expected a tcp:// url, got {}",
                url
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("{} has no host", url)))?;
        let port = url
            .port()
            .unwrap_or(artisan_core::protocol::DEFAULT_AGENT_PORT);
        Self::connect(&format!("{}:{}", host, port)).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed(format!(
                "worker {} is closed",
                self.connection.peer()
            )));
        }
        Ok(())
    }

    async fn call(&self, call: Call) -> Result<Reply> {
        self.ensure_open()?;
        self.connection.call(ROOT_OBJECT, call).await
    }
}

#[async_trait]
impl Worker for RemoteWorker {
    fn host(&self) -> &str {
        self.connection.peer()
    }

    async fn execute(
        &self,
        command: CommandLine,
        environment: Option<HashMap<String, String>>,
    ) -> Result<Arc<dyn Command>> {
        let (object, environment) = self
            .call(Call::Execute {
                command: command.clone(),
                environment,
            })
            .await?
            .into_spawned("execute")?;
        debug!(agent = %self.connection.peer(), object, command = %command, "Remote command started");
        Ok(Arc::new(RemoteCommand {
            connection: self.connection.clone(),
            object,
            command_line: command,
            environment,
        }))
    }

    async fn cwd(&self) -> Result<String> {
        self.call(Call::Cwd).await?.into_path("cwd")
    }

    async fn change_directory(&self, path: &str) -> Result<()> {
        self.call(Call::ChangeDirectory {
            path: path.to_string(),
        })
        .await?
        .into_unit("change_directory")
    }

    async fn environment(&self) -> Result<HashMap<String, String>> {
        self.call(Call::Environment).await?.into_environment("environment")
    }

    async fn set_environment_variable(&self, key: &str, value: &str) -> Result<()> {
        self.call(Call::SetEnvironmentVariable {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await?
        .into_unit("set_environment_variable")
    }

    async fn unset_environment_variable(&self, key: &str) -> Result<()> {
        self.call(Call::UnsetEnvironmentVariable {
            key: key.to_string(),
        })
        .await?
        .into_unit("unset_environment_variable")
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        self.call(Call::ListDirectory {
            path: path.to_string(),
        })
        .await?
        .into_names("list_directory")
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<()> {
        let mut source = self.open_file(remote, OpenMode::Read).await?;
        let mut target = tokio::fs::File::create(local).await?;
        loop {
            let chunk = source.read(MAX_DATA_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            target.write_all(&chunk).await?;
        }
        target.flush().await?;
        source.close().await
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mut source = tokio::fs::File::open(local).await?;
        let mut target = self.open_file(remote, OpenMode::Write).await?;
        let mut buffer = vec![0u8; MAX_DATA_CHUNK];
        loop {
            let n = source.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            target.write(Bytes::copy_from_slice(&buffer[..n])).await?;
        }
        target.close().await
    }

    async fn change_file_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.call(Call::ChangeFileMode {
            path: path.to_string(),
            mode,
        })
        .await?
        .into_unit("change_file_mode")
    }

    async fn change_file_owner(&self, path: &str, uid: u32) -> Result<()> {
        self.call(Call::ChangeFileOwner {
            path: path.to_string(),
            uid,
        })
        .await?
        .into_unit("change_file_owner")
    }

    async fn change_file_group(&self, path: &str, gid: u32) -> Result<()> {
        self.call(Call::ChangeFileGroup {
            path: path.to_string(),
            gid,
        })
        .await?
        .into_unit("change_file_group")
    }

    async fn stat_file(&self, path: &str, follow_symlinks: bool) -> Result<FileStat> {
        self.call(Call::StatFile {
            path: path.to_string(),
            follow_symlinks,
        })
        .await?
        .into_stat("stat_file")
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        self.call(Call::IsDirectory {
            path: path.to_string(),
        })
        .await?
        .into_bool("is_directory")
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        self.call(Call::IsFile {
            path: path.to_string(),
        })
        .await?
        .into_bool("is_file")
    }

    async fn is_symlink(&self, path: &str) -> Result<bool> {
        self.call(Call::IsSymlink {
            path: path.to_string(),
        })
        .await?
        .into_bool("is_symlink")
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> Result<Box<dyn WorkerFile>> {
        let (object, _) = self
            .call(Call::OpenFile {
                path: path.to_string(),
                mode,
            })
            .await?
            .into_spawned("open_file")?;
        Ok(Box::new(RemoteFile {
            connection: self.connection.clone(),
            object,
            closed: false,
        }))
    }

    async fn create_directory(&self, path: &str, parents: bool) -> Result<()> {
        self.call(Call::CreateDirectory {
            path: path.to_string(),
            parents,
        })
        .await?
        .into_unit("create_directory")
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.call(Call::RemoveFile {
            path: path.to_string(),
        })
        .await?
        .into_unit("remove_file")
    }

    async fn remove_directory(&self, path: &str, recursive: bool) -> Result<()> {
        self.call(Call::RemoveDirectory {
            path: path.to_string(),
            recursive,
        })
        .await?
        .into_unit("remove_directory")
    }

    async fn create_symlink(&self, target: &str, link: &str) -> Result<()> {
        self.call(Call::CreateSymlink {
            target: target.to_string(),
            link: link.to_string(),
        })
        .await?
        .into_unit("create_symlink")
    }

    async fn platform(&self) -> Result<Platform> {
        self.call(Call::Platform).await?.into_platform("platform")
    }

    async fn hostname(&self) -> Result<String> {
        self.call(Call::Hostname).await?.into_path("hostname")
    }

    async fn home(&self) -> Result<String> {
        self.call(Call::Home).await?.into_path("home")
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.ensure_open()?;
        let result = self
            .connection
            .call(ROOT_OBJECT, Call::Close)
            .await
            .and_then(|reply| reply.into_unit("close"));
        self.closed.store(true, Ordering::SeqCst);
        self.connection.shutdown().await;
        info!(agent = %self.connection.peer(), "Remote worker closed");
        result
    }
}

/// A command running inside an agent.
pub struct RemoteCommand {
    connection: Arc<Connection>,
    object: u64,
    command_line: CommandLine,
    environment: HashMap<String, String>,
}

impl RemoteCommand {
    pub fn object(&self) -> u64 {
        self.object
    }

    async fn call(&self, call: Call) -> Result<Reply> {
        self.connection.call(self.object, call).await
    }

    /// One bounded read.
    async fn read_slice(
        &self,
        stream: OutputStream,
        chunk_size: Option<usize>,
        slice: Duration,
    ) -> Result<StreamOutput> {
        self.call(Call::Read {
            stream,
            chunk_size,
            timeout_ms: timeout_to_wire(Some(slice)),
        })
        .await?
        .into_output("read")
    }
}

impl Drop for RemoteCommand {
    fn drop(&mut self) {
        self.connection.release_later(self.object);
    }
}

#[async_trait]
impl Command for RemoteCommand {
    fn command_line(&self) -> &CommandLine {
        &self.command_line
    }

    fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    async fn pid(&self) -> Result<Option<u32>> {
        self.call(Call::Pid).await?.into_pid("pid")
    }

    async fn exit_status(&self) -> Result<Option<i32>> {
        self.call(Call::ExitStatus).await?.into_exit_status("exit_status")
    }

    async fn cancelled(&self) -> Result<bool> {
        self.call(Call::Cancelled).await?.into_bool("cancelled")
    }

    async fn wait(&self, options: WaitOptions) -> Result<bool> {
        let deadline = Deadline::after(options.timeout);
        let finished = loop {
            let slice = deadline.slice(self.connection.call_slice());
            let finished = self
                .call(Call::Wait {
                    timeout_ms: timeout_to_wire(Some(slice)),
                    error_on_exit: false,
                    error_on_timeout: false,
                })
                .await?
                .into_bool("wait")?;
            if finished || deadline.is_expired() {
                break finished;
            }
        };
        let exit_status = if finished {
            self.exit_status().await?
        } else {
            None
        };
        finish_wait(finished, exit_status, &options, &self.command_line)
    }

    async fn cancel(&self) -> Result<()> {
        self.call(Call::Cancel).await?.into_unit("cancel")
    }

    async fn signal(&self, signal: i32) -> Result<()> {
        self.call(Call::Signal { signal }).await?.into_unit("signal")
    }

    async fn read(
        &self,
        stream: OutputStream,
        chunk_size: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        if chunk_size == Some(0) {
            return Ok(Bytes::new());
        }

        let deadline = Deadline::after(timeout);
        let mut buffer = BytesMut::new();
        loop {
            let wanted = chunk_size.map(|n| n - buffer.len());
            let output = self
                .read_slice(stream, wanted, deadline.slice(self.connection.call_slice()))
                .await?;
            buffer.extend_from_slice(&output.data);

            // Bytes the agent already holds are collected even past the deadline.
            let satisfied = match chunk_size {
                Some(n) => buffer.len() >= n,
                None => !buffer.is_empty() && !output.more,
            };
            if satisfied || output.closed || (deadline.is_expired() && !output.more) {
                return Ok(buffer.freeze());
            }
        }
    }

    async fn write_stdin(&self, data: Bytes) -> Result<()> {
        for chunk in data.chunks(MAX_DATA_CHUNK) {
            self.call(Call::WriteStdin {
                data: chunk.to_vec(),
            })
            .await?
            .into_unit("write_stdin")?;
        }
        Ok(())
    }

    async fn close_stdin(&self) -> Result<()> {
        self.call(Call::CloseStdin).await?.into_unit("close_stdin")
    }
}

/// A file opened inside an agent.
pub struct RemoteFile {
    connection: Arc<Connection>,
    object: u64,
    closed: bool,
}

impl RemoteFile {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed(format!(
                "remote file {} is closed",
                self.object
            )));
        }
        Ok(())
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        self.connection.release_later(self.object);
    }
}

#[async_trait]
impl WorkerFile for RemoteFile {
    async fn read(&mut self, max: usize) -> Result<Bytes> {
        self.ensure_open()?;
        let data = self
            .connection
            .call(self.object, Call::FileRead { max })
            .await?
            .into_data("file_read")?;
        Ok(Bytes::from(data))
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        for chunk in data.chunks(MAX_DATA_CHUNK) {
            self.connection
                .call(
                    self.object,
                    Call::FileWrite {
                        data: chunk.to_vec(),
                    },
                )
                .await?
                .into_unit("file_write")?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.connection
            .call(self.object, Call::FileClose)
            .await?
            .into_unit("file_close")
    }
}
