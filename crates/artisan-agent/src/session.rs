//! One client connection: its object registry and request dispatch.

use artisan_core::command::{OutputStream, WaitOptions};
use artisan_core::protocol::{
    Call, MAX_DATA_CHUNK, MAX_FRAME_LENGTH, ROOT_OBJECT, Reply, Request, Response, WireError,
    timeout_from_wire,
};
use artisan_core::{Command, Error, Result, Worker, WorkerFile};
use bytes::{Bytes, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

enum Object {
    Worker(Arc<dyn Worker>),
    Command(CommandEntry),
    File(Box<dyn WorkerFile>),
}

/// A registered command plus output already drained from it that did not
/// fit in one reply.
struct CommandEntry {
    command: Arc<dyn Command>,
    stdout: BytesMut,
    stderr: BytesMut,
}

impl CommandEntry {
    fn new(command: Arc<dyn Command>) -> Self {
        Self {
            command,
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
        }
    }

    fn pending(&mut self, stream: OutputStream) -> &mut BytesMut {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }
}

/// Objects addressable on one connection. Id 0 is the root worker.
struct Registry {
    objects: HashMap<u64, Object>,
    next_id: u64,
}

impl Registry {
    fn new(root: Arc<dyn Worker>) -> Self {
        let mut objects = HashMap::new();
        objects.insert(ROOT_OBJECT, Object::Worker(root));
        Self {
            objects,
            next_id: ROOT_OBJECT + 1,
        }
    }

    fn register(&mut self, object: Object) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(id, object);
        id
    }

    fn release(&mut self, id: u64) -> Result<()> {
        if id == ROOT_OBJECT {
            return Err(Error::InvalidInput(
                "the root worker cannot be released".to_string(),
            ));
        }
        self.objects
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("object {}", id)))
    }

    fn len(&self) -> usize {
        self.objects.len()
    }
}

pub(crate) struct Session {
    peer: SocketAddr,
    registry: Registry,
}

impl Session {
    pub(crate) fn new(peer: SocketAddr, root: Arc<dyn Worker>) -> Self {
        Self {
            peer,
            registry: Registry::new(root),
        }
    }

    /// Answer requests until the client disconnects.
    ///
    /// Dropping the session drops every command it created; local children
    /// are killed with them.
    pub(crate) async fn serve(mut self, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, artisan_worker::frame_codec());

        while let Some(frame) = framed.next().await {
            let frame = frame.map_err(|e| Error::Transport(e.to_string()))?;
            let response = match serde_json::from_slice::<Request>(&frame) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Malformed request");
                    Response::Err(WireError::from(Error::Protocol(format!(
                        "malformed request: {}",
                        e
                    ))))
                }
            };
            let body = encode_response(&response, MAX_FRAME_LENGTH)?;
            framed
                .send(body)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
        }

        debug!(peer = %self.peer, objects = self.registry.len(), "Session ended");
        Ok(())
    }

    async fn dispatch(&mut self, request: Request) -> Response {
        let name = request.call.name();
        let object = request.object;
        debug!(peer = %self.peer, object, call = name, "Dispatching");

        match AssertUnwindSafe(self.handle(request)).catch_unwind().await {
            Ok(result) => result.into(),
            Err(_) => {
                warn!(peer = %self.peer, object, call = name, "Handler panicked");
                Response::Err(WireError::from(Error::Internal(format!(
                    "agent failed while handling {}",
                    name
                ))))
            }
        }
    }

    async fn handle(&mut self, request: Request) -> Result<Reply> {
        let Request { object, call } = request;
        if call == Call::Release {
            self.registry.release(object)?;
            return Ok(Reply::Unit);
        }

        match self.registry.objects.get_mut(&object) {
            None => Err(Error::NotFound(format!("object {}", object))),
            Some(Object::Worker(worker)) => {
                let worker = worker.clone();
                self.worker_call(worker.as_ref(), call).await
            }
            Some(Object::Command(entry)) => command_call(entry, call).await,
            Some(Object::File(file)) => file_call(file.as_mut(), call).await,
        }
    }

    async fn worker_call(&mut self, worker: &dyn Worker, call: Call) -> Result<Reply> {
        Ok(match call {
            Call::Execute {
                command,
                environment,
            } => {
                let command = worker.execute(command, environment).await?;
                let environment = command.environment().clone();
                let object = self
                    .registry
                    .register(Object::Command(CommandEntry::new(command)));
                Reply::Spawned {
                    object,
                    environment,
                }
            }
            Call::OpenFile { path, mode } => {
                let file = worker.open_file(&path, mode).await?;
                let object = self.registry.register(Object::File(file));
                Reply::Spawned {
                    object,
                    environment: HashMap::new(),
                }
            }
            Call::Cwd => Reply::Path(worker.cwd().await?),
            Call::ChangeDirectory { path } => {
                worker.change_directory(&path).await?;
                Reply::Unit
            }
            Call::Environment => Reply::Environment(worker.environment().await?),
            Call::SetEnvironmentVariable { key, value } => {
                worker.set_environment_variable(&key, &value).await?;
                Reply::Unit
            }
            Call::UnsetEnvironmentVariable { key } => {
                worker.unset_environment_variable(&key).await?;
                Reply::Unit
            }
            Call::ListDirectory { path } => Reply::Names(worker.list_directory(&path).await?),
            Call::ChangeFileMode { path, mode } => {
                worker.change_file_mode(&path, mode).await?;
                Reply::Unit
            }
            Call::ChangeFileOwner { path, uid } => {
                worker.change_file_owner(&path, uid).await?;
                Reply::Unit
            }
            Call::ChangeFileGroup { path, gid } => {
                worker.change_file_group(&path, gid).await?;
                Reply::Unit
            }
            Call::StatFile {
                path,
                follow_symlinks,
            } => Reply::Stat(worker.stat_file(&path, follow_symlinks).await?),
            Call::IsDirectory { path } => Reply::Bool(worker.is_directory(&path).await?),
            Call::IsFile { path } => Reply::Bool(worker.is_file(&path).await?),
            Call::IsSymlink { path } => Reply::Bool(worker.is_symlink(&path).await?),
            Call::CreateDirectory { path, parents } => {
                worker.create_directory(&path, parents).await?;
                Reply::Unit
            }
            Call::RemoveFile { path } => {
                worker.remove_file(&path).await?;
                Reply::Unit
            }
            Call::RemoveDirectory { path, recursive } => {
                worker.remove_directory(&path, recursive).await?;
                Reply::Unit
            }
            Call::CreateSymlink { target, link } => {
                worker.create_symlink(&target, &link).await?;
                Reply::Unit
            }
            Call::Platform => Reply::Platform(worker.platform().await?),
            Call::Hostname => Reply::Path(worker.hostname().await?),
            Call::Home => Reply::Path(worker.home().await?),
            Call::Closed => Reply::Bool(worker.closed()),
            Call::Close => {
                worker.close().await?;
                Reply::Unit
            }
            other => return Err(not_applicable("worker", &other)),
        })
    }
}

/// Serialize a response, turning one that cannot be framed into a
/// `Protocol` error so the connection survives.
fn encode_response(response: &Response, limit: usize) -> Result<Bytes> {
    let failure = match serde_json::to_vec(response) {
        Ok(body) if body.len() <= limit => return Ok(Bytes::from(body)),
        Ok(body) => format!("reply of {} bytes exceeds the {} byte frame limit", body.len(), limit),
        Err(e) => format!("cannot encode reply: {}", e),
    };
    warn!(error = %failure, "Replacing reply with an error");
    let error = Response::Err(WireError::from(Error::Protocol(failure)));
    serde_json::to_vec(&error)
        .map(Bytes::from)
        .map_err(|e| Error::Protocol(e.to_string()))
}

fn not_applicable(target: &str, call: &Call) -> Error {
    Error::InvalidInput(format!("{} is not a {} operation", call.name(), target))
}

async fn command_call(entry: &mut CommandEntry, call: Call) -> Result<Reply> {
    let command = entry.command.clone();
    Ok(match call {
        Call::Wait {
            timeout_ms,
            error_on_exit,
            error_on_timeout,
        } => {
            let options = WaitOptions {
                timeout: timeout_from_wire(timeout_ms),
                error_on_exit,
                error_on_timeout,
            };
            Reply::Bool(command.wait(options).await?)
        }
        Call::Cancel => {
            command.cancel().await?;
            Reply::Unit
        }
        Call::Signal { signal } => {
            command.signal(signal).await?;
            Reply::Unit
        }
        Call::Read {
            stream,
            chunk_size,
            timeout_ms,
        } => {
            let limit = chunk_size.unwrap_or(MAX_DATA_CHUNK).min(MAX_DATA_CHUNK);
            if entry.pending(stream).is_empty() {
                let data = command
                    .read(stream, chunk_size.map(|n| n.min(limit)), timeout_from_wire(timeout_ms))
                    .await?;
                entry.pending(stream).extend_from_slice(&data);
            }
            let pending = entry.pending(stream);
            let data = pending.split_to(limit.min(pending.len()));
            let more = !pending.is_empty();
            // Nothing more can arrive once a finished command's buffer is dry.
            let closed = data.is_empty() && !more && command.state().await?.is_terminal();
            Reply::Output {
                data: data.to_vec(),
                more,
                closed,
            }
        }
        Call::WriteStdin { data } => {
            command.write_stdin(Bytes::from(data)).await?;
            Reply::Unit
        }
        Call::CloseStdin => {
            command.close_stdin().await?;
            Reply::Unit
        }
        Call::Pid => Reply::Pid(command.pid().await?),
        Call::ExitStatus => Reply::ExitStatus(command.exit_status().await?),
        Call::Cancelled => Reply::Bool(command.cancelled().await?),
        other => return Err(not_applicable("command", &other)),
    })
}

async fn file_call(file: &mut dyn WorkerFile, call: Call) -> Result<Reply> {
    Ok(match call {
        Call::FileRead { max } => Reply::Data(file.read(max.min(MAX_DATA_CHUNK)).await?.to_vec()),
        Call::FileWrite { data } => {
            file.write(Bytes::from(data)).await?;
            Reply::Unit
        }
        Call::FileClose => {
            file.close().await?;
            Reply::Unit
        }
        other => return Err(not_applicable("file", &other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use artisan_worker::LocalWorker;

    fn registry() -> Registry {
        Registry::new(Arc::new(LocalWorker::new().unwrap()))
    }

    #[test]
    fn test_registry_ids_increase() {
        let mut registry = registry();
        let worker: Arc<dyn Worker> = Arc::new(LocalWorker::new().unwrap());
        let first = registry.register(Object::Worker(worker.clone()));
        let second = registry.register(Object::Worker(worker));
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        registry.release(first).unwrap();
        assert!(matches!(registry.release(first), Err(Error::NotFound(_))));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_root_cannot_be_released() {
        let mut registry = registry();
        assert!(matches!(
            registry.release(ROOT_OBJECT),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut session = Session::new(peer, Arc::new(LocalWorker::new().unwrap()));
        let response = session
            .dispatch(Request {
                object: 42,
                call: Call::Pid,
            })
            .await;
        match response {
            Response::Err(e) => assert_eq!(e.kind, artisan_core::protocol::WireErrorKind::NotFound),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_reply_becomes_protocol_error() {
        let response = Response::Ok(Reply::Data(vec![b'x'; 64]));
        let body = encode_response(&response, 32).unwrap();
        match serde_json::from_slice::<Response>(&body).unwrap() {
            Response::Err(e) => {
                assert_eq!(e.kind, artisan_core::protocol::WireErrorKind::Protocol);
                assert!(e.message.contains("frame limit"));
            }
            other => panic!("Expected error, got {:?}", other),
        }

        let small = encode_response(&response, MAX_FRAME_LENGTH).unwrap();
        assert_eq!(serde_json::from_slice::<Response>(&small).unwrap(), response);
    }

    #[tokio::test]
    async fn test_large_output_is_served_in_chunks() {
        use artisan_core::command::CommandLine;
        use artisan_core::protocol::timeout_to_wire;
        use std::time::Duration;

        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut session = Session::new(peer, Arc::new(LocalWorker::new().unwrap()));
        let total = MAX_DATA_CHUNK + 1000;
        let spawned = session
            .dispatch(Request {
                object: ROOT_OBJECT,
                call: Call::Execute {
                    command: CommandLine::shell(format!("head -c {} /dev/zero", total)),
                    environment: None,
                },
            })
            .await;
        let Response::Ok(reply) = spawned else {
            panic!("Expected spawned command, got {:?}", spawned);
        };
        let (object, _) = reply.into_spawned("execute").unwrap();

        let waited = session
            .dispatch(Request {
                object,
                call: Call::Wait {
                    timeout_ms: timeout_to_wire(Some(Duration::from_secs(10))),
                    error_on_exit: false,
                    error_on_timeout: false,
                },
            })
            .await;
        assert_eq!(waited, Response::Ok(Reply::Bool(true)));

        let read = Call::Read {
            stream: OutputStream::Stdout,
            chunk_size: None,
            timeout_ms: Some(0),
        };
        let mut outputs = Vec::new();
        for _ in 0..3 {
            match session.dispatch(Request { object, call: read.clone() }).await {
                Response::Ok(reply) => outputs.push(reply.into_output("read").unwrap()),
                other => panic!("Expected output, got {:?}", other),
            }
        }
        assert_eq!(outputs[0].data.len(), MAX_DATA_CHUNK);
        assert!(outputs[0].more);
        assert_eq!(outputs[1].data.len(), 1000);
        assert!(!outputs[1].more);
        assert!(outputs[2].data.is_empty());
        assert!(outputs[2].closed);
    }

    #[tokio::test]
    async fn test_command_call_on_worker_rejected() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut session = Session::new(peer, Arc::new(LocalWorker::new().unwrap()));
        let response = session
            .dispatch(Request {
                object: ROOT_OBJECT,
                call: Call::Cancel,
            })
            .await;
        assert!(matches!(response, Response::Err(e) if e.kind == artisan_core::protocol::WireErrorKind::InvalidInput));
    }
}
