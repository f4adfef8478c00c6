//! Wire protocol between a remote worker proxy and the agent.
//!
//! Each frame is a length-prefixed JSON document. A client sends a
//! [`Request`] addressed to an object id on its connection and receives
//! exactly one [`Response`]. Object id [`ROOT_OBJECT`] is the connection's
//! root worker; `Execute` and `OpenFile` allocate fresh ids for the command
//! or file they create.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::time::Duration;

use crate::Error;
use crate::command::{CommandLine, OutputStream};
use crate::platform::Platform;
use crate::worker::{FileStat, OpenMode};

/// Id of the worker every connection starts with.
pub const ROOT_OBJECT: u64 = 0;

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Most payload bytes carried by one request or reply. Base64 keeps a full
/// chunk well under [`MAX_FRAME_LENGTH`].
pub const MAX_DATA_CHUNK: usize = 4 * 1024 * 1024;

/// Default TCP port of the agent.
pub const DEFAULT_AGENT_PORT: u16 = 7311;

/// Byte payloads travel as base64 strings instead of JSON number arrays.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub object: u64,
    pub call: Call,
}

/// Every operation that can cross the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    // Worker
    Execute {
        command: CommandLine,
        environment: Option<HashMap<String, String>>,
    },
    Cwd,
    ChangeDirectory {
        path: String,
    },
    Environment,
    SetEnvironmentVariable {
        key: String,
        value: String,
    },
    UnsetEnvironmentVariable {
        key: String,
    },
    ListDirectory {
        path: String,
    },
    ChangeFileMode {
        path: String,
        mode: u32,
    },
    ChangeFileOwner {
        path: String,
        uid: u32,
    },
    ChangeFileGroup {
        path: String,
        gid: u32,
    },
    StatFile {
        path: String,
        follow_symlinks: bool,
    },
    IsDirectory {
        path: String,
    },
    IsFile {
        path: String,
    },
    IsSymlink {
        path: String,
    },
    OpenFile {
        path: String,
        mode: OpenMode,
    },
    CreateDirectory {
        path: String,
        parents: bool,
    },
    RemoveFile {
        path: String,
    },
    RemoveDirectory {
        path: String,
        recursive: bool,
    },
    CreateSymlink {
        target: String,
        link: String,
    },
    Platform,
    Hostname,
    Home,
    Closed,
    Close,

    // Command
    Wait {
        timeout_ms: Option<u64>,
        error_on_exit: bool,
        error_on_timeout: bool,
    },
    Cancel,
    Signal {
        signal: i32,
    },
    Read {
        stream: OutputStream,
        chunk_size: Option<usize>,
        timeout_ms: Option<u64>,
    },
    WriteStdin {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    CloseStdin,
    Pid,
    ExitStatus,
    Cancelled,

    // File
    FileRead {
        max: usize,
    },
    FileWrite {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    FileClose,

    /// Drop a command or file from the connection's registry.
    Release,
}

impl Call {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Call::Execute { .. } => "execute",
            Call::Cwd => "cwd",
            Call::ChangeDirectory { .. } => "change_directory",
            Call::Environment => "environment",
            Call::SetEnvironmentVariable { .. } => "set_environment_variable",
            Call::UnsetEnvironmentVariable { .. } => "unset_environment_variable",
            Call::ListDirectory { .. } => "list_directory",
            Call::ChangeFileMode { .. } => "change_file_mode",
            Call::ChangeFileOwner { .. } => "change_file_owner",
            Call::ChangeFileGroup { .. } => "change_file_group",
            Call::StatFile { .. } => "stat_file",
            Call::IsDirectory { .. } => "is_directory",
            Call::IsFile { .. } => "is_file",
            Call::IsSymlink { .. } => "is_symlink",
            Call::OpenFile { .. } => "open_file",
            Call::CreateDirectory { .. } => "create_directory",
            Call::RemoveFile { .. } => "remove_file",
            Call::RemoveDirectory { .. } => "remove_directory",
            Call::CreateSymlink { .. } => "create_symlink",
            Call::Platform => "platform",
            Call::Hostname => "hostname",
            Call::Home => "home",
            Call::Closed => "closed",
            Call::Close => "close",
            Call::Wait { .. } => "wait",
            Call::Cancel => "cancel",
            Call::Signal { .. } => "signal",
            Call::Read { .. } => "read",
            Call::WriteStdin { .. } => "write_stdin",
            Call::CloseStdin => "close_stdin",
            Call::Pid => "pid",
            Call::ExitStatus => "exit_status",
            Call::Cancelled => "cancelled",
            Call::FileRead { .. } => "file_read",
            Call::FileWrite { .. } => "file_write",
            Call::FileClose => "file_close",
            Call::Release => "release",
        }
    }
}

/// Successful return values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Unit,
    Bool(bool),
    Path(String),
    Names(Vec<String>),
    Environment(HashMap<String, String>),
    Stat(FileStat),
    Platform(Platform),
    Data(#[serde(with = "base64_bytes")] Vec<u8>),
    ExitStatus(Option<i32>),
    Pid(Option<u32>),
    /// A new registry entry created by `Execute` or `OpenFile`.
    Spawned {
        object: u64,
        environment: HashMap<String, String>,
    },
    /// Output read from a command stream. `more` is set when the agent
    /// already holds further bytes that did not fit in this reply.
    Output {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        more: bool,
        closed: bool,
    },
}

fn unexpected(call: &str, reply: Reply) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", call, reply))
}

impl Reply {
    pub fn into_unit(self, call: &str) -> crate::Result<()> {
        match self {
            Reply::Unit => Ok(()),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_bool(self, call: &str) -> crate::Result<bool> {
        match self {
            Reply::Bool(value) => Ok(value),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_path(self, call: &str) -> crate::Result<String> {
        match self {
            Reply::Path(path) => Ok(path),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_names(self, call: &str) -> crate::Result<Vec<String>> {
        match self {
            Reply::Names(names) => Ok(names),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_environment(self, call: &str) -> crate::Result<HashMap<String, String>> {
        match self {
            Reply::Environment(env) => Ok(env),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_stat(self, call: &str) -> crate::Result<FileStat> {
        match self {
            Reply::Stat(stat) => Ok(stat),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_platform(self, call: &str) -> crate::Result<Platform> {
        match self {
            Reply::Platform(platform) => Ok(platform),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_data(self, call: &str) -> crate::Result<Vec<u8>> {
        match self {
            Reply::Data(data) => Ok(data),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_exit_status(self, call: &str) -> crate::Result<Option<i32>> {
        match self {
            Reply::ExitStatus(status) => Ok(status),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_pid(self, call: &str) -> crate::Result<Option<u32>> {
        match self {
            Reply::Pid(pid) => Ok(pid),
            other => Err(unexpected(call, other)),
        }
    }

    /// `(object, environment)` of a freshly registered command or file.
    pub fn into_spawned(self, call: &str) -> crate::Result<(u64, HashMap<String, String>)> {
        match self {
            Reply::Spawned {
                object,
                environment,
            } => Ok((object, environment)),
            other => Err(unexpected(call, other)),
        }
    }

    pub fn into_output(self, call: &str) -> crate::Result<StreamOutput> {
        match self {
            Reply::Output { data, more, closed } => Ok(StreamOutput { data, more, closed }),
            other => Err(unexpected(call, other)),
        }
    }
}

/// Decoded form of [`Reply::Output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutput {
    pub data: Vec<u8>,
    pub more: bool,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    Timeout,
    NonZeroExit,
    AlreadyClosed,
    Unsupported,
    WorkerUnavailable,
    Transport,
    Protocol,
    NotFound,
    InvalidInput,
    Io,
    Internal,
}

/// Serializable form of [`Error`], rebuilt into the same variant on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Reply),
    Err(WireError),
}

impl From<std::result::Result<Reply, Error>> for Response {
    fn from(result: std::result::Result<Reply, Error>) -> Self {
        match result {
            Ok(reply) => Response::Ok(reply),
            Err(err) => Response::Err(WireError::from(err)),
        }
    }
}

fn error_message(err: &Error) -> String {
    match err {
        Error::Timeout(m)
        | Error::AlreadyClosed(m)
        | Error::Unsupported(m)
        | Error::WorkerUnavailable(m)
        | Error::Transport(m)
        | Error::Protocol(m)
        | Error::NotFound(m)
        | Error::InvalidInput(m)
        | Error::Internal(m) => m.clone(),
        other => other.to_string(),
    }
}

impl From<Error> for WireError {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Timeout(_) => WireErrorKind::Timeout,
            Error::NonZeroExit { .. } => WireErrorKind::NonZeroExit,
            Error::AlreadyClosed(_) => WireErrorKind::AlreadyClosed,
            Error::Unsupported(_) => WireErrorKind::Unsupported,
            Error::WorkerUnavailable(_) => WireErrorKind::WorkerUnavailable,
            Error::Transport(_) | Error::ResponseTimeout(_) => WireErrorKind::Transport,
            Error::Protocol(_) => WireErrorKind::Protocol,
            Error::NotFound(_) => WireErrorKind::NotFound,
            Error::InvalidInput(_) => WireErrorKind::InvalidInput,
            Error::Io(_) => WireErrorKind::Io,
            Error::Internal(_) => WireErrorKind::Internal,
        };
        WireError {
            kind,
            message: error_message(&err),
            exit_status: err.exit_status(),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        let m = err.message;
        match err.kind {
            WireErrorKind::Timeout => Error::Timeout(m),
            WireErrorKind::NonZeroExit => Error::NonZeroExit {
                status: err.exit_status.unwrap_or(-1),
            },
            WireErrorKind::AlreadyClosed => Error::AlreadyClosed(m),
            WireErrorKind::Unsupported => Error::Unsupported(m),
            WireErrorKind::WorkerUnavailable => Error::WorkerUnavailable(m),
            WireErrorKind::Transport => Error::Transport(m),
            WireErrorKind::Protocol => Error::Protocol(m),
            WireErrorKind::NotFound => Error::NotFound(m),
            WireErrorKind::InvalidInput => Error::InvalidInput(m),
            WireErrorKind::Io => Error::Io(io::Error::other(m)),
            WireErrorKind::Internal => Error::Internal(m),
        }
    }
}

/// Millisecond form of an optional timeout, as carried on the wire.
pub fn timeout_to_wire(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
}

pub fn timeout_from_wire(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms.map(Duration::from_millis)
}
