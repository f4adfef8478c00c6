//! Core worker and command abstractions for the Artisan CI job runner.
//!
//! This crate contains:
//! - The `Worker` and `Command` traits every backend implements
//! - `ByteStream`, the buffer commands drain their output into
//! - Worker-relative path and environment variable expansion
//! - The `Job` lifecycle trait and build source types
//! - Wire protocol types shared by the remote proxy and the agent

pub mod command;
pub mod deadline;
pub mod error;
pub mod id;
pub mod job;
pub mod path;
pub mod platform;
pub mod protocol;
pub mod stream;
pub mod worker;

pub use command::{
    Command, CommandLine, CommandOutput, CommandState, OutputStream, WaitOptions,
    minimum_environment,
};
pub use error::{Error, Result};
pub use id::ResourceId;
pub use job::{BuildSource, BuildTrigger, Job, ScriptJob};
pub use platform::Platform;
pub use stream::ByteStream;
pub use worker::{FileKind, FileStat, OpenMode, Worker, WorkerFile};
