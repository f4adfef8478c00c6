//! Worker backends for Artisan CI.
//!
//! Provides the `Worker` implementations jobs run on:
//! - Local (child processes of the controller)
//! - SSH (one `ssh` client process per command)
//! - Remote (proxy to an `artisan-agent` over TCP)

pub mod local;
pub mod process;
pub mod remote;
pub mod ssh;

pub use local::{LocalFile, LocalWorker};
pub use process::{ProcessBackend, ProcessCommand};
pub use remote::{RemoteCommand, RemoteFile, RemoteWorker, frame_codec};
pub use ssh::{SshConfig, SshWorker};
