//! Build orchestration for Artisan CI.
//!
//! The `Builder` drives one job through its lifecycle on one worker; the
//! `JobQueue` pairs waiting jobs with idle workers and runs builds as tasks.

pub mod builder;
pub mod queue;

pub use builder::{BuildEnvironment, BuildResult, BuildStep, Builder, BuilderConfig};
pub use queue::JobQueue;
