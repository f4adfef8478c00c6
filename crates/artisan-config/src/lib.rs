//! KDL configuration parsing for Artisan CI.
//!
//! A project file (`artisan.kdl`) declares the workers a project can use,
//! the jobs it runs and optional agent and build directory settings.

pub mod error;
pub mod project;

pub use error::{ConfigError, ConfigResult};
pub use project::{
    AgentConfig, BuildSettings, ProjectConfig, WorkerConfig, WorkerKind, load_project,
    parse_project,
};
