//! Operating system families a worker can run on.

use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[display("linux")]
    Linux,
    #[display("macos")]
    MacOs,
    #[display("windows")]
    Windows,
    #[display("freebsd")]
    FreeBsd,
    #[display("{_0}")]
    Other(String),
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            "freebsd" => Platform::FreeBsd,
            other => Platform::Other(other.to_string()),
        }
    }

    /// Classify the output of `uname -s` on a remote host.
    pub fn from_uname(output: &str) -> Self {
        let name = output.trim().to_ascii_lowercase();
        match name.as_str() {
            "linux" => Platform::Linux,
            "darwin" => Platform::MacOs,
            "freebsd" => Platform::FreeBsd,
            n if n.starts_with("mingw")
                || n.starts_with("msys")
                || n.starts_with("cygwin")
                || n.starts_with("windows") =>
            {
                Platform::Windows
            }
            _ => Platform::Other(name),
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    pub fn is_posix(&self) -> bool {
        !self.is_windows()
    }

    pub fn separator(&self) -> char {
        if self.is_windows() { '\\' } else { '/' }
    }
}
