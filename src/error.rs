//! Error types.
//!
//! Each variant corresponds to one user-visible outcome; `main` dispatches on
//! the variant to pick the process exit code, so leaf code must pick the
//! variant that matches what the user can do about the failure.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MacblockError>;

#[derive(Debug, Error)]
pub enum MacblockError {
    /// Bad input: unknown source, invalid domain, malformed duration.
    #[error("{0}")]
    User(String),

    /// state.json is unreadable or malformed; the administrator must repair
    /// or delete it.
    #[error("{0}")]
    StateCorrupt(String),

    /// Not macOS, or a required system binary is missing.
    #[error("{0}")]
    Platform(String),

    /// Root required but absent, or vice versa.
    #[error("{0}")]
    Privilege(String),

    /// Port 53 taken by a foreign process, or a competing install.
    #[error("{0}")]
    Conflict(String),

    /// Timeout, nonzero subprocess, unreachable network. Retried inside the
    /// daemon; surfaced as-is from the CLI.
    #[error("{0}")]
    TransientIo(String),

    /// Some services applied, some failed.
    #[error("partial failure: {}", .failures.join("; "))]
    PartialFailure { failures: Vec<String> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MacblockError {
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Platform(_) | Self::Privilege(_) => 2,
            _ => 1,
        }
    }
}
