use crate::types::OutputMode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Persisted value or storage location absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Needs elevation (registry write, process termination).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Read-after-write never matched the target.
    #[error("{location} still reads {observed} after {attempts} attempts (wanted {expected})")]
    TransientMismatch {
        location: String,
        expected: OutputMode,
        observed: OutputMode,
        attempts: u32,
    },

    #[error("icon resource unavailable: {0}")]
    ResourceInit(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("{call} failed with code {code:#x}")]
    Os { call: &'static str, code: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[cfg(windows)]
    pub fn os(call: &'static str, e: &windows::core::Error) -> Self {
        Self::Os {
            call,
            code: e.code().0 as u32,
        }
    }
}
