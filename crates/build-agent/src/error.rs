use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed completion file {path}: {reason}")]
    MalformedCompletion { path: PathBuf, reason: String },

    #[error("Invalid job name {0:?}")]
    InvalidJobName(String),

    #[error("Timed out after {timeout:?} waiting for {path}")]
    Timeout { timeout: Duration, path: PathBuf },

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Process exit code the caller reports for this failure
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::MalformedCompletion { .. } | Error::InvalidJobName(_) => 2,
            Error::Timeout { .. } => 124,
            Error::Io { .. } | Error::Launch { .. } => 1,
        }
    }
}

/// Attach the offending path to an I/O error
pub(crate) fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
