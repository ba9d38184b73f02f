// The error taxonomy for the bundling core.
//
// Every fallible operation in this crate returns `Result<T, BundleError>`. Callers
// that wrap this core (a CLI, a packaging step) are expected to match on these
// variants rather than parse message text.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("{path}: missing ELF magic")]
    NotElf { path: PathBuf },

    #[error("{path}: malformed ELF ({reason})")]
    MalformedElf { path: PathBuf, reason: String },

    #[error("malformed ldd output: {line:?}")]
    MalformedLddOutput { line: String },

    #[error("failed to trace dependencies of {binary}: {reason}")]
    TraceFailed { binary: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("symlink conflict: {logical_path} already claims a different payload")]
    Conflict { logical_path: String },
}

pub type Result<T> = std::result::Result<T, BundleError>;

impl BundleError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BundleError::Io {
            path: path.into(),
            source,
        }
    }
}
