use std::path::PathBuf;

/// Errors that can occur in readpipe.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("I/O error: {source} ({path})")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("reference parsing error: {0}")]
    Reference(String),

    #[error("index error: {0}")]
    Index(String),

    #[error(
        "reference of {required} bases does not fit in a single index partition \
         of {limit} bytes; multi-partition indices are not supported"
    )]
    IndexCapacity { required: u64, limit: u64 },

    #[error("alignment error: {0}")]
    Alignment(String),

    #[error("pipeline stage '{stage}' failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },
}

impl Error {
    /// Convenience for wrapping an `io::Error` with a path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: path.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            source: err,
            path: PathBuf::from("<unknown>"),
        }
    }
}
