use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive entry '{entry}' resolves outside {destination}")]
    PathTraversal { entry: PathBuf, destination: PathBuf },
    #[error("failed to decompress {archive}: {source}")]
    Decompress {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
