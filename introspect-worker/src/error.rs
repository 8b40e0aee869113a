use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to read manifest {path:?}: {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path:?}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("model {0} is declared more than once")]
    DuplicateModel(String),

    #[error("route {controller}#{action} is declared more than once")]
    DuplicateRoute { controller: String, action: String },
}

pub type Result<T> = std::result::Result<T, WorkerError>;
