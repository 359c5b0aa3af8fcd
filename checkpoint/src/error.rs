use std::{error::Error, fmt, io};

/// The checkpoint module's result type.
pub type Result<T> = std::result::Result<T, CheckpointErr>;

/// Checkpoint store failures.
#[derive(Debug)]
pub enum CheckpointErr {
    Io(io::Error),
    Manifest(serde_json::Error),
    Tensor(safetensors::tensor::SafeTensorError),
    /// The requested checkpoint id (or "latest" with an empty store) does
    /// not exist.
    NotFound(String),
}

impl fmt::Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErr::Io(e) => write!(f, "io error: {e}"),
            CheckpointErr::Manifest(e) => write!(f, "manifest error: {e}"),
            CheckpointErr::Tensor(e) => write!(f, "state blob error: {e}"),
            CheckpointErr::NotFound(id) => write!(f, "checkpoint not found: {id}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointErr::Io(e) => Some(e),
            CheckpointErr::Manifest(e) => Some(e),
            CheckpointErr::Tensor(e) => Some(e),
            CheckpointErr::NotFound(_) => None,
        }
    }
}

impl From<io::Error> for CheckpointErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for CheckpointErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Manifest(value)
    }
}

impl From<safetensors::tensor::SafeTensorError> for CheckpointErr {
    fn from(value: safetensors::tensor::SafeTensorError) -> Self {
        Self::Tensor(value)
    }
}
