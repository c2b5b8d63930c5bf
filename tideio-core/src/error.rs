use thiserror::Error;

pub type Result<T> = std::result::Result<T, TideError>;

#[derive(Error, Debug)]
pub enum TideError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("container not empty: {0}")]
    NotEmpty(String),

    #[error("checksum mismatch: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TideError {
    /// Stable negative code carried in a completed event's return field.
    /// Zero is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            TideError::InvalidArgument(_) => -1,
            TideError::NotFound(_) => -2,
            TideError::PermissionDenied(_) => -3,
            TideError::StateConflict(_) => -4,
            TideError::NotEmpty(_) => -5,
            TideError::ChecksumMismatch { .. } => -6,
            TideError::Transport(_) => -7,
            TideError::Config(_) => -8,
            TideError::Io(_) => -9,
            TideError::Catalog(_) => -10,
            TideError::Serialization(_) => -11,
            TideError::Internal(_) => -12,
        }
    }
}
