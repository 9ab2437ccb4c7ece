use std::io;

pub type AcornResult<T> = Result<T, AcornError>;

/// Error surface shared across the workspace. Kinds are stable; messages are
/// informational only.
#[derive(Debug, thiserror::Error)]
pub enum AcornError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not supported by this trunk: {0}")]
    Unsupported(&'static str),
    #[error("denied by root policy: {0}")]
    PolicyDenied(String),
    #[error("conflict blocked: {0}")]
    ConflictBlocked(String),
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
    #[error("permanent i/o failure: {0}")]
    PermanentIo(String),
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),
    #[error("missing id: {0}")]
    MissingId(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl AcornError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AcornError::TransientIo(_) | AcornError::PeerUnavailable(_))
    }
}

impl From<io::Error> for AcornError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof => AcornError::TransientIo(err.to_string()),
            _ => AcornError::PermanentIo(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AcornError {
    fn from(err: serde_json::Error) -> Self {
        AcornError::Serialization(err.to_string())
    }
}
