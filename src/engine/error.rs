use ulid::Ulid;

use crate::directory::LookupError;
use crate::model::{InvalidWindow, UnknownToken};

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRange,
    InvalidInput,
    Conflict,
    NotFound,
    ValidationFailed,
    Unavailable,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidRange(InvalidWindow),
    InvalidInput(String),
    /// Ids of the existing bookings the candidate collides with.
    Conflict(Vec<Ulid>),
    NotFound(Ulid),
    ValidationFailed {
        failures: usize,
    },
    Unavailable(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRange(_) => ErrorKind::InvalidRange,
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => ErrorKind::InvalidInput,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            EngineError::Unavailable(_) | EngineError::WalError(_) => ErrorKind::Unavailable,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(e) => write!(f, "invalid range: {e}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Conflict(ids) => {
                write!(f, "booking conflicts with existing booking(s):")?;
                for id in ids {
                    write!(f, " {id}")?;
                }
                Ok(())
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::ValidationFailed { failures } => {
                write!(f, "validation failed for {failures} booking(s) in batch")
            }
            EngineError::Unavailable(e) => write!(f, "dependency unavailable: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<InvalidWindow> for EngineError {
    fn from(e: InvalidWindow) -> Self {
        EngineError::InvalidRange(e)
    }
}

impl From<UnknownToken> for EngineError {
    fn from(e: UnknownToken) -> Self {
        EngineError::InvalidInput(e.to_string())
    }
}

impl From<LookupError> for EngineError {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::NotFound(id) => EngineError::NotFound(id),
            LookupError::Unavailable(msg) => EngineError::Unavailable(msg),
        }
    }
}
