//! Error types for the brick cache

use thiserror::Error;

use super::types::BrickKey;
use crate::auxiliary::AuxKind;

/// Main error type for the cache
#[derive(Debug, Error)]
pub enum Error {
    #[error("allocation of {bytes} bytes for brick {key} failed: {reason}")]
    AllocationFailure {
        key: BrickKey,
        bytes: usize,
        reason: String,
    },

    #[error("decoding brick {key} failed: {reason}")]
    BrickDecodeFailed { key: BrickKey, reason: String },

    #[error("brick {0} is outside the declared grid")]
    OutOfRangeKey(BrickKey),

    #[error("memory budget of {budget_bytes} bytes cannot hold the minimum working set of {minimum_bytes} bytes")]
    BudgetExceededByReservation {
        budget_bytes: u64,
        minimum_bytes: u64,
    },

    #[error("invalid pyramid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("{kind:?} brick {key} requires its primary brick to have been resident")]
    AuxChannelUnavailable { kind: AuxKind, key: BrickKey },

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed classification of [`Error`] for callers that branch on the failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AllocationFailure,
    BrickDecodeFailed,
    OutOfRangeKey,
    BudgetExceededByReservation,
    InvalidDescriptor,
    InvalidConfig,
    AuxChannelUnavailable,
    Gpu,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            Error::BrickDecodeFailed { .. } => ErrorKind::BrickDecodeFailed,
            Error::OutOfRangeKey(_) => ErrorKind::OutOfRangeKey,
            Error::BudgetExceededByReservation { .. } => ErrorKind::BudgetExceededByReservation,
            Error::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::AuxChannelUnavailable { .. } => ErrorKind::AuxChannelUnavailable,
            Error::Gpu(_) => ErrorKind::Gpu,
            Error::Io(_) | Error::Json(_) => ErrorKind::Io,
        }
    }

    /// Errors the cache absorbs locally while rendering continues
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AllocationFailure
                | ErrorKind::BrickDecodeFailed
                | ErrorKind::OutOfRangeKey
                | ErrorKind::AuxChannelUnavailable
        )
    }

    /// Brick the error refers to, if any
    pub fn key(&self) -> Option<BrickKey> {
        match self {
            Error::AllocationFailure { key, .. }
            | Error::BrickDecodeFailed { key, .. }
            | Error::AuxChannelUnavailable { key, .. }
            | Error::OutOfRangeKey(key) => Some(*key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_recoverable() {
        let key = BrickKey::new(0, 1, 2, 3);
        let err = Error::BrickDecodeFailed { key, reason: "short buffer".into() };
        assert_eq!(err.kind(), ErrorKind::BrickDecodeFailed);
        assert!(err.is_recoverable());
        assert_eq!(err.key(), Some(key));

        let fatal = Error::InvalidDescriptor("zero levels".into());
        assert!(!fatal.is_recoverable());
        assert_eq!(fatal.key(), None);
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("missing"));
    }
}
