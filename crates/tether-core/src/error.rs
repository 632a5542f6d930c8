//! Error types for the Tether engine

use std::io;

/// Result type for engine operations
pub type TetherResult<T> = Result<T, TetherError>;

/// Broad category of a [`TetherError`]
///
/// Callers branch on the kind rather than on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Precondition violated by the caller (absent selection, bad weight, ...)
    InvalidArgument,
    /// Key or registration already present
    AlreadyExists,
    /// Key, queue or selection not registered
    NotFound,
    /// Operation not allowed in the current structure or state
    InvalidState,
    /// Run loop, pool or timer service already closed
    Closed,
    /// Underlying channel or OS failure
    Io,
}

/// Errors that can occur in engine operations
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Invalid argument supplied by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A pipeline key or similar registration already exists
    #[error("`{0}` already exists")]
    AlreadyExists(String),

    /// A pipeline key, queue or selection was not found
    #[error("`{0}` not found")]
    NotFound(String),

    /// The structure does not allow this operation
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The target was closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Failed to spawn a run loop or timer thread
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Channel I/O failure
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl TetherError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TetherError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TetherError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            TetherError::NotFound(_) => ErrorKind::NotFound,
            TetherError::InvalidState(_) => ErrorKind::InvalidState,
            TetherError::Closed(_) => ErrorKind::Closed,
            TetherError::Spawn { .. } | TetherError::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for a missing registration
    #[inline]
    pub fn not_found(what: impl Into<String>) -> Self {
        TetherError::NotFound(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = TetherError::AlreadyExists("codec".into());
        assert_eq!(format!("{}", e), "`codec` already exists");

        let e = TetherError::Closed("run loop");
        assert_eq!(format!("{}", e), "run loop is closed");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(TetherError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(
            TetherError::InvalidArgument("weight").kind(),
            ErrorKind::InvalidArgument
        );
        let io_err: TetherError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(io_err.kind(), ErrorKind::Io);
    }
}
