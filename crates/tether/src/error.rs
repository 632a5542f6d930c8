//! Facade error type

use tether_core::TetherError;
use tether_runtime::ConfigError;

/// Result type of facade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or running a [`Runtime`](crate::Runtime)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Engine operation failed
    #[error(transparent)]
    Engine(#[from] TetherError),
}
