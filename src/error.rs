use std::io;

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bridging the host and the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid TUN file descriptor")]
    InvalidTunFd,

    #[error("invalid TUN address {address}: {reason}")]
    InvalidTunAddress { address: String, reason: String },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("envelope decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
