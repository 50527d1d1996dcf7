use std::io;

use thiserror::Error;

/// Invalid configuration input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
    #[error("{0} must be at least {1}")]
    TooSmall(&'static str, u64),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create readiness multiplexer: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to register tun device: {0}")]
    RegisterTun(#[source] io::Error),

    #[error("failed to prepare tun device: {0}")]
    TunSetup(#[source] io::Error),

    #[error("tun device read failed: {0}")]
    TunRead(#[source] io::Error),

    #[error("tun device returned end of file")]
    TunClosed,

    #[error("waiting for readiness failed: {0}")]
    Wait(#[source] io::Error),
}

impl EngineError {
    /// Whether the error ends the engine instance (as opposed to rejecting its construction
    /// input).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Config(_))
    }
}
