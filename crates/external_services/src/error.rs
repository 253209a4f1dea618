//! Error types for external-service clients.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The internal API key was rejected by the control plane. This is
    /// a deployment configuration problem, not a per-session outcome.
    #[error("internal API key rejected by control plane")]
    ApiKeyRejected,

    /// The control plane answered with a status we do not understand.
    #[error("unexpected control plane status: {0}")]
    UnexpectedStatus(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, Error>;
