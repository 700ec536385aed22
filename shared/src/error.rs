//! Error types for the network broker.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Relay match error: {0}")]
    RelayMatch(String),

    #[error("Heartbeat error: {0}")]
    Heartbeat(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Timeout")]
    Timeout,
}
