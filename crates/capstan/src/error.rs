//! Errors surfaced by the synchronous manager operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Invalid request: bad tag name, duplicate tag, reserved converter
    /// name, dependency cycle, and friends.
    #[error("{0}")]
    Config(String),

    /// The named tag, converter or stream does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A subprocess produced a malformed frame; the worker stays invalid
    /// until it is restarted.
    #[error("{0}")]
    Protocol(String),

    /// The query in a tag definition did not parse.
    #[error(transparent)]
    Parse(#[from] streamidx::query::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The manager actor is gone (shut down or crashed).
    #[error("manager is not running")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ManagerError>;

pub(crate) fn config_err<T>(msg: impl Into<String>) -> Result<T> {
    Err(ManagerError::Config(msg.into()))
}

pub(crate) fn not_found<T>(msg: impl Into<String>) -> Result<T> {
    Err(ManagerError::NotFound(msg.into()))
}

impl ManagerError {
    /// Collapses an internal `anyhow` chain into the io error kind.
    pub(crate) fn from_anyhow(e: anyhow::Error) -> Self {
        match e.downcast::<std::io::Error>() {
            Ok(io) => ManagerError::Io(io),
            Err(e) => ManagerError::Io(std::io::Error::other(format!("{e:#}"))),
        }
    }
}
