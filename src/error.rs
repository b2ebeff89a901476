//! Error types for the fabric.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors reported by the fabric, its modules and the control channel.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is already in use")]
    Conflict(String),

    #[error("invalid input: {0}")]
    BadInput(String),

    #[error("no IP left in the DHCP pool")]
    PoolExhausted,

    #[error("unsupported message: {0}")]
    Unsupported(String),

    #[error("required layer missing: {0}")]
    ParseError(String),

    #[error("packet serialization failed: {0}")]
    SerializeError(String),

    #[error("{0} is not a usable guest address")]
    BadIp(Ipv4Addr),

    #[error("guest already has a learned IP")]
    AlreadyLearned,

    #[error("no DNS answers for this query")]
    NoAnswer,

    #[error("listener already stopped")]
    AlreadyStopped,

    #[error("failed to stop some listeners: {0}")]
    Teardown(String),

    #[error("{0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, Error>;
