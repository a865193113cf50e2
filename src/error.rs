//! Error handling (ambient stack): a single `thiserror`
//! enum for every fallible operation the crate exposes, one flat error
//! type per crate rather than a per-module error hierarchy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("worker thread for {0} terminated unexpectedly")]
    WorkerDied(&'static str),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("PRD chain exceeded the maximum of {max} descriptors")]
    PrdChainTooLong { max: usize },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
