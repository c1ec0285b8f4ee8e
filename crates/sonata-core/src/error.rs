use std::io;
use thiserror::Error;

/// Central error type for the Sonata engine.
///
/// Only setup and loop-level failures surface here. Everything that goes
/// wrong while serving a single request is expressed as an
/// [`Outcome`](crate::conn::Outcome) and answered with a status code.
#[derive(Debug, Error)]
pub enum SonataError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Every connection slot is in use.
    #[error("connection slab is full")]
    SlabFull,

    /// The worker pool could not be started.
    #[error("worker pool error: {0}")]
    Pool(String),
}

pub type SonataResult<T> = Result<T, SonataError>;
