use std::io;

use thiserror::Error;

use crate::{
    connection::{ConnectionError, ReadError},
    endpoint::EndpointError,
    timestamp::{ElapsedError, TimestampUnavailable},
};

/// Errors that end a timing exchange. None of them are retried.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] EndpointError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The socket rejected the `SO_TIMESTAMPING` request.
    #[error("Socket rejected the timestamping request: {0}")]
    TimestampConfig(#[source] io::Error),
    #[error("Refusing to send an empty payload")]
    EmptyPayload,
    /// The kernel accepted fewer bytes than requested. Not resumed.
    #[error("Short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },
    #[error("Send failed: {0}")]
    Write(#[source] io::Error),
    #[error("Read failed: {0}")]
    Read(#[from] ReadError),
    #[error("Timestamp unavailable: {0}")]
    TimestampUnavailable(#[from] TimestampUnavailable),
    #[error("Invalid interval: {0}")]
    Elapsed(#[from] ElapsedError),
    #[error("Cannot read the process clock: {0}")]
    Clock(#[source] io::Error),
}
