//! Exchange driver: one connection, one request, one response, one interval.
//!
//! The driver walks a fixed sequence of states and never goes back:
//!
//! ```text
//! Idle -> Connected -> Sent -> TxTimestamped -> Received -> RxTimestamped -> Done
//!   \________\___________\__________\_______________\____________\____> Failed
//! ```
//!
//! The connection lives on the driver's stack, so it is closed before any
//! error is handed back to the caller.

use std::{fmt, time::Duration};

use crate::{
    connection::{self, Connection},
    endpoint::Endpoint,
    error::ProbeError,
    timestamp::{self, TimestampKind, TimestampSource},
};

/// Default receive buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Default time to wait for the transmit timestamp on the error queue.
pub const DEFAULT_TX_TIMESTAMP_WAIT: Duration = Duration::from_millis(1000);

/// Default time a response that exactly fills the buffer is watched for more bytes.
pub const DEFAULT_OVERFLOW_GRACE: Duration = Duration::from_millis(20);

/// Progress of a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Connected,
    Sent,
    TxTimestamped,
    Received,
    RxTimestamped,
    Done,
    Failed,
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Settings for an exchange, fixed before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Timestamp strategy; never changes within an exchange.
    pub source: TimestampSource,
    /// Largest response accepted, in bytes.
    pub buffer_size: usize,
    /// Read/write deadline applied to the socket. `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
    /// How long to wait for the kernel transmit timestamp.
    pub tx_timestamp_wait: Duration,
    /// How long a response of exactly `buffer_size` bytes is watched for a
    /// trailing byte before it is accepted.
    pub overflow_grace: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            source: TimestampSource::Kernel,
            buffer_size: DEFAULT_BUFFER_SIZE,
            io_timeout: None,
            tx_timestamp_wait: DEFAULT_TX_TIMESTAMP_WAIT,
            overflow_grace: DEFAULT_OVERFLOW_GRACE,
        }
    }
}

/// Response payload and measured interval of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResult {
    payload_echoed: Vec<u8>,
    elapsed: Duration,
    source: TimestampKind,
}

impl ExchangeResult {
    pub fn payload_echoed(&self) -> &[u8] {
        &self.payload_echoed
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Interval between the send and receive timestamps, in nanoseconds.
    pub fn elapsed_nanos(&self) -> u128 {
        self.elapsed.as_nanos()
    }

    /// Clock both timestamps were taken from.
    pub fn source(&self) -> TimestampKind {
        self.source
    }

    #[cfg(test)]
    pub(crate) fn for_test(payload: &[u8], elapsed_ns: u64, source: TimestampKind) -> Self {
        Self {
            payload_echoed: payload.to_vec(),
            elapsed: Duration::from_nanos(elapsed_ns),
            source,
        }
    }
}

/// Drives exchanges with a fixed configuration.
///
/// Each call to [`Exchange::run`] is independent: it opens its own connection
/// and starts again from [`ExchangeState::Idle`].
#[derive(Debug)]
pub struct Exchange {
    config: ExchangeConfig,
    state: ExchangeState,
    prepare_socket: bool,
}

impl Exchange {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            config,
            state: ExchangeState::Idle,
            prepare_socket: true,
        }
    }

    /// Leaves the socket unconfigured so that the kernel never attaches timestamps.
    #[cfg(test)]
    fn without_socket_preparation(mut self) -> Self {
        self.prepare_socket = false;
        self
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// State reached by the most recent run.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Sends `payload` to `endpoint`, waits for the response and measures the interval.
    ///
    /// # Errors
    /// Returns the error of the first step that failed; the connection has
    /// already been closed when this returns.
    pub fn run(&mut self, endpoint: &Endpoint, payload: &[u8]) -> Result<ExchangeResult, ProbeError> {
        self.state = ExchangeState::Idle;
        match self.drive(endpoint, payload) {
            Ok(result) => Ok(result),
            Err(e) => {
                log::debug!(
                    "exchange with {} failed after state {}: {}",
                    endpoint,
                    self.state,
                    e
                );
                self.transition(ExchangeState::Failed);
                Err(e)
            }
        }
    }

    fn drive(&mut self, endpoint: &Endpoint, payload: &[u8]) -> Result<ExchangeResult, ProbeError> {
        if payload.is_empty() {
            return Err(ProbeError::EmptyPayload);
        }
        let source = self.config.source;

        let conn = connection::connect(endpoint)?;
        conn.set_io_timeout(self.config.io_timeout)?;
        if self.prepare_socket {
            source.prepare(&conn)?;
        }
        self.transition(ExchangeState::Connected);

        let pre_send = source.before_send()?;
        send_all_once(&conn, payload)?;
        self.transition(ExchangeState::Sent);

        let sent_at = source.capture_send_time(&conn, pre_send, self.config.tx_timestamp_wait)?;
        self.transition(ExchangeState::TxTimestamped);

        let capacity = self.config.buffer_size;
        let mut data = vec![0u8; capacity + 1];
        let mut control = vec![0u8; source.control_capacity()];
        let outcome = conn.receive(&mut data, &mut control, capacity)?;
        // The clock is read before waiting out the overflow grace period.
        let received_at = source.capture_receive_time(&control, &outcome);
        conn.check_overflow(&outcome, capacity, self.config.overflow_grace)?;
        self.transition(ExchangeState::Received);

        let received_at = received_at?;
        self.transition(ExchangeState::RxTimestamped);

        let elapsed = timestamp::elapsed(&sent_at, &received_at)?;
        drop(conn);
        self.transition(ExchangeState::Done);

        data.truncate(outcome.bytes);
        log::debug!(
            "exchange with {}: {} bytes echoed in {} ns ({})",
            endpoint,
            data.len(),
            elapsed.as_nanos(),
            received_at.source
        );
        Ok(ExchangeResult {
            payload_echoed: data,
            elapsed,
            source: received_at.source,
        })
    }

    fn transition(&mut self, next: ExchangeState) {
        log::trace!("exchange state {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Runs a single exchange with `config`.
pub fn run_exchange(
    config: ExchangeConfig,
    endpoint: &Endpoint,
    payload: &[u8],
) -> Result<ExchangeResult, ProbeError> {
    Exchange::new(config).run(endpoint, payload)
}

fn send_all_once(conn: &Connection, payload: &[u8]) -> Result<(), ProbeError> {
    let written = conn.send(payload).map_err(ProbeError::Write)?;
    if written != payload.len() {
        return Err(ProbeError::ShortWrite {
            written,
            expected: payload.len(),
        });
    }
    Ok(())
}
