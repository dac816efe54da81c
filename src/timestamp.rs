//! Timestamp sources for measuring the send/receive interval of an exchange.
//!
//! Two strategies are supported and selected once per exchange:
//!
//! - [`TimestampSource::Kernel`] asks the kernel for software TX/RX timestamps
//!   (`SO_TIMESTAMPING`). The send timestamp is read back from the socket error
//!   queue, the receive timestamp arrives as ancillary data on the data read.
//! - [`TimestampSource::ProcessClock`] reads `CLOCK_MONOTONIC_RAW` immediately
//!   before the send call and immediately after the receive call returns.
//!
//! Records from different clocks are never subtracted from each other.

use std::{fmt, io, time::Duration};

use nix::{
    sys::socket::{setsockopt, sockopt, TimestampingFlag},
    time::{clock_gettime, ClockId},
};
use thiserror::Error;

use crate::{
    cmsg::{self, DecodeError},
    connection::{Connection, RecvOutcome},
    error::ProbeError,
};

/// Size of the control buffer handed to `recvmsg(2)` for timestamp records.
pub const CONTROL_BUFFER_LEN: usize = 1024;

/// Scratch space for the payload copy the kernel may attach to an error queue message.
const ERRQUEUE_DATA_LEN: usize = 512;

/// Where a timestamp was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampKind {
    /// Kernel networking stack software timestamp (`CLOCK_REALTIME`).
    KernelSoftware,
    /// NIC hardware timestamp (PHC clock).
    KernelHardware,
    /// Process-local monotonic clock read.
    ProcessClock,
}

impl fmt::Display for TimestampKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TimestampKind::KernelSoftware => write!(f, "kernel-software"),
            TimestampKind::KernelHardware => write!(f, "kernel-hardware"),
            TimestampKind::ProcessClock => write!(f, "process-clock"),
        }
    }
}

/// A single captured instant, tagged with the clock it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampRecord {
    /// Time since the epoch of the record's clock, nanosecond resolution.
    pub captured_at: Duration,
    pub source: TimestampKind,
}

impl TimestampRecord {
    pub fn new(captured_at: Duration, source: TimestampKind) -> Self {
        Self {
            captured_at,
            source,
        }
    }
}

/// Errors that can occur when computing an interval between two records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElapsedError {
    /// The records come from different clocks.
    #[error("Cannot subtract a {send} timestamp from a {receive} timestamp")]
    ClockDomainMismatch {
        send: TimestampKind,
        receive: TimestampKind,
    },
    /// The receive timestamp precedes the send timestamp.
    #[error("Receive timestamp precedes send timestamp by {by_ns} ns")]
    NegativeInterval { by_ns: u128 },
}

/// Reasons a timestamp could not be obtained.
#[derive(Error, Debug)]
pub enum TimestampUnavailable {
    /// No `SCM_TIMESTAMPING` record was attached to the read.
    #[error("no timestamping record in ancillary data")]
    Absent,
    /// The ancillary data could not be decoded.
    #[error("malformed ancillary data: {0}")]
    Malformed(#[from] DecodeError),
    /// The error queue stayed empty for the whole wait.
    #[error("send timestamp not available after {0:?}")]
    NotReady(Duration),
    /// The kernel dropped ancillary data because the control buffer was too small.
    #[error("ancillary data truncated")]
    ControlTruncated,
    /// Reading the error queue failed.
    #[error("error queue read failed: {0}")]
    ErrorQueue(#[source] io::Error),
}

/// Computes `receive - send`.
///
/// # Errors
/// Returns `ElapsedError::ClockDomainMismatch` if the records come from different
/// clocks and `ElapsedError::NegativeInterval` if `receive` is earlier than `send`.
/// A negative interval is reported, never clamped to zero.
///
/// ```
/// use std::time::Duration;
/// use tcp_rtt_probe::timestamp::{elapsed, TimestampKind, TimestampRecord};
///
/// let send = TimestampRecord::new(Duration::new(10, 500), TimestampKind::ProcessClock);
/// let recv = TimestampRecord::new(Duration::new(10, 2_500), TimestampKind::ProcessClock);
/// assert_eq!(elapsed(&send, &recv).unwrap(), Duration::from_nanos(2_000));
/// ```
pub fn elapsed(
    send: &TimestampRecord,
    receive: &TimestampRecord,
) -> Result<Duration, ElapsedError> {
    if send.source != receive.source {
        return Err(ElapsedError::ClockDomainMismatch {
            send: send.source,
            receive: receive.source,
        });
    }
    receive
        .captured_at
        .checked_sub(send.captured_at)
        .ok_or_else(|| ElapsedError::NegativeInterval {
            by_ns: (send.captured_at - receive.captured_at).as_nanos(),
        })
}

/// Reads the highest resolution monotonic clock available to the process.
pub fn process_clock_now() -> Result<TimestampRecord, ProbeError> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC_RAW).map_err(|e| ProbeError::Clock(e.into()))?;
    Ok(TimestampRecord::new(
        Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32),
        TimestampKind::ProcessClock,
    ))
}

/// Strategy used to timestamp an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TimestampSource {
    /// Kernel software timestamps via `SO_TIMESTAMPING`.
    #[default]
    Kernel,
    /// Monotonic clock reads around the blocking calls.
    #[value(name = "clock")]
    ProcessClock,
}

impl TimestampSource {
    /// Configures `conn` for this strategy. Must run before any data is sent.
    pub fn prepare(self, conn: &Connection) -> Result<(), ProbeError> {
        match self {
            TimestampSource::Kernel => {
                let flags = TimestampingFlag::SOF_TIMESTAMPING_TX_SOFTWARE
                    | TimestampingFlag::SOF_TIMESTAMPING_RX_SOFTWARE
                    | TimestampingFlag::SOF_TIMESTAMPING_SOFTWARE;
                setsockopt(conn, sockopt::Timestamping, &flags)
                    .map_err(|e| ProbeError::TimestampConfig(e.into()))?;
                log::debug!("enabled software timestamping on {}", conn.peer());
                Ok(())
            }
            TimestampSource::ProcessClock => Ok(()),
        }
    }

    /// Clock read taken right before the send call, if this strategy uses one.
    pub fn before_send(self) -> Result<Option<TimestampRecord>, ProbeError> {
        match self {
            TimestampSource::Kernel => Ok(None),
            TimestampSource::ProcessClock => process_clock_now().map(Some),
        }
    }

    /// Produces the send-side record once the payload has been handed to the kernel.
    ///
    /// For the kernel strategy this waits up to `wait` for the error queue to
    /// carry the transmit timestamp; an empty queue is an error, not a hang.
    pub fn capture_send_time(
        self,
        conn: &Connection,
        pre_send: Option<TimestampRecord>,
        wait: Duration,
    ) -> Result<TimestampRecord, ProbeError> {
        match (self, pre_send) {
            (TimestampSource::ProcessClock, Some(record)) => Ok(record),
            (TimestampSource::ProcessClock, None) => process_clock_now(),
            (TimestampSource::Kernel, _) => Ok(read_tx_timestamp(conn, wait)?),
        }
    }

    /// Control buffer capacity the data read needs for this strategy.
    pub fn control_capacity(self) -> usize {
        match self {
            TimestampSource::Kernel => CONTROL_BUFFER_LEN,
            TimestampSource::ProcessClock => 0,
        }
    }

    /// Produces the receive-side record from the data read that just returned.
    pub fn capture_receive_time(
        self,
        control: &[u8],
        outcome: &RecvOutcome,
    ) -> Result<TimestampRecord, ProbeError> {
        match self {
            TimestampSource::ProcessClock => process_clock_now(),
            TimestampSource::Kernel => {
                if outcome.control_truncated {
                    return Err(TimestampUnavailable::ControlTruncated.into());
                }
                Ok(cmsg::software_timestamp(&control[..outcome.control_len])?)
            }
        }
    }
}

fn read_tx_timestamp(
    conn: &Connection,
    wait: Duration,
) -> Result<TimestampRecord, TimestampUnavailable> {
    if !conn
        .wait_error_queue(wait)
        .map_err(TimestampUnavailable::ErrorQueue)?
    {
        return Err(TimestampUnavailable::NotReady(wait));
    }

    let mut data = [0u8; ERRQUEUE_DATA_LEN];
    let mut control = [0u8; CONTROL_BUFFER_LEN];
    let outcome = conn
        .recv_error_queue(&mut data, &mut control)
        .map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock => TimestampUnavailable::NotReady(wait),
            _ => TimestampUnavailable::ErrorQueue(e),
        })?;

    if outcome.control_truncated {
        return Err(TimestampUnavailable::ControlTruncated);
    }
    cmsg::software_timestamp(&control[..outcome.control_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(secs: u64, nanos: u32, source: TimestampKind) -> TimestampRecord {
        TimestampRecord::new(Duration::new(secs, nanos), source)
    }

    #[test]
    fn test_elapsed_positive() {
        let send = record(1_700_000_000, 999_999_000, TimestampKind::KernelSoftware);
        let recv = record(1_700_000_001, 1_500, TimestampKind::KernelSoftware);
        assert_eq!(elapsed(&send, &recv).unwrap(), Duration::from_nanos(2_500));
    }

    #[test]
    fn test_elapsed_zero() {
        let send = record(5, 5, TimestampKind::ProcessClock);
        assert_eq!(elapsed(&send, &send).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_elapsed_negative_is_reported() {
        let send = record(10, 1_000, TimestampKind::KernelSoftware);
        let recv = record(10, 400, TimestampKind::KernelSoftware);
        assert_eq!(
            elapsed(&send, &recv),
            Err(ElapsedError::NegativeInterval { by_ns: 600 })
        );
    }

    #[test]
    fn test_elapsed_rejects_mixed_clocks() {
        let send = record(10, 0, TimestampKind::KernelSoftware);
        let recv = record(20, 0, TimestampKind::ProcessClock);
        assert_eq!(
            elapsed(&send, &recv),
            Err(ElapsedError::ClockDomainMismatch {
                send: TimestampKind::KernelSoftware,
                receive: TimestampKind::ProcessClock,
            })
        );
    }

    #[test]
    fn test_process_clock_is_monotonic() {
        let a = process_clock_now().unwrap();
        let b = process_clock_now().unwrap();
        assert_eq!(a.source, TimestampKind::ProcessClock);
        assert!(b.captured_at >= a.captured_at);
        assert!(elapsed(&a, &b).is_ok());
    }

    #[test]
    fn test_strategy_buffers() {
        assert_eq!(TimestampSource::ProcessClock.control_capacity(), 0);
        assert_eq!(TimestampSource::Kernel.control_capacity(), CONTROL_BUFFER_LEN);
        assert!(TimestampSource::Kernel.before_send().unwrap().is_none());
        assert!(TimestampSource::ProcessClock.before_send().unwrap().is_some());
    }

    #[test]
    fn test_kernel_receive_without_record_is_unavailable() {
        let outcome = RecvOutcome {
            bytes: 5,
            control_len: 0,
            control_truncated: false,
        };
        let err = TimestampSource::Kernel
            .capture_receive_time(&[], &outcome)
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::TimestampUnavailable(TimestampUnavailable::Absent)
        ));
    }

    #[test]
    fn test_kernel_receive_truncated_control() {
        let outcome = RecvOutcome {
            bytes: 5,
            control_len: 0,
            control_truncated: true,
        };
        let err = TimestampSource::Kernel
            .capture_receive_time(&[], &outcome)
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::TimestampUnavailable(TimestampUnavailable::ControlTruncated)
        ));
    }
}
