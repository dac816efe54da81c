//! TCP RTT Probe - precise request/response timing over a TCP connection.
//!
//! A single exchange opens a connection, sends one payload and measures the
//! interval between the payload leaving the local network stack and the
//! response entering it. Kernel software timestamps (`SO_TIMESTAMPING`) are
//! used by default; a monotonic process clock is available as a fallback.
//!
//! # Usage
//!
//! Run the echo reflector:
//! ```bash
//! rtt-echo --local-addr 0.0.0.0 --local-port 12345
//! ```
//!
//! Time a request against it:
//! ```bash
//! rtt-probe 127.0.0.1 12345 hello
//! rtt-probe 127.0.0.1 12345 hello --strategy clock --count 100 -o json
//! rtt-probe 127.0.0.1 12345 --prefix 'flag{' --suffix '}' --sweep-length 32 -n 8
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("tcp-rtt-probe relies on Linux socket timestamping (SO_TIMESTAMPING, MSG_ERRQUEUE)");

/// Control message (ancillary data) decoding.
pub mod cmsg;
/// Command-line configuration and validation.
pub mod configuration;
/// Connection establishment and socket I/O.
pub mod connection;
/// Validated remote endpoints.
pub mod endpoint;
/// Error taxonomy of an exchange.
pub mod error;
/// Exchange driver state machine.
pub mod exchange;
/// TCP echo reflector.
pub mod reflector;
/// Formatting of single exchange results.
pub mod report;
/// Statistics over repeated exchanges.
pub mod stats;
/// Payload length sweeps.
pub mod sweep;
/// Timestamp sources and interval computation.
pub mod timestamp;

pub use endpoint::Endpoint;
pub use error::ProbeError;
pub use exchange::{run_exchange, Exchange, ExchangeConfig, ExchangeResult, ExchangeState};
pub use timestamp::{TimestampKind, TimestampRecord, TimestampSource};
