use std::{
    io::{self, BufRead},
    time::Duration,
};

pub use clap::Parser;
use thiserror::Error;

use crate::{
    endpoint::{Endpoint, EndpointError},
    exchange::{ExchangeConfig, DEFAULT_BUFFER_SIZE},
    stats::OutputFormat,
    sweep::SweepPlan,
    timestamp::TimestampSource,
};

/// Errors found while validating the command line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Buffer size must be greater than zero")]
    ZeroBufferSize,
    #[error("Count must be greater than zero")]
    ZeroCount,
    #[error("Transmit timestamp wait must be greater than zero")]
    ZeroTxWait,
    #[error("Give the payload either as an argument or with --stdin, not both")]
    AmbiguousPayload,
    #[error("No payload given; pass it as an argument or use --stdin")]
    MissingPayload,
    #[error("Sweep length must be greater than zero")]
    ZeroSweepLength,
    #[error("A length sweep builds its own payloads; drop the payload argument and --stdin")]
    PayloadWithSweep,
    #[error("Fill character {0:?} is not a single ASCII byte")]
    NonAsciiFill(char),
}

/// Command line of the timing client.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Precise TCP request/response timing", long_about = None)]
pub struct Configuration {
    /// Address of the responding server (IPv4 or IPv6 literal)
    pub remote_addr: String,
    /// TCP port of the responding server
    #[arg(allow_negative_numbers = true)]
    pub remote_port: i64,
    /// Request payload
    pub payload: Option<String>,
    /// Read the payload as one line from standard input
    #[arg(long)]
    pub stdin: bool,
    /// Timestamp strategy
    #[arg(short, long, value_enum, default_value_t = TimestampSource::Kernel)]
    pub strategy: TimestampSource,
    /// Number of independent exchanges to run (per payload length when sweeping)
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,
    /// Bytes sent before the payload
    #[arg(long, default_value = "")]
    pub prefix: String,
    /// Bytes sent after the payload
    #[arg(long, default_value = "")]
    pub suffix: String,
    /// Time payloads of 1..=N fill characters instead of a fixed payload
    #[arg(long)]
    pub sweep_length: Option<usize>,
    /// Character the sweep payloads are made of
    #[arg(long, default_value_t = 'A')]
    pub fill: char,
    /// Receive buffer size in bytes; larger responses are an error
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    /// Socket read/write timeout in milliseconds (0 = block indefinitely)
    #[arg(short, long, default_value_t = 0)]
    pub timeout_ms: u64,
    /// Time to wait for the kernel transmit timestamp in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub tx_wait_ms: u64,
    /// How long a response that fills the whole buffer is watched for more bytes, in milliseconds
    #[arg(long, default_value_t = 20)]
    pub overflow_grace_ms: u64,
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.buffer_size == 0 {
            return Err(ConfigurationError::ZeroBufferSize);
        }
        if self.count == 0 {
            return Err(ConfigurationError::ZeroCount);
        }
        if self.tx_wait_ms == 0 {
            return Err(ConfigurationError::ZeroTxWait);
        }
        if !self.fill.is_ascii() {
            return Err(ConfigurationError::NonAsciiFill(self.fill));
        }
        if let Some(length) = self.sweep_length {
            if length == 0 {
                return Err(ConfigurationError::ZeroSweepLength);
            }
            if self.payload.is_some() || self.stdin {
                return Err(ConfigurationError::PayloadWithSweep);
            }
            return Ok(());
        }
        match (&self.payload, self.stdin) {
            (Some(_), true) => Err(ConfigurationError::AmbiguousPayload),
            (None, false) => Err(ConfigurationError::MissingPayload),
            _ => Ok(()),
        }
    }

    /// Target endpoint; fails before any socket exists if the address or port is bad.
    pub fn endpoint(&self) -> Result<Endpoint, EndpointError> {
        Endpoint::new(&self.remote_addr, self.remote_port)
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            source: self.strategy,
            buffer_size: self.buffer_size,
            io_timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            tx_timestamp_wait: Duration::from_millis(self.tx_wait_ms),
            overflow_grace: Duration::from_millis(self.overflow_grace_ms),
        }
    }

    /// Length sweep requested on the command line, if any. Call after `validate()`.
    pub fn sweep_plan(&self) -> Option<SweepPlan> {
        let max_length = self.sweep_length?;
        // `validate()` rejects anything outside ASCII.
        let fill = u8::try_from(self.fill).unwrap_or(b'A');
        Some(SweepPlan::new(
            self.prefix.as_bytes(),
            self.suffix.as_bytes(),
            fill,
            max_length,
        ))
    }

    /// Returns the payload argument, or one line of `input` with the line
    /// ending removed, wrapped in the configured prefix and suffix.
    pub fn read_payload<R: BufRead>(&self, mut input: R) -> io::Result<Vec<u8>> {
        let body = match self.payload {
            Some(ref payload) => payload.as_bytes().to_vec(),
            None => {
                let mut line = Vec::new();
                input.read_until(b'\n', &mut line)?;
                if line.last() == Some(&b'\n') {
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                }
                line
            }
        };
        let mut payload = Vec::with_capacity(self.prefix.len() + body.len() + self.suffix.len());
        payload.extend_from_slice(self.prefix.as_bytes());
        payload.extend_from_slice(&body);
        payload.extend_from_slice(self.suffix.as_bytes());
        Ok(payload)
    }
}
