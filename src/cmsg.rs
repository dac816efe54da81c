//! Decoder for the ancillary data (control messages) returned by `recvmsg(2)`.
//!
//! The control buffer is a chain of variable-length records, each starting
//! with a `cmsghdr` and padded to the platform's `CMSG_ALIGN` boundary:
//!
//! ```text
//! +-----------+-----------+-----------+---------+-----+-----------+ ...
//! | cmsg_len  | cmsg_level| cmsg_type | data    | pad | next hdr  |
//! +-----------+-----------+-----------+---------+-----+-----------+ ...
//! ```
//!
//! [`ControlMessages`] walks that chain over a borrowed byte slice and checks
//! every length against the buffer before touching it.

use std::{mem, ptr, time::Duration};

use nix::libc;
use thiserror::Error;

use crate::timestamp::{TimestampKind, TimestampRecord, TimestampUnavailable};

const HEADER_LEN: usize = mem::size_of::<libc::cmsghdr>();
const TIMESPEC_LEN: usize = mem::size_of::<libc::timespec>();

/// Slot of the software timestamp inside `struct scm_timestamping`.
const SOFTWARE_SLOT: usize = 0;
/// Slot of the raw hardware timestamp. Slot 1 is deprecated and always zero.
const HARDWARE_SLOT: usize = 2;

/// Rounds `len` up to the control message alignment (`CMSG_ALIGN`).
pub const fn cmsg_align(len: usize) -> usize {
    let align = mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

/// Offset of the payload from the start of a control message (`CMSG_DATA`).
pub const DATA_OFFSET: usize = cmsg_align(HEADER_LEN);

/// Errors that can occur while walking a control message chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A header reports a length smaller than the header itself.
    #[error("control message length {len} is shorter than its header")]
    HeaderLength { len: usize },
    /// A header reports a length past the end of the buffer.
    #[error("control message length {len} exceeds the {remaining} bytes left in the buffer")]
    Overrun { len: usize, remaining: usize },
    /// A timestamping record is too short to hold the requested slot.
    #[error("timestamping record of {len} bytes cannot hold {needed} bytes")]
    Undersized { len: usize, needed: usize },
    /// A timespec with a negative or out of range field.
    #[error("invalid timespec in timestamping record")]
    InvalidTimespec,
}

/// Contents of an `SCM_TIMESTAMPING` control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScmTimestamping {
    software: Duration,
    hardware: Option<Duration>,
}

impl ScmTimestamping {
    /// Parses the record payload, requiring at least the software slot.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let software = read_slot(data, SOFTWARE_SLOT)?;
        // The hardware slot is optional; records cut short before it are accepted.
        let hardware = read_slot(data, HARDWARE_SLOT)
            .ok()
            .filter(|ts| !ts.is_zero());
        Ok(Self { software, hardware })
    }

    /// Software timestamp, zero when the kernel did not fill it in.
    pub fn software(&self) -> Duration {
        self.software
    }

    /// Raw hardware timestamp, if one was reported.
    pub fn hardware(&self) -> Option<TimestampRecord> {
        self.hardware
            .map(|ts| TimestampRecord::new(ts, TimestampKind::KernelHardware))
    }
}

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage<'a> {
    /// `SOL_SOCKET` / `SCM_TIMESTAMPING`.
    Timestamping(ScmTimestamping),
    /// Any other message, left undecoded.
    Other {
        level: libc::c_int,
        kind: libc::c_int,
        data: &'a [u8],
    },
}

/// Bounds-checked iterator over a control message chain.
///
/// Yields at most one error, after which iteration stops.
pub struct ControlMessages<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> ControlMessages<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }

    fn fail(&mut self, err: DecodeError) -> Option<Result<ControlMessage<'a>, DecodeError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for ControlMessages<'a> {
    type Item = Result<ControlMessage<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let remaining = self.buf.get(self.offset..).unwrap_or_default();
        let Some(header) = read_struct::<libc::cmsghdr>(remaining, 0) else {
            // Not enough room left for another header: end of chain.
            self.done = true;
            return None;
        };

        let len = header.cmsg_len as usize;
        if len < DATA_OFFSET {
            return self.fail(DecodeError::HeaderLength { len });
        }
        if len > remaining.len() {
            return self.fail(DecodeError::Overrun {
                len,
                remaining: remaining.len(),
            });
        }

        let data = &remaining[DATA_OFFSET..len];
        self.offset = self.offset.saturating_add(cmsg_align(len));

        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_TIMESTAMPING {
            match ScmTimestamping::from_bytes(data) {
                Ok(ts) => Some(Ok(ControlMessage::Timestamping(ts))),
                Err(e) => self.fail(e),
            }
        } else {
            Some(Ok(ControlMessage::Other {
                level: header.cmsg_level,
                kind: header.cmsg_type,
                data,
            }))
        }
    }
}

/// Extracts the software timestamp from a control buffer.
///
/// The first `SCM_TIMESTAMPING` record wins. A zero software slot counts as
/// absent.
///
/// # Errors
/// Returns `TimestampUnavailable::Absent` if no record is present and
/// `TimestampUnavailable::Malformed` if the chain or the record is malformed.
pub fn software_timestamp(buf: &[u8]) -> Result<TimestampRecord, TimestampUnavailable> {
    for msg in ControlMessages::new(buf) {
        match msg? {
            ControlMessage::Timestamping(ts) if ts.software().is_zero() => {
                return Err(TimestampUnavailable::Absent);
            }
            ControlMessage::Timestamping(ts) => {
                return Ok(TimestampRecord::new(
                    ts.software(),
                    TimestampKind::KernelSoftware,
                ));
            }
            ControlMessage::Other { level, kind, .. } => {
                log::trace!("skipping control message level={} type={}", level, kind);
            }
        }
    }
    Err(TimestampUnavailable::Absent)
}

fn read_slot(data: &[u8], slot: usize) -> Result<Duration, DecodeError> {
    let offset = slot * TIMESPEC_LEN;
    let ts = read_struct::<libc::timespec>(data, offset).ok_or(DecodeError::Undersized {
        len: data.len(),
        needed: offset + TIMESPEC_LEN,
    })?;
    if ts.tv_sec < 0 || !(0..1_000_000_000).contains(&ts.tv_nsec) {
        return Err(DecodeError::InvalidTimespec);
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// Copies a plain C struct out of `bytes` at `offset`, if it fits.
///
/// Only used with `cmsghdr` and `timespec`, for which every bit pattern is valid.
fn read_struct<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(mem::size_of::<T>())?;
    let src = bytes.get(offset..end)?;
    // SAFETY: `src` holds exactly size_of::<T>() initialised bytes and the read
    // does not assume alignment.
    Some(unsafe { ptr::read_unaligned(src.as_ptr().cast::<T>()) })
}

/// Test helpers that lay out control messages the way the kernel does.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    fn struct_bytes<T: Copy>(value: &T) -> Vec<u8> {
        // SAFETY: reading the object representation of a plain C struct.
        unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
            .to_vec()
    }

    pub fn timespec(secs: i64, nanos: i64) -> Vec<u8> {
        // SAFETY: timespec is a plain C struct, all-zero is valid.
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        ts.tv_sec = secs as _;
        ts.tv_nsec = nanos as _;
        struct_bytes(&ts)
    }

    /// Appends one control message, with the length field set to `len_override` if given.
    pub fn push_cmsg(
        buf: &mut Vec<u8>,
        level: libc::c_int,
        kind: libc::c_int,
        data: &[u8],
        len_override: Option<usize>,
    ) {
        // SAFETY: cmsghdr is a plain C struct, all-zero is valid.
        let mut hdr: libc::cmsghdr = unsafe { mem::zeroed() };
        hdr.cmsg_len = len_override.unwrap_or(DATA_OFFSET + data.len()) as _;
        hdr.cmsg_level = level;
        hdr.cmsg_type = kind;

        let start = buf.len();
        buf.extend_from_slice(&struct_bytes(&hdr));
        buf.resize(start + DATA_OFFSET, 0);
        buf.extend_from_slice(data);
        buf.resize(start + cmsg_align(DATA_OFFSET + data.len()), 0);
    }

    /// Full three-slot `scm_timestamping` payload.
    pub fn scm_timestamping(software: (i64, i64), hardware: (i64, i64)) -> Vec<u8> {
        let mut data = timespec(software.0, software.1);
        data.extend(timespec(0, 0));
        data.extend(timespec(hardware.0, hardware.1));
        data
    }
}
