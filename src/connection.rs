//! Connection establishment and the raw socket calls used during an exchange.
//!
//! The socket is created and connected through `nix` so that socket creation
//! and handshake failures can be told apart. `recvmsg(2)` goes through `libc`
//! directly because the control buffer length the kernel reports back is
//! needed by the ancillary data decoder.

use std::{
    io::{self, Write},
    mem,
    net::{SocketAddr, TcpStream},
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use nix::{
    errno::Errno,
    libc,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6},
};
use thiserror::Error;

use crate::endpoint::Endpoint;

/// Errors that can occur while opening a connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// `socket(2)` failed.
    #[error("Cannot create socket: {0}")]
    SocketCreate(#[source] io::Error),
    /// The address family or address is not usable on this host.
    #[error("Address {0} is not supported on this host")]
    UnsupportedAddress(SocketAddr),
    /// Nothing is listening on the remote port.
    #[error("Connection to {0} refused")]
    Refused(SocketAddr),
    /// The handshake did not complete in time.
    #[error("Connection to {0} timed out")]
    TimedOut(SocketAddr),
    /// No route to the remote host or network.
    #[error("{0} is unreachable")]
    Unreachable(SocketAddr),
    /// Any other handshake failure.
    #[error("Cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Applying the read/write deadline failed.
    #[error("Cannot apply socket timeout: {0}")]
    Timeout(#[source] io::Error),
}

/// Errors that can occur while reading the response.
#[derive(Error, Debug)]
pub enum ReadError {
    /// The peer closed the connection without sending anything.
    #[error("Peer closed the connection before responding")]
    Closed,
    /// The response did not fit into the receive buffer.
    #[error("Response exceeds the {capacity}-byte receive buffer")]
    Truncated { capacity: usize },
    /// The read deadline expired.
    #[error("Timed out waiting for the response")]
    TimedOut,
    #[error("Receive failed: {0}")]
    Io(#[source] io::Error),
}

/// Outcome of a single `recvmsg(2)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvOutcome {
    /// Number of payload bytes placed into the data buffer.
    pub bytes: usize,
    /// Number of valid bytes in the control buffer.
    pub control_len: usize,
    /// The kernel had more ancillary data than the control buffer could hold.
    pub control_truncated: bool,
}

/// An exclusively owned, connected TCP stream.
///
/// The socket is closed when the value is dropped, on every exit path of
/// an exchange.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

/// Opens a TCP connection to `endpoint` with a single blocking handshake.
///
/// No retry is attempted; the first failure is returned.
///
/// # Errors
/// Returns a `ConnectionError` variant describing whether socket creation or
/// the handshake failed, and why.
pub fn connect(endpoint: &Endpoint) -> Result<Connection, ConnectionError> {
    let peer = endpoint.socket_addr();
    let family = match peer {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .map_err(|e| match e {
            Errno::EAFNOSUPPORT => ConnectionError::UnsupportedAddress(peer),
            e => ConnectionError::SocketCreate(e.into()),
        })?;

    let result = match peer {
        SocketAddr::V4(v4) => socket::connect(fd.as_raw_fd(), &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => socket::connect(fd.as_raw_fd(), &SockaddrIn6::from(v6)),
    };

    if let Err(e) = result {
        log::debug!("connect to {} failed: {}", peer, e);
        return Err(match e {
            Errno::ECONNREFUSED => ConnectionError::Refused(peer),
            Errno::ETIMEDOUT => ConnectionError::TimedOut(peer),
            Errno::EHOSTUNREACH | Errno::ENETUNREACH => ConnectionError::Unreachable(peer),
            Errno::EAFNOSUPPORT | Errno::EADDRNOTAVAIL => {
                ConnectionError::UnsupportedAddress(peer)
            }
            e => ConnectionError::Connect {
                addr: peer,
                source: e.into(),
            },
        });
    }

    log::debug!("connected to {}", peer);
    Ok(Connection {
        stream: TcpStream::from(fd),
        peer,
    })
}

impl Connection {
    /// Remote address this connection is bound to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Applies the same deadline to reads and writes, or clears it with `None`.
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let timeout = timeout.filter(|t| !t.is_zero());
        self.stream
            .set_read_timeout(timeout)
            .and_then(|_| self.stream.set_write_timeout(timeout))
            .map_err(ConnectionError::Timeout)
    }

    /// Issues exactly one `send` and returns how many bytes the kernel accepted.
    pub fn send(&self, payload: &[u8]) -> io::Result<usize> {
        (&self.stream).write(payload)
    }

    /// Performs one blocking data read with an optional control buffer.
    ///
    /// `data` must be one byte larger than `capacity` so that an oversized
    /// response can be detected. A read that fills exactly `capacity` bytes
    /// still has to pass [`Connection::check_overflow`].
    ///
    /// # Errors
    /// Returns `ReadError::Truncated` if more than `capacity` bytes arrived
    /// in this read, `ReadError::Closed` on EOF and `ReadError::TimedOut` if a
    /// read deadline expired.
    pub fn receive(
        &self,
        data: &mut [u8],
        control: &mut [u8],
        capacity: usize,
    ) -> Result<RecvOutcome, ReadError> {
        debug_assert!(data.len() > capacity);
        let outcome = self.recv_message(data, control, 0).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ReadError::TimedOut,
            _ => ReadError::Io(e),
        })?;

        if outcome.bytes == 0 {
            return Err(ReadError::Closed);
        }
        if outcome.bytes > capacity {
            return Err(ReadError::Truncated { capacity });
        }
        Ok(outcome)
    }

    /// Rejects a response that filled the whole buffer and kept coming.
    ///
    /// Only a read of exactly `capacity` bytes is checked. The socket is then
    /// watched for up to `grace` and any further byte, including one still in
    /// flight when the read returned, makes the response `Truncated`. EOF
    /// within the window is accepted.
    pub fn check_overflow(
        &self,
        outcome: &RecvOutcome,
        capacity: usize,
        grace: Duration,
    ) -> Result<(), ReadError> {
        if outcome.bytes < capacity {
            return Ok(());
        }
        let readable = self
            .poll_events(PollFlags::POLLIN, grace)
            .map_err(ReadError::Io)?
            .intersects(PollFlags::POLLIN);
        if readable && self.has_pending_data() {
            log::debug!("response from {} overflows {} bytes", self.peer, capacity);
            return Err(ReadError::Truncated { capacity });
        }
        Ok(())
    }

    /// Reads one message from the socket error queue without blocking.
    pub fn recv_error_queue(
        &self,
        data: &mut [u8],
        control: &mut [u8],
    ) -> io::Result<RecvOutcome> {
        self.recv_message(data, control, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT)
    }

    /// Waits until the error queue has a message or `timeout` expires.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_error_queue(&self, timeout: Duration) -> io::Result<bool> {
        // POLLERR is always reported, it does not need to be requested.
        let revents = self.poll_events(PollFlags::empty(), timeout)?;
        Ok(revents.contains(PollFlags::POLLERR))
    }

    /// Polls the socket once, retrying on `EINTR`. Returns no events on timeout.
    fn poll_events(&self, events: PollFlags, timeout: Duration) -> io::Result<PollFlags> {
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        loop {
            let mut fds = [PollFd::new(self.as_fd(), events)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(PollFlags::empty()),
                Ok(_) => return Ok(fds[0].revents().unwrap_or_else(PollFlags::empty)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn has_pending_data(&self) -> bool {
        let mut peek = [0u8; 1];
        matches!(
            self.recv_message(&mut peek, &mut [], libc::MSG_PEEK | libc::MSG_DONTWAIT),
            Ok(outcome) if outcome.bytes > 0
        )
    }

    fn recv_message(
        &self,
        data: &mut [u8],
        control: &mut [u8],
        flags: libc::c_int,
    ) -> io::Result<RecvOutcome> {
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        // SAFETY: an all-zero msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !control.is_empty() {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = control.len() as _;
        }

        loop {
            // SAFETY: `msg` points at `iov` and `control`, which stay mutably
            // borrowed for the duration of the call and match the lengths given.
            let n = unsafe { libc::recvmsg(self.as_raw_fd(), &mut msg, flags) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(RecvOutcome {
                bytes: n as usize,
                control_len: (msg.msg_controllen as usize).min(control.len()),
                control_truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
            });
        }
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        log::trace!("releasing connection to {}", self.peer);
    }
}
