//! Validated target endpoint for a timing exchange.
//!
//! An [`Endpoint`] can only be built from a parseable IP literal and a port in
//! the range 1-65535, so a malformed target is rejected before any socket
//! is created.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
    str::FromStr,
};

use thiserror::Error;

/// Errors that can occur when building an [`Endpoint`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The address is not an IPv4 or IPv6 literal.
    #[error("Invalid IP address literal {0:?}")]
    InvalidAddress(String),
    /// The port is zero, negative or above 65535.
    #[error("Port {0} is outside the range 1-65535")]
    PortOutOfRange(i64),
    /// The `address:port` form was used without a port.
    #[error("Missing port in {0:?}")]
    MissingPort(String),
}

/// Remote address and port of the responding server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address: IpAddr,
    port: NonZeroU16,
}

impl Endpoint {
    /// Builds an endpoint from an IP literal and a port number.
    ///
    /// The port is accepted as a wide integer so that out-of-range values
    /// supplied by a caller are reported instead of silently wrapping.
    ///
    /// # Errors
    /// Returns `EndpointError::InvalidAddress` if `address` is not an IP literal
    /// and `EndpointError::PortOutOfRange` if `port` is not in 1-65535.
    ///
    /// ```
    /// use tcp_rtt_probe::endpoint::{Endpoint, EndpointError};
    /// assert!(Endpoint::new("127.0.0.1", 12345).is_ok());
    /// assert_eq!(
    ///     Endpoint::new("127.0.0.1", 70000),
    ///     Err(EndpointError::PortOutOfRange(70000))
    /// );
    /// ```
    pub fn new(address: &str, port: i64) -> Result<Self, EndpointError> {
        let trimmed = address.trim();
        let literal = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        let address = literal
            .parse::<IpAddr>()
            .map_err(|_| EndpointError::InvalidAddress(address.to_string()))?;
        Self::from_parts(address, port)
    }

    /// Builds an endpoint from an already parsed address.
    ///
    /// # Errors
    /// Returns `EndpointError::PortOutOfRange` if `port` is not in 1-65535.
    pub fn from_parts(address: IpAddr, port: i64) -> Result<Self, EndpointError> {
        let port = u16::try_from(port)
            .ok()
            .and_then(NonZeroU16::new)
            .ok_or(EndpointError::PortOutOfRange(port))?;
        Ok(Self { address, port })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port.get()
    }

    /// Socket address used for `connect(2)`.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port.get())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Parses `a.b.c.d:port` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
        // A bare IPv6 literal has colons but no port.
        if host.contains(':') && !host.starts_with('[') {
            return Err(EndpointError::MissingPort(s.to_string()));
        }
        let port = port
            .parse::<i64>()
            .map_err(|_| EndpointError::MissingPort(s.to_string()))?;
        Self::new(host, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.socket_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_valid_ipv4() {
        let ep = Endpoint::new("127.0.0.1", 12345).unwrap();
        assert_eq!(ep.address(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(ep.port(), 12345);
        assert_eq!(ep.to_string(), "127.0.0.1:12345");
    }

    #[test]
    fn test_valid_ipv6() {
        let ep = Endpoint::new("::1", 8080).unwrap();
        assert_eq!(ep.address(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(ep.to_string(), "[::1]:8080");

        let bracketed = Endpoint::new("[::1]", 8080).unwrap();
        assert_eq!(bracketed, ep);
    }

    #[test]
    fn test_port_bounds() {
        assert!(Endpoint::new("10.0.0.1", 1).is_ok());
        assert!(Endpoint::new("10.0.0.1", 65535).is_ok());
        assert_eq!(
            Endpoint::new("10.0.0.1", 0),
            Err(EndpointError::PortOutOfRange(0))
        );
        assert_eq!(
            Endpoint::new("10.0.0.1", 65536),
            Err(EndpointError::PortOutOfRange(65536))
        );
        assert_eq!(
            Endpoint::new("10.0.0.1", 70000),
            Err(EndpointError::PortOutOfRange(70000))
        );
        assert_eq!(
            Endpoint::new("10.0.0.1", -1),
            Err(EndpointError::PortOutOfRange(-1))
        );
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            Endpoint::new("localhost", 80),
            Err(EndpointError::InvalidAddress(_))
        ));
        assert!(matches!(
            Endpoint::new("256.0.0.1", 80),
            Err(EndpointError::InvalidAddress(_))
        ));
        assert!(matches!(
            Endpoint::new("", 80),
            Err(EndpointError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_from_str() {
        let ep: Endpoint = "192.168.1.136:12345".parse().unwrap();
        assert_eq!(ep.port(), 12345);

        let ep6: Endpoint = "[fe80::1]:443".parse().unwrap();
        assert!(ep6.address().is_ipv6());
        assert_eq!(ep6.port(), 443);

        assert_eq!(
            "127.0.0.1:70000".parse::<Endpoint>(),
            Err(EndpointError::PortOutOfRange(70000))
        );
        assert!(matches!(
            "127.0.0.1".parse::<Endpoint>(),
            Err(EndpointError::MissingPort(_))
        ));
        assert!(matches!(
            "::1".parse::<Endpoint>(),
            Err(EndpointError::MissingPort(_))
        ));
    }

    #[test]
    fn test_into_socket_addr() {
        let ep = Endpoint::new("127.0.0.1", 9).unwrap();
        let addr: SocketAddr = ep.into();
        assert_eq!(addr, "127.0.0.1:9".parse::<SocketAddr>().unwrap());
    }
}
