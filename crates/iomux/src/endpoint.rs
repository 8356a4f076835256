use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// A network endpoint: numeric address plus port.
///
/// Name resolution lives outside the core; `new` accepts only literal IPv4
/// or IPv6 addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    pub fn new(address: &str, port: u16) -> Result<Self, Error> {
        let ip = IpAddr::from_str(address).map_err(|source| Error::InvalidAddress {
            addr: address.to_string(),
            source,
        })?;
        Ok(Self { addr: SocketAddr::new(ip, port) })
    }

    #[inline]
    pub fn address(&self) -> IpAddr {
        self.addr.ip()
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s)
            .map(|addr| Self { addr })
            .map_err(|source| Error::InvalidAddress { addr: s.to_string(), source })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}
