//! Canonical connection identity.
//!
//! The OS reports sockets with platform-specific family and type codes. This
//! module turns one such record into a hashable [`ConnectionKey`] that stays
//! stable across polls, so the tracker can recognise the same logical
//! connection from one snapshot to the next.

use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

pub const AF_INET: i32 = 2;
#[cfg(windows)]
pub const AF_INET6: i32 = 23;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const AF_INET6: i32 = 30;
#[cfg(target_os = "freebsd")]
pub const AF_INET6: i32 = 28;
#[cfg(not(any(windows, target_os = "macos", target_os = "ios", target_os = "freebsd")))]
pub const AF_INET6: i32 = 10;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;

/// One socket as reported by the OS enumerator, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSocket {
    pub pid: Option<u32>,
    pub family: i32,
    pub socket_type: i32,
    pub local: Option<Endpoint>,
    pub remote: Option<Endpoint>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Endpoint { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
    /// A code this platform table does not know; kept verbatim.
    Other(i32),
}

impl Family {
    pub fn from_code(code: i32) -> Self {
        match code {
            AF_INET => Family::Ipv4,
            AF_INET6 => Family::Ipv6,
            other => Family::Other(other),
        }
    }

    pub fn as_str(&self) -> Cow<'static, str> {
        match self {
            Family::Ipv4 => Cow::Borrowed("ipv4"),
            Family::Ipv6 => Cow::Borrowed("ipv6"),
            Family::Other(code) => Cow::Owned(code.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Other(i32),
}

impl Transport {
    pub fn from_code(code: i32) -> Self {
        match code {
            SOCK_STREAM => Transport::Tcp,
            SOCK_DGRAM => Transport::Udp,
            other => Transport::Other(other),
        }
    }

    pub fn as_str(&self) -> Cow<'static, str> {
        match self {
            Transport::Tcp => Cow::Borrowed("tcp"),
            Transport::Udp => Cow::Borrowed("udp"),
            Transport::Other(code) => Cow::Owned(code.to_string()),
        }
    }
}

impl Serialize for Family {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl Serialize for Transport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

/// Which transports reach the tracker. Filtered sockets never enter retained state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportFilter {
    #[default]
    All,
    Tcp,
    Udp,
}

impl TransportFilter {
    pub fn admits(&self, transport: Transport) -> bool {
        match self {
            TransportFilter::All => true,
            TransportFilter::Tcp => transport == Transport::Tcp,
            TransportFilter::Udp => transport == Transport::Udp,
        }
    }
}

/// Identity of a tracked socket across polls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub pid: Option<u32>,
    pub family: Family,
    pub transport: Transport,
    pub local: Endpoint,
    pub remote: Option<Endpoint>,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transport.as_str(), self.local)?;
        if let Some(remote) = &self.remote {
            write!(f, " -> {}", remote)?;
        }
        match self.pid {
            Some(pid) => write!(f, " (pid {})", pid),
            None => write!(f, " (pid ?)"),
        }
    }
}

/// Socket that made it through normalization, paired with its current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub key: ConnectionKey,
    pub status: Option<String>,
}

/// Returns `None` for records without a local address; those are discarded.
pub fn normalize(raw: RawSocket) -> Option<Observation> {
    let local = raw.local?;
    Some(Observation {
        key: ConnectionKey {
            pid: raw.pid,
            family: Family::from_code(raw.family),
            transport: Transport::from_code(raw.socket_type),
            local,
            remote: raw.remote,
        },
        status: raw.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn raw(family: i32, socket_type: i32) -> RawSocket {
        RawSocket {
            pid: Some(10),
            family,
            socket_type,
            local: Some(Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000)),
            remote: Some(Endpoint::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 443)),
            status: Some("ESTABLISHED".to_string()),
        }
    }

    #[test]
    fn test_known_codes_map_to_canonical_names() {
        let obs = normalize(raw(AF_INET, SOCK_STREAM)).unwrap();
        assert_eq!(obs.key.family, Family::Ipv4);
        assert_eq!(obs.key.transport, Transport::Tcp);
        assert_eq!(obs.status.as_deref(), Some("ESTABLISHED"));

        let obs = normalize(raw(AF_INET6, SOCK_DGRAM)).unwrap();
        assert_eq!(obs.key.family.as_str(), "ipv6");
        assert_eq!(obs.key.transport.as_str(), "udp");
    }

    #[test]
    fn test_unknown_codes_pass_through_as_numbers() {
        let obs = normalize(raw(99, 5)).unwrap();
        assert_eq!(obs.key.family, Family::Other(99));
        assert_eq!(obs.key.family.as_str(), "99");
        assert_eq!(obs.key.transport.as_str(), "5");
        assert_eq!(serde_json::to_string(&obs.key.transport).unwrap(), "\"5\"");
    }

    #[test]
    fn test_missing_local_address_is_discarded() {
        let mut socket = raw(AF_INET, SOCK_STREAM);
        socket.local = None;
        assert!(normalize(socket).is_none());
    }

    #[test]
    fn test_missing_remote_is_tolerated() {
        let mut socket = raw(AF_INET, SOCK_DGRAM);
        socket.remote = None;
        socket.status = None;
        let obs = normalize(socket).unwrap();
        assert!(obs.key.remote.is_none());
        assert!(obs.status.is_none());
    }

    #[test]
    fn test_transport_filter() {
        assert!(TransportFilter::All.admits(Transport::Other(7)));
        assert!(TransportFilter::Tcp.admits(Transport::Tcp));
        assert!(!TransportFilter::Tcp.admits(Transport::Udp));
        assert!(TransportFilter::Udp.admits(Transport::Udp));
        assert!(!TransportFilter::Udp.admits(Transport::Tcp));
    }

    #[test]
    fn test_key_display() {
        let obs = normalize(raw(AF_INET, SOCK_STREAM)).unwrap();
        assert_eq!(obs.key.to_string(), "tcp 127.0.0.1:5000 -> 1.2.3.4:443 (pid 10)");
    }
}
