//! OS socket table polling.
//!
//! Reads every inet socket on the system (IPv4 and IPv6, TCP and UDP) with its
//! owning pid. Unlike packet capture this needs no driver and sees sockets from
//! all sessions, though some owners stay hidden without elevated rights.

use crate::endpoint::{Endpoint, RawSocket, AF_INET, AF_INET6, SOCK_DGRAM, SOCK_STREAM};
use crate::error::EnumerationError;
use log::debug;
use netstat2::{
    get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, SocketInfo, TcpState,
};
use std::net::IpAddr;
use std::sync::Arc;

/// Source of socket snapshots. Each call returns the full current table.
pub trait SocketTable: Send + Sync {
    fn snapshot(&self) -> Result<Vec<RawSocket>, EnumerationError>;
}

/// Runs a snapshot on the blocking pool so a slow OS call never stalls the runtime.
pub async fn poll_snapshot(table: Arc<dyn SocketTable>) -> Result<Vec<RawSocket>, EnumerationError> {
    tokio::task::spawn_blocking(move || table.snapshot())
        .await
        .map_err(|e| EnumerationError::Task(e.to_string()))?
}

#[derive(Debug, Default)]
pub struct SystemSocketTable;

impl SystemSocketTable {
    pub fn new() -> Self {
        SystemSocketTable
    }
}

impl SocketTable for SystemSocketTable {
    fn snapshot(&self) -> Result<Vec<RawSocket>, EnumerationError> {
        let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
        let proto_flags = ProtocolFlags::TCP | ProtocolFlags::UDP;
        let sockets = get_sockets_info(af_flags, proto_flags)
            .map_err(|e| EnumerationError::Query(e.to_string()))?;

        let mut records = Vec::with_capacity(sockets.len());
        for socket in sockets {
            records.extend(expand(socket));
        }
        debug!("Socket table returned {} records", records.len());
        Ok(records)
    }
}

/// One record per owning pid. Sockets shared by several processes appear once per owner;
/// sockets with no visible owner get a null pid.
fn expand(socket: SocketInfo) -> Vec<RawSocket> {
    let template = match socket.protocol_socket_info {
        ProtocolSocketInfo::Tcp(tcp) => RawSocket {
            pid: None,
            family: family_code(&tcp.local_addr),
            socket_type: SOCK_STREAM,
            local: Some(Endpoint::new(tcp.local_addr, tcp.local_port)),
            remote: remote_endpoint(tcp.remote_addr, tcp.remote_port),
            status: Some(tcp_status(&tcp.state)),
        },
        ProtocolSocketInfo::Udp(udp) => RawSocket {
            pid: None,
            family: family_code(&udp.local_addr),
            socket_type: SOCK_DGRAM,
            local: Some(Endpoint::new(udp.local_addr, udp.local_port)),
            remote: None,
            status: None,
        },
    };

    if socket.associated_pids.is_empty() {
        return vec![template];
    }
    socket
        .associated_pids
        .iter()
        .map(|&pid| RawSocket {
            pid: Some(pid),
            ..template.clone()
        })
        .collect()
}

fn family_code(addr: &IpAddr) -> i32 {
    match addr {
        IpAddr::V4(_) => AF_INET,
        IpAddr::V6(_) => AF_INET6,
    }
}

/// Listening sockets report `0.0.0.0:0` / `[::]:0` as their peer; that means "no remote".
fn remote_endpoint(ip: IpAddr, port: u16) -> Option<Endpoint> {
    if ip.is_unspecified() && port == 0 {
        None
    } else {
        Some(Endpoint::new(ip, port))
    }
}

fn tcp_status(state: &TcpState) -> String {
    let name = match state {
        TcpState::Closed => "CLOSE",
        TcpState::Listen => "LISTEN",
        TcpState::SynSent => "SYN_SENT",
        TcpState::SynReceived => "SYN_RECV",
        TcpState::Established => "ESTABLISHED",
        TcpState::FinWait1 => "FIN_WAIT1",
        TcpState::FinWait2 => "FIN_WAIT2",
        TcpState::CloseWait => "CLOSE_WAIT",
        TcpState::Closing => "CLOSING",
        TcpState::LastAck => "LAST_ACK",
        TcpState::TimeWait => "TIME_WAIT",
        TcpState::DeleteTcb => "DELETE_TCB",
        other => return format!("{:?}", other).to_uppercase(),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    struct FailingTable;

    impl SocketTable for FailingTable {
        fn snapshot(&self) -> Result<Vec<RawSocket>, EnumerationError> {
            Err(EnumerationError::Query("access denied".to_string()))
        }
    }

    #[test]
    fn test_unspecified_peer_means_no_remote() {
        assert!(remote_endpoint(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).is_none());
        assert!(remote_endpoint(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).is_none());
        let peer = remote_endpoint(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 443).unwrap();
        assert_eq!(peer.port, 443);
    }

    #[test]
    fn test_tcp_status_names() {
        assert_eq!(tcp_status(&TcpState::Established), "ESTABLISHED");
        assert_eq!(tcp_status(&TcpState::CloseWait), "CLOSE_WAIT");
        assert_eq!(tcp_status(&TcpState::SynReceived), "SYN_RECV");
    }

    #[test]
    fn test_family_code_follows_address() {
        assert_eq!(family_code(&IpAddr::V4(Ipv4Addr::LOCALHOST)), AF_INET);
        assert_eq!(family_code(&IpAddr::V6(Ipv6Addr::LOCALHOST)), AF_INET6);
    }

    #[tokio::test]
    async fn test_poll_snapshot_surfaces_failure() {
        let table: Arc<dyn SocketTable> = Arc::new(FailingTable);
        let err = poll_snapshot(table).await.unwrap_err();
        assert!(matches!(err, EnumerationError::Query(_)));
    }
}
