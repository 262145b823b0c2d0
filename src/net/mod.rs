//! Network helpers for inbound listeners and outbound dialing

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener, UdpSocket};

pub use self::{
    flow::{FlowManager, FlowStat, ServerFlowStatistic},
    mon_stream::MonProxyStream,
};

pub mod flow;
pub mod mon_stream;

/// Address family restriction for inbound listeners (`net` config field)
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AddrFamily {
    /// Accept both IPv4 and IPv6 clients
    #[default]
    Both,
    /// IPv4 only
    Ipv4Only,
    /// IPv6 only
    Ipv6Only,
}

impl AddrFamily {
    /// Map the `net` configuration value: `4` and `6` restrict to one
    /// family, everything else accepts both
    pub fn from_net(net: u32) -> AddrFamily {
        match net {
            4 => AddrFamily::Ipv4Only,
            6 => AddrFamily::Ipv6Only,
            _ => AddrFamily::Both,
        }
    }

    fn bind_addr(self, port: u16) -> (Domain, SocketAddr) {
        match self {
            AddrFamily::Ipv4Only => (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
            // dual-stack and v6-only both bind the wildcard v6 address,
            // IPV6_V6ONLY makes the difference
            AddrFamily::Both | AddrFamily::Ipv6Only => {
                (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
            }
        }
    }
}

fn new_inbound_socket(family: AddrFamily, port: u16, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let (domain, addr) = family.bind_addr(port);

    let socket = Socket::new(domain, ty, Some(protocol))?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(family == AddrFamily::Ipv6Only)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket)
}

/// Bind an inbound TCP listener on `:port` honoring the address family
///
/// A dual-stack bind falls back to IPv4 only on hosts without IPv6.
pub fn bind_tcp(family: AddrFamily, port: u16) -> io::Result<TcpListener> {
    let socket = match new_inbound_socket(family, port, Type::STREAM, Protocol::TCP) {
        Ok(socket) => socket,
        Err(..) if family == AddrFamily::Both => {
            new_inbound_socket(AddrFamily::Ipv4Only, port, Type::STREAM, Protocol::TCP)?
        }
        Err(err) => return Err(err),
    };
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Bind an inbound UDP socket on `:port` honoring the address family
pub fn bind_udp(family: AddrFamily, port: u16) -> io::Result<UdpSocket> {
    let socket = match new_inbound_socket(family, port, Type::DGRAM, Protocol::UDP) {
        Ok(socket) => socket,
        Err(..) if family == AddrFamily::Both => {
            new_inbound_socket(AddrFamily::Ipv4Only, port, Type::DGRAM, Protocol::UDP)?
        }
        Err(err) => return Err(err),
    };
    UdpSocket::from_std(socket.into())
}

/// Perform a DNS resolution, returning the first answer
pub async fn resolve(addr: &str, port: u16) -> io::Result<SocketAddr> {
    match lookup_host((addr, port)).await {
        Ok(mut v) => match v.next() {
            Some(sa) => Ok(sa),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("dns resolve {addr}:{port} returned no address"),
            )),
        },
        Err(err) => Err(io::Error::new(
            err.kind(),
            format!("dns resolve {addr}:{port} error: {err}"),
        )),
    }
}

/// Check whether an I/O error means the process or system ran out of file
/// descriptors (`EMFILE` / `ENFILE`), which is logged at a distinguished
/// level by the relay paths.
#[cfg(unix)]
pub fn is_fd_exhausted(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(not(unix))]
pub fn is_fd_exhausted(_: &io::Error) -> bool {
    false
}
