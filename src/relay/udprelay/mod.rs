//! Shadowsocks UDP server
//!
//! Each client address is mapped to one wildcard-bound upstream socket (a
//! "full cone" NAT entry) with an idle expiry timer. Reply datagrams are
//! rewritten with the exact header the client originally sent whenever the
//! reply source matches an earlier request, so domain-typed destinations
//! survive the round trip.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::future;
use log::{debug, error, info, trace, warn};
use lru_time_cache::LruCache;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time,
};

use crate::{
    acl,
    config::PortConfig,
    crypto::{bytes_to_key, CipherKind},
    net::{self, ServerFlowStatistic},
    relay::address::Address,
};

use self::proxy_socket::ProxySocket;

pub mod crypto_io;
pub mod proxy_socket;

/// Maximum size of one UDP datagram
pub const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;

/// NAT entries expire after this long without a packet from their client
pub const DEFAULT_UDP_EXPIRY_DURATION: Duration = Duration::from_secs(120);

type AssociationMap = LruCache<SocketAddr, UdpAssociation>;

/// Shared handle to the NAT table
pub type SharedAssociationMap = Arc<Mutex<AssociationMap>>;

/// UDP relay server for one port
pub struct UdpServer {
    port: u16,
    config: PortConfig,
    method: CipherKind,
    key: Bytes,
    assoc_map: SharedAssociationMap,
    cleanup_abortable: JoinHandle<()>,
    flow_stat: Arc<ServerFlowStatistic>,
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.cleanup_abortable.abort();
    }
}

impl UdpServer {
    pub fn new(
        port: u16,
        config: PortConfig,
        method: CipherKind,
        time_to_live: Option<Duration>,
        flow_stat: Arc<ServerFlowStatistic>,
    ) -> UdpServer {
        let time_to_live = time_to_live.unwrap_or(DEFAULT_UDP_EXPIRY_DURATION);
        let assoc_map = Arc::new(Mutex::new(LruCache::with_expiry_duration(time_to_live)));

        let cleanup_abortable = {
            let assoc_map = assoc_map.clone();
            tokio::spawn(async move {
                loop {
                    time::sleep(time_to_live).await;

                    // cleanup expired associations. iter() will remove expired elements
                    let _ = assoc_map.lock().await.iter();
                }
            })
        };

        let key = bytes_to_key(config.password.as_bytes(), method.key_len());

        UdpServer {
            port,
            config,
            method,
            key,
            assoc_map,
            cleanup_abortable,
            flow_stat,
        }
    }

    /// Shared handle to the NAT table; its length is the number of live
    /// upstream sockets bound for this port
    pub fn association_map(&self) -> SharedAssociationMap {
        self.assoc_map.clone()
    }

    /// Serve loop over an inbound socket bound to this port
    pub async fn run(self, socket: UdpSocket) {
        info!("[udp] server listening on port {}", self.port);

        let listener = Arc::new(ProxySocket::from_socket(
            socket,
            self.method,
            self.key.clone(),
            self.flow_stat.clone(),
        ));

        let mut buffer = [0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        loop {
            let (n, peer_addr) = match listener.recv_from(&mut buffer).await {
                Ok(r) => r,
                Err(err) => {
                    error!("[udp] server on port {} recv_from failed with error: {}", self.port, err);
                    continue;
                }
            };

            let (target_addr, header, body) = match listener.decrypt(&mut buffer[..n]) {
                Ok(r) => r,
                Err(err) => {
                    warn!("[udp] invalid packet from {}: {}", peer_addr, err);
                    continue;
                }
            };

            let dst = match target_addr {
                Address::SocketAddress(sa) => sa,
                Address::DomainNameAddress(ref dname, port) => match net::resolve(dname, port).await {
                    Ok(sa) => sa,
                    Err(..) => {
                        warn!("[udp]failed to resolve domain name: {}", dname);
                        continue;
                    }
                },
            };

            if acl::check_outbound_blocked(dst.ip(), dst.port(), self.config.openvpn_ok()) {
                warn!("[udp]illegal connect to local network({})", dst.ip());
                continue;
            }

            let header = Bytes::copy_from_slice(header);
            let body = Bytes::copy_from_slice(body);
            if let Err(err) = self.send_packet(&listener, peer_addr, dst, header, body).await {
                error!("[udp] packet relay {} -> {} failed, error: {}", peer_addr, dst, err);
            }
        }
    }

    async fn send_packet(
        &self,
        listener: &Arc<ProxySocket>,
        peer_addr: SocketAddr,
        dst: SocketAddr,
        header: Bytes,
        body: Bytes,
    ) -> io::Result<()> {
        let mut assoc_map = self.assoc_map.lock().await;

        // get() refreshes the idle timer: any outbound packet from the
        // client keeps its NAT entry alive
        if let Some(assoc) = assoc_map.get(&peer_addr) {
            return assoc.try_send((dst, header, body));
        }

        let assoc = UdpAssociation::new(listener.clone(), peer_addr);
        debug!("[udp] new connection {} ({} alive)", peer_addr, assoc_map.len() + 1);

        assoc.try_send((dst, header, body))?;
        assoc_map.insert(peer_addr, assoc);

        Ok(())
    }
}

/// One NAT entry: a queue into its dispatch task
///
/// Dropping the association (idle expiry or teardown) aborts the task, which
/// closes the upstream sockets with it.
pub struct UdpAssociation {
    assoc_handle: JoinHandle<()>,
    sender: mpsc::Sender<(SocketAddr, Bytes, Bytes)>,
}

impl Drop for UdpAssociation {
    fn drop(&mut self) {
        self.assoc_handle.abort();
    }
}

impl UdpAssociation {
    fn new(inbound: Arc<ProxySocket>, peer_addr: SocketAddr) -> UdpAssociation {
        let (assoc_handle, sender) = UdpAssociationContext::create(inbound, peer_addr);
        UdpAssociation { assoc_handle, sender }
    }

    fn try_send(&self, data: (SocketAddr, Bytes, Bytes)) -> io::Result<()> {
        if self.sender.try_send(data).is_err() {
            return Err(io::Error::other("udp relay channel full"));
        }
        Ok(())
    }
}

struct UdpAssociationContext {
    peer_addr: SocketAddr,
    inbound: Arc<ProxySocket>,
    outbound_ipv4_socket: Option<UdpSocket>,
    outbound_ipv6_socket: Option<UdpSocket>,
    // reply source -> request header, first request wins. Owned per entry so
    // one client's teardown cannot invalidate another's mappings.
    req_index: HashMap<SocketAddr, Bytes>,
}

impl Drop for UdpAssociationContext {
    fn drop(&mut self) {
        debug!("[udp] connection {} closed", self.peer_addr);
    }
}

impl UdpAssociationContext {
    fn create(
        inbound: Arc<ProxySocket>,
        peer_addr: SocketAddr,
    ) -> (JoinHandle<()>, mpsc::Sender<(SocketAddr, Bytes, Bytes)>) {
        // Dropping excessive pending packets protects the server when an
        // association's upstream stalls.
        let (sender, receiver) = mpsc::channel(128);

        let mut assoc = UdpAssociationContext {
            peer_addr,
            inbound,
            outbound_ipv4_socket: None,
            outbound_ipv6_socket: None,
            req_index: HashMap::new(),
        };
        let handle = tokio::spawn(async move { assoc.dispatch_packet(receiver).await });

        (handle, sender)
    }

    async fn dispatch_packet(&mut self, mut receiver: mpsc::Receiver<(SocketAddr, Bytes, Bytes)>) {
        let mut outbound_ipv4_buffer = Vec::new();
        let mut outbound_ipv6_buffer = Vec::new();

        loop {
            tokio::select! {
                packet_received_opt = receiver.recv() => {
                    let (dst, header, body) = match packet_received_opt {
                        Some(d) => d,
                        None => {
                            trace!("[udp] association for {} -> ... channel closed", self.peer_addr);
                            break;
                        }
                    };

                    self.dispatch_received_packet(dst, header, &body).await;
                }

                received_opt = receive_from_outbound_opt(&self.outbound_ipv4_socket, &mut outbound_ipv4_buffer) => {
                    let (n, src) = match received_opt {
                        Ok(r) => r,
                        Err(err) => {
                            if net::is_fd_exhausted(&err) {
                                error!("[udp]read error: {}", err);
                            } else {
                                error!("[udp]error reading from remote of {}: {}", self.peer_addr, err);
                            }
                            // Socket failure. Reset for recreation.
                            self.outbound_ipv4_socket = None;
                            continue;
                        }
                    };

                    self.send_received_respond_packet(src, &outbound_ipv4_buffer[..n]).await;
                }

                received_opt = receive_from_outbound_opt(&self.outbound_ipv6_socket, &mut outbound_ipv6_buffer) => {
                    let (n, src) = match received_opt {
                        Ok(r) => r,
                        Err(err) => {
                            if net::is_fd_exhausted(&err) {
                                error!("[udp]read error: {}", err);
                            } else {
                                error!("[udp]error reading from remote of {}: {}", self.peer_addr, err);
                            }
                            self.outbound_ipv6_socket = None;
                            continue;
                        }
                    };

                    self.send_received_respond_packet(src, &outbound_ipv6_buffer[..n]).await;
                }
            }
        }

        #[inline]
        async fn receive_from_outbound_opt(
            socket: &Option<UdpSocket>,
            buf: &mut Vec<u8>,
        ) -> io::Result<(usize, SocketAddr)> {
            match *socket {
                None => future::pending().await,
                Some(ref s) => {
                    if buf.is_empty() {
                        buf.resize(MAXIMUM_UDP_PAYLOAD_SIZE, 0);
                    }
                    s.recv_from(buf).await
                }
            }
        }
    }

    async fn dispatch_received_packet(&mut self, dst: SocketAddr, header: Bytes, body: &[u8]) {
        trace!("[udp] relay {} -> {} with {} bytes", self.peer_addr, dst, body.len());

        // remember the header the client used, first request wins
        self.req_index.entry(dst).or_insert(header);

        if let Err(err) = self.send_received_outbound_packet(dst, body).await {
            if net::is_fd_exhausted(&err) {
                error!("[udp]write error: {}", err);
            } else {
                error!("[udp]error connecting to: {}, {}", dst, err);
            }
        }
    }

    async fn send_received_outbound_packet(&mut self, target_addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        let socket = match target_addr {
            SocketAddr::V4(..) => match self.outbound_ipv4_socket {
                Some(ref mut socket) => socket,
                None => {
                    // wildcard local port: the reverse path accepts replies
                    // from any source ("full cone")
                    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
                    self.outbound_ipv4_socket.insert(socket)
                }
            },
            SocketAddr::V6(..) => match self.outbound_ipv6_socket {
                Some(ref mut socket) => socket,
                None => {
                    let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await?;
                    self.outbound_ipv6_socket.insert(socket)
                }
            },
        };

        let n = socket.send_to(data, target_addr).await?;
        if n != data.len() {
            warn!(
                "[udp] {} -> {} sent {} bytes != expected {} bytes",
                self.peer_addr,
                target_addr,
                n,
                data.len()
            );
        }

        Ok(())
    }

    async fn send_received_respond_packet(&mut self, src: SocketAddr, data: &[u8]) {
        trace!("[udp] relay {} <- {} received {} bytes", self.peer_addr, src, data.len());

        // replay the exact header the client sent when the reply source
        // matches an earlier request: a domain-typed destination cannot be
        // reconstructed from the source address alone
        let result = match self.req_index.get(&src) {
            Some(header) => self.inbound.send_to_with_header(self.peer_addr, header, data).await,
            None => self.inbound.send_to(self.peer_addr, &Address::from(src), data).await,
        };

        match result {
            Ok(..) => trace!("[udp] relay {} <- {} with {} bytes", self.peer_addr, src, data.len()),
            Err(err) => warn!(
                "[udp] failed to send back to client {}, from target {}, error: {}",
                self.peer_addr, src, err
            ),
        }
    }
}
