//! Shadowsocks TCP server

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::{self, Either};
use log::{debug, error, info, trace, warn};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time,
};

use crate::{
    acl,
    config::PortConfig,
    crypto::{bytes_to_key, CipherKind},
    net::{self, MonProxyStream, ServerFlowStatistic},
    relay::{address::Address, Teardown},
};

use self::{
    proxy_stream::ProxyServerStream,
    utils::{copy_from_encrypted, copy_to_encrypted, CopyOptions},
};

pub mod proxy_stream;
pub mod stream;
pub mod utils;

/// Process-wide count of live client connections
static CONNECTION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Every Nth concurrent connection logs a progress line
const LOG_CONNECTION_DELTA: u64 = 100;

/// TCP relay server for one port
pub struct TcpServer {
    port: u16,
    config: PortConfig,
    method: CipherKind,
    timeout: Duration,
    teardown: Teardown,
    flow_stat: Arc<ServerFlowStatistic>,
}

impl TcpServer {
    pub fn new(
        port: u16,
        config: PortConfig,
        method: CipherKind,
        timeout: Duration,
        teardown: Teardown,
        flow_stat: Arc<ServerFlowStatistic>,
    ) -> TcpServer {
        TcpServer {
            port,
            config,
            method,
            timeout,
            teardown,
            flow_stat,
        }
    }

    /// Accept loop. Ends when the listener is closed by the manager during a
    /// reconfigure or shutdown.
    pub async fn run(self, listener: TcpListener) {
        info!("tcp server listening on port {}", self.port);

        // Key derivation is deferred to the first accepted connection, so
        // idle ports pay nothing.
        let mut key: Option<Bytes> = None;

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    if net::is_fd_exhausted(&err) {
                        error!("tcp server on port {} accept error: {}", self.port, err);
                        time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    // listener was closed to update the port's config
                    debug!("tcp server on port {} accept ended: {}", self.port, err);
                    return;
                }
            };

            let key = match key {
                Some(ref key) => key.clone(),
                None => {
                    info!("creating cipher for port: {}", self.port);
                    let derived = bytes_to_key(self.config.password.as_bytes(), self.method.key_len());
                    key = Some(derived.clone());
                    derived
                }
            };

            let count = CONNECTION_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
            if count % LOG_CONNECTION_DELTA == 0 {
                info!("number of client connections reaches {}", count);
            }

            debug!("new client {} on port {}", peer_addr, self.port);

            let client = TcpServerClient {
                timeout: self.timeout,
                openvpn_ok: self.config.openvpn_ok(),
                teardown: self.teardown.clone(),
                peer_addr,
                stream: ProxyServerStream::from_stream(
                    MonProxyStream::from_stream(stream, self.flow_stat.clone()),
                    self.method,
                    &key,
                ),
            };

            tokio::spawn(async move {
                if let Err(err) = client.serve().await {
                    debug!("tcp server stream aborted with error: {}", err);
                }
                CONNECTION_COUNT.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

struct TcpServerClient {
    timeout: Duration,
    openvpn_ok: bool,
    teardown: Teardown,
    peer_addr: SocketAddr,
    stream: ProxyServerStream<MonProxyStream<TcpStream>>,
}

impl TcpServerClient {
    async fn serve(mut self) -> io::Result<()> {
        let (target_addr, leftover) = match time::timeout(self.timeout, self.stream.handshake()).await {
            Err(..) => {
                debug!("request header from {} timed out", self.peer_addr);
                return Ok(());
            }
            Ok(Err(err)) => {
                warn!("error getting request from {}: {}", self.peer_addr, err);
                return Ok(());
            }
            Ok(Ok(r)) => r,
        };

        trace!(
            "accepted tcp client connection {}, establishing tunnel to {}",
            self.peer_addr,
            target_addr
        );

        let target = match target_addr {
            Address::SocketAddress(sa) => sa,
            Address::DomainNameAddress(ref dname, port) => match net::resolve(dname, port).await {
                Ok(sa) => sa,
                Err(err) => {
                    warn!("{}", err);
                    return Ok(());
                }
            },
        };

        if acl::check_outbound_blocked(target.ip(), target.port(), self.openvpn_ok) {
            warn!("illegal connect to local network({})", target.ip());
            return Ok(());
        }

        let mut remote = match TcpStream::connect(target).await {
            Ok(s) => s,
            Err(err) => {
                if net::is_fd_exhausted(&err) {
                    error!("dial error: {}", err);
                } else {
                    debug!("error connecting to {}: {}", target_addr, err);
                }
                return Ok(());
            }
        };

        // payload bytes that arrived together with the request header go out
        // before relaying starts
        if !leftover.is_empty() {
            remote.write_all(&leftover).await?;
        }

        debug!("established tcp tunnel {} <-> {}", self.peer_addr, target_addr);

        let peer_addr = self.peer_addr;
        let (mut lr, mut lw) = tokio::io::split(self.stream);
        let (mut rr, mut rw) = remote.split();

        let l2r = copy_from_encrypted(
            &mut lr,
            &mut rw,
            CopyOptions {
                read_timeout: Some(self.timeout),
                teardown: self.teardown.clone(),
            },
        );
        let r2l = copy_to_encrypted(
            &mut rr,
            &mut lw,
            CopyOptions {
                read_timeout: None,
                teardown: self.teardown.clone(),
            },
        );

        tokio::pin!(l2r);
        tokio::pin!(r2l);

        match future::select(l2r, r2l).await {
            Either::Left((Ok(..), ..)) => {
                trace!("tcp tunnel {} -> {} closed", peer_addr, target_addr);
            }
            Either::Left((Err(err), ..)) => {
                trace!("tcp tunnel {} -> {} closed with error: {}", peer_addr, target_addr, err);
            }
            Either::Right((Ok(..), ..)) => {
                trace!("tcp tunnel {} <- {} closed", peer_addr, target_addr);
            }
            Either::Right((Err(err), ..)) => {
                trace!("tcp tunnel {} <- {} closed with error: {}", peer_addr, target_addr, err);
            }
        }

        Ok(())
    }
}
