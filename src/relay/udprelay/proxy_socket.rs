//! UDP socket for communicating with shadowsocks' proxy clients

use std::{io, net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;

use crate::{
    crypto::CipherKind,
    net::ServerFlowStatistic,
    relay::address::Address,
};

use super::crypto_io::{decrypt_payload, encrypt_payload, ProtocolResult};

/// Framed datagram socket: every datagram is independently IV-framed and
/// encrypted with the port's key
pub struct ProxySocket {
    socket: UdpSocket,
    method: CipherKind,
    key: Bytes,
    flow_stat: Arc<ServerFlowStatistic>,
}

impl ProxySocket {
    /// Wrap a bound inbound socket
    pub fn from_socket(
        socket: UdpSocket,
        method: CipherKind,
        key: Bytes,
        flow_stat: Arc<ServerFlowStatistic>,
    ) -> ProxySocket {
        ProxySocket {
            socket,
            method,
            key,
            flow_stat,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one raw (still encrypted) datagram
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, peer_addr) = self.socket.recv_from(buf).await?;
        self.flow_stat.udp().incr_rx(n as u64);
        Ok((n, peer_addr))
    }

    /// Decrypt a received datagram in place, splitting it into destination
    /// address, raw header bytes and payload body
    pub fn decrypt<'a>(&self, packet: &'a mut [u8]) -> ProtocolResult<(Address, &'a [u8], &'a [u8])> {
        decrypt_payload(self.method, &self.key, packet)
    }

    /// Encrypt and send `header || payload` to `peer`, replaying the exact
    /// header bytes of an earlier request
    pub async fn send_to_with_header(&self, peer: SocketAddr, header: &[u8], payload: &[u8]) -> ProtocolResult<usize> {
        let mut buf = BytesMut::with_capacity(self.method.iv_len() + header.len() + payload.len());
        encrypt_payload(self.method, &self.key, header, payload, &mut buf);

        let n = self.socket.send_to(&buf, peer).await?;
        self.flow_stat.udp().incr_tx(n as u64);
        Ok(n)
    }

    /// Encrypt and send a reply with a synthesized header for `addr`
    pub async fn send_to(&self, peer: SocketAddr, addr: &Address, payload: &[u8]) -> ProtocolResult<usize> {
        let mut header = BytesMut::with_capacity(addr.serialized_len());
        addr.write_to_buf(&mut header);
        self.send_to_with_header(peer, &header, payload).await
    }
}
