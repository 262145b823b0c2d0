//! A TCP stream for communicating with shadowsocks' proxy client

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use byte_string::ByteStr;
use bytes::{Bytes, BytesMut};
use futures::ready;
use log::trace;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::{
    crypto::{random_iv, CipherKind},
    relay::address::Address,
};

use super::stream::{DecryptedReader, EncryptedWriter};

/// A stream for communicating with shadowsocks' proxy client
///
/// Reads decrypt, writes encrypt. The decryptor initializes itself from the
/// IV prefix of the inbound stream; the encryptor's IV is generated at
/// construction and leaves with the first outbound write.
#[pin_project]
pub struct ProxyServerStream<S> {
    #[pin]
    stream: S,
    dec: DecryptedReader,
    enc: EncryptedWriter,
    has_handshaked: bool,
}

impl<S> ProxyServerStream<S> {
    /// Create a `ProxyServerStream` from an accepted connection
    pub fn from_stream(stream: S, method: CipherKind, key: &[u8]) -> ProxyServerStream<S> {
        let iv = random_iv(method.iv_len());
        trace!("generated stream iv {:?}", ByteStr::new(&iv));

        ProxyServerStream {
            stream,
            dec: DecryptedReader::new(method, key),
            enc: EncryptedWriter::new(method, key, &iv),
            has_handshaked: false,
        }
    }

    /// Get reference of the internal stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consumes the object and return the internal stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handshaking. Getting the destination address from the client.
    ///
    /// This method should be called only once after accepted. Any payload
    /// bytes that arrived in the same segments as the address header are
    /// returned as `leftover`; they must reach the upstream socket before
    /// relaying starts.
    pub async fn handshake(&mut self) -> io::Result<(Address, Bytes)> {
        if self.has_handshaked {
            return Err(io::Error::other("stream is already handshaked"));
        }
        self.has_handshaked = true;

        let mut buf = BytesMut::with_capacity(Address::max_serialized_len());
        loop {
            if let Some((addr, header_len)) = Address::parse_partial(&buf).map_err(io::Error::from)? {
                let leftover = buf.split_off(header_len).freeze();
                if !leftover.is_empty() {
                    trace!("request header carried {} payload bytes", leftover.len());
                }
                return Ok((addr, leftover));
            }

            let n = self.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before a complete address header",
                ));
            }
        }
    }
}

impl<S> AsyncRead for ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.has_handshaked {
            return Err(io::Error::other("stream is not handshaked yet")).into();
        }

        let this = self.project();
        ready!(this.dec.poll_read_decrypted(cx, this.stream.get_mut(), buf))?;
        Ok(()).into()
    }
}

impl<S> AsyncWrite for ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        this.enc
            .poll_write_encrypted(cx, this.stream.get_mut(), buf)
            .map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
