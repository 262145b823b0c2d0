//! Stream cipher framing for TCP
//!
//! ```plain
//! +-------+----------------------+
//! |  IV   | Encrypted payload    |
//! +-------+----------------------+
//! | Fixed | Variable             |
//! +-------+----------------------+
//! ```
//!
//! The IV is sent once per direction, as the prefix of the first bytes on
//! the wire; everything after it is a plain keystream passthrough.

use std::{
    io,
    marker::Unpin,
    pin::Pin,
    task::{self, Poll},
};

use byte_string::ByteStr;
use bytes::{BufMut, Bytes, BytesMut};
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{Cipher, CipherKind, CryptoMode};

/// Stream protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("stream ended before a complete iv was received")]
    ShortIv,
}

/// Stream protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(err) => err,
            ProtocolError::ShortIv => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        }
    }
}

enum DecryptReadState {
    WaitIv { key: Bytes },
    Read,
}

/// Reader wrapper that will decrypt data automatically
pub struct DecryptedReader {
    state: DecryptReadState,
    cipher: Option<Cipher>,
    iv_buf: BytesMut,
    method: CipherKind,
}

impl DecryptedReader {
    pub fn new(method: CipherKind, key: &[u8]) -> DecryptedReader {
        DecryptedReader {
            state: DecryptReadState::WaitIv {
                key: Bytes::copy_from_slice(key),
            },
            cipher: None,
            iv_buf: BytesMut::with_capacity(method.iv_len()),
            method,
        }
    }

    /// Attempt to read decrypted data from `stream`
    pub fn poll_read_decrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        loop {
            match self.state {
                DecryptReadState::WaitIv { ref key } => {
                    let key = key.clone();
                    ready!(self.poll_read_iv(cx, stream, &key))?;

                    self.iv_buf.clear();
                    self.state = DecryptReadState::Read;
                }
                DecryptReadState::Read => {
                    let before_n = buf.filled().len();
                    ready!(Pin::new(&mut *stream).poll_read(cx, buf))?;
                    let after_n = buf.filled().len();
                    if after_n > before_n {
                        let m = &mut buf.filled_mut()[before_n..];
                        let cipher = self.cipher.as_mut().expect("cipher initialized with iv");
                        cipher.decrypt_packet(m);
                    }
                    return Ok(()).into();
                }
            }
        }
    }

    fn poll_read_iv<S>(&mut self, cx: &mut task::Context<'_>, stream: &mut S, key: &[u8]) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let iv_len = self.method.iv_len();

        while self.iv_buf.len() < iv_len {
            let remaining = iv_len - self.iv_buf.len();

            let mut chunk = [0u8; 16];
            let mut read_buf = ReadBuf::new(&mut chunk[..remaining.min(16)]);
            ready!(Pin::new(&mut *stream).poll_read(cx, &mut read_buf))?;

            let n = read_buf.filled().len();
            if n == 0 {
                return Err(ProtocolError::ShortIv).into();
            }
            self.iv_buf.put_slice(read_buf.filled());
        }

        let iv = &self.iv_buf[..iv_len];
        trace!("got stream iv {:?}", ByteStr::new(iv));

        self.cipher = Some(Cipher::new(self.method, key, iv, CryptoMode::Decrypt));

        Ok(()).into()
    }

    /// Check if the IV has been received and the cipher initialized
    pub fn handshaked(&self) -> bool {
        matches!(self.state, DecryptReadState::Read)
    }
}

enum EncryptWriteState {
    AssemblePacket,
    Writing { pos: usize },
}

/// Writer wrapper that will encrypt data automatically
///
/// The IV given at construction is queued in the write buffer, so it leaves
/// the socket as a contiguous prefix of the first write.
pub struct EncryptedWriter {
    cipher: Cipher,
    buffer: BytesMut,
    state: EncryptWriteState,
}

impl EncryptedWriter {
    /// Creates a new EncryptedWriter with a freshly generated `iv`
    pub fn new(method: CipherKind, key: &[u8], iv: &[u8]) -> EncryptedWriter {
        let mut buffer = BytesMut::with_capacity(iv.len());
        buffer.put_slice(iv);

        EncryptedWriter {
            cipher: Cipher::new(method, key, iv, CryptoMode::Encrypt),
            buffer,
            state: EncryptWriteState::AssemblePacket,
        }
    }

    /// Attempt to write encrypted data into `stream`
    pub fn poll_write_encrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &[u8],
    ) -> Poll<ProtocolResult<usize>>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            match self.state {
                EncryptWriteState::AssemblePacket => {
                    let n = self.buffer.len();
                    self.buffer.put_slice(buf);
                    self.cipher.encrypt_packet(&mut self.buffer[n..]);
                    self.state = EncryptWriteState::Writing { pos: 0 };
                }
                EncryptWriteState::Writing { ref mut pos } => {
                    while *pos < self.buffer.len() {
                        let n = ready!(Pin::new(&mut *stream).poll_write(cx, &self.buffer[*pos..]))?;
                        if n == 0 {
                            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()).into();
                        }
                        *pos += n;
                    }

                    self.state = EncryptWriteState::AssemblePacket;
                    self.buffer.clear();

                    return Ok(buf.len()).into();
                }
            }
        }
    }
}
