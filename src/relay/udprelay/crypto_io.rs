//! Per-datagram stream cipher framing for UDP
//!
//! ```plain
//! +-------+-----------------------------------+
//! |  IV   | encrypt(ATYP + ADDR + PORT + DATA)|
//! +-------+-----------------------------------+
//! | Fixed | Variable                          |
//! +-------+-----------------------------------+
//! ```
//!
//! Every datagram is framed independently with a fresh IV.

use std::io;

use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use log::trace;
use rand::RngCore;

use crate::{
    crypto::{Cipher, CipherKind, CryptoMode},
    relay::address::{self, Address},
};

/// UDP protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    AddressError(#[from] address::Error),
    #[error("udp packet too short for iv and payload")]
    ShortPacket,
}

/// UDP protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::IoError(err) => err,
            ProtocolError::AddressError(err) => err.into(),
            ProtocolError::ShortPacket => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// Assemble and encrypt one outbound datagram: `iv || encrypt(header || payload)`
pub fn encrypt_payload(method: CipherKind, key: &[u8], header: &[u8], payload: &[u8], dst: &mut BytesMut) {
    let iv_len = method.iv_len();

    dst.clear();
    dst.reserve(iv_len + header.len() + payload.len());
    dst.resize(iv_len, 0);
    rand::thread_rng().fill_bytes(&mut dst[..iv_len]);
    trace!("udp packet generated stream iv {:?}", ByteStr::new(&dst[..iv_len]));

    dst.put_slice(header);
    dst.put_slice(payload);

    let (iv, body) = dst.split_at_mut(iv_len);
    let mut cipher = Cipher::new(method, key, iv, CryptoMode::Encrypt);
    cipher.encrypt_packet(body);
}

/// Decrypt one inbound datagram in place
///
/// Returns the destination address, the raw header bytes as the client sent
/// them (needed to rewrite reply packets) and the payload body.
pub fn decrypt_payload<'a>(
    method: CipherKind,
    key: &[u8],
    packet: &'a mut [u8],
) -> ProtocolResult<(Address, &'a [u8], &'a [u8])> {
    let iv_len = method.iv_len();
    if packet.len() < iv_len + 1 {
        return Err(ProtocolError::ShortPacket);
    }

    let (iv, data) = packet.split_at_mut(iv_len);
    trace!("udp packet got stream iv {:?}", ByteStr::new(iv));

    let mut cipher = Cipher::new(method, key, iv, CryptoMode::Decrypt);
    cipher.decrypt_packet(data);

    let (addr, header_len) = Address::read_from_slice(data)?;
    let (header, body) = (&*data).split_at(header_len);
    Ok((addr, header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bytes_to_key;

    #[test]
    fn datagram_roundtrip() {
        let method = CipherKind::AES_256_CFB;
        let key = bytes_to_key(b"datagram-pass", method.key_len());

        let addr = Address::DomainNameAddress("example.com".to_owned(), 53);
        let mut header = BytesMut::new();
        addr.write_to_buf(&mut header);

        let mut packet = BytesMut::new();
        encrypt_payload(method, &key, &header, b"hello world", &mut packet);
        assert_eq!(packet.len(), method.iv_len() + header.len() + 11);

        let mut received = packet.to_vec();
        let (parsed, raw_header, body) = decrypt_payload(method, &key, &mut received).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(raw_header, &header[..]);
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn each_datagram_has_fresh_iv() {
        let method = CipherKind::AES_128_CFB;
        let key = bytes_to_key(b"fresh", method.key_len());
        let header = [0x01, 8, 8, 8, 8, 0, 53];

        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        encrypt_payload(method, &key, &header, b"q", &mut a);
        encrypt_payload(method, &key, &header, b"q", &mut b);
        assert_ne!(&a[..method.iv_len()], &b[..method.iv_len()]);
    }

    #[test]
    fn short_packet_is_rejected() {
        let method = CipherKind::AES_256_CFB;
        let key = bytes_to_key(b"short", method.key_len());

        let mut packet = vec![0u8; method.iv_len()];
        assert!(matches!(
            decrypt_payload(method, &key, &mut packet),
            Err(ProtocolError::ShortPacket)
        ));
    }
}
