//! Shadowsocks request address codec
//!
//! ```plain
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! `ATYP` is `1` (IPv4, 4 bytes), `3` (domain, length-prefixed) or `4`
//! (IPv6, 16 bytes); the port is big-endian.

use std::{
    fmt::{self, Debug, Display, Formatter},
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[rustfmt::skip]
mod consts {
    pub const ADDR_TYPE_IPV4:        u8 = 0x01;
    pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
    pub const ADDR_TYPE_IPV6:        u8 = 0x04;
}

/// Address parsing error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("address domain name must be UTF-8 encoding")]
    AddressDomainInvalidEncoding,
    #[error("address domain name must not be empty")]
    AddressDomainEmpty,
    #[error("address header truncated")]
    ShortHeader,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IoError(err) => err,
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

/// Destination address carried in the request header
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Socket address (IP Address)
    SocketAddress(SocketAddr),
    /// Domain name address
    DomainNameAddress(String, u16),
}

impl Address {
    /// Try to parse an `Address` from the front of `buf`
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete header;
    /// on success returns the address and the number of bytes it occupied.
    /// Bytes past the header belong to the payload.
    pub fn parse_partial(buf: &[u8]) -> Result<Option<(Address, usize)>, Error> {
        if buf.len() < 2 {
            return Ok(None);
        }

        match buf[0] {
            consts::ADDR_TYPE_IPV4 => {
                // ATYP + 4 address bytes + port
                if buf.len() < 7 {
                    return Ok(None);
                }
                let addr = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((
                    Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))),
                    7,
                )))
            }
            consts::ADDR_TYPE_IPV6 => {
                // ATYP + 16 address bytes + port
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let addr = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Some((
                    Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))),
                    19,
                )))
            }
            consts::ADDR_TYPE_DOMAIN_NAME => {
                let domain_len = buf[1] as usize;
                if domain_len == 0 {
                    return Err(Error::AddressDomainEmpty);
                }
                // ATYP + length byte + domain + port
                let header_len = 2 + domain_len + 2;
                if buf.len() < header_len {
                    return Ok(None);
                }
                let domain = match std::str::from_utf8(&buf[2..2 + domain_len]) {
                    Ok(domain) => domain.to_owned(),
                    Err(..) => return Err(Error::AddressDomainInvalidEncoding),
                };
                let port = u16::from_be_bytes([buf[2 + domain_len], buf[3 + domain_len]]);
                Ok(Some((Address::DomainNameAddress(domain, port), header_len)))
            }
            atyp => Err(Error::AddressTypeNotSupported(atyp)),
        }
    }

    /// Parse an `Address` from a complete buffer, e.g. a decrypted datagram
    pub fn read_from_slice(buf: &[u8]) -> Result<(Address, usize), Error> {
        match Address::parse_partial(buf)? {
            Some(parsed) => Ok(parsed),
            None => Err(Error::ShortHeader),
        }
    }

    /// Writes to writer
    #[inline]
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        writer.write_all(&buf).await
    }

    /// Writes the canonical serialized form to buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref dname, port) => {
                assert!(
                    !dname.is_empty() && dname.len() <= u8::MAX as usize,
                    "domain name length must be in [1, 255]"
                );
                buf.put_u8(consts::ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(dname.len() as u8);
                buf.put_slice(dname.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Required buffer size for serializing
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref dname, _) => 1 + 1 + dname.len() + 2,
        }
    }

    /// Maximum header size: domain form with a 255 byte name
    #[inline]
    pub fn max_serialized_len() -> usize {
        1 + 1 + u8::MAX as usize + 2
    }

    /// Associated port number
    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }

    /// Host part as text
    pub fn host(&self) -> String {
        match *self {
            Address::SocketAddress(ref addr) => addr.ip().to_string(),
            Address::DomainNameAddress(ref domain, ..) => domain.to_owned(),
        }
    }
}

impl Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{addr}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(s: SocketAddr) -> Address {
        Address::SocketAddress(s)
    }
}

impl From<(String, u16)> for Address {
    fn from((dn, port): (String, u16)) -> Address {
        Address::DomainNameAddress(dn, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Address) {
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(buf.len(), addr.serialized_len());

        let (parsed, n) = Address::read_from_slice(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(parsed, addr);
    }

    #[test]
    fn roundtrip_ipv4() {
        roundtrip(Address::SocketAddress("1.2.3.4:8080".parse().unwrap()));
    }

    #[test]
    fn roundtrip_ipv6() {
        roundtrip(Address::SocketAddress("[2001:db8::1]:443".parse().unwrap()));
    }

    #[test]
    fn roundtrip_domain() {
        roundtrip(Address::DomainNameAddress("example.com".to_owned(), 80));
    }

    #[test]
    fn parse_wire_format() {
        // \x03 \x0b example.com \x00\x50
        let mut buf = vec![0x03, 0x0b];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&[0x00, 0x50]);

        let (addr, n) = Address::read_from_slice(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(addr, Address::DomainNameAddress("example.com".to_owned(), 80));
    }

    #[test]
    fn parse_leaves_payload() {
        let mut buf = vec![0x01, 127, 0, 0, 1, 0x1f, 0x90];
        buf.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");

        let (addr, n) = Address::parse_partial(&buf).unwrap().unwrap();
        assert_eq!(addr, Address::SocketAddress("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(&buf[n..], b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn parse_incomplete() {
        assert!(Address::parse_partial(&[]).unwrap().is_none());
        assert!(Address::parse_partial(&[0x01]).unwrap().is_none());
        assert!(Address::parse_partial(&[0x01, 1, 2, 3, 4, 0]).unwrap().is_none());
        assert!(Address::parse_partial(&[0x04, 0xfe]).unwrap().is_none());
        // domain of length 5, only 3 name bytes present
        assert!(Address::parse_partial(&[0x03, 5, b'a', b'b', b'c']).unwrap().is_none());

        assert!(matches!(
            Address::read_from_slice(&[0x01, 1, 2]),
            Err(Error::ShortHeader)
        ));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert!(matches!(
            Address::parse_partial(&[0x05, 0, 0, 0, 0, 0, 0]),
            Err(Error::AddressTypeNotSupported(0x05))
        ));
    }

    #[test]
    fn parse_rejects_empty_domain() {
        assert!(matches!(
            Address::parse_partial(&[0x03, 0, 0, 80]),
            Err(Error::AddressDomainEmpty)
        ));
    }
}
