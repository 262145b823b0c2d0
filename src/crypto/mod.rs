//! Stream ciphers for the shadowsocks wire protocol
//!
//! Every supported method is a one-way stream cipher keyed by
//! `EVP_BytesToKey(MD5, password)` and initialized from an IV that travels in
//! clear as the prefix of the stream (TCP) or of every datagram (UDP).

pub use self::{
    cipher::{bytes_to_key, random_iv, Cipher, CryptoMode},
    kind::{available_ciphers, CipherKind, UnknownMethodError},
};

pub mod cipher;
pub mod kind;
