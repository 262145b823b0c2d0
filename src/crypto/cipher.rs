//! Key derivation and one-way stream cipher states

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes128, Aes192, Aes256,
};
use bytes::Bytes;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};
use rand::RngCore;

use super::kind::CipherKind;

type Aes128CfbEnc = BufEncryptor<Aes128>;
type Aes192CfbEnc = BufEncryptor<Aes192>;
type Aes256CfbEnc = BufEncryptor<Aes256>;
type Aes128CfbDec = BufDecryptor<Aes128>;
type Aes192CfbDec = BufDecryptor<Aes192>;
type Aes256CfbDec = BufDecryptor<Aes256>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Derive a key from a password with shadowsocks' `EVP_BytesToKey(MD5)`
/// stretching (no salt). Deterministic for a given password.
pub fn bytes_to_key(password: &[u8], key_len: usize) -> Bytes {
    let mut key = Vec::with_capacity(key_len + Md5::output_size());
    let mut last: Option<Vec<u8>> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(ref digest) = last {
            hasher.update(digest);
        }
        hasher.update(password);
        let digest = hasher.finalize().to_vec();
        key.extend_from_slice(&digest);
        last = Some(digest);
    }

    key.truncate(key_len);
    Bytes::from(key)
}

/// Generate a fresh random IV of the given length
pub fn random_iv(len: usize) -> Bytes {
    let mut iv = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut iv);
    Bytes::from(iv)
}

/// Direction a cipher state is initialized for
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CryptoMode {
    Encrypt,
    Decrypt,
}

enum CipherInner {
    Aes128CfbEnc(Aes128CfbEnc),
    Aes192CfbEnc(Aes192CfbEnc),
    Aes256CfbEnc(Aes256CfbEnc),
    Aes128CfbDec(Aes128CfbDec),
    Aes192CfbDec(Aes192CfbDec),
    Aes256CfbDec(Aes256CfbDec),
    Aes128Ctr(Aes128Ctr),
    Aes192Ctr(Aes192Ctr),
    Aes256Ctr(Aes256Ctr),
}

/// One-way stream cipher state
///
/// Carries the implicit keystream position; it is owned and never cloned.
/// A fresh state is created from `(key, iv)` per direction (TCP) or per
/// datagram (UDP).
pub struct Cipher {
    inner: CipherInner,
}

impl Cipher {
    /// Create a cipher state for one direction
    ///
    /// `key` must be `kind.key_len()` bytes and `iv` must be `kind.iv_len()`
    /// bytes; both are guaranteed by the callers deriving them from `kind`.
    pub fn new(kind: CipherKind, key: &[u8], iv: &[u8], mode: CryptoMode) -> Cipher {
        debug_assert_eq!(key.len(), kind.key_len());
        debug_assert_eq!(iv.len(), kind.iv_len());

        let inner = match (kind, mode) {
            (CipherKind::AES_128_CFB, CryptoMode::Encrypt) => {
                CipherInner::Aes128CfbEnc(Aes128CfbEnc::new_from_slices(key, iv).expect("key/iv length"))
            }
            (CipherKind::AES_192_CFB, CryptoMode::Encrypt) => {
                CipherInner::Aes192CfbEnc(Aes192CfbEnc::new_from_slices(key, iv).expect("key/iv length"))
            }
            (CipherKind::AES_256_CFB, CryptoMode::Encrypt) => {
                CipherInner::Aes256CfbEnc(Aes256CfbEnc::new_from_slices(key, iv).expect("key/iv length"))
            }
            (CipherKind::AES_128_CFB, CryptoMode::Decrypt) => {
                CipherInner::Aes128CfbDec(Aes128CfbDec::new_from_slices(key, iv).expect("key/iv length"))
            }
            (CipherKind::AES_192_CFB, CryptoMode::Decrypt) => {
                CipherInner::Aes192CfbDec(Aes192CfbDec::new_from_slices(key, iv).expect("key/iv length"))
            }
            (CipherKind::AES_256_CFB, CryptoMode::Decrypt) => {
                CipherInner::Aes256CfbDec(Aes256CfbDec::new_from_slices(key, iv).expect("key/iv length"))
            }
            // CTR keystreams are direction agnostic
            (CipherKind::AES_128_CTR, _) => {
                CipherInner::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).expect("key/iv length"))
            }
            (CipherKind::AES_192_CTR, _) => {
                CipherInner::Aes192Ctr(Aes192Ctr::new_from_slices(key, iv).expect("key/iv length"))
            }
            (CipherKind::AES_256_CTR, _) => {
                CipherInner::Aes256Ctr(Aes256Ctr::new_from_slices(key, iv).expect("key/iv length"))
            }
        };

        Cipher { inner }
    }

    /// Encrypt a packet in place, advancing the keystream
    pub fn encrypt_packet(&mut self, data: &mut [u8]) {
        match self.inner {
            CipherInner::Aes128CfbEnc(ref mut c) => c.encrypt(data),
            CipherInner::Aes192CfbEnc(ref mut c) => c.encrypt(data),
            CipherInner::Aes256CfbEnc(ref mut c) => c.encrypt(data),
            CipherInner::Aes128Ctr(ref mut c) => c.apply_keystream(data),
            CipherInner::Aes192Ctr(ref mut c) => c.apply_keystream(data),
            CipherInner::Aes256Ctr(ref mut c) => c.apply_keystream(data),
            _ => unreachable!("cipher was initialized for decryption"),
        }
    }

    /// Decrypt a packet in place, advancing the keystream
    pub fn decrypt_packet(&mut self, data: &mut [u8]) {
        match self.inner {
            CipherInner::Aes128CfbDec(ref mut c) => c.decrypt(data),
            CipherInner::Aes192CfbDec(ref mut c) => c.decrypt(data),
            CipherInner::Aes256CfbDec(ref mut c) => c.decrypt(data),
            CipherInner::Aes128Ctr(ref mut c) => c.apply_keystream(data),
            CipherInner::Aes192Ctr(ref mut c) => c.apply_keystream(data),
            CipherInner::Aes256Ctr(ref mut c) => c.apply_keystream(data),
            _ => unreachable!("cipher was initialized for encryption"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kind::CipherKind;

    const METHODS: &[CipherKind] = &[
        CipherKind::AES_128_CFB,
        CipherKind::AES_192_CFB,
        CipherKind::AES_256_CFB,
        CipherKind::AES_128_CTR,
        CipherKind::AES_192_CTR,
        CipherKind::AES_256_CTR,
    ];

    #[test]
    fn key_derivation_md5_chain() {
        let key = bytes_to_key(b"foobar", 32);
        assert_eq!(key.len(), 32);

        // first block is MD5(password), second is MD5(first || password)
        let first = Md5::digest(b"foobar");
        assert_eq!(&key[..16], &first[..]);

        let mut hasher = Md5::new();
        hasher.update(first);
        hasher.update(b"foobar");
        assert_eq!(&key[16..], &hasher.finalize()[..]);
    }

    #[test]
    fn key_derivation_deterministic() {
        for kind in METHODS {
            let a = bytes_to_key(b"some password", kind.key_len());
            let b = bytes_to_key(b"some password", kind.key_len());
            assert_eq!(a, b);
            assert_eq!(a.len(), kind.key_len());
        }
        assert_ne!(bytes_to_key(b"one", 16), bytes_to_key(b"two", 16));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        for &kind in METHODS {
            let key = bytes_to_key(b"test-password", kind.key_len());
            let iv = random_iv(kind.iv_len());

            let mut data = vec![0u8; 16384];
            for (i, b) in data.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            let original = data.clone();

            let mut enc = Cipher::new(kind, &key, &iv, CryptoMode::Encrypt);
            enc.encrypt_packet(&mut data);
            assert_ne!(data, original, "{kind} ciphertext must differ from plaintext");

            let mut dec = Cipher::new(kind, &key, &iv, CryptoMode::Decrypt);
            dec.decrypt_packet(&mut data);
            assert_eq!(data, original, "{kind} roundtrip");
        }
    }

    #[test]
    fn roundtrip_across_chunk_boundaries() {
        // keystream position must be carried across arbitrarily sized calls
        for &kind in METHODS {
            let key = bytes_to_key(b"chunky", kind.key_len());
            let iv = random_iv(kind.iv_len());

            let original: Vec<u8> = (0u32..4096).map(|i| (i * 7 % 256) as u8).collect();

            let mut ciphertext = original.clone();
            let mut enc = Cipher::new(kind, &key, &iv, CryptoMode::Encrypt);
            let mut off = 0;
            for chunk in [1usize, 15, 16, 17, 255, 1000, 2792] {
                enc.encrypt_packet(&mut ciphertext[off..off + chunk]);
                off += chunk;
            }
            assert_eq!(off, original.len());

            let mut plaintext = ciphertext.clone();
            let mut dec = Cipher::new(kind, &key, &iv, CryptoMode::Decrypt);
            let mut off = 0;
            for chunk in [4000usize, 96] {
                dec.decrypt_packet(&mut plaintext[off..off + chunk]);
                off += chunk;
            }
            assert_eq!(plaintext, original, "{kind} chunked roundtrip");
        }
    }

    #[test]
    fn distinct_ivs_give_distinct_ciphertext() {
        let kind = CipherKind::AES_256_CFB;
        let key = bytes_to_key(b"iv-test", kind.key_len());

        let mut a = vec![0x42u8; 64];
        let mut b = vec![0x42u8; 64];
        let iv_a = random_iv(kind.iv_len());
        let iv_b = random_iv(kind.iv_len());
        assert_ne!(iv_a, iv_b);

        Cipher::new(kind, &key, &iv_a, CryptoMode::Encrypt).encrypt_packet(&mut a);
        Cipher::new(kind, &key, &iv_b, CryptoMode::Encrypt).encrypt_packet(&mut b);
        assert_ne!(a, b);
    }
}
