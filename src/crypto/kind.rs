//! Cipher method identifiers

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use thiserror::Error;

/// Method name is not in [`available_ciphers`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown cipher method")]
pub struct UnknownMethodError;

/// Supported stream cipher methods
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[allow(non_camel_case_types)]
pub enum CipherKind {
    AES_128_CFB,
    AES_192_CFB,
    AES_256_CFB,
    AES_128_CTR,
    AES_192_CTR,
    AES_256_CTR,
}

impl CipherKind {
    /// Length of the derived key in bytes
    pub fn key_len(self) -> usize {
        match self {
            Self::AES_128_CFB | Self::AES_128_CTR => 16,
            Self::AES_192_CFB | Self::AES_192_CTR => 24,
            Self::AES_256_CFB | Self::AES_256_CTR => 32,
        }
    }

    /// Length of the initialization vector in bytes
    pub fn iv_len(self) -> usize {
        // AES block size, for both CFB and CTR
        16
    }

    /// Method name on the wire and in configuration files
    pub fn name(self) -> &'static str {
        match self {
            Self::AES_128_CFB => "aes-128-cfb",
            Self::AES_192_CFB => "aes-192-cfb",
            Self::AES_256_CFB => "aes-256-cfb",
            Self::AES_128_CTR => "aes-128-ctr",
            Self::AES_192_CTR => "aes-192-ctr",
            Self::AES_256_CTR => "aes-256-ctr",
        }
    }
}

impl Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherKind {
    type Err = UnknownMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-128-cfb" => Ok(Self::AES_128_CFB),
            "aes-192-cfb" => Ok(Self::AES_192_CFB),
            "aes-256-cfb" => Ok(Self::AES_256_CFB),
            "aes-128-ctr" => Ok(Self::AES_128_CTR),
            "aes-192-ctr" => Ok(Self::AES_192_CTR),
            "aes-256-ctr" => Ok(Self::AES_256_CTR),
            _ => Err(UnknownMethodError),
        }
    }
}

/// Names of all supported methods, for `--help` and config validation
pub fn available_ciphers() -> &'static [&'static str] {
    &[
        "aes-128-cfb",
        "aes-192-cfb",
        "aes-256-cfb",
        "aes-128-ctr",
        "aes-192-ctr",
        "aes-256-ctr",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_methods() {
        for name in available_ciphers() {
            let kind = name.parse::<CipherKind>().expect("listed method must parse");
            assert_eq!(kind.name(), *name);
            assert_eq!(kind.iv_len(), 16);
        }
    }

    #[test]
    fn parse_unknown_method() {
        assert_eq!("rc4-md5".parse::<CipherKind>(), Err(UnknownMethodError));
        assert_eq!("".parse::<CipherKind>(), Err(UnknownMethodError));
    }

    #[test]
    fn key_lengths() {
        assert_eq!(CipherKind::AES_128_CFB.key_len(), 16);
        assert_eq!(CipherKind::AES_192_CFB.key_len(), 24);
        assert_eq!(CipherKind::AES_256_CFB.key_len(), 32);
        assert_eq!(CipherKind::AES_256_CTR.key_len(), 32);
    }
}
