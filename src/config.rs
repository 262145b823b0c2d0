//! This is a mod for storing and parsing configuration
//!
//! The configuration file is a JSON document. A single-port server:
//!
//! ```ignore
//! {
//!     "server_port": 8388,
//!     "password": "the-password",
//!     "method": "aes-256-cfb",
//!     "timeout": 60
//! }
//! ```
//!
//! A multi-port server assigns every port its own password and per-port
//! flags (`openvpn_flag`, `udp_flag`); values may also be plain password
//! strings:
//!
//! ```ignore
//! {
//!     "port_password": {
//!         "8388": ["password-one", "ok", "ok"],
//!         "8389": "password-two"
//!     },
//!     "method": "aes-256-cfb"
//! }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fs::OpenOptions,
    io::{self, Read},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    crypto::CipherKind,
    net::AddrFamily,
};

/// Flag value that enables a per-port feature
const FLAG_OK: &str = "ok";

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    server_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port_password: Option<HashMap<String, SSPortPassword>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    net: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
enum SSPortPassword {
    /// `"port": "password"`
    Password(String),
    /// `"port": [password, openvpn_flag, udp_flag]`, trailing entries optional
    Detailed(Vec<String>),
}

impl SSPortPassword {
    fn into_port_config(self) -> PortConfig {
        match self {
            SSPortPassword::Password(password) => PortConfig::new(password),
            SSPortPassword::Detailed(mut fields) => {
                fields.resize(3, String::new());
                let udp = fields.pop().expect("resized to 3");
                let openvpn = fields.pop().expect("resized to 3");
                let password = fields.pop().expect("resized to 3");
                PortConfig { password, openvpn, udp }
            }
        }
    }
}

/// Per-port configuration, immutable once installed; the manager replaces it
/// wholesale on update
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfig {
    /// Password this port's key is derived from
    pub password: String,
    /// `"ok"` permits relaying to a co-located OpenVPN endpoint on 127.x:1194
    pub openvpn: String,
    /// `"ok"` starts a UDP relay for this port (when UDP is globally enabled)
    pub udp: String,
}

impl PortConfig {
    pub fn new<P: Into<String>>(password: P) -> PortConfig {
        PortConfig {
            password: password.into(),
            openvpn: String::new(),
            udp: String::new(),
        }
    }

    pub fn openvpn_ok(&self) -> bool {
        self.openvpn == FLAG_OK
    }

    pub fn udp_ok(&self) -> bool {
        self.udp == FLAG_OK
    }

    /// Whether applying `new` requires restarting the TCP listener
    pub fn tcp_config_changed(&self, new: &PortConfig) -> bool {
        self.password != new.password || self.openvpn != new.openvpn
    }
}

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("json parse error: {0}")]
    JsonError(#[from] json5::Error),
    #[error("unknown cipher method `{0}`")]
    UnknownMethod(String),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Port of the single-port mode, used when `port_password` is empty
    pub server_port: Option<u16>,
    /// Password of the single-port mode
    pub password: Option<String>,
    /// Port to password map; every entry becomes one listener
    pub port_password: BTreeMap<u16, PortConfig>,
    /// Cipher method shared by every port
    pub method: CipherKind,
    /// Timeout of TCP header reads and per-read deadline of client pipes
    pub timeout: Duration,
    /// Inbound address family restriction
    pub net: AddrFamily,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            server_port: None,
            password: None,
            port_password: BTreeMap::new(),
            method: CipherKind::AES_256_CFB,
            timeout: Duration::from_secs(60),
            net: AddrFamily::Both,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Parse a configuration document
    pub fn load_from_str(s: &str) -> Result<Config, Error> {
        let ssconfig = json5::from_str::<SSConfig>(s)?;

        let mut config = Config::new();
        config.server_port = ssconfig.server_port;
        config.password = ssconfig.password;

        if let Some(method) = ssconfig.method {
            if !method.is_empty() {
                config.method = method.parse().map_err(|_| Error::UnknownMethod(method))?;
            }
        }
        if let Some(timeout) = ssconfig.timeout {
            config.timeout = Duration::from_secs(timeout);
        }
        if let Some(net) = ssconfig.net {
            config.net = AddrFamily::from_net(net);
        }

        if let Some(port_password) = ssconfig.port_password {
            for (port, entry) in port_password {
                let port = port.parse::<u16>().map_err(|_| Error::InvalidPort(port.clone()))?;
                config.port_password.insert(port, entry.into_port_config());
            }
        }

        Ok(config)
    }

    /// Load the configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(filename: P) -> Result<Config, Error> {
        let mut reader = OpenOptions::new().read(true).open(filename)?;
        let mut content = String::new();
        reader.read_to_string(&mut content)?;

        Config::load_from_str(&content)
    }

    /// Synthesize a single-entry `port_password` from `server_port` and
    /// `password` when the map is empty. When the map is present those two
    /// options are ignored with a notice.
    pub fn unify_port_password(&mut self) {
        if self.port_password.is_empty() {
            if let (Some(port), Some(password)) = (self.server_port, self.password.as_ref()) {
                if !password.is_empty() {
                    self.port_password.insert(port, PortConfig::new(password.clone()));
                }
            }
        } else if self.password.is_some() || self.server_port.is_some() {
            eprintln!("given port_password, ignore server_port and password option");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::load_from_str("{}").unwrap();
        assert_eq!(config.method, CipherKind::AES_256_CFB);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.net, AddrFamily::Both);
        assert!(config.port_password.is_empty());
    }

    #[test]
    fn multi_port_document() {
        let config = Config::load_from_str(
            r#"{
                "port_password": {
                    "8388": ["pass-one", "ok", "ok"],
                    "8389": ["pass-two", "", ""],
                    "8390": "pass-three"
                },
                "method": "aes-128-cfb",
                "timeout": 30,
                "net": 4
            }"#,
        )
        .unwrap();

        assert_eq!(config.method, CipherKind::AES_128_CFB);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.net, AddrFamily::Ipv4Only);

        let one = &config.port_password[&8388];
        assert_eq!(one.password, "pass-one");
        assert!(one.openvpn_ok());
        assert!(one.udp_ok());

        let two = &config.port_password[&8389];
        assert!(!two.openvpn_ok());
        assert!(!two.udp_ok());

        let three = &config.port_password[&8390];
        assert_eq!(three.password, "pass-three");
        assert!(!three.udp_ok());
    }

    #[test]
    fn short_detailed_entries_are_padded() {
        let config = Config::load_from_str(r#"{ "port_password": { "8388": ["pw"] } }"#).unwrap();
        let entry = &config.port_password[&8388];
        assert_eq!(entry.password, "pw");
        assert!(!entry.openvpn_ok());
        assert!(!entry.udp_ok());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let err = Config::load_from_str(r#"{ "method": "rot13" }"#).unwrap_err();
        assert!(matches!(err, Error::UnknownMethod(ref m) if m == "rot13"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = Config::load_from_str(r#"{ "port_password": { "port": "pw" } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidPort(..)));
    }

    #[test]
    fn unify_synthesizes_single_port() {
        let mut config = Config::load_from_str(r#"{ "server_port": 8388, "password": "pw" }"#).unwrap();
        config.unify_port_password();
        assert_eq!(config.port_password.len(), 1);
        assert_eq!(config.port_password[&8388].password, "pw");
    }

    #[test]
    fn unify_keeps_port_password_map() {
        let mut config = Config::load_from_str(
            r#"{ "server_port": 9999, "password": "ignored", "port_password": { "8388": "pw" } }"#,
        )
        .unwrap();
        config.unify_port_password();
        assert_eq!(config.port_password.len(), 1);
        assert!(config.port_password.contains_key(&8388));
    }

    #[test]
    fn tcp_config_change_detection() {
        let a = PortConfig {
            password: "pw".to_owned(),
            openvpn: "ok".to_owned(),
            udp: String::new(),
        };

        let mut b = a.clone();
        assert!(!a.tcp_config_changed(&b));

        b.udp = "ok".to_owned();
        assert!(!a.tcp_config_changed(&b));

        b.password = "other".to_owned();
        assert!(a.tcp_config_changed(&b));

        let mut c = a.clone();
        c.openvpn = String::new();
        assert!(a.tcp_config_changed(&c));
    }
}
