//! Multi-port shadowsocks relay server
//!
//! A single process serves many ports concurrently, each bound to its own
//! password (and hence cipher key). Ports are added, replaced and removed at
//! runtime by re-reading the configuration file on `SIGHUP`.

pub use self::{
    config::{Config, PortConfig},
    manager::PortManager,
    relay::address::Address,
};

pub mod acl;
pub mod config;
pub mod crypto;
pub mod manager;
pub mod net;
pub mod relay;
pub mod server;

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
