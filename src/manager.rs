//! Port/password manager
//!
//! Registry of the active TCP listeners and UDP sockets, keyed by port.
//! Reconfiguration never mutates an installed listener: it closes the old
//! one and spawns a replacement, so pipes opened under the previous password
//! drain out through their teardown flag while new connections use the new
//! key.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{error, info};
use tokio::task::JoinHandle;

use crate::{
    config::{Config, PortConfig},
    crypto::CipherKind,
    net::{self, AddrFamily, FlowManager},
    relay::{tcprelay::TcpServer, udprelay::UdpServer, Teardown},
};

/// A registered TCP listener
struct PortListener {
    config: PortConfig,
    teardown: Teardown,
    handle: JoinHandle<()>,
}

/// A registered UDP listener
struct UdpListener {
    config: PortConfig,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    tcp: HashMap<u16, PortListener>,
    udp: HashMap<u16, UdpListener>,
}

enum UpdateAction {
    /// Port is not registered yet, start it
    Start,
    /// Password or openvpn flag changed, restart TCP (and UDP)
    ///
    /// The removed listeners' handles ride along so the replacement can wait
    /// for the old sockets to actually close before rebinding the port.
    RestartBoth {
        old_tcp: Option<JoinHandle<()>>,
        old_udp: Option<JoinHandle<()>>,
    },
    /// Only the udp flag changed, restart UDP alone
    RestartUdp { old_udp: Option<JoinHandle<()>> },
    /// Nothing to change
    Keep,
}

/// Registry of active listeners with add/delete/update operations
pub struct PortManager {
    registry: Mutex<Registry>,
    flow: FlowManager,
    method: CipherKind,
    timeout: Duration,
    family: AddrFamily,
    udp_enabled: bool,
    udp_expiry: Option<Duration>,
}

impl PortManager {
    pub fn new(config: &Config, udp_enabled: bool) -> PortManager {
        PortManager {
            registry: Mutex::new(Registry::default()),
            flow: FlowManager::new(),
            method: config.method,
            timeout: config.timeout,
            family: config.net,
            udp_enabled,
            udp_expiry: None,
        }
    }

    /// Override the NAT idle expiry of UDP listeners spawned afterwards
    pub fn set_udp_expiry(&mut self, expiry: Duration) {
        self.udp_expiry = Some(expiry);
    }

    /// Traffic statistics of the registered ports
    pub fn flow(&self) -> &FlowManager {
        &self.flow
    }

    /// Snapshot of a registered TCP listener's config
    pub fn get(&self, port: u16) -> Option<PortConfig> {
        let registry = self.registry.lock().expect("manager lock");
        registry.tcp.get(&port).map(|pl| pl.config.clone())
    }

    /// Snapshot of a registered UDP listener's config
    pub fn get_udp(&self, port: u16) -> Option<PortConfig> {
        let registry = self.registry.lock().expect("manager lock");
        registry.udp.get(&port).map(|ul| ul.config.clone())
    }

    fn add(&self, port: u16, config: PortConfig, teardown: Teardown, handle: JoinHandle<()>) {
        let mut registry = self.registry.lock().expect("manager lock");
        if let Some(old) = registry.tcp.insert(port, PortListener { config, teardown, handle }) {
            old.handle.abort();
            old.teardown.set();
        }
        drop(registry);

        self.flow.add(port);
    }

    fn add_udp(&self, port: u16, config: PortConfig, handle: JoinHandle<()>) {
        let mut registry = self.registry.lock().expect("manager lock");
        if let Some(old) = registry.udp.insert(port, UdpListener { config, handle }) {
            old.handle.abort();
        }
        drop(registry);

        self.flow.add(port);
    }

    /// Close a port's listeners, terminate its pipes and deregister traffic
    pub fn delete(&self, port: u16) {
        let (tcp, udp) = {
            let mut registry = self.registry.lock().expect("manager lock");
            (registry.tcp.remove(&port), registry.udp.remove(&port))
        };

        if let Some(pl) = tcp {
            pl.handle.abort();
            pl.teardown.set();
        }
        if let Some(ul) = udp {
            ul.handle.abort();
        }

        self.flow.remove(port);
    }

    /// Install `config` for `port`: start it when absent, restart what the
    /// change requires otherwise
    pub fn update(self: &Arc<Self>, port: u16, config: PortConfig) {
        let action = {
            let mut registry = self.registry.lock().expect("manager lock");

            enum Decision {
                Start,
                RestartBoth,
                RestartUdp,
                Keep,
            }

            let decision = match registry.tcp.get(&port) {
                None => Decision::Start,
                Some(pl) if pl.config.tcp_config_changed(&config) => Decision::RestartBoth,
                Some(pl) if self.udp_enabled && pl.config.udp != config.udp => Decision::RestartUdp,
                Some(..) => Decision::Keep,
            };

            match decision {
                Decision::Start => {
                    info!("new port {} added", port);
                    UpdateAction::Start
                }
                Decision::RestartBoth => {
                    info!("closing port {} to update config", port);
                    let old_tcp = registry.tcp.remove(&port).map(|pl| {
                        pl.handle.abort();
                        pl.teardown.set();
                        pl.handle
                    });
                    let old_udp = registry.udp.remove(&port).map(|ul| {
                        info!("[udp]closing port {} to update config", port);
                        ul.handle.abort();
                        ul.handle
                    });
                    UpdateAction::RestartBoth { old_tcp, old_udp }
                }
                Decision::RestartUdp => {
                    let old_udp = registry.udp.remove(&port).map(|ul| {
                        info!("[udp]closing port {} to update config", port);
                        ul.handle.abort();
                        ul.handle
                    });
                    // the TCP listener keeps running; reinstall its entry with
                    // the new config so the udp flag is not stale
                    if let Some(pl) = registry.tcp.remove(&port) {
                        registry.tcp.insert(
                            port,
                            PortListener {
                                config: config.clone(),
                                teardown: pl.teardown,
                                handle: pl.handle,
                            },
                        );
                    }
                    UpdateAction::RestartUdp { old_udp }
                }
                Decision::Keep => UpdateAction::Keep,
            }
        };

        match action {
            UpdateAction::Start => {
                self.spawn_tcp(port, config.clone(), None);
                if self.udp_enabled && config.udp_ok() {
                    self.spawn_udp(port, config, None);
                }
            }
            UpdateAction::RestartBoth { old_tcp, old_udp } => {
                self.spawn_tcp(port, config.clone(), old_tcp);
                if self.udp_enabled && config.udp_ok() {
                    self.spawn_udp(port, config, old_udp);
                }
            }
            UpdateAction::RestartUdp { old_udp } => {
                if config.udp_ok() {
                    self.spawn_udp(port, config, old_udp);
                }
            }
            UpdateAction::Keep => {}
        }
    }

    /// Apply a freshly loaded configuration: update every port it names and
    /// delete every registered port it dropped
    pub fn update_from_config(self: &Arc<Self>, config: &Config) {
        for (port, port_config) in &config.port_password {
            self.update(*port, port_config.clone());
        }

        let old_ports: BTreeSet<u16> = {
            let registry = self.registry.lock().expect("manager lock");
            registry.tcp.keys().chain(registry.udp.keys()).copied().collect()
        };

        for port in old_ports {
            if !config.port_password.contains_key(&port) {
                info!("closing port {} as it's deleted", port);
                self.delete(port);
            }
        }
    }

    /// Bind and register a TCP listener asynchronously; the registry may
    /// briefly lack the entry while the bind is in flight
    fn spawn_tcp(self: &Arc<Self>, port: u16, config: PortConfig, previous: Option<JoinHandle<()>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            // the replaced listener must release the port first
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let listener = match net::bind_tcp(manager.family, port) {
                Ok(listener) => listener,
                Err(err) => {
                    error!("error listening port {}: {}", port, err);
                    return;
                }
            };

            let teardown = Teardown::new();
            let flow_stat = manager.flow.add(port);
            let server = TcpServer::new(
                port,
                config.clone(),
                manager.method,
                manager.timeout,
                teardown.clone(),
                flow_stat,
            );

            let handle = tokio::spawn(server.run(listener));
            manager.add(port, config, teardown, handle);
        });
    }

    fn spawn_udp(self: &Arc<Self>, port: u16, config: PortConfig, previous: Option<JoinHandle<()>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let socket = match net::bind_udp(manager.family, port) {
                Ok(socket) => socket,
                Err(err) => {
                    error!("[udp] error listening port {}: {}", port, err);
                    return;
                }
            };

            let flow_stat = manager.flow.add(port);
            let server = UdpServer::new(port, config.clone(), manager.method, manager.udp_expiry, flow_stat);

            let handle = tokio::spawn(server.run(socket));
            manager.add_udp(port, config, handle);
        });
    }
}
