//! Per-port traffic accounting

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// Connection flow statistic
#[derive(Default)]
pub struct FlowStat {
    tx: AtomicU64,
    rx: AtomicU64,
}

impl FlowStat {
    /// Create an empty flow statistic
    pub fn new() -> FlowStat {
        FlowStat::default()
    }

    /// Transmitted bytes count
    pub fn tx(&self) -> u64 {
        self.tx.load(Ordering::Relaxed)
    }

    /// Increase transmitted bytes
    pub fn incr_tx(&self, n: u64) {
        self.tx.fetch_add(n, Ordering::AcqRel);
    }

    /// Received bytes count
    pub fn rx(&self) -> u64 {
        self.rx.load(Ordering::Relaxed)
    }

    /// Increase received bytes
    pub fn incr_rx(&self, n: u64) {
        self.rx.fetch_add(n, Ordering::AcqRel);
    }
}

/// Flow statistic for one port
#[derive(Default)]
pub struct ServerFlowStatistic {
    tcp: FlowStat,
    udp: FlowStat,
}

impl ServerFlowStatistic {
    /// Create a new ServerFlowStatistic
    pub fn new() -> ServerFlowStatistic {
        ServerFlowStatistic::default()
    }

    /// TCP relay flow statistic
    pub fn tcp(&self) -> &FlowStat {
        &self.tcp
    }

    /// UDP relay flow statistic
    pub fn udp(&self) -> &FlowStat {
        &self.udp
    }

    /// Total bytes transferred over this port
    pub fn trans_stat(&self) -> u64 {
        self.tcp.tx() + self.tcp.rx() + self.udp.tx() + self.udp.rx()
    }
}

/// Registry of flow statistics for every live port
///
/// Ports are registered when their listeners start and deregistered when the
/// manager deletes them.
#[derive(Default)]
pub struct FlowManager {
    servers: Mutex<BTreeMap<u16, Arc<ServerFlowStatistic>>>,
}

impl FlowManager {
    pub fn new() -> FlowManager {
        FlowManager::default()
    }

    /// Register a port, returning its statistic. Registering an already
    /// known port returns the existing statistic.
    pub fn add(&self, port: u16) -> Arc<ServerFlowStatistic> {
        let mut servers = self.servers.lock().expect("flow manager lock");
        servers.entry(port).or_default().clone()
    }

    /// Deregister a port
    pub fn remove(&self, port: u16) {
        let mut servers = self.servers.lock().expect("flow manager lock");
        servers.remove(&port);
    }

    /// Statistic of one port, if registered
    pub fn get(&self, port: u16) -> Option<Arc<ServerFlowStatistic>> {
        let servers = self.servers.lock().expect("flow manager lock");
        servers.get(&port).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_count() {
        let manager = FlowManager::new();
        let flow = manager.add(8388);
        flow.tcp().incr_rx(100);
        flow.tcp().incr_tx(40);
        flow.udp().incr_rx(7);

        let same = manager.add(8388);
        assert_eq!(same.trans_stat(), 147);

        manager.remove(8388);
        assert!(manager.get(8388).is_none());
    }
}
