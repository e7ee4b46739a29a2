//! In-memory cluster fixture.

#![allow(dead_code)]

use ha_replicator::clock::unix_nanos;
use ha_replicator::driver::{DriverError, DriverResult};
use ha_replicator::{
    Agent, AgentConfig, Clock, ClusterCoordinator, MemoryDriver, NodeConfig, Point,
    StaticConfigSource,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

pub const MASTER: &str = "influx-a";
pub const SLAVE: &str = "influx-b";
pub const SEC: i64 = 1_000_000_000;

/// Master/slave config with the given initial strategy.
pub fn config(strategy: &str) -> AgentConfig {
    let mut config = AgentConfig::for_testing(MASTER, SLAVE);
    config.general.instance_id = "it-pair".to_string();
    config.general.initial_replication = strategy.to_string();
    config
}

/// An agent wired to in-memory drivers, one per configured node name.
pub struct TestCluster {
    pub source: StaticConfigSource,
    pub drivers: HashMap<String, Arc<MemoryDriver>>,
    pub agent: Arc<Agent<MemoryDriver>>,
}

impl TestCluster {
    pub fn new(config: AgentConfig, clock: Arc<dyn Clock>) -> Self {
        let drivers: HashMap<String, Arc<MemoryDriver>> = [MASTER, SLAVE]
            .into_iter()
            .map(|n| (n.to_string(), Arc::new(MemoryDriver::new(n))))
            .collect();
        let lookup = drivers.clone();
        let factory = move |node: &NodeConfig| -> DriverResult<Arc<MemoryDriver>> {
            lookup
                .get(&node.name)
                .cloned()
                .ok_or_else(|| DriverError::new(format!("no such node {}", node.name)))
        };
        let source = StaticConfigSource::new(config);
        let agent = Arc::new(Agent::with_clock(source.clone(), factory, clock));
        Self {
            source,
            drivers,
            agent,
        }
    }

    pub fn master(&self) -> &Arc<MemoryDriver> {
        &self.drivers[MASTER]
    }

    pub fn slave(&self) -> &Arc<MemoryDriver> {
        &self.drivers[SLAVE]
    }

    /// The running coordinator; panics when the agent is stopped.
    pub fn coordinator(&self) -> Arc<ClusterCoordinator<MemoryDriver>> {
        self.agent.coordinator().expect("agent not running")
    }

    /// Probe both nodes `times` times, as their monitors would.
    pub async fn probe(&self, times: usize) {
        let coordinator = self.coordinator();
        for _ in 0..times {
            coordinator.master().check().await;
            coordinator.slave().check().await;
        }
    }
}

/// A shutdown receiver that never fires.
pub fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// `n` points of `measurement`, one per second, ending one second before `now`.
pub fn points_before(measurement: &str, now: SystemTime, n: i64) -> Vec<Point> {
    let end = unix_nanos(now);
    (0..n)
        .map(|i| {
            Point::new(measurement, end - (n - i) * SEC)
                .tag("host", "web-1")
                .field("value", i as f64)
        })
        .collect()
}

/// `n` points of `measurement` starting at `start`, one per second.
pub fn points_from(measurement: &str, start: SystemTime, n: i64) -> Vec<Point> {
    let start = unix_nanos(start);
    (0..n)
        .map(|i| {
            Point::new(measurement, start + i * SEC)
                .tag("host", "web-1")
                .field("value", i as f64)
        })
        .collect()
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
