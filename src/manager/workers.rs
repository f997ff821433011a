//! Workers known to the manager: feed-server endpoints and port pools

use crate::assets::DEFAULT_WORKER_PORTS;
use crate::config::WorkerConfig;
use crate::error::ManagerError;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerEntry {
    pub name: String,
    /// Port of the worker's feed server, unknown until the worker reports it
    pub feed_server_port: Option<u16>,
    free: BTreeSet<u16>,
    reserved: BTreeSet<u16>,
}

impl WorkerEntry {
    fn new(name: &str, ports: RangeInclusive<u16>) -> Self {
        WorkerEntry {
            name: name.to_string(),
            feed_server_port: None,
            free: ports.collect(),
            reserved: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerDirectory {
    workers: BTreeMap<String, WorkerEntry>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(workers: &[WorkerConfig]) -> Self {
        let mut directory = WorkerDirectory::new();
        for worker in workers {
            directory.register(worker);
        }
        directory
    }

    pub fn register(&mut self, worker: &WorkerConfig) {
        let mut entry = WorkerEntry::new(&worker.name, worker.ports.start..=worker.ports.end);
        entry.feed_server_port = worker.feed_server_port;
        debug!(
            "Registered worker {} with ports {}-{}",
            worker.name, worker.ports.start, worker.ports.end
        );
        self.workers.insert(worker.name.clone(), entry);
    }

    fn entry(&mut self, name: &str) -> &mut WorkerEntry {
        self.workers
            .entry(name.to_string())
            .or_insert_with(|| WorkerEntry::new(name, DEFAULT_WORKER_PORTS))
    }

    /// The worker's feed server is listening; connections to it can be made
    pub fn feed_server_available(&mut self, name: &str, port: u16) {
        info!("Feed server of worker {} available on port {}", name, port);
        self.entry(name).feed_server_port = Some(port);
    }

    pub fn worker_detached(&mut self, name: &str) {
        if let Some(entry) = self.workers.get_mut(name) {
            info!("Worker {} went away", name);
            entry.feed_server_port = None;
        }
    }

    pub fn feed_server_port(&self, name: &str) -> Option<u16> {
        self.workers.get(name).and_then(|w| w.feed_server_port)
    }

    pub fn reserve_ports(&mut self, name: &str, count: usize) -> Result<Vec<u16>, ManagerError> {
        let entry = self.entry(name);
        if entry.free.len() < count {
            warn!("Worker {} has only {} free ports, {} wanted", name, entry.free.len(), count);
            return Err(ManagerError::NoPortsAvailable(name.to_string()));
        }
        let ports: Vec<u16> = entry.free.iter().take(count).copied().collect();
        for port in &ports {
            entry.free.remove(port);
            entry.reserved.insert(*port);
        }
        debug!("Reserved ports {:?} on worker {}", ports, name);
        Ok(ports)
    }

    /// Give ports back to the pool; ports that were not reserved are ignored
    pub fn release_ports(&mut self, name: &str, ports: &[u16]) {
        let Some(entry) = self.workers.get_mut(name) else {
            return;
        };
        for port in ports {
            if entry.reserved.remove(port) {
                entry.free.insert(*port);
            }
        }
        debug!("Released ports {:?} on worker {}", ports, name);
    }
}

#[cfg(test)]
impl WorkerEntry {
    pub fn reserved(&self) -> impl Iterator<Item = u16> + '_ {
        self.reserved.iter().copied()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
impl WorkerDirectory {
    pub fn get(&self, name: &str) -> Option<&WorkerEntry> {
        self.workers.get(name)
    }
}
