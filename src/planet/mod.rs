//! Persisted component records, grouped by flow
//!
//! The planet is the durable side of the manager: one record per component,
//! surviving sessions coming and going. Sessions borrow their record through
//! a [`SharedRecord`] while they are alive.

pub mod config;
pub mod ids;
pub mod message;
pub mod mood;
pub mod record;

pub use config::{ComponentConfig, EaterSource, VirtualFeed};
pub use message::{Level, Message};
pub use mood::Mood;
pub use record::{ComponentRecord, JobState, SharedRecord};

use crate::error::ManagerError;
use anyhow::{Context, Result};
use ids::parse_component_id;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// On-disk layout of a planet
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlanetFile {
    #[serde(default)]
    pub components: Vec<ComponentRecord>,
}

/// Point-in-time copy of every record, keyed by flow
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanetSnapshot {
    pub flows: BTreeMap<String, Vec<ComponentRecord>>,
}

#[derive(Debug, Default)]
pub struct Planet {
    flows: BTreeMap<String, BTreeMap<String, SharedRecord>>,
}

impl Planet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ComponentRecord>) -> Self {
        let mut planet = Planet::new();
        for mut record in records {
            record.job = None;
            planet.insert(record);
        }
        planet
    }

    pub fn load(path: &Path) -> Result<Planet> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read planet from {}", path.display()))?;
        let file: PlanetFile = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse planet {}", path.display()))?;
        let planet = Planet::from_records(file.components);
        info!("Loaded {} components from {}", planet.len(), path.display());
        Ok(planet)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let components = self
            .records()
            .map(|record| {
                let mut record = record.snapshot();
                record.job = None;
                record
            })
            .collect();
        let data = serde_json::to_string_pretty(&PlanetFile { components })?;
        std::fs::write(path, data)
            .with_context(|| format!("Failed to write planet to {}", path.display()))?;
        info!("Saved {} components to {}", self.len(), path.display());
        Ok(())
    }

    fn insert(&mut self, record: ComponentRecord) -> SharedRecord {
        let flow = record.parent().to_string();
        let name = record.name().to_string();
        let shared = SharedRecord::new(record);
        self.flows
            .entry(flow)
            .or_default()
            .insert(name, shared.clone());
        shared
    }

    /// Record for `config`'s component, creating it if the planet does not know it
    pub fn add_component(&mut self, config: ComponentConfig) -> SharedRecord {
        if let Some(existing) = self.get(&config.avatar_id()) {
            return existing;
        }
        debug!("Adding component {} to flow {}", config.name, config.parent);
        self.insert(ComponentRecord::new(config))
    }

    pub fn get(&self, avatar_id: &str) -> Option<SharedRecord> {
        let (flow, name) = parse_component_id(avatar_id).ok()?;
        self.flows.get(flow)?.get(name).cloned()
    }

    pub fn contains(&self, avatar_id: &str) -> bool {
        self.get(avatar_id).is_some()
    }

    pub fn flows(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &SharedRecord> {
        self.flows.values().flat_map(|flow| flow.values())
    }

    pub fn len(&self) -> usize {
        self.flows.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a component that is not running
    pub fn delete_component(&mut self, avatar_id: &str) -> Result<ComponentRecord, ManagerError> {
        let record = self
            .get(avatar_id)
            .ok_or_else(|| ManagerError::UnknownComponent(avatar_id.to_string()))?;
        if !Self::deletable(&record) {
            return Err(ManagerError::ComponentBusy(avatar_id.to_string()));
        }
        let (flow, name) = parse_component_id(avatar_id)?;
        if let Some(components) = self.flows.get_mut(flow) {
            components.remove(name);
            if components.is_empty() {
                self.flows.remove(flow);
            }
        }
        info!("Deleted component {}", avatar_id);
        Ok(record.snapshot())
    }

    /// Remove a whole flow; nothing is removed if any component is busy
    pub fn delete_flow(&mut self, flow: &str) -> Result<Vec<ComponentRecord>, ManagerError> {
        let components = self
            .flows
            .get(flow)
            .ok_or_else(|| ManagerError::UnknownComponent(format!("/{}", flow)))?;
        if let Some(busy) = components.values().find(|r| !Self::deletable(r)) {
            return Err(ManagerError::ComponentBusy(busy.read(|r| r.avatar_id())));
        }
        let removed = self.flows.remove(flow).unwrap_or_default();
        info!("Deleted flow {} with {} components", flow, removed.len());
        Ok(removed.values().map(SharedRecord::snapshot).collect())
    }

    fn deletable(record: &SharedRecord) -> bool {
        record.read(|r| !r.is_attached() && r.mood.is_deletable())
    }

    pub fn snapshot(&self) -> PlanetSnapshot {
        PlanetSnapshot {
            flows: self
                .flows
                .iter()
                .map(|(flow, components)| {
                    (
                        flow.clone(),
                        components.values().map(SharedRecord::snapshot).collect(),
                    )
                })
                .collect(),
        }
    }
}
