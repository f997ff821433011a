//! In-process component job
//!
//! Answers the manager from a configuration and a job state held in memory.
//! Used to run whole flows inside the manager process, and as the remote
//! side in tests: every call is recorded, and any method can be made to fail.

use crate::error::RemoteError;
use crate::manager::clock::Clocking;
use crate::mind::{ComponentMind, Keycard, RemoteResult};
use crate::planet::{ComponentConfig, JobState, Mood};
use crate::utils::lock;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum MindCall {
    GetConfig,
    GetState,
    GetMasterClockInfo,
    EatFrom {
        eater_alias: String,
        full_feed_id: String,
        host: String,
        port: u16,
    },
    FeedTo {
        feeder_name: String,
        full_feed_id: String,
        host: String,
        port: u16,
    },
    ProvideMasterClock {
        port: u16,
    },
    SetMasterClock(Clocking),
    SetElementProperty {
        element: String,
        property: String,
        value: Value,
    },
    GetElementProperty {
        element: String,
        property: String,
    },
    Stop,
    Reload,
    Authenticate(Keycard),
    RemoveKeycardId(String),
    ExpireKeycard(String),
}

impl MindCall {
    pub fn method(&self) -> &'static str {
        match self {
            MindCall::GetConfig => "getConfig",
            MindCall::GetState => "getState",
            MindCall::GetMasterClockInfo => "getMasterClockInfo",
            MindCall::EatFrom { .. } => "eatFrom",
            MindCall::FeedTo { .. } => "feedTo",
            MindCall::ProvideMasterClock { .. } => "provideMasterClock",
            MindCall::SetMasterClock(_) => "setMasterClock",
            MindCall::SetElementProperty { .. } => "setElementProperty",
            MindCall::GetElementProperty { .. } => "getElementProperty",
            MindCall::Stop => "stop",
            MindCall::Reload => "reloadComponent",
            MindCall::Authenticate(_) => "authenticate",
            MindCall::RemoveKeycardId(_) => "removeKeycardId",
            MindCall::ExpireKeycard(_) => "expireKeycard",
        }
    }
}

struct LocalState {
    job: JobState,
    clocking: Option<Clocking>,
    host: String,
    calls: Vec<MindCall>,
    failing: HashSet<String>,
    properties: HashMap<(String, String), Value>,
    latency: Option<Duration>,
    keycards: u64,
}

pub struct LocalMind {
    config: ComponentConfig,
    state: Mutex<LocalState>,
}

impl LocalMind {
    pub fn new(config: ComponentConfig, worker_name: &str) -> Self {
        let elements = vec![format!("{}-source", config.name), format!("{}-sink", config.name)];
        LocalMind {
            config,
            state: Mutex::new(LocalState {
                job: JobState {
                    mood: Mood::Happy,
                    elements,
                    pid: std::process::id(),
                    worker_name: worker_name.to_string(),
                    manager_ip: None,
                },
                clocking: None,
                host: crate::assets::LOOPBACK_HOST.to_string(),
                calls: Vec::new(),
                failing: HashSet::new(),
                properties: HashMap::new(),
                latency: None,
                keycards: 0,
            }),
        }
    }

    /// Address the job reports for the clocks it provides
    pub fn with_host(self, host: &str) -> Self {
        lock(&self.state).host = host.to_string();
        self
    }

    fn enter(&self, call: MindCall) -> RemoteResult<()> {
        let mut state = lock(&self.state);
        let method = call.method();
        state.calls.push(call);
        if state.failing.contains(method) {
            return Err(RemoteError::new(format!("{} failed on {}", method, self.config.name)));
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = lock(&self.state).latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[cfg(test)]
impl LocalMind {
    pub fn with_elements(self, elements: &[&str]) -> Self {
        lock(&self.state).job.elements = elements.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_mood(self, mood: Mood) -> Self {
        lock(&self.state).job.mood = mood;
        self
    }

    /// Pretend the job is already providing a clock
    pub fn with_clocking(self, clocking: Clocking) -> Self {
        lock(&self.state).clocking = Some(clocking);
        self
    }

    /// Delay answers to connection and clock requests
    pub fn with_latency(self, latency: Duration) -> Self {
        lock(&self.state).latency = Some(latency);
        self
    }

    /// Make every later call of `method` fail
    pub fn fail_on(&self, method: &str) {
        lock(&self.state).failing.insert(method.to_string());
    }

    pub fn recover(&self, method: &str) {
        lock(&self.state).failing.remove(method);
    }

    pub fn calls(&self) -> Vec<MindCall> {
        lock(&self.state).calls.clone()
    }

    pub fn take_calls(&self) -> Vec<MindCall> {
        std::mem::take(&mut lock(&self.state).calls)
    }

    pub fn count(&self, method: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.method() == method)
            .count()
    }

    pub fn clocking(&self) -> Option<Clocking> {
        lock(&self.state).clocking.clone()
    }
}

#[async_trait]
impl ComponentMind for LocalMind {
    async fn get_config(&self) -> RemoteResult<ComponentConfig> {
        self.enter(MindCall::GetConfig)?;
        Ok(self.config.clone())
    }

    async fn get_state(&self) -> RemoteResult<JobState> {
        self.enter(MindCall::GetState)?;
        Ok(lock(&self.state).job.clone())
    }

    async fn get_master_clock_info(&self) -> RemoteResult<Option<Clocking>> {
        self.enter(MindCall::GetMasterClockInfo)?;
        Ok(lock(&self.state).clocking.clone())
    }

    async fn eat_from(
        &self,
        eater_alias: &str,
        full_feed_id: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()> {
        self.enter(MindCall::EatFrom {
            eater_alias: eater_alias.to_string(),
            full_feed_id: full_feed_id.to_string(),
            host: host.to_string(),
            port,
        })?;
        self.delay().await;
        Ok(())
    }

    async fn feed_to(
        &self,
        feeder_name: &str,
        full_feed_id: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()> {
        self.enter(MindCall::FeedTo {
            feeder_name: feeder_name.to_string(),
            full_feed_id: full_feed_id.to_string(),
            host: host.to_string(),
            port,
        })?;
        self.delay().await;
        Ok(())
    }

    async fn provide_master_clock(&self, port: u16) -> RemoteResult<(String, u64)> {
        self.enter(MindCall::ProvideMasterClock { port })?;
        self.delay().await;
        let base_time = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .max(0) as u64;
        let mut state = lock(&self.state);
        let host = state.host.clone();
        state.clocking = Some(Clocking::new(&host, port, base_time));
        Ok((host, base_time))
    }

    async fn set_master_clock(&self, clocking: &Clocking) -> RemoteResult<()> {
        self.enter(MindCall::SetMasterClock(clocking.clone()))
    }

    async fn set_element_property(
        &self,
        element: &str,
        property: &str,
        value: Value,
    ) -> RemoteResult<()> {
        self.enter(MindCall::SetElementProperty {
            element: element.to_string(),
            property: property.to_string(),
            value: value.clone(),
        })?;
        lock(&self.state)
            .properties
            .insert((element.to_string(), property.to_string()), value);
        Ok(())
    }

    async fn get_element_property(&self, element: &str, property: &str) -> RemoteResult<Value> {
        self.enter(MindCall::GetElementProperty {
            element: element.to_string(),
            property: property.to_string(),
        })?;
        lock(&self.state)
            .properties
            .get(&(element.to_string(), property.to_string()))
            .cloned()
            .ok_or_else(|| RemoteError::new(format!("element {} has no property {}", element, property)))
    }

    async fn stop(&self) -> RemoteResult<()> {
        self.enter(MindCall::Stop)?;
        lock(&self.state).job.mood = Mood::Sleeping;
        Ok(())
    }

    async fn reload(&self) -> RemoteResult<()> {
        self.enter(MindCall::Reload)
    }

    async fn authenticate(&self, keycard: Keycard) -> RemoteResult<Option<Keycard>> {
        self.enter(MindCall::Authenticate(keycard.clone()))?;
        let mut state = lock(&self.state);
        state.keycards += 1;
        Ok(Some(Keycard {
            id: Some(format!("{}-{}", self.config.name, state.keycards)),
            ..keycard
        }))
    }

    async fn remove_keycard_id(&self, keycard_id: &str) -> RemoteResult<()> {
        self.enter(MindCall::RemoveKeycardId(keycard_id.to_string()))
    }

    async fn expire_keycard(&self, keycard_id: &str) -> RemoteResult<()> {
        self.enter(MindCall::ExpireKeycard(keycard_id.to_string()))
    }
}
