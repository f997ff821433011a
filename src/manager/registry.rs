//! The set of live component sessions and the reactions to its changes
//!
//! Every method runs on the manager's control loop. Membership changes and
//! the two outside signals (a worker's feed server became reachable, a master
//! clock became available) re-run clock setup and feed wiring for the
//! sessions they concern, and answer the wiring decisions they made.

use crate::assets::{ATMOSPHERE_FLOW, LOOPBACK_HOST};
use crate::error::ManagerError;
use crate::manager::clock::{self, ClockAction, Clocking};
use crate::manager::feed_map::{FeedMap, FeedNode};
use crate::manager::session::{Bootstrap, CallSpawner, Completion, ComponentSession};
use crate::manager::workers::WorkerDirectory;
use crate::mind::{ComponentMind, Keycard};
use crate::planet::ids::{component_id, feed_id, full_feed_id, parse_component_id};
use crate::planet::{ComponentRecord, Mood, Planet, PlanetSnapshot};
use crate::utils::sos::SignalOfStop;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A decision about one eater/feeder pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wiring {
    /// `eater` was asked to eat from `host:port`
    Connecting {
        eater: String,
        alias: String,
        full_feed_id: String,
        host: String,
        port: u16,
    },
    /// Nothing was asked; retried on the next matching event
    Postponed {
        eater: String,
        alias: String,
        feed_id: String,
        reason: Postponed,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Postponed {
    /// No live session serves the feed
    NoFeeder,
    /// The feeder's worker has not reported its feed server yet
    FeedServerUnknown(String),
}

pub struct SessionRegistry {
    planet: Planet,
    sessions: BTreeMap<String, ComponentSession>,
    feed_map: FeedMap,
    workers: WorkerDirectory,
    calls: CallSpawner,
    sos: SignalOfStop,
    /// Bumped on every attach; tells sessions of the same component apart
    incarnations: u64,
}

impl SessionRegistry {
    /// The receiver yields the answers of every remote call the registry starts;
    /// feed them back through [`SessionRegistry::handle_completion`]
    pub fn new(
        planet: Planet,
        workers: WorkerDirectory,
        sos: SignalOfStop,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (calls, completions) = CallSpawner::new();
        let registry = SessionRegistry {
            planet,
            sessions: BTreeMap::new(),
            feed_map: FeedMap::new(),
            workers,
            calls,
            sos,
            incarnations: 0,
        };
        (registry, completions)
    }

    /// Live session of `avatar_id`, telling apart unknown and sleeping components
    pub fn session(&self, avatar_id: &str) -> Result<&ComponentSession, ManagerError> {
        match self.sessions.get(avatar_id) {
            Some(session) => Ok(session),
            None => Err(self.missing(avatar_id)),
        }
    }

    pub fn session_mut(&mut self, avatar_id: &str) -> Result<&mut ComponentSession, ManagerError> {
        if !self.sessions.contains_key(avatar_id) {
            return Err(self.missing(avatar_id));
        }
        self.sessions
            .get_mut(avatar_id)
            .ok_or_else(|| ManagerError::UnknownComponent(avatar_id.to_string()))
    }

    fn missing(&self, avatar_id: &str) -> ManagerError {
        if self.planet.contains(avatar_id) {
            ManagerError::SleepingComponent(avatar_id.to_string())
        } else {
            ManagerError::UnknownComponent(avatar_id.to_string())
        }
    }

    /// Register a bootstrapped component and wire it up
    pub fn attach(
        &mut self,
        avatar_id: &str,
        mind: Arc<dyn ComponentMind>,
        bootstrap: Bootstrap,
        peer_host: &str,
    ) -> Result<Vec<Wiring>, ManagerError> {
        if self.sessions.contains_key(avatar_id) {
            return Err(ManagerError::AlreadyLoggedIn(avatar_id.to_string()));
        }
        let record = match self.planet.get(avatar_id) {
            Some(record) => record,
            None => {
                let (flow, name) = parse_component_id(avatar_id)?;
                let mut config = bootstrap.config.clone();
                config.parent = flow.to_string();
                config.name = name.to_string();
                self.planet.add_component(config)
            }
        };
        self.incarnations += 1;
        let session = ComponentSession::bind(
            avatar_id,
            self.incarnations,
            mind,
            bootstrap,
            record,
            peer_host,
            self.sos.child(),
            self.calls.clone(),
        );

        self.feed_map
            .component_attached(FeedNode::from_config(&session.config()));
        self.sessions.insert(avatar_id.to_string(), session);

        self.setup_clocking(avatar_id);
        Ok(self.connect_eaters_and_feeders(avatar_id))
    }

    /// Forget a session that went away. Its eaters, and the sessions that ate
    /// from it through a virtual feed, are wired again.
    pub fn detach(&mut self, avatar_id: &str) -> Result<(Mood, Vec<Wiring>), ManagerError> {
        let session = self
            .sessions
            .remove(avatar_id)
            .ok_or_else(|| self.missing(avatar_id))?;
        let mood = session.on_disconnect(&mut self.workers);

        let mut dependents: BTreeSet<String> = self
            .feed_map
            .eaters_for(avatar_id)
            .into_iter()
            .map(|link| link.peer)
            .collect();
        dependents.extend(self.feed_map.component_detached(avatar_id));
        dependents.remove(avatar_id);

        let mut wiring = Vec::new();
        for dependent in dependents {
            if self.sessions.contains_key(&dependent) {
                debug!("{} depended on {}, rewiring", dependent, avatar_id);
                wiring.extend(self.connect_eaters_and_feeders(&dependent));
            }
        }
        Ok((mood, wiring))
    }

    /// A worker's feed server is listening; retry whatever waited for it
    pub fn feed_server_available(&mut self, worker: &str, port: u16) -> Vec<Wiring> {
        self.workers.feed_server_available(worker, port);
        let hosted: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.worker_name() == worker)
            .map(|s| s.avatar_id().to_string())
            .collect();

        let mut wiring = Vec::new();
        for avatar_id in hosted {
            self.setup_clocking(&avatar_id);
            wiring.extend(self.connect_eaters_and_feeders(&avatar_id));
        }
        wiring
    }

    pub fn worker_detached(&mut self, worker: &str) {
        self.workers.worker_detached(worker);
    }

    /// `master_id` now provides `clocking`; slave every session that follows it
    /// and is not yet on that clock. Answers the sessions that were told.
    pub fn master_clock_available(&mut self, master_id: &str, clocking: &Clocking) -> Vec<String> {
        let slaves: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.avatar_id() != master_id)
            .filter(|s| s.clock_master().as_deref() == Some(master_id))
            .filter(|s| s.synced_clock() != Some(clocking))
            .map(|s| s.avatar_id().to_string())
            .collect();
        for slave in &slaves {
            self.setup_clocking(slave);
        }
        slaves
    }

    pub fn setup_clocking(&mut self, avatar_id: &str) {
        let Some(session) = self.sessions.get(avatar_id) else {
            return;
        };
        let clock_master = session.clock_master();
        let action = clock::plan(
            avatar_id,
            clock_master.as_deref(),
            session.synced_clock(),
            |master| self.sessions.get(master).map(|m| m.clocking().cloned()),
        );

        match action {
            ClockAction::NotRequired | ClockAction::InSync => {}
            ClockAction::Provide => {
                let provided = session.clocking().cloned();
                match provided {
                    Some(clocking) => {
                        self.master_clock_available(avatar_id, &clocking);
                    }
                    None => {
                        if let Some(session) = self.sessions.get_mut(avatar_id) {
                            session.request_become_clock_provider(&mut self.workers);
                        }
                    }
                }
            }
            ClockAction::Synchronize(clocking) => {
                if let Some(session) = self.sessions.get_mut(avatar_id) {
                    session.synchronize_clock(clocking);
                }
            }
            ClockAction::MasterNotProviding(master) => {
                debug!("{} waits for {} to provide its clock", avatar_id, master);
            }
            ClockAction::WaitForMaster(master) => {
                debug!("{} waits for clock master {} to log in", avatar_id, master);
            }
        }
    }

    /// Wire the eaters of `avatar_id` and the eaters it feeds. The eater side
    /// always initiates the connection.
    pub fn connect_eaters_and_feeders(&mut self, avatar_id: &str) -> Vec<Wiring> {
        let Some(config) = self.sessions.get(avatar_id).map(|s| s.config()) else {
            return Vec::new();
        };
        let feeders = self.feed_map.feeders_for(avatar_id);
        let eaters = self.feed_map.eaters_for(avatar_id);

        let mut wiring = Vec::new();
        for source in config.eater_sources() {
            match feeders.iter().find(|link| link.local_feed == source.alias) {
                Some(link) => wiring.push(self.connect_eater(
                    avatar_id,
                    &link.local_feed,
                    &link.peer,
                    &link.peer_feed,
                )),
                None => {
                    info!(
                        "{}:{} postponed, nobody feeds {}",
                        avatar_id, source.alias, source.feed_id
                    );
                    wiring.push(Wiring::Postponed {
                        eater: avatar_id.to_string(),
                        alias: source.alias.clone(),
                        feed_id: source.feed_id.clone(),
                        reason: Postponed::NoFeeder,
                    });
                }
            }
        }
        for link in eaters {
            wiring.push(self.connect_eater(&link.peer, &link.peer_feed, avatar_id, &link.local_feed));
        }
        wiring
    }

    fn connect_eater(&mut self, eater: &str, alias: &str, feeder: &str, feeder_name: &str) -> Wiring {
        let Ok(feeder_session) = self.session(feeder) else {
            return Wiring::Postponed {
                eater: eater.to_string(),
                alias: alias.to_string(),
                feed_id: format!("{}:{}", feeder, feeder_name),
                reason: Postponed::NoFeeder,
            };
        };
        let (flow, name) = feeder_session
            .record()
            .read(|r| (r.parent().to_string(), r.name().to_string()));
        let full_feed_id = full_feed_id(&flow, &name, feeder_name);

        match self.map_net_feed(eater, feeder) {
            Ok((host, port)) => {
                if let Some(session) = self.sessions.get_mut(eater) {
                    session.eat_from(alias, &full_feed_id, &host, port);
                }
                Wiring::Connecting {
                    eater: eater.to_string(),
                    alias: alias.to_string(),
                    full_feed_id,
                    host,
                    port,
                }
            }
            Err(reason) => {
                info!("{}:{} postponed: {:?}", eater, alias, reason);
                Wiring::Postponed {
                    eater: eater.to_string(),
                    alias: alias.to_string(),
                    feed_id: feed_id(&name, feeder_name),
                    reason,
                }
            }
        }
    }

    /// Address `eater` has to dial to reach the feed server hosting `feeder`.
    ///
    /// Components seen from the same external address are assumed to sit
    /// behind the same NAT and talk over loopback.
    fn map_net_feed(&self, eater: &str, feeder: &str) -> Result<(String, u16), Postponed> {
        let feeder = self.sessions.get(feeder).ok_or(Postponed::NoFeeder)?;
        let worker = feeder.worker_name();
        let Some(port) = self.workers.feed_server_port(worker) else {
            return Err(Postponed::FeedServerUnknown(worker.to_string()));
        };
        let host = match self.sessions.get(eater) {
            Some(eater) if eater.peer_host() == feeder.peer_host() => LOOPBACK_HOST.to_string(),
            _ => feeder.peer_host().to_string(),
        };
        Ok((host, port))
    }

    /// Apply the answer of a remote call started earlier
    pub fn handle_completion(&mut self, completion: Completion) {
        self.calls.finished();
        match completion {
            Completion::ClockProvided {
                avatar_id,
                incarnation,
                port,
                result,
            } => {
                let Some(session) = incarnation_mut(&mut self.sessions, &avatar_id, incarnation) else {
                    debug!("{} left before its clock answer", avatar_id);
                    return;
                };
                if let Some(clocking) = session.clock_provided(port, result, &mut self.workers) {
                    self.master_clock_available(&avatar_id, &clocking);
                }
            }
            Completion::ClockSet {
                avatar_id,
                incarnation,
                clocking,
                result,
            } => {
                if let Some(session) = incarnation_mut(&mut self.sessions, &avatar_id, incarnation) {
                    session.clock_set(clocking, result);
                }
            }
            Completion::Connected {
                avatar_id,
                incarnation,
                eater_alias,
                generation,
                result,
            } => {
                if let Some(session) = incarnation_mut(&mut self.sessions, &avatar_id, incarnation) {
                    session.connection_done(&eater_alias, generation, result);
                }
            }
            Completion::Cancelled => debug!("A remote call was cancelled"),
        }
    }

    pub fn set_element_property(
        &self,
        avatar_id: &str,
        element: &str,
        property: &str,
        value: Value,
    ) -> Result<BoxFuture<'static, Result<(), ManagerError>>, ManagerError> {
        self.session(avatar_id)?
            .set_element_property(element, property, value)
    }

    pub fn get_element_property(
        &self,
        avatar_id: &str,
        element: &str,
        property: &str,
    ) -> Result<BoxFuture<'static, Result<Value, ManagerError>>, ManagerError> {
        self.session(avatar_id)?.get_element_property(element, property)
    }

    pub fn stop(&self, avatar_id: &str) -> Result<BoxFuture<'static, ()>, ManagerError> {
        Ok(self.session(avatar_id)?.stop())
    }

    pub fn reload(&self, avatar_id: &str) -> Result<BoxFuture<'static, ()>, ManagerError> {
        Ok(self.session(avatar_id)?.reload())
    }

    pub fn authenticate(
        &self,
        bouncer_id: &str,
        keycard: Keycard,
    ) -> Result<BoxFuture<'static, Result<Option<Keycard>, ManagerError>>, ManagerError> {
        Ok(self.session(bouncer_id)?.authenticate(keycard))
    }

    /// Bouncers are addressed by name inside the atmosphere
    pub fn remove_keycard_id(
        &self,
        bouncer_name: &str,
        keycard_id: &str,
    ) -> Result<BoxFuture<'static, Result<(), ManagerError>>, ManagerError> {
        let bouncer_id = component_id(ATMOSPHERE_FLOW, bouncer_name);
        let Some(bouncer) = self.sessions.get(&bouncer_id) else {
            warn!("No bouncer {} to remove keycard {} from", bouncer_name, keycard_id);
            return Err(ManagerError::UnknownComponent(bouncer_id));
        };
        Ok(bouncer.remove_keycard_id(keycard_id))
    }

    pub fn expire_keycard(
        &self,
        requester_id: &str,
        keycard_id: &str,
    ) -> Result<BoxFuture<'static, Result<(), ManagerError>>, ManagerError> {
        let Some(requester) = self.sessions.get(requester_id) else {
            warn!("Cannot expire keycard {} of unknown {}", keycard_id, requester_id);
            return Err(ManagerError::UnknownComponent(requester_id.to_string()));
        };
        Ok(requester.expire_keycard(keycard_id))
    }

    pub fn wait_happy(&mut self, avatar_id: &str) -> Result<oneshot::Receiver<()>, ManagerError> {
        Ok(self.session_mut(avatar_id)?.wait_happy())
    }

    pub fn delete_component(&mut self, avatar_id: &str) -> Result<ComponentRecord, ManagerError> {
        if self.sessions.contains_key(avatar_id) {
            return Err(ManagerError::ComponentBusy(avatar_id.to_string()));
        }
        self.planet.delete_component(avatar_id)
    }

    pub fn delete_flow(&mut self, flow: &str) -> Result<Vec<ComponentRecord>, ManagerError> {
        if let Some(busy) = self.sessions.values().find(|s| s.parent() == flow) {
            return Err(ManagerError::ComponentBusy(busy.avatar_id().to_string()));
        }
        self.planet.delete_flow(flow)
    }

    pub fn planet_snapshot(&self) -> PlanetSnapshot {
        self.planet.snapshot()
    }

    /// Stop every outstanding call and hand the planet back
    pub fn into_planet(self) -> Planet {
        self.sos.cancel();
        info!("Registry closed with {} live sessions", self.sessions.len());
        self.planet
    }
}

#[cfg(test)]
impl SessionRegistry {
    pub fn planet(&self) -> &Planet {
        &self.planet
    }

    pub fn workers(&self) -> &WorkerDirectory {
        &self.workers
    }

    pub fn feed_map(&mut self) -> &mut FeedMap {
        &mut self.feed_map
    }

    pub fn in_flight(&self) -> usize {
        self.calls.in_flight()
    }

    pub fn live_sessions(&self) -> impl Iterator<Item = &ComponentSession> {
        self.sessions.values()
    }
}

/// The live session of `avatar_id`, if it is the one that made the call
fn incarnation_mut<'a>(
    sessions: &'a mut BTreeMap<String, ComponentSession>,
    avatar_id: &str,
    incarnation: u64,
) -> Option<&'a mut ComponentSession> {
    let session = sessions.get_mut(avatar_id)?;
    if session.incarnation() != incarnation {
        debug!("Dropping an answer meant for an earlier login of {}", avatar_id);
        return None;
    }
    Some(session)
}
