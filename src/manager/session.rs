//! Live binding between the manager and one remote component job

use crate::error::{ManagerError, RemoteError};
use crate::manager::clock::Clocking;
use crate::manager::workers::WorkerDirectory;
use crate::mind::{ComponentMind, Keycard, RemoteResult};
use crate::planet::config::{config_diff, render_diff};
use crate::planet::{ComponentConfig, JobState, Message, Mood, SharedRecord};
use crate::utils::sos::SignalOfStop;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};

/// Outcome of a remote call started from the control loop.
///
/// `incarnation` names the session that started the call, so an answer
/// meant for a session that logged out is never applied to the one that
/// logged back in under the same id.
#[derive(Debug)]
pub enum Completion {
    ClockProvided {
        avatar_id: String,
        incarnation: u64,
        port: u16,
        result: RemoteResult<(String, u64)>,
    },
    ClockSet {
        avatar_id: String,
        incarnation: u64,
        clocking: Clocking,
        result: RemoteResult<()>,
    },
    Connected {
        avatar_id: String,
        incarnation: u64,
        eater_alias: String,
        generation: u64,
        result: RemoteResult<()>,
    },
    /// The call was stopped before it answered
    Cancelled,
}

/// Spawns remote calls and routes exactly one [`Completion`] per call back
/// to the control loop
#[derive(Debug, Clone)]
pub struct CallSpawner {
    tx: mpsc::UnboundedSender<Completion>,
    in_flight: Arc<AtomicUsize>,
}

impl CallSpawner {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = CallSpawner {
            tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        (spawner, rx)
    }

    pub fn spawn<F>(&self, sos: &SignalOfStop, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let tx = self.tx.clone();
        let sos = sos.clone();
        tokio::spawn(async move {
            let completion = sos.run(call).await.unwrap_or(Completion::Cancelled);
            // the loop is gone when this fails, nobody is waiting anymore
            let _ = tx.send(completion);
        });
    }

    /// A completion was taken off the channel
    pub fn finished(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Calls whose completion has not been handled yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Everything a component told the manager at login
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub config: ComponentConfig,
    pub job: JobState,
    pub clocking: Option<Clocking>,
}

#[derive(Debug)]
struct PendingConnection {
    generation: u64,
    cancel: SignalOfStop,
}

pub struct ComponentSession {
    avatar_id: String,
    incarnation: u64,
    mind: Arc<dyn ComponentMind>,
    record: SharedRecord,
    job: JobState,
    /// Clock this session provides as master
    clocking: Option<Clocking>,
    clock_pending: bool,
    /// Master clock this session was last told to follow
    synced: Option<Clocking>,
    ports: Vec<u16>,
    shutdown_requested: bool,
    pending: HashMap<String, PendingConnection>,
    generation: u64,
    happy_waiters: Vec<oneshot::Sender<()>>,
    /// External address the component connected from
    peer_host: String,
    sos: SignalOfStop,
    calls: CallSpawner,
}

impl ComponentSession {
    /// Fetch configuration, job state and clock info from a freshly
    /// connected component. The first failing fetch aborts the login.
    pub async fn bootstrap(
        avatar_id: &str,
        mind: &Arc<dyn ComponentMind>,
    ) -> Result<Bootstrap, ManagerError> {
        let (config, job, clocking) = tokio::try_join!(
            mind.get_config(),
            mind.get_state(),
            mind.get_master_clock_info()
        )
        .map_err(|source| {
            warn!("Login of {} failed: {}", avatar_id, source);
            ManagerError::Bootstrap {
                avatar_id: avatar_id.to_string(),
                source,
            }
        })?;
        Ok(Bootstrap {
            config,
            job,
            clocking,
        })
    }

    /// Bind the fetched state into `record`.
    ///
    /// The reported configuration replaces the stored one; a difference is
    /// kept as a `stale-config` warning on the record, never refused.
    pub fn bind(
        avatar_id: &str,
        incarnation: u64,
        mind: Arc<dyn ComponentMind>,
        bootstrap: Bootstrap,
        record: SharedRecord,
        peer_host: &str,
        sos: SignalOfStop,
        calls: CallSpawner,
    ) -> Self {
        let Bootstrap {
            config: mut reported,
            job,
            clocking,
        } = bootstrap;

        record.update(|r| {
            reported.name = r.name().to_string();
            reported.parent = r.parent().to_string();
            let upgrade_failure = reported.upgrade().err();

            let mut stored = r.config.clone();
            if let Err(failure) = stored.upgrade() {
                debug!(
                    "Stored configuration of {} stays at version {} for the diff: {}",
                    avatar_id, failure.version, failure.reason
                );
            }
            let changes = config_diff(&stored, &reported);
            if !changes.is_empty() {
                warn!("{} logged in with a stale configuration", avatar_id);
                r.add_message(
                    Message::warning(
                        "stale-config",
                        format!(
                            "{} reported a configuration different from the stored one, \
                             the stored configuration was replaced",
                            avatar_id
                        ),
                    )
                    .with_debug(render_diff(&changes, "stored", "reported")),
                );
            }
            r.config = reported;

            if let Some(failure) = upgrade_failure {
                warn!(
                    "Configuration upgrade of {} stopped at version {}: {}",
                    avatar_id, failure.version, failure.reason
                );
                r.add_message(Message::warning(
                    format!("upgrade-{}", failure.version),
                    format!(
                        "Could not upgrade configuration from version {}: {}",
                        failure.version, failure.reason
                    ),
                ));
            }

            r.attach_job(job.clone());
            r.mood_pending = None;
        });

        let kind = record.read(|r| r.kind().to_string());
        info!(
            "{} ({}) logged in from {} on worker {} ({})",
            avatar_id, kind, peer_host, job.worker_name, job.mood
        );
        ComponentSession {
            avatar_id: avatar_id.to_string(),
            incarnation,
            mind,
            record,
            job,
            clocking,
            clock_pending: false,
            synced: None,
            ports: Vec::new(),
            shutdown_requested: false,
            pending: HashMap::new(),
            generation: 0,
            happy_waiters: Vec::new(),
            peer_host: peer_host.to_string(),
            sos,
            calls,
        }
    }

    pub fn avatar_id(&self) -> &str {
        &self.avatar_id
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn record(&self) -> &SharedRecord {
        &self.record
    }

    pub fn config(&self) -> ComponentConfig {
        self.record.config()
    }

    pub fn parent(&self) -> String {
        self.record.read(|r| r.parent().to_string())
    }

    pub fn clock_master(&self) -> Option<String> {
        self.record.read(|r| r.config.clock_master.clone())
    }

    pub fn worker_name(&self) -> &str {
        &self.job.worker_name
    }

    pub fn peer_host(&self) -> &str {
        &self.peer_host
    }

    pub fn clocking(&self) -> Option<&Clocking> {
        self.clocking.as_ref()
    }

    pub fn synced_clock(&self) -> Option<&Clocking> {
        self.synced.as_ref()
    }

    /// Ask the component to provide the master clock on a freshly reserved port.
    ///
    /// Does nothing while an earlier request is still unanswered. Returns true
    /// if a request went out.
    pub fn request_become_clock_provider(&mut self, workers: &mut WorkerDirectory) -> bool {
        if self.clock_pending {
            debug!("{} is already setting up a master clock", self.avatar_id);
            return false;
        }
        let port = match workers.reserve_ports(&self.job.worker_name, 1) {
            Ok(ports) => ports[0],
            Err(e) => {
                warn!("{} cannot provide a master clock: {}", self.avatar_id, e);
                self.record.update(|r| {
                    r.set_message(Message::warning(
                        "provide-master-clock",
                        format!("Could not provide master clock: {}", e),
                    ))
                });
                return false;
            }
        };
        self.ports.push(port);
        self.clock_pending = true;

        info!("Asking {} to provide the master clock on port {}", self.avatar_id, port);
        let mind = self.mind.clone();
        let avatar_id = self.avatar_id.clone();
        let incarnation = self.incarnation;
        self.calls.spawn(&self.sos, async move {
            let result = mind.provide_master_clock(port).await;
            Completion::ClockProvided {
                avatar_id,
                incarnation,
                port,
                result,
            }
        });
        true
    }

    /// Answer of [`Self::request_become_clock_provider`]; returns the new
    /// clock if the component is now providing
    pub fn clock_provided(
        &mut self,
        port: u16,
        result: RemoteResult<(String, u64)>,
        workers: &mut WorkerDirectory,
    ) -> Option<Clocking> {
        self.clock_pending = false;
        match result {
            Ok((host, base_time)) => {
                let clocking = Clocking::new(&host, port, base_time);
                info!("{} provides the master clock at {}", self.avatar_id, clocking);
                self.clocking = Some(clocking.clone());
                Some(clocking)
            }
            Err(e) => {
                warn!("{} failed to provide a master clock: {}", self.avatar_id, e);
                workers.release_ports(&self.job.worker_name, &[port]);
                self.ports.retain(|p| *p != port);
                self.record.update(|r| {
                    r.set_message(
                        Message::warning("provide-master-clock", "Could not provide master clock")
                            .with_debug(e.message),
                    )
                });
                None
            }
        }
    }

    /// Tell a slave which clock to follow
    pub fn synchronize_clock(&mut self, clocking: Clocking) {
        debug!("Slaving {} to master clock {}", self.avatar_id, clocking);
        self.synced = Some(clocking.clone());
        let mind = self.mind.clone();
        let avatar_id = self.avatar_id.clone();
        let incarnation = self.incarnation;
        self.calls.spawn(&self.sos, async move {
            let result = mind.set_master_clock(&clocking).await;
            Completion::ClockSet {
                avatar_id,
                incarnation,
                clocking,
                result,
            }
        });
    }

    pub fn clock_set(&mut self, clocking: Clocking, result: RemoteResult<()>) {
        match result {
            Ok(()) => debug!("{} follows master clock {}", self.avatar_id, clocking),
            Err(e) => {
                warn!("{} could not follow master clock: {}", self.avatar_id, e);
                if self.synced.as_ref() == Some(&clocking) {
                    self.synced = None;
                }
                self.record.update(|r| {
                    r.set_message(
                        Message::warning("set-master-clock", "Could not set master clock")
                            .with_debug(e.message),
                    )
                });
            }
        }
    }

    /// Connect eater `eater_alias` to the feeder at `host:port`, dropping any
    /// attempt still running for the same alias
    pub fn eat_from(&mut self, eater_alias: &str, full_feed_id: &str, host: &str, port: u16) {
        if let Some(previous) = self.pending.remove(eater_alias) {
            debug!(
                "Superseding connection attempt {} of {}:{}",
                previous.generation, self.avatar_id, eater_alias
            );
            previous.cancel.cancel();
        }
        self.generation += 1;
        let generation = self.generation;
        let cancel = self.sos.child();
        self.pending.insert(
            eater_alias.to_string(),
            PendingConnection {
                generation,
                cancel: cancel.clone(),
            },
        );

        info!(
            "Connecting {}:{} to {} at {}:{}",
            self.avatar_id, eater_alias, full_feed_id, host, port
        );
        let mind = self.mind.clone();
        let avatar_id = self.avatar_id.clone();
        let incarnation = self.incarnation;
        let eater_alias = eater_alias.to_string();
        let full_feed_id = full_feed_id.to_string();
        let host = host.to_string();
        self.calls.spawn(&cancel, async move {
            let result = mind.eat_from(&eater_alias, &full_feed_id, &host, port).await;
            Completion::Connected {
                avatar_id,
                incarnation,
                eater_alias,
                generation,
                result,
            }
        });
    }

    pub fn connection_done(&mut self, eater_alias: &str, generation: u64, result: RemoteResult<()>) {
        match self.pending.get(eater_alias) {
            Some(pending) if pending.generation == generation => {
                self.pending.remove(eater_alias);
            }
            _ => {
                debug!("Ignoring outdated answer for {}:{}", self.avatar_id, eater_alias);
                return;
            }
        }
        if let Err(e) = result {
            warn!("{}:{} could not connect: {}", self.avatar_id, eater_alias, e);
        }
    }

    fn check_property(&self, element: &str, property: &str) -> Result<(), ManagerError> {
        if element.is_empty() {
            return Err(ManagerError::Property("no element specified".into()));
        }
        if !self.job.elements.iter().any(|e| e == element) {
            return Err(ManagerError::Property(format!(
                "element '{}' does not exist in {}",
                element, self.avatar_id
            )));
        }
        if property.is_empty() {
            return Err(ManagerError::Property("no property specified".into()));
        }
        Ok(())
    }

    /// Validated here; the returned call only runs once awaited
    pub fn set_element_property(
        &self,
        element: &str,
        property: &str,
        value: Value,
    ) -> Result<BoxFuture<'static, Result<(), ManagerError>>, ManagerError> {
        self.check_property(element, property)?;
        let mind = self.mind.clone();
        let element = element.to_string();
        let property = property.to_string();
        Ok(async move {
            let result = mind.set_element_property(&element, &property, value).await;
            remote_result("setElementProperty", result)
        }
        .boxed())
    }

    pub fn get_element_property(
        &self,
        element: &str,
        property: &str,
    ) -> Result<BoxFuture<'static, Result<Value, ManagerError>>, ManagerError> {
        self.check_property(element, property)?;
        let mind = self.mind.clone();
        let element = element.to_string();
        let property = property.to_string();
        Ok(async move {
            let result = mind.get_element_property(&element, &property).await;
            remote_result("getElementProperty", result)
        }
        .boxed())
    }

    /// Best effort; a component that is already gone is not an error
    pub fn stop(&self) -> BoxFuture<'static, ()> {
        self.record.update(|r| r.mood_pending = Some(Mood::Sleeping));
        let mind = self.mind.clone();
        let avatar_id = self.avatar_id.clone();
        async move {
            if let Err(e) = mind.stop().await {
                warn!("Stopping {} failed: {}", avatar_id, e);
            }
        }
        .boxed()
    }

    pub fn reload(&self) -> BoxFuture<'static, ()> {
        let mind = self.mind.clone();
        let avatar_id = self.avatar_id.clone();
        async move {
            if let Err(e) = mind.reload().await {
                warn!("Reloading {} failed: {}", avatar_id, e);
            }
        }
        .boxed()
    }

    pub fn authenticate(
        &self,
        keycard: Keycard,
    ) -> BoxFuture<'static, Result<Option<Keycard>, ManagerError>> {
        let mind = self.mind.clone();
        async move { remote_result("authenticate", mind.authenticate(keycard).await) }.boxed()
    }

    pub fn remove_keycard_id(&self, keycard_id: &str) -> BoxFuture<'static, Result<(), ManagerError>> {
        let mind = self.mind.clone();
        let keycard_id = keycard_id.to_string();
        async move { remote_result("removeKeycardId", mind.remove_keycard_id(&keycard_id).await) }
            .boxed()
    }

    pub fn expire_keycard(&self, keycard_id: &str) -> BoxFuture<'static, Result<(), ManagerError>> {
        let mind = self.mind.clone();
        let keycard_id = keycard_id.to_string();
        async move { remote_result("expireKeycard", mind.expire_keycard(&keycard_id).await) }
            .boxed()
    }

    /// The component reported a new mood; returns true if it changed
    pub fn mood_changed(&mut self, mood: Mood) -> bool {
        self.job.mood = mood;
        let changed = self.record.update(|r| {
            if let Some(job) = r.job.as_mut() {
                job.mood = mood;
            }
            if r.mood_pending == Some(mood) {
                r.mood_pending = None;
            }
            r.set_mood(mood)
        });
        if changed {
            info!("{} is now {}", self.avatar_id, mood);
        }
        if mood == Mood::Happy {
            for waiter in self.happy_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        changed
    }

    pub fn elements_changed(&mut self, elements: Vec<String>) {
        debug!("{} has elements {:?}", self.avatar_id, elements);
        self.record.update(|r| {
            if let Some(job) = r.job.as_mut() {
                job.elements = elements.clone();
            }
        });
        self.job.elements = elements;
    }

    /// The component announced it is going away on purpose
    pub fn notify_clean_shutdown(&mut self) {
        if self.shutdown_requested {
            debug!("{} already announced its shutdown", self.avatar_id);
            return;
        }
        info!("{} is shutting down cleanly", self.avatar_id);
        self.shutdown_requested = true;
    }

    /// Resolves once the component reports itself happy; dropped with the session
    pub fn wait_happy(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.job.mood == Mood::Happy {
            let _ = tx.send(());
        } else {
            self.happy_waiters.push(tx);
        }
        rx
    }

    /// Settle the record once the component is gone; answers the final mood
    pub fn on_disconnect(self, workers: &mut WorkerDirectory) -> Mood {
        self.sos.cancel();
        workers.release_ports(&self.job.worker_name, &self.ports);

        let shutdown_requested = self.shutdown_requested;
        let mood = self.record.update(|r| {
            let mood = r.mood.after_disconnect(shutdown_requested);
            r.set_mood(mood);
            r.mood_pending = None;
            r.clear_messages();
            r.detach_job();
            mood
        });
        info!("{} logged out, now {}", self.avatar_id, mood);
        mood
    }
}

#[cfg(test)]
impl ComponentSession {
    pub fn reserved_ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn pending_connections(&self) -> usize {
        self.pending.len()
    }
}

/// Wrap a failure of a remote call, keeping its message
fn remote_result<T>(method: &str, result: RemoteResult<T>) -> Result<T, ManagerError> {
    result.map_err(|e: RemoteError| {
        debug!("Remote call {} failed: {}", method, e);
        ManagerError::remote(method, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortRange, WorkerConfig};
    use crate::mind::{LocalMind, MindCall};
    use crate::planet::ComponentRecord;

    struct Fixture {
        mind: Arc<LocalMind>,
        session: ComponentSession,
        record: SharedRecord,
        workers: WorkerDirectory,
        rx: mpsc::UnboundedReceiver<Completion>,
    }

    fn config() -> ComponentConfig {
        let mut config = ComponentConfig::new("live", "producer", "videotest");
        config.feed.push("default".into());
        config
    }

    async fn fixture(mind: LocalMind) -> Fixture {
        let mind = Arc::new(mind);
        let remote: Arc<dyn ComponentMind> = mind.clone();
        let bootstrap = ComponentSession::bootstrap("/live/producer", &remote).await.unwrap();
        let record = SharedRecord::new(ComponentRecord::new(config()));
        let (calls, rx) = CallSpawner::new();
        let session = ComponentSession::bind(
            "/live/producer",
            1,
            remote,
            bootstrap,
            record.clone(),
            "10.0.0.5",
            SignalOfStop::new(),
            calls,
        );
        let workers = WorkerDirectory::from_config(&[WorkerConfig {
            name: "worker-1".into(),
            feed_server_port: Some(8800),
            ports: PortRange { start: 9000, end: 9001 },
        }]);
        Fixture {
            mind,
            session,
            record,
            workers,
            rx,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_fails_fast() {
        let mind = LocalMind::new(config(), "worker-1");
        mind.fail_on("getState");
        let remote: Arc<dyn ComponentMind> = Arc::new(mind);

        let err = ComponentSession::bootstrap("/live/producer", &remote).await.unwrap_err();
        assert!(matches!(err, ManagerError::Bootstrap { ref avatar_id, .. } if avatar_id == "/live/producer"));
    }

    #[tokio::test]
    async fn test_bind_attaches_job() {
        let f = fixture(LocalMind::new(config(), "worker-1").with_mood(Mood::Hungry)).await;

        let record = f.record.snapshot();
        assert_eq!(record.mood, Mood::Hungry);
        assert_eq!(record.job.unwrap().worker_name, "worker-1");
        assert!(record.messages.is_empty());
        assert_eq!(f.session.worker_name(), "worker-1");
    }

    #[tokio::test]
    async fn test_stale_config_is_replaced_with_warning() {
        let mut reported = config();
        reported.properties.insert("pattern".into(), Value::from(2));
        let mind = Arc::new(LocalMind::new(reported, "worker-1"));
        let remote: Arc<dyn ComponentMind> = mind.clone();
        let bootstrap = ComponentSession::bootstrap("/live/producer", &remote).await.unwrap();
        let record = SharedRecord::new(ComponentRecord::new(config()));
        let (calls, _rx) = CallSpawner::new();

        ComponentSession::bind(
            "/live/producer",
            1,
            remote,
            bootstrap,
            record.clone(),
            "10.0.0.5",
            SignalOfStop::new(),
            calls,
        );

        let record = record.snapshot();
        assert_eq!(record.config.properties["pattern"], Value::from(2));
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].id, "stale-config");
        assert!(record.messages[0].debug.as_deref().unwrap().contains("properties.pattern"));
    }

    #[tokio::test]
    async fn test_stored_config_that_cannot_upgrade_is_diffed_as_is() {
        let mut stored = config();
        stored.config_version = 0;
        stored.source = vec![":broken".into()];
        let mind = Arc::new(LocalMind::new(config(), "worker-1"));
        let remote: Arc<dyn ComponentMind> = mind.clone();
        let bootstrap = ComponentSession::bootstrap("/live/producer", &remote).await.unwrap();
        let record = SharedRecord::new(ComponentRecord::new(stored));
        let (calls, _rx) = CallSpawner::new();

        ComponentSession::bind(
            "/live/producer",
            1,
            remote,
            bootstrap,
            record.clone(),
            "10.0.0.5",
            SignalOfStop::new(),
            calls,
        );

        let record = record.snapshot();
        assert_eq!(record.config, config());
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].id, "stale-config");
        assert!(record.messages[0].debug.as_deref().unwrap().contains("source"));
    }

    #[tokio::test]
    async fn test_property_validation_is_local() {
        let f = fixture(LocalMind::new(config(), "worker-1").with_elements(&["src"])).await;
        f.mind.take_calls();

        for (element, property) in [("", "x"), ("nonexistent-element", "x"), ("src", "")] {
            let err = f
                .session
                .set_element_property(element, property, Value::from(1))
                .err()
                .unwrap();
            assert!(matches!(err, ManagerError::Property(_)));
            assert!(matches!(
                f.session.get_element_property(element, property).err(),
                Some(ManagerError::Property(_))
            ));
        }
        assert!(f.mind.calls().is_empty());

        let call = f.session.set_element_property("src", "pattern", Value::from(1)).unwrap();
        call.await.unwrap();
        assert_eq!(f.mind.count("setElementProperty"), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_is_wrapped() {
        let f = fixture(LocalMind::new(config(), "worker-1").with_elements(&["src"])).await;
        f.mind.fail_on("getElementProperty");

        let err = f.session.get_element_property("src", "pattern").unwrap().await.unwrap_err();
        assert_eq!(
            err,
            ManagerError::RemoteMethod {
                method: "getElementProperty".into(),
                message: "getElementProperty failed on producer".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_stop_swallows_errors() {
        let f = fixture(LocalMind::new(config(), "worker-1")).await;
        f.mind.fail_on("stop");
        f.mind.fail_on("reloadComponent");

        f.session.stop().await;
        f.session.reload().await;
        assert_eq!(f.mind.count("stop"), 1);
        assert_eq!(f.record.snapshot().mood_pending, Some(Mood::Sleeping));
    }

    #[tokio::test]
    async fn test_disconnect_moods() {
        let f = fixture(LocalMind::new(config(), "worker-1")).await;
        let mut session = f.session;
        let mut workers = f.workers;
        session.notify_clean_shutdown();
        session.notify_clean_shutdown();
        assert_eq!(session.on_disconnect(&mut workers), Mood::Sleeping);

        let f = fixture(LocalMind::new(config(), "worker-1")).await;
        let mut workers = f.workers;
        assert_eq!(f.session.on_disconnect(&mut workers), Mood::Lost);
        assert!(!f.record.snapshot().is_attached());

        for clean in [false, true] {
            let f = fixture(LocalMind::new(config(), "worker-1").with_mood(Mood::Sad)).await;
            let mut session = f.session;
            let mut workers = f.workers;
            if clean {
                session.notify_clean_shutdown();
            }
            assert_eq!(session.on_disconnect(&mut workers), Mood::Sad);
        }
    }

    #[tokio::test]
    async fn test_provide_clock_and_release_on_disconnect() {
        let mut f = fixture(LocalMind::new(config(), "worker-1").with_host("10.0.0.5")).await;

        assert!(f.session.request_become_clock_provider(&mut f.workers));
        assert!(!f.session.request_become_clock_provider(&mut f.workers));
        assert_eq!(f.session.reserved_ports(), &[9000]);

        let Completion::ClockProvided { port, result, .. } = f.rx.recv().await.unwrap() else {
            panic!("expected a clock answer");
        };
        let clocking = f.session.clock_provided(port, result, &mut f.workers).unwrap();
        assert_eq!(clocking.host, "10.0.0.5");
        assert_eq!(clocking.port, 9000);

        f.session.on_disconnect(&mut f.workers);
        assert_eq!(f.workers.get("worker-1").unwrap().free_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_clock_releases_port() {
        let mut f = fixture(LocalMind::new(config(), "worker-1")).await;
        f.mind.fail_on("provideMasterClock");

        f.session.request_become_clock_provider(&mut f.workers);
        let Completion::ClockProvided { port, result, .. } = f.rx.recv().await.unwrap() else {
            panic!("expected a clock answer");
        };
        assert!(f.session.clock_provided(port, result, &mut f.workers).is_none());

        assert!(f.session.reserved_ports().is_empty());
        assert_eq!(f.workers.get("worker-1").unwrap().free_count(), 2);
        let messages = f.record.snapshot().messages;
        assert_eq!(messages[0].id, "provide-master-clock");
    }

    #[tokio::test]
    async fn test_new_connection_supersedes_pending() {
        let mut f = fixture(
            LocalMind::new(config(), "worker-1").with_latency(std::time::Duration::from_secs(30)),
        )
        .await;
        f.mind.take_calls();

        f.session.eat_from("default", "/live/a:default", "10.0.0.1", 8800);
        f.session.eat_from("default", "/live/a:default", "10.0.0.2", 8800);
        assert_eq!(f.session.pending_connections(), 1);

        let first = f.rx.recv().await.unwrap();
        assert!(matches!(first, Completion::Cancelled));

        f.mind.fail_on("eatFrom");
        f.session.eat_from("default", "/live/a:default", "10.0.0.3", 8800);
        let mut cancelled = 0;
        for _ in 0..2 {
            match f.rx.recv().await.unwrap() {
                Completion::Cancelled => cancelled += 1,
                Completion::Connected {
                    eater_alias,
                    generation,
                    result,
                    ..
                } => {
                    assert!(result.is_err());
                    f.session.connection_done(&eater_alias, generation, result);
                }
                other => panic!("unexpected answer {:?}", other),
            }
        }
        assert_eq!(cancelled, 1);
        assert_eq!(f.session.pending_connections(), 0);
        assert_eq!(f.mind.count("eatFrom"), 3);
    }

    #[tokio::test]
    async fn test_outdated_answer_is_ignored() {
        let mut f = fixture(LocalMind::new(config(), "worker-1")).await;
        f.session.eat_from("default", "/live/a:default", "10.0.0.1", 8800);

        f.session.connection_done("default", 42, Ok(()));
        assert_eq!(f.session.pending_connections(), 1);

        let Completion::Connected { eater_alias, generation, result, .. } = f.rx.recv().await.unwrap() else {
            panic!("expected a connection answer");
        };
        f.session.connection_done(&eater_alias, generation, result);
        assert_eq!(f.session.pending_connections(), 0);
        assert!(matches!(f.mind.calls().last(), Some(MindCall::EatFrom { port: 8800, .. })));
    }

    #[tokio::test]
    async fn test_wait_happy() {
        let mut f = fixture(LocalMind::new(config(), "worker-1").with_mood(Mood::Waking)).await;
        let mut waiter = f.session.wait_happy();
        assert!(waiter.try_recv().is_err());

        assert!(f.session.mood_changed(Mood::Happy));
        assert!(waiter.await.is_ok());
        assert_eq!(f.record.mood(), Mood::Happy);
        assert!(f.session.wait_happy().await.is_ok());
    }
}
