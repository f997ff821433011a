//! The manager: one control loop owning the session registry
//!
//! [`Manager`] is a cheap handle. Every request becomes a [`Command`] that the
//! control loop processes to completion before looking at the next one, so
//! attach and detach reactions never interleave. Remote calls issued on behalf
//! of a request run on their own tasks and answer the caller directly.

pub mod clock;
pub mod feed_map;
pub mod registry;
pub mod session;
pub mod workers;

use crate::assets::COMMAND_QUEUE_SIZE;
use crate::error::ManagerError;
use crate::mind::{ComponentEvent, ComponentMind, Keycard};
use crate::planet::{ComponentRecord, Planet, PlanetSnapshot};
use crate::utils::sos::SignalOfStop;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info};
use registry::{SessionRegistry, Wiring};
use serde_json::Value;
use session::{Bootstrap, Completion, ComponentSession};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use workers::WorkerDirectory;

type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

enum Command {
    Attach {
        avatar_id: String,
        mind: Arc<dyn ComponentMind>,
        bootstrap: Bootstrap,
        peer_host: String,
        reply: Reply<Vec<Wiring>>,
    },
    Event {
        avatar_id: String,
        event: ComponentEvent,
        reply: Reply<Vec<Wiring>>,
    },
    WorkerAttached {
        worker: String,
        port: u16,
        reply: Reply<Vec<Wiring>>,
    },
    WorkerDetached {
        worker: String,
        reply: Reply<()>,
    },
    SetElementProperty {
        avatar_id: String,
        element: String,
        property: String,
        value: Value,
        reply: Reply<()>,
    },
    GetElementProperty {
        avatar_id: String,
        element: String,
        property: String,
        reply: Reply<Value>,
    },
    Stop {
        avatar_id: String,
        reply: Reply<()>,
    },
    Reload {
        avatar_id: String,
        reply: Reply<()>,
    },
    Authenticate {
        bouncer_id: String,
        keycard: Keycard,
        reply: Reply<Option<Keycard>>,
    },
    RemoveKeycardId {
        bouncer_name: String,
        keycard_id: String,
        reply: Reply<()>,
    },
    ExpireKeycard {
        requester_id: String,
        keycard_id: String,
        reply: Reply<()>,
    },
    WaitHappy {
        avatar_id: String,
        reply: Reply<oneshot::Receiver<()>>,
    },
    DeleteComponent {
        avatar_id: String,
        reply: Reply<ComponentRecord>,
    },
    DeleteFlow {
        flow: String,
        reply: Reply<Vec<ComponentRecord>>,
    },
    PlanetSnapshot {
        reply: oneshot::Sender<PlanetSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<Planet>,
    },
}

#[derive(Debug, Clone)]
pub struct Manager {
    commands: mpsc::Sender<Command>,
}

impl Manager {
    /// Start the control loop; it stops on [`Manager::shutdown`], when every
    /// handle is dropped, or when `sos` fires
    pub fn spawn(planet: Planet, workers: WorkerDirectory, sos: &SignalOfStop) -> Manager {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let sos = sos.child();
        let (registry, completions) = SessionRegistry::new(planet, workers, sos.clone());
        tokio::spawn(control_loop(registry, completions, rx, sos));
        Manager { commands }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ManagerError::ManagerGone)?;
        rx.await.map_err(|_| ManagerError::ManagerGone)
    }

    /// Log in an authenticated component: bootstrap it, then register and
    /// wire it on the control loop
    pub async fn login(
        &self,
        avatar_id: &str,
        mind: Arc<dyn ComponentMind>,
        peer_host: &str,
    ) -> Result<Vec<Wiring>, ManagerError> {
        let bootstrap = ComponentSession::bootstrap(avatar_id, &mind).await?;
        self.request(|reply| Command::Attach {
            avatar_id: avatar_id.to_string(),
            mind,
            bootstrap,
            peer_host: peer_host.to_string(),
            reply,
        })
        .await?
    }

    /// Deliver a notification the component sent on its own
    pub async fn event(
        &self,
        avatar_id: &str,
        event: ComponentEvent,
    ) -> Result<Vec<Wiring>, ManagerError> {
        self.request(|reply| Command::Event {
            avatar_id: avatar_id.to_string(),
            event,
            reply,
        })
        .await?
    }

    pub async fn worker_attached(&self, worker: &str, port: u16) -> Result<Vec<Wiring>, ManagerError> {
        self.request(|reply| Command::WorkerAttached {
            worker: worker.to_string(),
            port,
            reply,
        })
        .await?
    }

    pub async fn worker_detached(&self, worker: &str) -> Result<(), ManagerError> {
        self.request(|reply| Command::WorkerDetached {
            worker: worker.to_string(),
            reply,
        })
        .await?
    }

    pub async fn set_element_property(
        &self,
        avatar_id: &str,
        element: &str,
        property: &str,
        value: Value,
    ) -> Result<(), ManagerError> {
        self.request(|reply| Command::SetElementProperty {
            avatar_id: avatar_id.to_string(),
            element: element.to_string(),
            property: property.to_string(),
            value,
            reply,
        })
        .await?
    }

    pub async fn get_element_property(
        &self,
        avatar_id: &str,
        element: &str,
        property: &str,
    ) -> Result<Value, ManagerError> {
        self.request(|reply| Command::GetElementProperty {
            avatar_id: avatar_id.to_string(),
            element: element.to_string(),
            property: property.to_string(),
            reply,
        })
        .await?
    }

    pub async fn stop_component(&self, avatar_id: &str) -> Result<(), ManagerError> {
        self.request(|reply| Command::Stop {
            avatar_id: avatar_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn reload_component(&self, avatar_id: &str) -> Result<(), ManagerError> {
        self.request(|reply| Command::Reload {
            avatar_id: avatar_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn authenticate(
        &self,
        bouncer_id: &str,
        keycard: Keycard,
    ) -> Result<Option<Keycard>, ManagerError> {
        self.request(|reply| Command::Authenticate {
            bouncer_id: bouncer_id.to_string(),
            keycard,
            reply,
        })
        .await?
    }

    pub async fn remove_keycard_id(&self, bouncer_name: &str, keycard_id: &str) -> Result<(), ManagerError> {
        self.request(|reply| Command::RemoveKeycardId {
            bouncer_name: bouncer_name.to_string(),
            keycard_id: keycard_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn expire_keycard(&self, requester_id: &str, keycard_id: &str) -> Result<(), ManagerError> {
        self.request(|reply| Command::ExpireKeycard {
            requester_id: requester_id.to_string(),
            keycard_id: keycard_id.to_string(),
            reply,
        })
        .await?
    }

    /// Resolves once the component reports itself happy
    pub async fn wait_happy(&self, avatar_id: &str) -> Result<(), ManagerError> {
        let happy = self
            .request(|reply| Command::WaitHappy {
                avatar_id: avatar_id.to_string(),
                reply,
            })
            .await??;
        happy
            .await
            .map_err(|_| ManagerError::SleepingComponent(avatar_id.to_string()))
    }

    pub async fn delete_component(&self, avatar_id: &str) -> Result<ComponentRecord, ManagerError> {
        self.request(|reply| Command::DeleteComponent {
            avatar_id: avatar_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn delete_flow(&self, flow: &str) -> Result<Vec<ComponentRecord>, ManagerError> {
        self.request(|reply| Command::DeleteFlow {
            flow: flow.to_string(),
            reply,
        })
        .await?
    }

    pub async fn planet_snapshot(&self) -> Result<PlanetSnapshot, ManagerError> {
        self.request(|reply| Command::PlanetSnapshot { reply }).await
    }

    /// Stop the control loop and hand back the planet for saving
    pub async fn shutdown(&self) -> Result<Planet, ManagerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn control_loop(
    mut registry: SessionRegistry,
    mut completions: mpsc::UnboundedReceiver<Completion>,
    mut commands: mpsc::Receiver<Command>,
    sos: SignalOfStop,
) {
    info!("Manager control loop started");

    let shutdown = loop {
        tokio::select! {
            biased;
            _ = sos.wait_cancellation() => break None,
            Some(completion) = completions.recv() => registry.handle_completion(completion),
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(reply) = handle_command(&mut registry, &sos, command) {
                        break Some(reply);
                    }
                }
                None => break None,
            },
        }
    };

    let planet = registry.into_planet();
    if let Some(reply) = shutdown {
        let _ = reply.send(planet);
    }
    info!("Manager control loop stopped");
}

/// Returns the reply channel of a shutdown request, which ends the loop
fn handle_command(
    registry: &mut SessionRegistry,
    sos: &SignalOfStop,
    command: Command,
) -> Option<oneshot::Sender<Planet>> {
    match command {
        Command::Attach {
            avatar_id,
            mind,
            bootstrap,
            peer_host,
            reply,
        } => {
            let _ = reply.send(registry.attach(&avatar_id, mind, bootstrap, &peer_host));
        }
        Command::Event {
            avatar_id,
            event,
            reply,
        } => {
            let _ = reply.send(dispatch_event(registry, &avatar_id, event));
        }
        Command::WorkerAttached {
            worker,
            port,
            reply,
        } => {
            let _ = reply.send(Ok(registry.feed_server_available(&worker, port)));
        }
        Command::WorkerDetached { worker, reply } => {
            registry.worker_detached(&worker);
            let _ = reply.send(Ok(()));
        }
        Command::SetElementProperty {
            avatar_id,
            element,
            property,
            value,
            reply,
        } => forward(
            sos,
            registry.set_element_property(&avatar_id, &element, &property, value),
            reply,
        ),
        Command::GetElementProperty {
            avatar_id,
            element,
            property,
            reply,
        } => forward(
            sos,
            registry.get_element_property(&avatar_id, &element, &property),
            reply,
        ),
        Command::Stop { avatar_id, reply } => {
            let call = registry.stop(&avatar_id).map(|stop| stop.map(Ok::<(), ManagerError>).boxed());
            forward(sos, call, reply)
        }
        Command::Reload { avatar_id, reply } => {
            let call = registry.reload(&avatar_id).map(|reload| reload.map(Ok::<(), ManagerError>).boxed());
            forward(sos, call, reply)
        }
        Command::Authenticate {
            bouncer_id,
            keycard,
            reply,
        } => forward(sos, registry.authenticate(&bouncer_id, keycard), reply),
        Command::RemoveKeycardId {
            bouncer_name,
            keycard_id,
            reply,
        } => forward(sos, registry.remove_keycard_id(&bouncer_name, &keycard_id), reply),
        Command::ExpireKeycard {
            requester_id,
            keycard_id,
            reply,
        } => forward(sos, registry.expire_keycard(&requester_id, &keycard_id), reply),
        Command::WaitHappy { avatar_id, reply } => {
            let _ = reply.send(registry.wait_happy(&avatar_id));
        }
        Command::DeleteComponent { avatar_id, reply } => {
            let _ = reply.send(registry.delete_component(&avatar_id));
        }
        Command::DeleteFlow { flow, reply } => {
            let _ = reply.send(registry.delete_flow(&flow));
        }
        Command::PlanetSnapshot { reply } => {
            let _ = reply.send(registry.planet_snapshot());
        }
        Command::Shutdown { reply } => return Some(reply),
    }
    None
}

fn dispatch_event(
    registry: &mut SessionRegistry,
    avatar_id: &str,
    event: ComponentEvent,
) -> Result<Vec<Wiring>, ManagerError> {
    debug!("{} sent {:?}", avatar_id, event);
    match event {
        ComponentEvent::MoodChanged(mood) => {
            registry.session_mut(avatar_id)?.mood_changed(mood);
            Ok(Vec::new())
        }
        ComponentEvent::ElementsChanged(elements) => {
            registry.session_mut(avatar_id)?.elements_changed(elements);
            Ok(Vec::new())
        }
        ComponentEvent::CleanShutdown => {
            registry.session_mut(avatar_id)?.notify_clean_shutdown();
            Ok(Vec::new())
        }
        ComponentEvent::Disconnected => registry.detach(avatar_id).map(|(_, wiring)| wiring),
    }
}

/// Answer `reply` with a validation error right away, or with the outcome of
/// the remote call once it completes off the loop
fn forward<T: Send + 'static>(
    sos: &SignalOfStop,
    call: Result<BoxFuture<'static, Result<T, ManagerError>>, ManagerError>,
    reply: Reply<T>,
) {
    match call {
        Err(e) => {
            let _ = reply.send(Err(e));
        }
        Ok(call) => {
            sos.spawn(async move {
                let _ = reply.send(call.await);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortRange, WorkerConfig};
    use crate::mind::LocalMind;
    use crate::planet::{ComponentConfig, EaterSource, Mood};
    use std::time::Duration;

    fn manager() -> Manager {
        let workers = WorkerDirectory::from_config(&[WorkerConfig {
            name: "w1".into(),
            feed_server_port: None,
            ports: PortRange { start: 9000, end: 9009 },
        }]);
        Manager::spawn(Planet::new(), workers, &SignalOfStop::new())
    }

    fn producer() -> Arc<LocalMind> {
        let mut config = ComponentConfig::new("live", "a", "videotest");
        config.feed.push("default".into());
        Arc::new(LocalMind::new(config, "w1").with_elements(&["src"]))
    }

    fn consumer() -> Arc<LocalMind> {
        let mut config = ComponentConfig::new("live", "b", "http-streamer");
        config.eater.insert(
            "default".into(),
            vec![EaterSource {
                feed_id: "a:default".into(),
                alias: "default".into(),
            }],
        );
        Arc::new(LocalMind::new(config, "w1"))
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_login_and_wire_through_handle() {
        let manager = manager();
        let a = producer();
        let b = consumer();

        manager.login("/live/a", a.clone(), "10.0.0.1").await.unwrap();
        let wiring = manager.login("/live/b", b.clone(), "10.0.0.2").await.unwrap();
        assert!(matches!(wiring.as_slice(), [Wiring::Postponed { .. }]));

        let wiring = manager.worker_attached("w1", 8800).await.unwrap();
        assert_eq!(wiring.len(), 2);
        eventually(|| b.count("eatFrom") >= 1).await;
        assert_eq!(a.count("eatFrom"), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_registers_nothing() {
        let manager = manager();
        let a = producer();
        a.fail_on("getMasterClockInfo");

        let err = manager.login("/live/a", a.clone(), "10.0.0.1").await.unwrap_err();
        assert!(matches!(err, ManagerError::Bootstrap { .. }));
        assert!(manager.planet_snapshot().await.unwrap().flows.is_empty());
        assert_eq!(
            manager.stop_component("/live/a").await,
            Err(ManagerError::UnknownComponent("/live/a".into()))
        );
    }

    #[tokio::test]
    async fn test_events_drive_the_record() {
        let manager = manager();
        let a = Arc::new(
            LocalMind::new(ComponentConfig::new("live", "a", "videotest"), "w1").with_mood(Mood::Waking),
        );
        manager.login("/live/a", a.clone(), "10.0.0.1").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_happy("/live/a").await })
        };
        manager
            .event("/live/a", ComponentEvent::MoodChanged(Mood::Happy))
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();

        manager.event("/live/a", ComponentEvent::CleanShutdown).await.unwrap();
        manager.event("/live/a", ComponentEvent::CleanShutdown).await.unwrap();
        manager.event("/live/a", ComponentEvent::Disconnected).await.unwrap();

        let snapshot = manager.planet_snapshot().await.unwrap();
        let record = &snapshot.flows["live"][0];
        assert_eq!(record.mood, Mood::Sleeping);
        assert!(record.job.is_none());
        assert_eq!(
            manager.event("/live/a", ComponentEvent::MoodChanged(Mood::Happy)).await,
            Err(ManagerError::SleepingComponent("/live/a".into()))
        );
    }

    #[tokio::test]
    async fn test_wait_happy_fails_when_component_leaves() {
        let manager = manager();
        let a = Arc::new(
            LocalMind::new(ComponentConfig::new("live", "a", "videotest"), "w1").with_mood(Mood::Waking),
        );
        manager.login("/live/a", a, "10.0.0.1").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_happy("/live/a").await })
        };
        tokio::task::yield_now().await;
        manager.event("/live/a", ComponentEvent::Disconnected).await.unwrap();

        assert_eq!(
            waiter.await.unwrap(),
            Err(ManagerError::SleepingComponent("/live/a".into()))
        );
    }

    #[tokio::test]
    async fn test_properties_through_handle() {
        let manager = manager();
        let a = producer();
        manager.login("/live/a", a.clone(), "10.0.0.1").await.unwrap();
        a.take_calls();

        assert!(matches!(
            manager.set_element_property("/live/a", "", "x", Value::from(1)).await,
            Err(ManagerError::Property(_))
        ));
        assert!(matches!(
            manager
                .set_element_property("/live/a", "nonexistent-element", "x", Value::from(1))
                .await,
            Err(ManagerError::Property(_))
        ));
        assert!(a.calls().is_empty());

        manager
            .set_element_property("/live/a", "src", "pattern", Value::from(3))
            .await
            .unwrap();
        assert_eq!(
            manager.get_element_property("/live/a", "src", "pattern").await,
            Ok(Value::from(3))
        );
    }

    #[tokio::test]
    async fn test_stop_and_reload_are_best_effort() {
        let manager = manager();
        let a = producer();
        manager.login("/live/a", a.clone(), "10.0.0.1").await.unwrap();
        a.fail_on("stop");

        assert_eq!(manager.stop_component("/live/a").await, Ok(()));
        assert_eq!(manager.reload_component("/live/a").await, Ok(()));
        assert_eq!(a.count("stop"), 1);
        assert_eq!(a.count("reloadComponent"), 1);
    }

    #[tokio::test]
    async fn test_delete_and_shutdown() {
        let manager = manager();
        let a = producer();
        manager.login("/live/a", a, "10.0.0.1").await.unwrap();
        manager.login("/live/b", consumer(), "10.0.0.2").await.unwrap();

        assert!(matches!(
            manager.delete_flow("live").await,
            Err(ManagerError::ComponentBusy(_))
        ));
        manager.event("/live/b", ComponentEvent::Disconnected).await.unwrap();
        assert_eq!(manager.delete_component("/live/b").await.unwrap().mood, Mood::Lost);

        let planet = manager.shutdown().await.unwrap();
        assert_eq!(planet.len(), 1);
        assert!(planet.contains("/live/a"));
        assert_eq!(
            manager.planet_snapshot().await.err(),
            Some(ManagerError::ManagerGone)
        );
    }
}
