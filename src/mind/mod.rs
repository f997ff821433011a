//! The manager's view of a remote component process
//!
//! A [`ComponentMind`] is the RPC handle the transport hands over once a
//! component has authenticated. Calls go out through the trait; whatever the
//! component tells the manager on its own comes back as a [`ComponentEvent`].

pub mod local;

pub use local::{LocalMind, MindCall};

use crate::error::RemoteError;
use crate::manager::clock::Clocking;
use crate::planet::{ComponentConfig, JobState, Mood};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Credentials a bouncer component decides on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keycard {
    #[serde(default)]
    pub id: Option<String>,
    /// Component id of whoever asked for authentication
    pub requester_id: String,
    #[serde(default)]
    pub data: Value,
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Requests the manager can issue to a component job
#[async_trait]
pub trait ComponentMind: Send + Sync {
    async fn get_config(&self) -> RemoteResult<ComponentConfig>;

    async fn get_state(&self) -> RemoteResult<JobState>;

    /// The clock the component is already providing, if any
    async fn get_master_clock_info(&self) -> RemoteResult<Option<Clocking>>;

    async fn eat_from(
        &self,
        eater_alias: &str,
        full_feed_id: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()>;

    async fn feed_to(
        &self,
        feeder_name: &str,
        full_feed_id: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()>;

    /// Bind a network clock on `port`; answers the address and base time
    async fn provide_master_clock(&self, port: u16) -> RemoteResult<(String, u64)>;

    async fn set_master_clock(&self, clocking: &Clocking) -> RemoteResult<()>;

    async fn set_element_property(
        &self,
        element: &str,
        property: &str,
        value: Value,
    ) -> RemoteResult<()>;

    async fn get_element_property(&self, element: &str, property: &str) -> RemoteResult<Value>;

    async fn stop(&self) -> RemoteResult<()>;

    async fn reload(&self) -> RemoteResult<()>;

    async fn authenticate(&self, keycard: Keycard) -> RemoteResult<Option<Keycard>>;

    async fn remove_keycard_id(&self, keycard_id: &str) -> RemoteResult<()>;

    async fn expire_keycard(&self, keycard_id: &str) -> RemoteResult<()>;
}

/// Notifications a component sends on its own
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentEvent {
    MoodChanged(Mood),
    ElementsChanged(Vec<String>),
    /// The component is about to go away on purpose
    CleanShutdown,
    /// The transport lost the component
    Disconnected,
}
