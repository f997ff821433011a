//! Error taxonomy of the manager core

use thiserror::Error;

/// Failure surfaced by a call on a remote component
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedIdError {
    #[error("empty component name in feed id '{0}'")]
    EmptyComponent(String),
    #[error("empty feed name in feed id '{0}'")]
    EmptyFeed(String),
    #[error("malformed component id '{0}'")]
    MalformedComponentId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// One of the three session bootstrap calls failed, nothing was registered
    #[error("bootstrap of {avatar_id} failed: {source}")]
    Bootstrap {
        avatar_id: String,
        #[source]
        source: RemoteError,
    },

    /// Local validation of an element property request failed
    #[error("{0}")]
    Property(String),

    #[error("unknown component {0}")]
    UnknownComponent(String),

    #[error("component {0} is not logged in")]
    SleepingComponent(String),

    #[error("remote method {method} failed: {message}")]
    RemoteMethod { method: String, message: String },

    #[error("component {0} is busy")]
    ComponentBusy(String),

    #[error("component {0} is already logged in")]
    AlreadyLoggedIn(String),

    #[error("no free ports left on worker {0}")]
    NoPortsAvailable(String),

    #[error(transparent)]
    FeedId(#[from] FeedIdError),

    #[error("manager is not running")]
    ManagerGone,
}

impl ManagerError {
    pub fn remote(method: &str, error: RemoteError) -> Self {
        ManagerError::RemoteMethod {
            method: method.to_string(),
            message: error.message,
        }
    }
}
