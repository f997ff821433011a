//! Clock master election and propagation
//!
//! A flow may name one of its components as clock master. That component is
//! asked to provide a network clock; every other component naming the same
//! master gets a copy of the resulting [`Clocking`]. Only the named master
//! ever provides, so there is at most one provider per master id.

use serde::{Deserialize, Serialize};

/// Where to find a network clock, and the pipeline base time it started at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clocking {
    pub host: String,
    pub port: u16,
    /// Nanoseconds
    pub base_time: u64,
}

impl Clocking {
    pub fn new(host: &str, port: u16, base_time: u64) -> Self {
        Clocking {
            host: host.to_string(),
            port,
            base_time,
        }
    }
}

impl std::fmt::Display for Clocking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (base time {})", self.host, self.port, self.base_time)
    }
}

/// What a session has to do about its clock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockAction {
    /// No clock master configured
    NotRequired,

    /// The session is the master and must provide
    Provide,

    /// Slave of a providing master
    Synchronize(Clocking),

    /// Slave already running on the master's current clock
    InSync,

    /// The master is logged in but has no clock yet
    MasterNotProviding(String),

    /// The master is not logged in; retried when it announces its clock
    WaitForMaster(String),
}

/// Decide the clock action for `avatar_id`.
///
/// `master_clock` looks up the master session: `None` when it is not
/// logged in, `Some(None)` when it is but does not provide yet.
pub fn plan<F>(
    avatar_id: &str,
    clock_master: Option<&str>,
    synced: Option<&Clocking>,
    master_clock: F,
) -> ClockAction
where
    F: FnOnce(&str) -> Option<Option<Clocking>>,
{
    let Some(master) = clock_master else {
        return ClockAction::NotRequired;
    };
    if master == avatar_id {
        return ClockAction::Provide;
    }
    match master_clock(master) {
        None => ClockAction::WaitForMaster(master.to_string()),
        Some(None) => ClockAction::MasterNotProviding(master.to_string()),
        Some(Some(clocking)) if synced == Some(&clocking) => ClockAction::InSync,
        Some(Some(clocking)) => ClockAction::Synchronize(clocking),
    }
}
