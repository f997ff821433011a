//! Component mood (health) as seen by the manager

use serde::{Deserialize, Serialize};

/// Lifecycle and health value of a component.
///
/// While a component is connected its mood follows what the component
/// reports about itself. Once it disconnects the manager settles it with
/// [`Mood::after_disconnect`]. The manager never invents `Sad` on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    /// Running and producing
    Happy,

    /// Running but starved of input
    Hungry,

    /// Starting up
    Waking,

    /// Stopped on purpose
    #[default]
    Sleeping,

    /// Gone without saying goodbye
    Lost,

    /// Failed; stays this way until an operator intervenes
    Sad,
}

impl Mood {
    /// Mood a component ends up in once its session goes away
    pub fn after_disconnect(self, shutdown_requested: bool) -> Mood {
        match self {
            Mood::Sad => Mood::Sad,
            _ if shutdown_requested => Mood::Sleeping,
            _ => Mood::Lost,
        }
    }

    /// Whether the persisted record may be deleted while in this mood
    pub fn is_deletable(&self) -> bool {
        matches!(self, Mood::Sleeping | Mood::Lost | Mood::Sad)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Hungry => "hungry",
            Mood::Waking => "waking",
            Mood::Sleeping => "sleeping",
            Mood::Lost => "lost",
            Mood::Sad => "sad",
        }
    }
}

impl std::fmt::Display for Mood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
