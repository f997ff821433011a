use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Error,
    Warning,
    Info,
}

/// Operator-facing diagnostic attached to a component record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub level: Level,
    /// Stable identifier, e.g. `stale-config`
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    /// Unix seconds
    pub timestamp: i64,
}

impl Message {
    pub fn new(level: Level, id: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            level,
            id: id.into(),
            text: text.into(),
            debug: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn warning(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Level::Warning, id, text)
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.level, self.id, self.text)
    }
}
