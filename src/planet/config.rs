//! Durable component configuration, its upgrade path and diffing

use crate::assets::{CURRENT_CONFIG_VERSION, DEFAULT_EATER_NAME};
use crate::planet::ids::{component_id, parse_feed_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One source an eater consumes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EaterSource {
    /// `component:feed` of the feeder
    pub feed_id: String,
    /// Local name the eater gives this source
    pub alias: String,
}

/// A feed this component serves on behalf of another component name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFeed {
    /// `component:feed` the feed is exposed as
    pub feed_id: String,
    /// Local feeder that actually produces it
    pub feeder: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComponentConfig {
    pub name: String,
    /// Flow the component belongs to
    pub parent: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub worker: Option<String>,
    /// eater name -> sources
    #[serde(default)]
    pub eater: BTreeMap<String, Vec<EaterSource>>,
    /// feeder names
    #[serde(default)]
    pub feed: Vec<String>,
    /// Component id of the flow's clock master, if it needs one
    #[serde(default)]
    pub clock_master: Option<String>,
    #[serde(default)]
    pub virtual_feeds: Vec<VirtualFeed>,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
    #[serde(default)]
    pub config_version: u32,
    /// Flat source list of version 0 configurations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source: Vec<String>,
}

impl ComponentConfig {
    pub fn new(flow: &str, name: &str, kind: &str) -> Self {
        ComponentConfig {
            name: name.to_string(),
            parent: flow.to_string(),
            kind: kind.to_string(),
            worker: None,
            eater: BTreeMap::new(),
            feed: Vec::new(),
            clock_master: None,
            virtual_feeds: Vec::new(),
            properties: serde_json::Map::new(),
            config_version: CURRENT_CONFIG_VERSION,
            source: Vec::new(),
        }
    }

    pub fn avatar_id(&self) -> String {
        component_id(&self.parent, &self.name)
    }

    /// Every `(feed_id, alias)` pair across all eaters
    pub fn eater_sources(&self) -> impl Iterator<Item = &EaterSource> {
        self.eater.values().flatten()
    }

    /// Bring an older configuration up to the current version.
    ///
    /// Stops at the first upgrader that fails, leaving the version at the
    /// last one that succeeded.
    pub fn upgrade(&mut self) -> Result<(), UpgradeFailure> {
        while self.config_version < CURRENT_CONFIG_VERSION {
            let version = self.config_version;
            let upgrader = UPGRADERS[version as usize];
            upgrader(self).map_err(|reason| UpgradeFailure { version, reason })?;
            self.config_version = version + 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeFailure {
    pub version: u32,
    pub reason: String,
}

type Upgrader = fn(&mut ComponentConfig) -> Result<(), String>;

const UPGRADERS: [Upgrader; CURRENT_CONFIG_VERSION as usize] = [upgrade_sources_to_eaters];

/// Version 0 listed plain sources; turn them into aliased eater entries
fn upgrade_sources_to_eaters(config: &mut ComponentConfig) -> Result<(), String> {
    if config.source.is_empty() {
        return Ok(());
    }
    let mut alias = DEFAULT_EATER_NAME.to_string();
    let mut sources = Vec::with_capacity(config.source.len());
    for feed_id in &config.source {
        parse_feed_id(feed_id).map_err(|e| e.to_string())?;
        sources.push(EaterSource {
            feed_id: feed_id.clone(),
            alias: alias.clone(),
        });
        alias.push_str("-bis");
    }
    config
        .eater
        .entry(DEFAULT_EATER_NAME.to_string())
        .or_default()
        .extend(sources);
    config.source.clear();
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Added { path: String, value: Value },
    Removed { path: String, value: Value },
    Changed { path: String, old: Value, new: Value },
}

/// Key-level differences between two configurations
pub fn config_diff(old: &ComponentConfig, new: &ComponentConfig) -> Vec<ConfigChange> {
    let mut changes = Vec::new();
    match (serde_json::to_value(old), serde_json::to_value(new)) {
        (Ok(old), Ok(new)) => diff_values("", &old, &new, &mut changes),
        _ => changes.push(ConfigChange::Changed {
            path: String::new(),
            old: Value::Null,
            new: Value::Null,
        }),
    }
    changes
}

fn diff_values(path: &str, old: &Value, new: &Value, changes: &mut Vec<ConfigChange>) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                let sub = join_path(path, key);
                match new.get(key) {
                    Some(new_value) => diff_values(&sub, old_value, new_value, changes),
                    None => changes.push(ConfigChange::Removed {
                        path: sub,
                        value: old_value.clone(),
                    }),
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    changes.push(ConfigChange::Added {
                        path: join_path(path, key),
                        value: new_value.clone(),
                    });
                }
            }
        }
        (old, new) if old != new => changes.push(ConfigChange::Changed {
            path: path.to_string(),
            old: old.clone(),
            new: new.clone(),
        }),
        _ => {}
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

pub fn render_diff(changes: &[ConfigChange], old_label: &str, new_label: &str) -> String {
    changes
        .iter()
        .map(|change| match change {
            ConfigChange::Added { path, value } => {
                format!("{} only in {}: {}", path, new_label, value)
            }
            ConfigChange::Removed { path, value } => {
                format!("{} only in {}: {}", path, old_label, value)
            }
            ConfigChange::Changed { path, old, new } => {
                format!("{} changed from {} ({}) to {} ({})", path, old, old_label, new, new_label)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_sources() {
        let mut config = ComponentConfig::new("live", "muxer", "ogg-muxer");
        config.config_version = 0;
        config.source = vec!["video:default".into(), "audio".into()];

        config.upgrade().unwrap();

        assert_eq!(config.config_version, CURRENT_CONFIG_VERSION);
        assert!(config.source.is_empty());
        let sources = &config.eater["default"];
        assert_eq!(sources[0].feed_id, "video:default");
        assert_eq!(sources[0].alias, "default");
        assert_eq!(sources[1].feed_id, "audio");
        assert_eq!(sources[1].alias, "default-bis");
    }

    #[test]
    fn test_upgrade_failure_keeps_version() {
        let mut config = ComponentConfig::new("live", "muxer", "ogg-muxer");
        config.config_version = 0;
        config.source = vec![":broken".into()];

        let failure = config.upgrade().unwrap_err();
        assert_eq!(failure.version, 0);
        assert_eq!(config.config_version, 0);
    }

    #[test]
    fn test_current_config_untouched() {
        let mut config = ComponentConfig::new("live", "producer", "videotest");
        let before = config.clone();
        config.upgrade().unwrap();
        assert_eq!(config, before);
    }

    #[test]
    fn test_diff() {
        let old = ComponentConfig::new("live", "producer", "videotest");
        let mut new = old.clone();
        new.feed.push("default".into());
        new.properties.insert("framerate".into(), Value::from(25));

        let changes = config_diff(&old, &new);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| matches!(c,
            ConfigChange::Changed { path, .. } if path == "feed")));
        assert!(changes.iter().any(|c| matches!(c,
            ConfigChange::Added { path, .. } if path == "properties.framerate")));

        let text = render_diff(&changes, "internal conf", "running conf");
        assert!(text.contains("properties.framerate only in running conf"));
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: ComponentConfig = serde_json::from_str(
            r#"{"name": "producer", "parent": "live", "type": "videotest", "feed": ["default"]}"#,
        )
        .unwrap();
        assert_eq!(config.avatar_id(), "/live/producer");
        assert_eq!(config.config_version, 0);
        assert!(config.eater.is_empty());
    }
}
