//! Who feeds whom
//!
//! The feed map is derived from the feed declarations of the live sessions.
//! Attaching or detaching a session only marks it dirty; the next read
//! rebuilds every index in one pass, so readers always see a map that
//! matches the last set of sessions and never a partially updated one.

use crate::planet::ids::{component_id, full_feed_id, parse_feed_id};
use crate::planet::{ComponentConfig, EaterSource};
use crate::utils::multimap::MultiMap;
use log::{debug, warn};
use std::collections::BTreeMap;

/// Feed declarations of one live session
#[derive(Debug, Clone, PartialEq)]
pub struct FeedNode {
    pub avatar_id: String,
    pub flow: String,
    pub name: String,
    pub eaters: Vec<EaterSource>,
    pub feeders: Vec<String>,
    /// (full feed id exposed, local feeder name)
    pub virtual_feeds: Vec<(String, String)>,
}

impl FeedNode {
    pub fn from_config(config: &ComponentConfig) -> Self {
        let virtual_feeds = config
            .virtual_feeds
            .iter()
            .filter_map(|vfeed| match parse_feed_id(&vfeed.feed_id) {
                Ok((component, feed)) => Some((
                    full_feed_id(&config.parent, component, feed),
                    vfeed.feeder.clone(),
                )),
                Err(e) => {
                    warn!("Ignoring virtual feed of {}: {}", config.avatar_id(), e);
                    None
                }
            })
            .collect();
        FeedNode {
            avatar_id: config.avatar_id(),
            flow: config.parent.clone(),
            name: config.name.clone(),
            eaters: config.eater_sources().cloned().collect(),
            feeders: config.feed.clone(),
            virtual_feeds,
        }
    }

    pub fn full_feed_id(&self, feed: &str) -> String {
        full_feed_id(&self.flow, &self.name, feed)
    }

    fn exposes(&self, feeder: &str) -> bool {
        self.feeders.iter().any(|f| f == feeder)
    }

    /// Real feeders plus the local feeders behind virtual feeds
    fn serving_feeders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.feeders.iter().map(String::as_str).collect();
        for (_, feeder) in &self.virtual_feeds {
            if !names.contains(&feeder.as_str()) {
                names.push(feeder);
            }
        }
        names
    }
}

/// One end of a feed connection seen from a session:
/// `local_feed` of this session is wired to `peer_feed` of `peer`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedLink {
    pub local_feed: String,
    pub peer: String,
    pub peer_feed: String,
}

impl FeedLink {
    pub fn new(local_feed: &str, peer: &str, peer_feed: &str) -> Self {
        FeedLink {
            local_feed: local_feed.to_string(),
            peer: peer.to_string(),
            peer_feed: peer_feed.to_string(),
        }
    }
}

/// A session serving a virtual feed; ordered by attach sequence first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualProvider {
    pub attached: u64,
    pub avatar_id: String,
    pub feeder: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedIndices {
    /// eater full feed id -> (eater alias, feeder session, feeder name)
    pub feeders_for_eaters: BTreeMap<String, FeedLink>,
    /// feeder full feed id -> (feeder name, eater session, eater alias)
    pub eaters_for_feeders: MultiMap<String, FeedLink>,
    /// virtual full feed id -> providers
    pub virtual_feeds: MultiMap<String, VirtualProvider>,
    /// provider session -> sessions eating through one of its virtual feeds
    pub virtual_feed_deps: MultiMap<String, String>,
}

#[derive(Debug, Default)]
pub struct FeedMap {
    nodes: BTreeMap<String, (u64, FeedNode)>,
    attach_counter: u64,
    dirty: bool,
    indices: FeedIndices,
}

impl FeedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the session was already part of the map
    pub fn component_attached(&mut self, node: FeedNode) -> bool {
        if self.nodes.contains_key(&node.avatar_id) {
            warn!("{} is already in the feed map", node.avatar_id);
            return false;
        }
        self.attach_counter += 1;
        self.nodes
            .insert(node.avatar_id.clone(), (self.attach_counter, node));
        self.dirty = true;
        true
    }

    /// Remove a session; answers the sessions that ate from it through a
    /// virtual feed and therefore need their connections redone
    pub fn component_detached(&mut self, avatar_id: &str) -> Vec<String> {
        self.recompute();
        if self.nodes.remove(avatar_id).is_none() {
            return Vec::new();
        }
        self.dirty = true;
        self.indices
            .virtual_feed_deps
            .pop(&avatar_id.to_string())
            .into_iter()
            .filter(|dep| dep != avatar_id)
            .collect()
    }

    /// Rebuild the indices if a session came or went since the last read
    pub fn recompute(&mut self) {
        if self.dirty {
            self.rebuild();
        }
    }

    /// Unconditionally rebuild every index from the attached sessions
    pub fn rebuild(&mut self) {
        let mut indices = FeedIndices::default();

        for (attached, node) in self.nodes.values() {
            for (ffid, feeder) in &node.virtual_feeds {
                indices.virtual_feeds.add(
                    ffid.clone(),
                    VirtualProvider {
                        attached: *attached,
                        avatar_id: node.avatar_id.clone(),
                        feeder: feeder.clone(),
                    },
                );
            }
        }

        for (_, eater) in self.nodes.values() {
            for source in &eater.eaters {
                let Some((feeder, feeder_name)) = self.resolve(eater, source, &mut indices) else {
                    debug!(
                        "eater {}:{} waiting for feed {} to log in",
                        eater.name, source.alias, source.feed_id
                    );
                    continue;
                };
                let feeder_ffid = match self.nodes.get(&feeder) {
                    Some((_, node)) => node.full_feed_id(&feeder_name),
                    None => continue,
                };
                indices.feeders_for_eaters.insert(
                    eater.full_feed_id(&source.alias),
                    FeedLink::new(&source.alias, &feeder, &feeder_name),
                );
                indices.eaters_for_feeders.add(
                    feeder_ffid,
                    FeedLink::new(&feeder_name, &eater.avatar_id, &source.alias),
                );
            }
        }

        self.indices = indices;
        self.dirty = false;
    }

    /// Find the session and feeder name serving `source` of `eater`
    fn resolve(
        &self,
        eater: &FeedNode,
        source: &EaterSource,
        indices: &mut FeedIndices,
    ) -> Option<(String, String)> {
        let (component, feed) = match parse_feed_id(&source.feed_id) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Bad eater source on {}: {}", eater.avatar_id, e);
                return None;
            }
        };

        let direct = component_id(&eater.flow, component);
        if let Some((_, feeder)) = self.nodes.get(&direct) {
            if feeder.exposes(feed) {
                return Some((direct, feed.to_string()));
            }
        }

        let ffid = full_feed_id(&eater.flow, component, feed);
        let provider = indices.virtual_feeds.first(&ffid)?.clone();
        indices
            .virtual_feed_deps
            .add(provider.avatar_id.clone(), eater.avatar_id.clone());
        debug!(
            "chose {}:{} for virtual feed {}",
            provider.avatar_id, provider.feeder, source.feed_id
        );
        Some((provider.avatar_id, provider.feeder))
    }

    /// The feeds `avatar_id` eats from, as (eater alias, feeder session, feeder name)
    pub fn feeders_for(&mut self, avatar_id: &str) -> Vec<FeedLink> {
        self.recompute();
        let Some((_, node)) = self.nodes.get(avatar_id) else {
            return Vec::new();
        };
        node.eaters
            .iter()
            .filter_map(|source| {
                self.indices
                    .feeders_for_eaters
                    .get(&node.full_feed_id(&source.alias))
                    .cloned()
            })
            .collect()
    }

    /// The eaters `avatar_id` feeds, as (feeder name, eater session, eater alias)
    pub fn eaters_for(&mut self, avatar_id: &str) -> Vec<FeedLink> {
        self.recompute();
        let Some((_, node)) = self.nodes.get(avatar_id) else {
            return Vec::new();
        };
        node.serving_feeders()
            .into_iter()
            .flat_map(|feeder| {
                self.indices
                    .eaters_for_feeders
                    .get(&node.full_feed_id(feeder))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
impl FeedMap {
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn indices(&mut self) -> &FeedIndices {
        self.recompute();
        &self.indices
    }
}
