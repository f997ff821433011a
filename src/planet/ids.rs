//! Component and feed identifiers
//!
//! - component id: `/flow/component`
//! - feed id: `component:feed`
//! - full feed id: `/flow/component:feed`

use crate::assets::DEFAULT_FEED_NAME;
use crate::error::FeedIdError;

pub fn component_id(flow: &str, component: &str) -> String {
    format!("/{}/{}", flow, component)
}

pub fn feed_id(component: &str, feed: &str) -> String {
    format!("{}:{}", component, feed)
}

pub fn full_feed_id(flow: &str, component: &str, feed: &str) -> String {
    format!("/{}/{}:{}", flow, component, feed)
}

/// Split `component:feed`; a bare component name refers to its default feed
pub fn parse_feed_id(feed_id: &str) -> Result<(&str, &str), FeedIdError> {
    let (component, feed) = feed_id
        .split_once(':')
        .unwrap_or((feed_id, DEFAULT_FEED_NAME));
    if component.is_empty() {
        return Err(FeedIdError::EmptyComponent(feed_id.to_string()));
    }
    if feed.is_empty() {
        return Err(FeedIdError::EmptyFeed(feed_id.to_string()));
    }
    Ok((component, feed))
}

/// Split `/flow/component` into its flow and component names
pub fn parse_component_id(avatar_id: &str) -> Result<(&str, &str), FeedIdError> {
    let malformed = || FeedIdError::MalformedComponentId(avatar_id.to_string());
    let rest = avatar_id.strip_prefix('/').ok_or_else(malformed)?;
    let (flow, component) = rest.split_once('/').ok_or_else(malformed)?;
    if flow.is_empty() || component.is_empty() || component.contains('/') {
        return Err(malformed());
    }
    Ok((flow, component))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(component_id("live", "producer"), "/live/producer");
        assert_eq!(feed_id("producer", "video"), "producer:video");
        assert_eq!(full_feed_id("live", "producer", "video"), "/live/producer:video");
    }

    #[test]
    fn test_parse_feed_id() {
        assert_eq!(parse_feed_id("producer:video"), Ok(("producer", "video")));
        assert_eq!(parse_feed_id("producer"), Ok(("producer", "default")));
        assert!(matches!(parse_feed_id(":video"), Err(FeedIdError::EmptyComponent(_))));
        assert!(matches!(parse_feed_id("producer:"), Err(FeedIdError::EmptyFeed(_))));
    }

    #[test]
    fn test_parse_component_id() {
        assert_eq!(parse_component_id("/live/producer"), Ok(("live", "producer")));
        assert!(parse_component_id("live/producer").is_err());
        assert!(parse_component_id("/live").is_err());
        assert!(parse_component_id("/live/a/b").is_err());
    }
}
