use std::ops::RangeInclusive;

// feeds
pub const DEFAULT_FEED_NAME: &str = "default";
pub const DEFAULT_EATER_NAME: &str = "default";

// connections
pub const LOOPBACK_HOST: &str = "127.0.0.1";
pub const DEFAULT_FEED_SERVER_PORT: u16 = 8600;
pub const DEFAULT_WORKER_PORTS: RangeInclusive<u16> = 8601..=8699;

// bouncer components live in their own pseudo-flow
pub const ATMOSPHERE_FLOW: &str = "atmosphere";

// persisted configuration
pub const CURRENT_CONFIG_VERSION: u32 = 1;

// manager
pub const COMMAND_QUEUE_SIZE: usize = 64;
