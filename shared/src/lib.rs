//! Skyfleet Shared Types
//!
//! This crate provides the drone, connection history and operation audit
//! records shared by the link service and its storage backends, along with
//! the drone status machine and the cache record codec.

pub mod codec;
pub mod model;
pub mod status;

// Re-export commonly used types at crate root
pub use model::*;
pub use status::{check_transition, is_valid_transition, DroneStatus, InvalidTransition};

/// Default operating parameters
pub mod defaults {
    /// Bounded wait for a new link to report itself live
    pub const LINK_LIVE_TIMEOUT_MS: u64 = 2000;

    /// Interval between liveness checks while waiting for a link
    pub const LINK_POLL_INTERVAL_MS: u64 = 100;

    /// Bound on a single publish/recording call over a live link
    pub const LINK_COMMAND_TIMEOUT_MS: u64 = 5000;

    /// Number of worker threads available for blocking link attempts
    pub const LINK_WORKER_THREADS: usize = 8;

    /// A MAVLink link without a heartbeat for this long is considered down
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 3000;

    /// Expiry of cached drone records
    pub const CACHE_TTL_SECS: u64 = 60;

    /// Page size for drone listings
    pub const DEFAULT_LIST_LIMIT: usize = 100;

    pub const MAX_NAME_LEN: usize = 100;
    pub const MAX_DRONE_ID_LEN: usize = 50;
    pub const MAX_URL_LEN: usize = 255;
}

/// Connection record close reasons
pub mod reasons {
    pub const MANUAL_DISCONNECT: &str = "manual disconnect";
    pub const SUPERSEDED: &str = "superseded by new connection";
    pub const TIMEOUT: &str = "connection timeout";
    pub const CANCELLED: &str = "cancelled by disconnect";
    pub const LINK_LOST: &str = "link lost";
    pub const SHUTDOWN: &str = "service shutdown";
    pub const WORKER_DIED: &str = "link worker exited without reporting";
}
