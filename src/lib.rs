//! Skyfleet Link Service
//!
//! Establishes, tracks and tears down live links to drone bridges, keeps the
//! registry of active links, reconciles link state into the persisted drone
//! records and writes the operation audit trail.

pub mod cache;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod store;

pub use error::{DroneError, Result};
pub use orchestrator::{ConnectAttempt, ConnectionOrchestrator};
pub use registry::{ClientRegistry, RegisteredLink};
pub use service::DroneService;
