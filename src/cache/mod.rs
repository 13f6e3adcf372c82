//! Drone state cache
//!
//! Read-through, write-through cache of drone records in front of the store.
//! The cache is an optimization only: every backend failure degrades to a
//! miss and is never returned to the caller.

mod memory;

pub use memory::{MemoryCache, NoopCache};

use async_trait::async_trait;
use bytes::Bytes;
use skyfleet_shared::{codec, Drone};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Key/value store with expiry
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Permission to fill the cache with a record read from the store
///
/// A fill is dropped if a write for the same drone happened after the ticket
/// was taken, so a slow reader cannot overwrite a newer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    drone_id: i64,
    generation: u64,
}

pub struct StateCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    /// Write generation per drone; guarded so fills and writes serialize
    generations: Mutex<HashMap<i64, u64>>,
}

impl StateCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// Cache that never holds anything
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopCache), Duration::ZERO)
    }

    pub fn key(drone_id: i64) -> String {
        format!("drone:{}", drone_id)
    }

    pub async fn get(&self, drone_id: i64) -> Option<Drone> {
        let key = Self::key(drone_id);
        let bytes = match self.backend.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(drone_id, "Cache read failed: {}", e);
                return None;
            }
        };

        match codec::decode(&bytes) {
            Ok(drone) => Some(drone),
            Err(e) => {
                warn!(drone_id, "Dropping undecodable cache entry: {}", e);
                if let Err(e) = self.backend.delete(&key).await {
                    debug!(drone_id, "Cache delete failed: {}", e);
                }
                None
            }
        }
    }

    pub async fn ticket(&self, drone_id: i64) -> FillTicket {
        let generations = self.generations.lock().await;
        FillTicket {
            drone_id,
            generation: generations.get(&drone_id).copied().unwrap_or(0),
        }
    }

    /// Read-through fill; skipped when a newer write has landed
    pub async fn fill(&self, ticket: FillTicket, drone: &Drone) {
        let generations = self.generations.lock().await;
        let current = generations.get(&ticket.drone_id).copied().unwrap_or(0);
        if current != ticket.generation || drone.id != ticket.drone_id {
            debug!(drone_id = ticket.drone_id, "Skipping stale cache fill");
            return;
        }
        self.store(drone).await;
    }

    /// Write-through after a successful store mutation
    pub async fn write(&self, drone: &Drone) {
        let mut generations = self.generations.lock().await;
        *generations.entry(drone.id).or_insert(0) += 1;
        self.store(drone).await;
    }

    pub async fn invalidate(&self, drone_id: i64) {
        let mut generations = self.generations.lock().await;
        *generations.entry(drone_id).or_insert(0) += 1;
        if let Err(e) = self.backend.delete(&Self::key(drone_id)).await {
            warn!(drone_id, "Cache invalidation failed: {}", e);
        }
    }

    async fn store(&self, drone: &Drone) {
        let key = Self::key(drone.id);
        let bytes = match codec::encode(drone) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(drone_id = drone.id, "Not caching drone: {}", e);
                self.evict(&key, drone.id).await;
                return;
            }
        };

        if let Err(e) = self.backend.set(&key, bytes, self.ttl).await {
            warn!(drone_id = drone.id, "Cache write failed: {}", e);
            self.evict(&key, drone.id).await;
        }
    }

    /// Drop an entry that could not be overwritten so it cannot be served stale
    async fn evict(&self, key: &str, drone_id: i64) {
        if let Err(e) = self.backend.delete(key).await {
            debug!(drone_id, "Cache delete failed: {}", e);
        }
    }
}
