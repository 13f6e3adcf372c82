//! Registry of live drone links

use crate::link::LinkClient;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A registered link and when it went live
#[derive(Clone)]
pub struct RegisteredLink {
    pub client: Arc<dyn LinkClient>,
    pub connected_at: DateTime<Utc>,
}

/// Process-wide table of live links, keyed by drone id
///
/// Holds at most one link per drone. Every operation takes the same lock, so
/// registrations for a drone never interleave.
pub struct ClientRegistry {
    links: Mutex<HashMap<i64, RegisteredLink>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Install a link, closing whatever was registered for the drone before
    pub async fn register(&self, drone_id: i64, client: Arc<dyn LinkClient>) {
        let entry = RegisteredLink {
            client,
            connected_at: Utc::now(),
        };
        let previous = self.links.lock().await.insert(drone_id, entry);

        if let Some(previous) = previous {
            info!(drone_id, "Replacing registered {} link", previous.client.kind());
            teardown(drone_id, &previous.client);
        }
    }

    pub async fn lookup(&self, drone_id: i64) -> Option<RegisteredLink> {
        self.links.lock().await.get(&drone_id).cloned()
    }

    /// Remove a drone's link without closing it
    pub async fn remove(&self, drone_id: i64) -> Option<RegisteredLink> {
        self.links.lock().await.remove(&drone_id)
    }

    /// Remove the link only if it is still the given client
    pub async fn remove_if(&self, drone_id: i64, client: &Arc<dyn LinkClient>) -> bool {
        let mut links = self.links.lock().await;
        match links.get(&drone_id) {
            Some(entry) if Arc::ptr_eq(&entry.client, client) => {
                links.remove(&drone_id);
                true
            }
            _ => false,
        }
    }

    /// Remove every link, returning them for teardown
    pub async fn drain(&self) -> Vec<(i64, RegisteredLink)> {
        self.links.lock().await.drain().collect()
    }

    pub async fn connected_drones(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.links.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn count(&self) -> usize {
        self.links.lock().await.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort close of a link; failures are logged and dropped
pub fn teardown(drone_id: i64, client: &Arc<dyn LinkClient>) {
    if let Err(e) = client.terminate() {
        warn!(drone_id, "Failed to close {} link: {:#}", client.kind(), e);
    }
}
