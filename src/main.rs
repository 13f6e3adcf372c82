use anyhow::{Context, Result};
use serde_json::json;
use skyfleet::cache::MemoryCache;
use skyfleet::config::ServiceConfig;
use skyfleet::store::SqliteStore;
use skyfleet::{logging, DroneService};
use skyfleet_shared::{reasons, Actor, ConnectRequest, Drone, DroneFilter, DroneStatus, NewDrone};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between live state refreshes of linked drones
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::load().context("Failed to load configuration")?;
    logging::init(&config.logging)?;

    info!("Skyfleet link service starting");
    info!(
        "  Link: live timeout {} ms, {} workers",
        config.link.live_timeout_ms, config.link.worker_threads
    );
    info!(
        "  Cache: enabled={} ttl={}s",
        config.cache.enabled, config.cache.ttl_secs
    );
    info!("  Store: {}", config.store.url);

    let store = SqliteStore::connect(&config.store.url)
        .await
        .context("Failed to open store")?;
    let cache = Arc::new(MemoryCache::new());
    let service = DroneService::new(&config, Arc::new(store.clone()), cache.clone());
    let operator = Actor::system();

    close_stale_links(&service).await;

    // Simulated drone so a fresh daemon has something to talk to
    let drone = simulator(&service, &operator).await?;
    let attempt = service
        .connect(
            drone.id,
            ConnectRequest::simulated("sim://sim-01", json!({ "connect_delay_ms": 250 })),
            &operator,
        )
        .await?;
    info!(
        drone_id = drone.id,
        connection_id = attempt.connection_id,
        "Connection initiated"
    );

    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = refresh.tick() => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired cache entries");
                }
                refresh_fleet(&service).await;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    service.shutdown().await;
    store.close().await;
    info!("Skyfleet link service stopped");
    Ok(())
}

async fn simulator(service: &DroneService, operator: &Actor) -> Result<Drone> {
    let existing = service
        .list_drones(&DroneFilter {
            limit: usize::MAX,
            ..Default::default()
        })
        .await?
        .into_iter()
        .find(|d| d.drone_id == "sim-01");
    match existing {
        Some(drone) => Ok(drone),
        None => Ok(service
            .create_drone(NewDrone::new("Simulator", "sim-01"), operator)
            .await?),
    }
}

/// Links do not survive a restart; close what the last run left open
async fn close_stale_links(service: &DroneService) {
    let drones = match service
        .list_drones(&DroneFilter {
            limit: usize::MAX,
            ..Default::default()
        })
        .await
    {
        Ok(drones) => drones,
        Err(e) => {
            warn!("Failed to list drones: {}", e);
            return;
        }
    };

    let actor = Actor::system();
    for drone in drones
        .iter()
        .filter(|d| d.status.is_live() || d.status == DroneStatus::Connecting)
    {
        match service
            .orchestrator()
            .disconnect(drone.id, &actor, reasons::LINK_LOST)
            .await
        {
            Ok(_) => info!(drone_id = drone.id, "Closed link left open by previous run"),
            Err(e) => warn!(drone_id = drone.id, "Failed to close stale link: {}", e),
        }
    }
}

async fn refresh_fleet(service: &DroneService) {
    let drones = match service.list_drones(&DroneFilter::default()).await {
        Ok(drones) => drones,
        Err(e) => {
            warn!("Failed to list drones: {}", e);
            return;
        }
    };

    for drone in drones.iter().filter(|d| d.status.is_live()) {
        match service.refresh_state(drone.id).await {
            Ok(drone) => info!(
                drone_id = drone.id,
                status = %drone.status,
                battery = drone.state.battery,
                mode = drone.state.mode.as_deref().unwrap_or("-"),
                "State refreshed"
            ),
            Err(e) => warn!(drone_id = drone.id, "Refresh failed: {}", e),
        }
    }
}
