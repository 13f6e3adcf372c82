//! Drone Service
//!
//! The single entry point for callers: drone CRUD with a cache-aside read
//! path, plus connect/disconnect/refresh and the link-backed operations.
//! User-triggered mutations always leave an audit entry, including on
//! failure.

use crate::cache::{CacheBackend, StateCache};
use crate::config::{LinkSettings, ServiceConfig};
use crate::error::{DroneError, Result};
use crate::link::{
    DefaultLinkFactory, ImageFrame, LinkClient, LinkFactory, PointCloud, RecordingRequest,
};
use crate::orchestrator::{ConnectAttempt, ConnectionOrchestrator};
use crate::registry::{ClientRegistry, RegisteredLink};
use crate::store::{Store, StoreTx};
use chrono::Utc;
use serde_json::{json, Value};
use skyfleet_shared::{
    reasons, Actor, ConnectRequest, ConnectionRecord, Drone, DroneFilter, DronePatch,
    NewDrone, NewOperation, OperationAudit, OperationKind, OperationStatus,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct DroneService {
    store: Arc<dyn Store>,
    cache: Arc<StateCache>,
    orchestrator: Arc<ConnectionOrchestrator>,
    settings: LinkSettings,
}

impl DroneService {
    pub fn new(config: &ServiceConfig, store: Arc<dyn Store>, backend: Arc<dyn CacheBackend>) -> Self {
        let factory = Arc::new(DefaultLinkFactory::new(config.link.clone()));
        Self::with_factory(config, store, backend, factory)
    }

    pub fn with_factory(
        config: &ServiceConfig,
        store: Arc<dyn Store>,
        backend: Arc<dyn CacheBackend>,
        factory: Arc<dyn LinkFactory>,
    ) -> Self {
        let cache = if config.cache.enabled {
            Arc::new(StateCache::new(backend, config.cache.ttl()))
        } else {
            Arc::new(StateCache::disabled())
        };
        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            store.clone(),
            cache.clone(),
            Arc::new(ClientRegistry::new()),
            factory,
            config.link.clone(),
        ));
        Self {
            store,
            cache,
            orchestrator,
            settings: config.link.clone(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator> {
        &self.orchestrator
    }

    pub async fn create_drone(&self, new: NewDrone, actor: &Actor) -> Result<Drone> {
        let payload = json!({
            "action": "create_drone",
            "name": new.name,
            "drone_id": new.drone_id,
        });
        if let Err(e) = new.validate() {
            self.record_failed(OperationKind::Other, actor, None, payload, &e.0)
                .await;
            return Err(e.into());
        }

        let at = Utc::now();
        let result: Result<Drone> = async {
            let mut tx = self.store.begin().await?;
            let created = async {
                let drone = tx.insert_drone(new, at).await?;
                tx.insert_operation(
                    NewOperation::new(OperationKind::Other, actor)
                        .for_drone(drone.id)
                        .with_payload(payload.clone())
                        .succeeded(),
                    at,
                )
                .await?;
                Ok::<_, DroneError>(drone)
            }
            .await;
            match created {
                Ok(drone) => {
                    tx.commit().await?;
                    Ok(drone)
                }
                Err(e) => {
                    tx.rollback().await;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok(drone) => {
                info!(drone_id = drone.id, name = %drone.name, actor = %actor, "Drone created");
                self.cache.write(&drone).await;
                Ok(drone)
            }
            Err(e) => {
                warn!("Drone creation failed: {}", e);
                self.record_failed(OperationKind::Other, actor, None, payload, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    pub async fn get_drone(&self, drone_id: i64) -> Result<Drone> {
        self.orchestrator.load(drone_id).await
    }

    pub async fn list_drones(&self, filter: &DroneFilter) -> Result<Vec<Drone>> {
        Ok(self.store.drones(filter).await?)
    }

    /// Apply a partial update under the drone's sequencing lock
    pub async fn update_drone(&self, drone_id: i64, patch: DronePatch, actor: &Actor) -> Result<Drone> {
        let mut payload = patch.to_payload();
        if let Value::Object(fields) = &mut payload {
            fields.insert("action".into(), json!("update_drone"));
        }

        let _guard = self.orchestrator.lock_drone(drone_id).await;
        let linked = self.orchestrator.link_handle(drone_id).await.is_some();

        let at = Utc::now();
        let result: Result<Drone> = async {
            patch.validate()?;
            let mut tx = self.store.begin().await?;
            match Self::update_in(tx.as_mut(), drone_id, &patch, linked, actor, payload.clone(), at).await {
                Ok(drone) => {
                    tx.commit().await?;
                    Ok(drone)
                }
                Err(e) => {
                    tx.rollback().await;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok(drone) => {
                debug!(drone_id, actor = %actor, "Drone updated");
                self.cache.write(&drone).await;
                Ok(drone)
            }
            Err(e) => {
                if e.is_rejection() {
                    debug!(drone_id, "Update rejected: {}", e);
                } else {
                    warn!(drone_id, "Update failed: {}", e);
                    self.cache.invalidate(drone_id).await;
                }
                if !matches!(e, DroneError::NotFound(_)) {
                    self.record_failed(OperationKind::Other, actor, Some(drone_id), payload, &e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn update_in(
        tx: &mut dyn StoreTx,
        drone_id: i64,
        patch: &DronePatch,
        linked: bool,
        actor: &Actor,
        payload: Value,
        at: chrono::DateTime<Utc>,
    ) -> Result<Drone> {
        let mut drone = tx
            .drone(drone_id)
            .await?
            .ok_or(DroneError::NotFound(drone_id))?;

        if let Some(status) = patch.status {
            // A registered link owns the live statuses
            if linked && !status.is_live() {
                return Err(DroneError::Validation(format!(
                    "drone {} has a live link; disconnect before setting status {}",
                    drone_id, status
                )));
            }
            drone.transition(status, at)?;
        }
        drone.apply_patch(patch, at);
        tx.put_drone(&drone).await?;
        tx.insert_operation(
            NewOperation::new(OperationKind::Other, actor)
                .for_drone(drone_id)
                .with_payload(payload)
                .succeeded(),
            at,
        )
        .await?;
        Ok(drone)
    }

    /// Start connecting; the outcome shows up in the drone status
    pub async fn connect(&self, drone_id: i64, request: ConnectRequest, actor: &Actor) -> Result<ConnectAttempt> {
        let payload = json!({
            "bridge_url": request.bridge_url,
            "simulated": request.simulated,
        });
        match self.orchestrator.connect(drone_id, request, actor).await {
            Ok(attempt) => Ok(attempt),
            // Link creation failures already closed the prepared audit entry
            Err(e @ DroneError::LinkFailure(_)) => Err(e),
            Err(e) => {
                let target = (!matches!(e, DroneError::NotFound(_))).then_some(drone_id);
                self.record_failed(OperationKind::Connect, actor, target, payload, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self, drone_id: i64, actor: &Actor) -> Result<Drone> {
        self.orchestrator
            .disconnect(drone_id, actor, reasons::MANUAL_DISCONNECT)
            .await
    }

    /// Current record, refreshed from the live link when there is one
    pub async fn refresh_state(&self, drone_id: i64) -> Result<Drone> {
        self.orchestrator.refresh(drone_id).await
    }

    /// The registered link of a drone
    pub async fn link_handle(&self, drone_id: i64) -> Result<RegisteredLink> {
        if let Some(entry) = self.orchestrator.link_handle(drone_id).await {
            return Ok(entry);
        }
        match self.store.drone(drone_id).await? {
            Some(_) => Err(DroneError::LinkUnavailable(drone_id)),
            None => Err(DroneError::NotFound(drone_id)),
        }
    }

    pub async fn publish(
        &self,
        drone_id: i64,
        topic: &str,
        msg_type: &str,
        message: Value,
        actor: &Actor,
    ) -> Result<Value> {
        let operation = NewOperation::new(OperationKind::Publish, actor)
            .for_drone(drone_id)
            .with_topic(topic)
            .with_payload(json!({ "type": msg_type, "message": message }));

        let topic = topic.to_string();
        let msg_type = msg_type.to_string();
        self.run_link_call(drone_id, operation, move |client| {
            client.publish(&topic, &msg_type, &message)?;
            Ok(json!({ "published": true }))
        })
        .await
    }

    pub async fn start_recording(&self, drone_id: i64, request: RecordingRequest, actor: &Actor) -> Result<Value> {
        let operation = NewOperation::new(OperationKind::RecordingStart, actor)
            .for_drone(drone_id)
            .with_payload(json!({ "name": request.name, "topics": request.topics }));
        self.run_link_call(drone_id, operation, move |client| client.start_recording(&request))
            .await
    }

    pub async fn stop_recording(&self, drone_id: i64, actor: &Actor) -> Result<Value> {
        let operation = NewOperation::new(OperationKind::RecordingStop, actor).for_drone(drone_id);
        self.run_link_call(drone_id, operation, |client| client.stop_recording())
            .await
    }

    /// Audited call on the live link, run off the request path
    async fn run_link_call<F>(&self, drone_id: i64, operation: NewOperation, call: F) -> Result<Value>
    where
        F: FnOnce(&dyn LinkClient) -> anyhow::Result<Value> + Send + 'static,
    {
        let kind = operation.kind;
        let entry = match self.link_handle(drone_id).await {
            Ok(entry) => entry,
            Err(e) => {
                if matches!(e, DroneError::NotFound(_)) {
                    return Err(e);
                }
                self.orchestrator
                    .record_failed(operation.failed(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let at = Utc::now();
        let audit = {
            let mut tx = self.store.begin().await?;
            match tx.insert_operation(operation.in_progress(), at).await {
                Ok(audit) => {
                    tx.commit().await?;
                    audit
                }
                Err(e) => {
                    tx.rollback().await;
                    return Err(e.into());
                }
            }
        };

        let client = entry.client.clone();
        let called = tokio::time::timeout(
            self.settings.command_timeout(),
            tokio::task::spawn_blocking(move || call(client.as_ref())),
        )
        .await;

        let outcome = match called {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(e))) => Err(DroneError::LinkFailure(format!("{:#}", e))),
            Ok(Err(e)) => Err(DroneError::LinkFailure(e.to_string())),
            Err(_) => Err(DroneError::LinkTimeout(self.settings.command_timeout_ms)),
        };

        let (status, response, error_message) = match &outcome {
            Ok(response) => (OperationStatus::Success, Some(response.clone()), None),
            Err(e) => (OperationStatus::Failed, None, Some(e.to_string())),
        };
        let finished: Result<()> = async {
            let mut tx = self.store.begin().await?;
            match tx
                .finish_operation(audit.id, status, response, error_message, Utc::now())
                .await
            {
                Ok(_) => Ok(tx.commit().await?),
                Err(e) => {
                    tx.rollback().await;
                    Err(e.into())
                }
            }
        }
        .await;

        if let Err(e) = finished {
            error!(drone_id, operation_id = audit.id, "Failed to finish {:?} audit entry: {}", kind, e);
            return Err(e);
        }
        match &outcome {
            Ok(_) => debug!(drone_id, "{:?} succeeded", kind),
            Err(e) => warn!(drone_id, "{:?} failed: {}", kind, e),
        }
        outcome
    }

    /// Best-effort camera read; `None` when the link has nothing
    pub async fn capture_image(&self, drone_id: i64) -> Result<Option<ImageFrame>> {
        self.media_read(drone_id, |client| match client.fetch_camera_image() {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Ok(client.latest_image()),
            Err(e) => {
                debug!("Camera fetch failed, using latest frame: {:#}", e);
                Ok(client.latest_image())
            }
        })
        .await
    }

    /// Best-effort point cloud read; `None` when the link has nothing
    pub async fn capture_point_cloud(&self, drone_id: i64) -> Result<Option<PointCloud>> {
        self.media_read(drone_id, |client| match client.fetch_point_cloud() {
            Ok(Some(cloud)) => Ok(Some(cloud)),
            Ok(None) => Ok(client.latest_point_cloud()),
            Err(e) => {
                debug!("Point cloud fetch failed, using latest: {:#}", e);
                Ok(client.latest_point_cloud())
            }
        })
        .await
    }

    async fn media_read<T, F>(&self, drone_id: i64, read: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LinkClient) -> anyhow::Result<Option<T>> + Send + 'static,
    {
        let client = self.link_handle(drone_id).await?.client;
        let read = tokio::time::timeout(
            self.settings.command_timeout(),
            tokio::task::spawn_blocking(move || read(client.as_ref())),
        )
        .await;

        match read {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(e))) => {
                debug!(drone_id, "Media read failed: {:#}", e);
                Ok(None)
            }
            Ok(Err(e)) => {
                warn!(drone_id, "Media worker failed: {}", e);
                Ok(None)
            }
            Err(_) => {
                warn!(drone_id, "Media read timed out");
                Ok(None)
            }
        }
    }

    pub async fn connection_history(&self, drone_id: i64) -> Result<Vec<ConnectionRecord>> {
        self.ensure_exists(drone_id).await?;
        Ok(self.store.connections(drone_id).await?)
    }

    pub async fn operation_history(&self, drone_id: i64) -> Result<Vec<OperationAudit>> {
        self.ensure_exists(drone_id).await?;
        Ok(self.store.operations(drone_id).await?)
    }

    async fn ensure_exists(&self, drone_id: i64) -> Result<()> {
        match self.store.drone(drone_id).await? {
            Some(_) => Ok(()),
            None => Err(DroneError::NotFound(drone_id)),
        }
    }

    pub async fn shutdown(&self) {
        info!("Drone service shutting down");
        self.orchestrator.shutdown().await;
    }

    async fn record_failed(
        &self,
        kind: OperationKind,
        actor: &Actor,
        drone_id: Option<i64>,
        payload: Value,
        error_message: &str,
    ) {
        let mut operation = NewOperation::new(kind, actor).with_payload(payload);
        if let Some(drone_id) = drone_id {
            operation = operation.for_drone(drone_id);
        }
        self.orchestrator
            .record_failed(operation.failed(error_message))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::DownCache;
    use crate::cache::MemoryCache;
    use crate::store::SqliteStore;
    use serde_json::json;
    use skyfleet_shared::{DroneStatus, LinkConfig};

    fn config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.link.live_timeout_ms = 300;
        config.link.poll_interval_ms = 10;
        config.link.command_timeout_ms = 300;
        config
    }

    async fn service_with(backend: Arc<dyn CacheBackend>) -> (DroneService, SqliteStore) {
        let store = SqliteStore::in_memory().await.unwrap();
        let service = DroneService::new(&config(), Arc::new(store.clone()), backend);
        (service, store)
    }

    async fn service() -> (DroneService, SqliteStore) {
        service_with(Arc::new(MemoryCache::new())).await
    }

    fn operator() -> Actor {
        Actor::user(7, "operator")
    }

    async fn connected(service: &DroneService, sim_config: Value) -> Drone {
        let drone = service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();
        service
            .connect(drone.id, ConnectRequest::simulated("sim://uav-01", sim_config), &operator())
            .await
            .unwrap();
        service.orchestrator().settle(drone.id).await;
        service.get_drone(drone.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (service, store) = service().await;
        let drone = service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();
        assert_eq!(drone.status, DroneStatus::Idle);
        assert_eq!(service.get_drone(drone.id).await.unwrap(), drone);

        let ops = store.operations(drone.id).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Other);
        assert_eq!(ops[0].payload.as_ref().unwrap()["action"], "create_drone");
        assert_eq!(ops[0].actor, operator());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_and_duplicate() {
        let (service, _store) = service().await;
        let err = service
            .create_drone(NewDrone::new("", "uav-01"), &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::Validation(_)));

        service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();
        let err = service
            .create_drone(NewDrone::new("Other", "uav-01"), &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::Persistence(_)));
        assert_eq!(service.list_drones(&DroneFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let (service, _store) = service().await;
        for i in 0..5 {
            service
                .create_drone(NewDrone::new(format!("Drone {}", i), format!("uav-{:02}", i)), &operator())
                .await
                .unwrap();
        }
        let first = service
            .update_drone(
                1,
                DronePatch {
                    status: Some(DroneStatus::Disconnected),
                    ..Default::default()
                },
                &operator(),
            )
            .await
            .unwrap();
        assert_eq!(first.status, DroneStatus::Disconnected);

        let all = service.list_drones(&DroneFilter::default()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].drone_id, "uav-04");

        let page = service
            .list_drones(&DroneFilter {
                offset: 1,
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].drone_id, "uav-03");

        let idle = service
            .list_drones(&DroneFilter::with_status(DroneStatus::Idle))
            .await
            .unwrap();
        assert_eq!(idle.len(), 4);
    }

    #[tokio::test]
    async fn test_update_invalidates_cached_record() {
        let (service, store) = service().await;
        let drone = service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();
        service.get_drone(drone.id).await.unwrap();

        let patch = DronePatch {
            name: Some("Renamed".into()),
            link: Some(LinkConfig {
                bridge_url: Some("udpin:0.0.0.0:14550".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        service.update_drone(drone.id, patch, &operator()).await.unwrap();

        let read = service.get_drone(drone.id).await.unwrap();
        assert_eq!(read.name, "Renamed");
        assert_eq!(read.link.bridge_url.as_deref(), Some("udpin:0.0.0.0:14550"));

        let ops = store.operations(drone.id).await.unwrap();
        assert_eq!(ops[1].payload.as_ref().unwrap()["action"], "update_drone");
    }

    #[tokio::test]
    async fn test_update_rejects_orchestrator_statuses() {
        let (service, store) = service().await;
        let drone = service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();

        let patch = DronePatch {
            status: Some(DroneStatus::Connected),
            ..Default::default()
        };
        let err = service.update_drone(drone.id, patch, &operator()).await.unwrap_err();
        assert!(matches!(err, DroneError::Validation(_)));

        let patch = DronePatch {
            status: Some(DroneStatus::Flying),
            ..Default::default()
        };
        let err = service.update_drone(drone.id, patch, &operator()).await.unwrap_err();
        assert!(matches!(err, DroneError::InvalidTransition(_)));

        // Both rejections are audited
        let ops = store.operations(drone.id).await.unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops[1..].iter().all(|o| o.status == OperationStatus::Failed));
        assert_eq!(service.get_drone(drone.id).await.unwrap().status, DroneStatus::Idle);
    }

    #[tokio::test]
    async fn test_update_unknown_drone() {
        let (service, _store) = service().await;
        let err = service
            .update_drone(9, DronePatch::default(), &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::NotFound(9)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_patch_while_linked() {
        let (service, _store) = service().await;
        let drone = connected(&service, json!({})).await;
        assert_eq!(drone.status, DroneStatus::Connected);

        let patch = DronePatch {
            status: Some(DroneStatus::Disconnected),
            ..Default::default()
        };
        let err = service.update_drone(drone.id, patch, &operator()).await.unwrap_err();
        assert!(matches!(err, DroneError::Validation(_)));

        let patch = DronePatch {
            status: Some(DroneStatus::Armed),
            ..Default::default()
        };
        let drone = service.update_drone(drone.id, patch, &operator()).await.unwrap();
        assert_eq!(drone.status, DroneStatus::Armed);
        assert!(drone.state.is_connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_rejection_is_audited() {
        let (service, store) = service().await;
        let drone = service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();

        let err = service
            .connect(drone.id, ConnectRequest::network(""), &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::Validation(_)));

        let ops = store.operations(drone.id).await.unwrap();
        let last = ops.last().unwrap();
        assert_eq!(last.kind, OperationKind::Connect);
        assert_eq!(last.status, OperationStatus::Failed);
        assert_eq!(store.open_connection_count(drone.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_connect_for_unknown_drone() {
        let (service, store) = service().await;

        let err = service
            .connect(999, ConnectRequest::network(""), &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::NotFound(999)));

        // The entry is kept but points at no drone
        let connects: Vec<(Option<i64>, String)> =
            sqlx::query_as("SELECT drone_id, status FROM operations WHERE kind = 'connect'")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(connects, vec![(None, "failed".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_requires_link() {
        let (service, store) = service().await;
        let drone = service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();

        let err = service
            .publish(drone.id, "arm", "", Value::Null, &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::LinkUnavailable(_)));
        let ops = store.operations(drone.id).await.unwrap();
        assert_eq!(ops.last().unwrap().kind, OperationKind::Publish);
        assert_eq!(ops.last().unwrap().status, OperationStatus::Failed);

        let err = service
            .publish(99, "arm", "", Value::Null, &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::NotFound(99)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_over_live_link() {
        let (service, store) = service().await;
        let drone = connected(&service, json!({})).await;

        service
            .publish(drone.id, "arm", "", Value::Null, &operator())
            .await
            .unwrap();
        let response = service
            .publish(drone.id, "/takeoff", "", json!({"altitude": 10.0}), &operator())
            .await
            .unwrap();
        assert_eq!(response, json!({"published": true}));

        let refreshed = service.refresh_state(drone.id).await.unwrap();
        assert!(refreshed.state.tookoff);
        assert_eq!(refreshed.state.altitude, Some(10.0));

        let err = service
            .publish(drone.id, "takeoff", "", json!({}), &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::LinkFailure(_)));

        let publishes: Vec<_> = store
            .operations(drone.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.kind == OperationKind::Publish)
            .collect();
        assert_eq!(publishes.len(), 3);
        assert_eq!(publishes[1].status, OperationStatus::Success);
        assert_eq!(publishes[1].topic.as_deref(), Some("/takeoff"));
        assert_eq!(publishes[2].status, OperationStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recording_round() {
        let (service, store) = service().await;
        let drone = connected(&service, json!({})).await;

        service
            .start_recording(drone.id, RecordingRequest::default(), &operator())
            .await
            .unwrap();
        service.stop_recording(drone.id, &operator()).await.unwrap();

        let kinds: Vec<_> = store
            .operations(drone.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.status == OperationStatus::Success)
            .map(|o| o.kind)
            .collect();
        assert!(kinds.contains(&OperationKind::RecordingStart));
        assert!(kinds.contains(&OperationKind::RecordingStop));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_media_reads() {
        let (service, _store) = service().await;
        let drone = service
            .create_drone(NewDrone::new("Scout", "uav-01"), &operator())
            .await
            .unwrap();
        assert!(matches!(
            service.capture_image(drone.id).await,
            Err(DroneError::LinkUnavailable(_))
        ));

        service
            .connect(
                drone.id,
                ConnectRequest::simulated("sim://uav-01", json!({"camera_width": 8, "camera_height": 4})),
                &operator(),
            )
            .await
            .unwrap();
        service.orchestrator().settle(drone.id).await;

        let frame = service.capture_image(drone.id).await.unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        assert!(service.capture_point_cloud(drone.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_works_with_cache_down() {
        let (service, _store) = service_with(Arc::new(DownCache)).await;
        let drone = connected(&service, json!({})).await;
        assert_eq!(drone.status, DroneStatus::Connected);

        let drone = service.disconnect(drone.id, &operator()).await.unwrap();
        assert_eq!(drone.status, DroneStatus::Disconnected);
        assert_eq!(service.get_drone(drone.id).await.unwrap().status, DroneStatus::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_history_queries() {
        let (service, _store) = service().await;
        let drone = connected(&service, json!({})).await;
        service.disconnect(drone.id, &operator()).await.unwrap();

        let connections = service.connection_history(drone.id).await.unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].disconnect_reason.as_deref(), Some(reasons::MANUAL_DISCONNECT));
        assert!(connections[0].duration_secs.is_some());

        let kinds: Vec<_> = service
            .operation_history(drone.id)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Other, OperationKind::Connect, OperationKind::Disconnect]
        );
        assert!(matches!(service.connection_history(5).await, Err(DroneError::NotFound(5))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown() {
        let (service, store) = service().await;
        let drone = connected(&service, json!({})).await;
        service.shutdown().await;

        let drone = store.drone(drone.id).await.unwrap().unwrap();
        assert_eq!(drone.status, DroneStatus::Disconnected);
        assert!(matches!(
            service.link_handle(drone.id).await,
            Err(DroneError::LinkUnavailable(_))
        ));
    }
}
