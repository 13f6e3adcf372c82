//! Connection Orchestrator
//!
//! Drives the connect/disconnect lifecycle of drone links:
//! - prepares durable records before any link work starts
//! - runs the blocking link attempt on a bounded worker pool
//! - reconciles the outcome into the store, the registry and the cache
//!
//! All lifecycle work for one drone runs under that drone's sequencing lock.
//! A connect attempt keeps the lock until its outcome is reconciled.

use crate::cache::StateCache;
use crate::config::LinkSettings;
use crate::error::{DroneError, Result};
use crate::link::{LinkClient, LinkFactory};
use crate::registry::{teardown, ClientRegistry, RegisteredLink};
use crate::store::{Store, StoreResult, StoreTx};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use skyfleet_shared::{
    reasons, Actor, ConnectRequest, Drone, DroneStatus, NewConnection, NewOperation,
    OperationKind, OperationStatus, StateSnapshot,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle returned once an attempt has been scheduled
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    /// Drone as persisted at the start of the attempt (status `connecting`)
    pub drone: Drone,
    pub connection_id: i64,
    pub operation_id: i64,
}

/// An attempt still waiting for its link to go live
#[derive(Clone)]
struct InFlight {
    cancel: CancellationToken,
    client: Arc<dyn LinkClient>,
}

/// Durable records opened for one attempt
#[derive(Debug, Clone, Copy)]
struct AttemptRecords {
    drone_id: i64,
    connection_id: i64,
    operation_id: i64,
}

impl ConnectAttempt {
    fn records(&self) -> AttemptRecords {
        AttemptRecords {
            drone_id: self.drone.id,
            connection_id: self.connection_id,
            operation_id: self.operation_id,
        }
    }
}

struct AttemptContext {
    drone_id: i64,
    connection_id: i64,
    operation_id: i64,
    address: String,
    client: Arc<dyn LinkClient>,
    cancel: CancellationToken,
}

/// What the worker saw
#[derive(Debug)]
enum WorkerReport {
    Live(Option<StateSnapshot>),
    Cancelled,
    TimedOut,
    Failed(String),
}

/// How an attempt ended
#[derive(Debug)]
enum Outcome {
    Live(Option<StateSnapshot>),
    Cancelled,
    TimedOut,
    Failed(String),
    /// The worker went away without reporting
    WorkerDied,
}

/// Terminal records for a failed attempt
struct Failure {
    status: DroneStatus,
    reason: String,
    operation_status: OperationStatus,
    error: String,
}

impl Outcome {
    fn into_failure(self, live_timeout_ms: u64) -> Option<Failure> {
        let failure = match self {
            Outcome::Live(_) => return None,
            Outcome::Cancelled => Failure {
                status: DroneStatus::Disconnected,
                reason: reasons::CANCELLED.into(),
                operation_status: OperationStatus::Cancelled,
                error: "connection attempt cancelled".into(),
            },
            Outcome::TimedOut => Failure {
                status: DroneStatus::Disconnected,
                reason: reasons::TIMEOUT.into(),
                operation_status: OperationStatus::Failed,
                error: DroneError::LinkTimeout(live_timeout_ms).to_string(),
            },
            Outcome::Failed(e) => Failure {
                status: DroneStatus::Disconnected,
                reason: format!("connection failed: {}", e),
                operation_status: OperationStatus::Failed,
                error: DroneError::LinkFailure(e).to_string(),
            },
            Outcome::WorkerDied => Failure {
                status: DroneStatus::Error,
                reason: reasons::WORKER_DIED.into(),
                operation_status: OperationStatus::Failed,
                error: reasons::WORKER_DIED.into(),
            },
        };
        Some(failure)
    }
}

/// Blocking half of an attempt: connect, then poll until live
fn wait_until_live(
    client: &dyn LinkClient,
    cancel: &CancellationToken,
    deadline: Instant,
    poll: Duration,
) -> WorkerReport {
    if cancel.is_cancelled() {
        return WorkerReport::Cancelled;
    }
    if let Err(e) = client.connect() {
        return WorkerReport::Failed(format!("{:#}", e));
    }

    loop {
        if cancel.is_cancelled() {
            // The attempt may have been torn down while connect was blocking
            let _ = client.terminate();
            return WorkerReport::Cancelled;
        }
        if client.is_connected() {
            return WorkerReport::Live(client.snapshot().ok());
        }
        let now = Instant::now();
        if now >= deadline {
            return WorkerReport::TimedOut;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

pub struct ConnectionOrchestrator {
    store: Arc<dyn Store>,
    cache: Arc<StateCache>,
    registry: Arc<ClientRegistry>,
    factory: Arc<dyn LinkFactory>,
    settings: LinkSettings,
    /// Bounds concurrent blocking link attempts
    workers: Arc<Semaphore>,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: Mutex<HashMap<i64, InFlight>>,
}

impl ConnectionOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<StateCache>,
        registry: Arc<ClientRegistry>,
        factory: Arc<dyn LinkFactory>,
        settings: LinkSettings,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.worker_threads.max(1)));
        Self {
            store,
            cache,
            registry,
            factory,
            settings,
            workers,
            locks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    fn lock_for(&self, drone_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(drone_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Take a drone's sequencing lock
    pub async fn lock_drone(&self, drone_id: i64) -> OwnedMutexGuard<()> {
        self.lock_for(drone_id).lock_owned().await
    }

    /// Wait until no lifecycle work is running for a drone
    pub async fn settle(&self, drone_id: i64) {
        drop(self.lock_drone(drone_id).await);
    }

    pub fn is_connecting(&self, drone_id: i64) -> bool {
        self.in_flight.lock().contains_key(&drone_id)
    }

    /// Current registered link of a drone
    pub async fn link_handle(&self, drone_id: i64) -> Option<RegisteredLink> {
        self.registry.lookup(drone_id).await
    }

    /// Last known record: cache first, then the store
    pub async fn load(&self, drone_id: i64) -> Result<Drone> {
        if let Some(drone) = self.cache.get(drone_id).await {
            return Ok(drone);
        }
        let ticket = self.cache.ticket(drone_id).await;
        let drone = self
            .store
            .drone(drone_id)
            .await?
            .ok_or(DroneError::NotFound(drone_id))?;
        self.cache.fill(ticket, &drone).await;
        Ok(drone)
    }

    async fn load_in(tx: &mut dyn StoreTx, drone_id: i64) -> Result<Drone> {
        tx.drone(drone_id)
            .await?
            .ok_or(DroneError::NotFound(drone_id))
    }

    /// Start a connection attempt and return once it is scheduled
    ///
    /// The outcome is reconciled in the background; callers observe it
    /// through the drone status and the operation history.
    pub async fn connect(
        self: &Arc<Self>,
        drone_id: i64,
        request: ConnectRequest,
        actor: &Actor,
    ) -> Result<ConnectAttempt> {
        if self.store.drone(drone_id).await?.is_none() {
            return Err(DroneError::NotFound(drone_id));
        }
        request.validate()?;
        if self.is_connecting(drone_id) {
            return Err(DroneError::AlreadyInProgress(drone_id));
        }

        let guard = self.lock_drone(drone_id).await;
        if self.is_connecting(drone_id) {
            return Err(DroneError::AlreadyInProgress(drone_id));
        }

        // Hide any previous link before touching records; it is closed once the
        // new attempt is durable and reinstated if preparation fails
        let previous = self.registry.remove(drone_id).await;

        let prepared = self.prepare(drone_id, &request, actor).await;
        let attempt = match prepared {
            Ok(attempt) => attempt,
            Err(e) => {
                if let Some(previous) = previous {
                    self.registry.register(drone_id, previous.client).await;
                }
                return Err(e);
            }
        };
        if let Some(previous) = previous {
            info!(drone_id, "Closing previous {} link", previous.client.kind());
            teardown(drone_id, &previous.client);
        }
        self.cache.write(&attempt.drone).await;

        info!(
            drone_id,
            connection_id = attempt.connection_id,
            address = %request.bridge_url,
            actor = %actor,
            "Connection attempt started"
        );

        let client = match self.factory.build(&attempt.drone) {
            Ok(client) => client,
            Err(e) => {
                let message = format!("{:#}", e);
                error!(drone_id, "Failed to create link: {}", message);
                let failure = Outcome::Failed(message.clone()).into_failure(self.settings.live_timeout_ms);
                if let Some(failure) = failure {
                    self.record_failure(&attempt.records(), &failure).await;
                }
                return Err(DroneError::LinkFailure(message));
            }
        };

        let cancel = CancellationToken::new();
        self.in_flight.lock().insert(
            drone_id,
            InFlight {
                cancel: cancel.clone(),
                client: client.clone(),
            },
        );

        let ctx = AttemptContext {
            drone_id,
            connection_id: attempt.connection_id,
            operation_id: attempt.operation_id,
            address: request.bridge_url.clone(),
            client,
            cancel,
        };
        let this = self.clone();
        tokio::spawn(async move { this.run_attempt(ctx, guard).await });

        Ok(attempt)
    }

    /// Durable preparation: close stale records, open the new ones
    async fn prepare(
        &self,
        drone_id: i64,
        request: &ConnectRequest,
        actor: &Actor,
    ) -> Result<ConnectAttempt> {
        let mut tx = self.store.begin().await?;
        match self
            .prepare_in(tx.as_mut(), drone_id, request, actor, Utc::now())
            .await
        {
            Ok(attempt) => {
                tx.commit().await?;
                Ok(attempt)
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn prepare_in(
        &self,
        tx: &mut dyn StoreTx,
        drone_id: i64,
        request: &ConnectRequest,
        actor: &Actor,
        at: DateTime<Utc>,
    ) -> Result<ConnectAttempt> {
        let mut drone = Self::load_in(tx, drone_id).await?;

        let closed = tx
            .close_open_connections(drone_id, reasons::SUPERSEDED, at)
            .await?;
        if closed > 0 {
            debug!(drone_id, closed, "Closed superseded connection records");
        }

        // A live or connecting status here is left over from a previous link
        if drone.status.is_live() || drone.status == DroneStatus::Connecting {
            drone.transition(DroneStatus::Disconnected, at)?;
        }
        drone.link = request.link_config();
        drone.transition(DroneStatus::Connecting, at)?;
        tx.put_drone(&drone).await?;

        let connection = tx
            .insert_connection(NewConnection {
                drone_id,
                address: request.bridge_url.clone(),
                connected_at: at,
            })
            .await?;
        let operation = tx
            .insert_operation(
                NewOperation::new(OperationKind::Connect, actor)
                    .for_drone(drone_id)
                    .with_payload(json!({
                        "bridge_url": request.bridge_url,
                        "simulated": request.simulated,
                    }))
                    .with_metadata(json!({ "connection_id": connection.id }))
                    .in_progress(),
                at,
            )
            .await?;

        Ok(ConnectAttempt {
            drone,
            connection_id: connection.id,
            operation_id: operation.id,
        })
    }

    async fn run_attempt(self: Arc<Self>, ctx: AttemptContext, guard: OwnedMutexGuard<()>) {
        let outcome = self.establish(&ctx).await;
        debug!(drone_id = ctx.drone_id, "Attempt finished: {:?}", outcome);

        // A disconnect may have cancelled after the link went live
        let outcome = match outcome {
            Outcome::Live(_) if ctx.cancel.is_cancelled() => Outcome::Cancelled,
            other => other,
        };

        let drone_id = ctx.drone_id;
        self.reconcile(ctx, outcome).await;
        self.in_flight.lock().remove(&drone_id);
        drop(guard);
    }

    /// Run the blocking attempt on the worker pool, bounded by the live timeout
    ///
    /// Cancellation ends the wait at once, whether the attempt is still queued
    /// for a worker or already running on one.
    async fn establish(&self, ctx: &AttemptContext) -> Outcome {
        let live_timeout = self.settings.live_timeout();
        let poll = self.settings.poll_interval();
        let deadline = Instant::now() + live_timeout;
        let workers = self.workers.clone();
        let client = ctx.client.clone();
        let cancel = ctx.cancel.clone();

        let attempt = async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                permit = workers.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Pool closed at shutdown
                    Err(_) => return Outcome::Cancelled,
                },
            };

            let (report_tx, report_rx) = oneshot::channel();
            let worker_cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let report = wait_until_live(client.as_ref(), &worker_cancel, deadline, poll);
                let _ = report_tx.send(report);
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                report = report_rx => match report {
                    Ok(WorkerReport::Live(snapshot)) => Outcome::Live(snapshot),
                    Ok(WorkerReport::Cancelled) => Outcome::Cancelled,
                    Ok(WorkerReport::TimedOut) => Outcome::TimedOut,
                    Ok(WorkerReport::Failed(e)) => Outcome::Failed(e),
                    Err(_) => Outcome::WorkerDied,
                },
            }
        };

        match tokio::time::timeout(live_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) if ctx.cancel.is_cancelled() => Outcome::Cancelled,
            Err(_) => {
                // The worker may still be inside a blocking connect; it sees the
                // flag once that returns
                warn!(
                    drone_id = ctx.drone_id,
                    address = %ctx.address,
                    "Link did not report live within {} ms",
                    self.settings.live_timeout_ms
                );
                ctx.cancel.cancel();
                Outcome::TimedOut
            }
        }
    }

    async fn reconcile(&self, ctx: AttemptContext, outcome: Outcome) {
        let failure = match outcome {
            Outcome::Live(snapshot) => match self.reconcile_success(&ctx, snapshot).await {
                Ok(drone) => {
                    info!(
                        drone_id = ctx.drone_id,
                        link = ctx.client.kind(),
                        "Drone connected"
                    );
                    self.cache.write(&drone).await;
                    return;
                }
                Err(e) => {
                    error!(drone_id = ctx.drone_id, "Failed to record connection: {}", e);
                    Failure {
                        status: DroneStatus::Disconnected,
                        reason: format!("connection failed: {}", e),
                        operation_status: OperationStatus::Failed,
                        error: e.to_string(),
                    }
                }
            },
            other => match other.into_failure(self.settings.live_timeout_ms) {
                Some(failure) => failure,
                None => return,
            },
        };
        self.reconcile_failure(&ctx, failure).await;
    }

    async fn reconcile_success(
        &self,
        ctx: &AttemptContext,
        snapshot: Option<StateSnapshot>,
    ) -> Result<Drone> {
        self.registry
            .register(ctx.drone_id, ctx.client.clone())
            .await;

        let at = Utc::now();
        let result: Result<Drone> = async {
            let mut tx = self.store.begin().await?;
            match Self::success_in(tx.as_mut(), ctx, snapshot, at).await {
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

        if result.is_err() {
            self.registry.remove_if(ctx.drone_id, &ctx.client).await;
        }
        result
    }

    async fn success_in(
        tx: &mut dyn StoreTx,
        ctx: &AttemptContext,
        snapshot: Option<StateSnapshot>,
        at: DateTime<Utc>,
    ) -> Result<Drone> {
        let mut drone = Self::load_in(tx, ctx.drone_id).await?;
        if let Some(snapshot) = snapshot {
            drone.apply_snapshot(snapshot, at);
        }
        drone.transition(DroneStatus::Connected, at)?;
        tx.put_drone(&drone).await?;
        tx.finish_operation(
            ctx.operation_id,
            OperationStatus::Success,
            Some(json!({
                "connection_id": ctx.connection_id,
                "address": ctx.address,
                "link": ctx.client.kind(),
            })),
            None,
            at,
        )
        .await?;
        Ok(drone)
    }

    /// Converge on the failure records; errors are logged, not returned
    async fn reconcile_failure(&self, ctx: &AttemptContext, failure: Failure) {
        self.registry.remove_if(ctx.drone_id, &ctx.client).await;
        teardown(ctx.drone_id, &ctx.client);
        let records = AttemptRecords {
            drone_id: ctx.drone_id,
            connection_id: ctx.connection_id,
            operation_id: ctx.operation_id,
        };
        self.record_failure(&records, &failure).await;
    }

    async fn record_failure(&self, records: &AttemptRecords, failure: &Failure) {
        let at = Utc::now();
        let result: Result<Drone> = async {
            let mut tx = self.store.begin().await?;
            match Self::failure_in(tx.as_mut(), records, failure, at).await {
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
                warn!(
                    drone_id = records.drone_id,
                    status = %drone.status,
                    reason = %failure.reason,
                    "Connection attempt failed"
                );
                self.cache.write(&drone).await;
            }
            Err(e) => {
                error!(
                    drone_id = records.drone_id,
                    operation_id = records.operation_id,
                    "Failed to record failed connection attempt: {}",
                    e
                );
                self.cache.invalidate(records.drone_id).await;
            }
        }
    }

    async fn failure_in(
        tx: &mut dyn StoreTx,
        records: &AttemptRecords,
        failure: &Failure,
        at: DateTime<Utc>,
    ) -> Result<Drone> {
        let mut drone = Self::load_in(tx, records.drone_id).await?;
        drone.transition(failure.status, at)?;
        tx.put_drone(&drone).await?;
        tx.close_connection(records.connection_id, &failure.reason, at)
            .await?;
        tx.finish_operation(
            records.operation_id,
            failure.operation_status,
            None,
            Some(failure.error.clone()),
            at,
        )
        .await?;
        Ok(drone)
    }

    /// Close a drone's link and records; safe to repeat
    ///
    /// An in-flight attempt is cancelled first and reconciled before the
    /// disconnect itself runs.
    pub async fn disconnect(&self, drone_id: i64, actor: &Actor, reason: &str) -> Result<Drone> {
        if self.store.drone(drone_id).await?.is_none() {
            return Err(DroneError::NotFound(drone_id));
        }

        let in_flight = self.in_flight.lock().get(&drone_id).cloned();
        if let Some(attempt) = in_flight {
            info!(drone_id, "Cancelling in-flight connection attempt");
            attempt.cancel.cancel();
            teardown(drone_id, &attempt.client);
        }

        let _guard = self.lock_drone(drone_id).await;

        if let Some(entry) = self.registry.remove(drone_id).await {
            teardown(drone_id, &entry.client);
        }

        let at = Utc::now();
        let result: Result<(Drone, usize)> = async {
            let mut tx = self.store.begin().await?;
            match Self::disconnect_in(tx.as_mut(), drone_id, actor, reason, at).await {
                Ok(done) => {
                    tx.commit().await?;
                    Ok(done)
                }
                Err(e) => {
                    tx.rollback().await;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok((drone, closed)) => {
                info!(drone_id, closed, reason, actor = %actor, "Drone disconnected");
                self.cache.write(&drone).await;
                Ok(drone)
            }
            Err(e) => {
                error!(drone_id, "Failed to record disconnect: {}", e);
                self.cache.invalidate(drone_id).await;
                self.record_failed(
                    NewOperation::new(OperationKind::Disconnect, actor)
                        .for_drone(drone_id)
                        .with_payload(json!({ "reason": reason }))
                        .failed(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn disconnect_in(
        tx: &mut dyn StoreTx,
        drone_id: i64,
        actor: &Actor,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(Drone, usize)> {
        let mut drone = Self::load_in(tx, drone_id).await?;
        let closed = tx.close_open_connections(drone_id, reason, at).await?;
        drone.transition(DroneStatus::Disconnected, at)?;
        tx.put_drone(&drone).await?;
        tx.insert_operation(
            NewOperation::new(OperationKind::Disconnect, actor)
                .for_drone(drone_id)
                .with_payload(json!({ "reason": reason }))
                .with_response(json!({ "closed_connections": closed }))
                .succeeded(),
            at,
        )
        .await?;
        Ok((drone, closed))
    }

    /// Append a failed audit entry on its own; a failure here is only logged
    pub async fn record_failed(&self, operation: NewOperation) {
        let kind = operation.kind;
        let result: StoreResult<()> = async {
            let mut tx = self.store.begin().await?;
            tx.insert_operation(operation, Utc::now()).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            error!("Failed to write {:?} audit entry: {}", kind, e);
        }
    }

    /// Pull a fresh snapshot from the live link and persist it
    ///
    /// Never fails because of the link: an unresponsive link serves the last
    /// known record, a link that reports itself down is handled as link loss.
    pub async fn refresh(&self, drone_id: i64) -> Result<Drone> {
        let Ok(_guard) = self.lock_for(drone_id).try_lock_owned() else {
            // Lifecycle work in progress; its result lands shortly
            return self.load(drone_id).await;
        };
        let Some(entry) = self.registry.lookup(drone_id).await else {
            return self.load(drone_id).await;
        };

        let client = entry.client.clone();
        let pulled = tokio::time::timeout(
            self.settings.command_timeout(),
            tokio::task::spawn_blocking(move || {
                if !client.is_connected() {
                    return Ok(None);
                }
                client.snapshot().map(Some)
            }),
        )
        .await;

        let snapshot = match pulled {
            Ok(Ok(Ok(Some(snapshot)))) => snapshot,
            Ok(Ok(Ok(None))) => return self.handle_link_loss(drone_id, entry).await,
            Ok(Ok(Err(e))) => {
                warn!(drone_id, "Snapshot pull failed: {:#}", e);
                return self.load(drone_id).await;
            }
            Ok(Err(e)) => {
                warn!(drone_id, "Snapshot worker failed: {}", e);
                return self.load(drone_id).await;
            }
            Err(_) => {
                warn!(drone_id, "Snapshot pull timed out");
                return self.load(drone_id).await;
            }
        };

        let at = Utc::now();
        let result: Result<Drone> = async {
            let mut tx = self.store.begin().await?;
            let mut drone = Self::load_in(tx.as_mut(), drone_id).await?;
            drone.apply_snapshot(snapshot, at);
            tx.put_drone(&drone).await?;
            tx.commit().await?;
            Ok(drone)
        }
        .await;

        match result {
            Ok(drone) => {
                self.cache.write(&drone).await;
                Ok(drone)
            }
            Err(DroneError::NotFound(id)) => Err(DroneError::NotFound(id)),
            Err(e) => {
                warn!(drone_id, "Failed to persist snapshot: {}", e);
                self.load(drone_id).await
            }
        }
    }

    /// A registered link reported itself down
    async fn handle_link_loss(&self, drone_id: i64, entry: RegisteredLink) -> Result<Drone> {
        warn!(drone_id, link = entry.client.kind(), "Link lost");
        self.registry.remove_if(drone_id, &entry.client).await;
        teardown(drone_id, &entry.client);

        let at = Utc::now();
        let actor = Actor::system();
        let result: Result<(Drone, usize)> = async {
            let mut tx = self.store.begin().await?;
            match Self::disconnect_in(tx.as_mut(), drone_id, &actor, reasons::LINK_LOST, at).await {
                Ok(done) => {
                    tx.commit().await?;
                    Ok(done)
                }
                Err(e) => {
                    tx.rollback().await;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok((drone, _)) => {
                self.cache.write(&drone).await;
                Ok(drone)
            }
            Err(e) => {
                error!(drone_id, "Failed to record link loss: {}", e);
                self.cache.invalidate(drone_id).await;
                self.load(drone_id).await
            }
        }
    }

    /// Cancel attempts and disconnect every linked drone
    pub async fn shutdown(&self) {
        self.workers.close();

        let in_flight: Vec<(i64, InFlight)> = self
            .in_flight
            .lock()
            .iter()
            .map(|(id, attempt)| (*id, attempt.clone()))
            .collect();
        for (drone_id, attempt) in &in_flight {
            attempt.cancel.cancel();
            teardown(*drone_id, &attempt.client);
        }

        let mut drone_ids: Vec<i64> = in_flight.iter().map(|(id, _)| *id).collect();
        for (drone_id, entry) in self.registry.drain().await {
            teardown(drone_id, &entry.client);
            drone_ids.push(drone_id);
        }
        drone_ids.sort_unstable();
        drone_ids.dedup();

        info!(count = drone_ids.len(), "Disconnecting drones for shutdown");
        let actor = Actor::system();
        let results = join_all(
            drone_ids
                .iter()
                .map(|id| self.disconnect(*id, &actor, reasons::SHUTDOWN)),
        )
        .await;
        for (drone_id, result) in drone_ids.iter().zip(results) {
            if let Err(e) = result {
                error!(drone_id, "Shutdown disconnect failed: {}", e);
            }
        }
    }
}
