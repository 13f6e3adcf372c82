//! SQLite store
//!
//! Provides durable storage for drones, connection history and the operation
//! audit on top of `sqlx`. The schema lives in `migrations/` and is applied
//! on open. The record invariants are enforced by the schema itself:
//! - `drone_id` is UNIQUE
//! - a partial unique index allows one open connection record per drone
//! - connection records reference an existing drone

use super::{Store, StoreError, StoreResult, StoreTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use skyfleet_shared::{
    Actor, ConnectionRecord, Drone, DroneFilter, DroneStatus, LinkConfig, NewConnection, NewDrone,
    NewOperation, OperationAudit, OperationStatus, StateSnapshot,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::types::Json;
use sqlx::{Executor, Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info, warn};

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::Arc;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() || db.is_check_violation() => {
                StoreError::Constraint(db.message().to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("corrupt row: {}", e))
}

/// Text form of a serde-named enum (`in_progress`, `set_mode`, ...)
fn label<T: Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value).map_err(corrupt)? {
        Value::String(s) => Ok(s),
        other => Err(corrupt(format!("expected a string label, got {}", other))),
    }
}

fn parse_label<T: DeserializeOwned>(label: String) -> StoreResult<T> {
    serde_json::from_value(Value::String(label)).map_err(corrupt)
}

fn json_column(row: &SqliteRow, column: &str) -> StoreResult<Option<Value>> {
    Ok(row
        .try_get::<Option<Json<Value>>, _>(column)?
        .map(|value| value.0))
}

fn drone_from_row(row: &SqliteRow) -> StoreResult<Drone> {
    let status: String = row.try_get("status")?;
    Ok(Drone {
        id: row.try_get("id")?,
        drone_id: row.try_get("drone_id")?,
        name: row.try_get("name")?,
        device_id: row.try_get("device_id")?,
        status: DroneStatus::from_str(&status).map_err(corrupt)?,
        state: row.try_get::<Json<StateSnapshot>, _>("state")?.0,
        link: row.try_get::<Json<LinkConfig>, _>("link")?.0,
        metadata: json_column(row, "metadata")?,
        last_state_update: row.try_get("last_state_update")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn connection_from_row(row: &SqliteRow) -> StoreResult<ConnectionRecord> {
    Ok(ConnectionRecord {
        id: row.try_get("id")?,
        drone_id: row.try_get("drone_id")?,
        address: row.try_get("address")?,
        connected_at: row.try_get("connected_at")?,
        disconnected_at: row.try_get("disconnected_at")?,
        duration_secs: row.try_get("duration_secs")?,
        disconnect_reason: row.try_get("disconnect_reason")?,
    })
}

fn operation_from_row(row: &SqliteRow) -> StoreResult<OperationAudit> {
    Ok(OperationAudit {
        id: row.try_get("id")?,
        kind: parse_label(row.try_get("kind")?)?,
        status: parse_label(row.try_get("status")?)?,
        actor: Actor {
            user_id: row.try_get("actor_user_id")?,
            name: row.try_get("actor_name")?,
        },
        drone_id: row.try_get("drone_id")?,
        topic: row.try_get("topic")?,
        payload: json_column(row, "payload")?,
        response: json_column(row, "response")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_secs: row.try_get("duration_secs")?,
        metadata: json_column(row, "metadata")?,
    })
}

async fn fetch_drone<'e, E>(db: E, id: i64) -> StoreResult<Option<Drone>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT id, drone_id, name, device_id, status, state, link, metadata,
                last_state_update, created_at, updated_at
         FROM drones WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    row.as_ref().map(drone_from_row).transpose()
}

async fn fetch_connection<'e, E>(db: E, id: i64) -> StoreResult<Option<ConnectionRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT id, drone_id, address, connected_at, disconnected_at, duration_secs,
                disconnect_reason
         FROM connections WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    row.as_ref().map(connection_from_row).transpose()
}

async fn fetch_operation<'e, E>(db: E, id: i64) -> StoreResult<Option<OperationAudit>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT id, kind, status, actor_user_id, actor_name, drone_id, topic, payload,
                response, error_message, started_at, completed_at, duration_secs, metadata
         FROM operations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    row.as_ref().map(operation_from_row).transpose()
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    #[cfg(test)]
    failing_commits: Arc<AtomicUsize>,
}

impl SqliteStore {
    /// Open or create the database at `url` and apply pending migrations
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // One connection: SQLite admits a single writer, and an in-memory
        // database exists only as long as its connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))?;

        info!(url, "Store opened");
        Ok(Self {
            pool,
            #[cfg(test)]
            failing_commits: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Private database that disappears with the store
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Get the underlying pool (for ad-hoc queries)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Number of open connection records for a drone
    pub async fn open_connection_count(&self, drone_id: i64) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM connections WHERE drone_id = ? AND disconnected_at IS NULL",
        )
        .bind(drone_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    /// Make the next `n` commits fail as if the database went away
    #[cfg(test)]
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx {
            tx,
            #[cfg(test)]
            failing_commits: self.failing_commits.clone(),
        }))
    }

    async fn drone(&self, id: i64) -> StoreResult<Option<Drone>> {
        fetch_drone(&self.pool, id).await
    }

    async fn drones(&self, filter: &DroneFilter) -> StoreResult<Vec<Drone>> {
        let status = filter.status.map(|s| s.as_str());
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(filter.offset).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, drone_id, name, device_id, status, state, link, metadata,
                    last_state_update, created_at, updated_at
             FROM drones
             WHERE (? IS NULL OR status = ?)
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(drone_from_row).collect()
    }

    async fn connections(&self, drone_id: i64) -> StoreResult<Vec<ConnectionRecord>> {
        let rows = sqlx::query(
            "SELECT id, drone_id, address, connected_at, disconnected_at, duration_secs,
                    disconnect_reason
             FROM connections WHERE drone_id = ? ORDER BY id ASC",
        )
        .bind(drone_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn operations(&self, drone_id: i64) -> StoreResult<Vec<OperationAudit>> {
        let rows = sqlx::query(
            "SELECT id, kind, status, actor_user_id, actor_name, drone_id, topic, payload,
                    response, error_message, started_at, completed_at, duration_secs, metadata
             FROM operations WHERE drone_id = ? ORDER BY id ASC",
        )
        .bind(drone_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(operation_from_row).collect()
    }
}

/// A `BEGIN`..`COMMIT` block on the store's connection
///
/// Dropping it without committing rolls back.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
    #[cfg(test)]
    failing_commits: Arc<AtomicUsize>,
}

impl SqliteTx {
    async fn write_close(&mut self, record: &ConnectionRecord) -> StoreResult<()> {
        sqlx::query(
            "UPDATE connections SET disconnected_at = ?, duration_secs = ?, disconnect_reason = ?
             WHERE id = ?",
        )
        .bind(record.disconnected_at)
        .bind(record.duration_secs)
        .bind(&record.disconnect_reason)
        .bind(record.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn drone(&mut self, id: i64) -> StoreResult<Option<Drone>> {
        fetch_drone(&mut *self.tx, id).await
    }

    async fn insert_drone(&mut self, new: NewDrone, at: DateTime<Utc>) -> StoreResult<Drone> {
        let mut drone = Drone {
            id: 0,
            drone_id: new.drone_id,
            name: new.name,
            device_id: new.device_id,
            status: DroneStatus::Idle,
            state: StateSnapshot::default(),
            link: new.link,
            metadata: new.metadata,
            last_state_update: None,
            created_at: at,
            updated_at: at,
        };
        let result = sqlx::query(
            "INSERT INTO drones (drone_id, name, device_id, status, state, link, metadata,
                                 last_state_update, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&drone.drone_id)
        .bind(&drone.name)
        .bind(drone.device_id)
        .bind(drone.status.as_str())
        .bind(Json(&drone.state))
        .bind(Json(&drone.link))
        .bind(drone.metadata.as_ref().map(Json))
        .bind(drone.last_state_update)
        .bind(drone.created_at)
        .bind(drone.updated_at)
        .execute(&mut *self.tx)
        .await?;
        drone.id = result.last_insert_rowid();
        Ok(drone)
    }

    async fn put_drone(&mut self, drone: &Drone) -> StoreResult<()> {
        let existing = fetch_drone(&mut *self.tx, drone.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("drone {}", drone.id)))?;
        if existing.drone_id != drone.drone_id {
            return Err(StoreError::Constraint(format!(
                "drone_id of drone {} is immutable",
                drone.id
            )));
        }

        sqlx::query(
            "UPDATE drones SET name = ?, device_id = ?, status = ?, state = ?, link = ?,
                               metadata = ?, last_state_update = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&drone.name)
        .bind(drone.device_id)
        .bind(drone.status.as_str())
        .bind(Json(&drone.state))
        .bind(Json(&drone.link))
        .bind(drone.metadata.as_ref().map(Json))
        .bind(drone.last_state_update)
        .bind(drone.updated_at)
        .bind(drone.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_connection(&mut self, new: NewConnection) -> StoreResult<ConnectionRecord> {
        let result = sqlx::query(
            "INSERT INTO connections (drone_id, address, connected_at) VALUES (?, ?, ?)",
        )
        .bind(new.drone_id)
        .bind(&new.address)
        .bind(new.connected_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Duplicate(_) => StoreError::Constraint(format!(
                "drone {} already has an open connection record",
                new.drone_id
            )),
            other => other,
        })?;

        Ok(ConnectionRecord {
            id: result.last_insert_rowid(),
            drone_id: new.drone_id,
            address: new.address,
            connected_at: new.connected_at,
            disconnected_at: None,
            duration_secs: None,
            disconnect_reason: None,
        })
    }

    async fn close_connection(
        &mut self,
        connection_id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<ConnectionRecord> {
        let mut record = fetch_connection(&mut *self.tx, connection_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("connection {}", connection_id)))?;
        if record.is_open() {
            record.close(reason, at);
            self.write_close(&record).await?;
        }
        Ok(record)
    }

    async fn close_open_connections(
        &mut self,
        drone_id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let rows = sqlx::query(
            "SELECT id, drone_id, address, connected_at, disconnected_at, duration_secs,
                    disconnect_reason
             FROM connections WHERE drone_id = ? AND disconnected_at IS NULL",
        )
        .bind(drone_id)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut closed = 0;
        for row in &rows {
            let mut record = connection_from_row(row)?;
            record.close(reason, at);
            debug!(drone_id, connection_id = record.id, reason, "Closing connection record");
            self.write_close(&record).await?;
            closed += 1;
        }
        Ok(closed)
    }

    async fn insert_operation(
        &mut self,
        new: NewOperation,
        at: DateTime<Utc>,
    ) -> StoreResult<OperationAudit> {
        let mut audit = new.into_audit(0, at);
        let result = sqlx::query(
            "INSERT INTO operations (kind, status, actor_user_id, actor_name, drone_id, topic,
                                     payload, response, error_message, started_at, completed_at,
                                     duration_secs, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(label(&audit.kind)?)
        .bind(label(&audit.status)?)
        .bind(audit.actor.user_id)
        .bind(&audit.actor.name)
        .bind(audit.drone_id)
        .bind(&audit.topic)
        .bind(audit.payload.as_ref().map(Json))
        .bind(audit.response.as_ref().map(Json))
        .bind(&audit.error_message)
        .bind(audit.started_at)
        .bind(audit.completed_at)
        .bind(audit.duration_secs)
        .bind(audit.metadata.as_ref().map(Json))
        .execute(&mut *self.tx)
        .await?;
        audit.id = result.last_insert_rowid();
        Ok(audit)
    }

    async fn finish_operation(
        &mut self,
        operation_id: i64,
        status: OperationStatus,
        response: Option<Value>,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<OperationAudit> {
        let mut audit = fetch_operation(&mut *self.tx, operation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("operation {}", operation_id)))?;
        audit
            .finish(status, response, error_message, at)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;

        sqlx::query(
            "UPDATE operations SET status = ?, response = ?, error_message = ?,
                                   completed_at = ?, duration_secs = ?
             WHERE id = ?",
        )
        .bind(label(&audit.status)?)
        .bind(audit.response.as_ref().map(Json))
        .bind(&audit.error_message)
        .bind(audit.completed_at)
        .bind(audit.duration_secs)
        .bind(audit.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(audit)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        #[cfg(test)]
        {
            let injected = self
                .failing_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                self.tx.rollback().await?;
                return Err(StoreError::Unavailable("injected commit failure".into()));
            }
        }
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        if let Err(e) = self.tx.rollback().await {
            warn!("Rollback failed: {}", e);
        }
    }
}
