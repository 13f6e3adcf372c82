//! Durable records for drones, connection history and operation audits
//!
//! This module handles:
//! - The `Store` abstraction the service writes through
//! - Transactions with commit/rollback semantics (`StoreTx`)
//! - The SQLite implementation and its schema migrations

mod sqlite;

pub use sqlite::{SqliteStore, SqliteTx};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use skyfleet_shared::{
    ConnectionRecord, Drone, DroneFilter, NewConnection, NewDrone, NewOperation, OperationAudit,
    OperationStatus,
};
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Entry point to the persistent store
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Start a transaction; nothing it writes is visible until commit
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    async fn drone(&self, id: i64) -> StoreResult<Option<Drone>>;

    /// Drones matching the filter, newest first
    async fn drones(&self, filter: &DroneFilter) -> StoreResult<Vec<Drone>>;

    /// Connection history for a drone, oldest first
    async fn connections(&self, drone_id: i64) -> StoreResult<Vec<ConnectionRecord>>;

    /// Operation audit entries for a drone, oldest first
    async fn operations(&self, drone_id: i64) -> StoreResult<Vec<OperationAudit>>;
}

/// A unit of work against the store
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTx: Send {
    /// Read a drone as seen by this transaction
    async fn drone(&mut self, id: i64) -> StoreResult<Option<Drone>>;

    async fn insert_drone(&mut self, new: NewDrone, at: DateTime<Utc>) -> StoreResult<Drone>;

    /// Replace a drone row
    async fn put_drone(&mut self, drone: &Drone) -> StoreResult<()>;

    async fn insert_connection(&mut self, new: NewConnection) -> StoreResult<ConnectionRecord>;

    /// Close one connection record; closing a closed record is a no-op
    async fn close_connection(
        &mut self,
        connection_id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<ConnectionRecord>;

    /// Close every open connection record of a drone, returning how many were closed
    async fn close_open_connections(
        &mut self,
        drone_id: i64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<usize>;

    async fn insert_operation(
        &mut self,
        new: NewOperation,
        at: DateTime<Utc>,
    ) -> StoreResult<OperationAudit>;

    /// Move an operation to a terminal status
    async fn finish_operation(
        &mut self,
        operation_id: i64,
        status: OperationStatus,
        response: Option<Value>,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<OperationAudit>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>);
}
