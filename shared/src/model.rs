//! Drone, connection history and operation audit records

use crate::defaults;
use crate::status::{check_transition, DroneStatus, InvalidTransition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Rejected user input
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(ValidationError(format!(
            "{} must be between {} and {} characters (got {})",
            field, min, max, len
        )));
    }
    Ok(())
}

/// Latest vehicle state observed on a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub is_connected: bool,
    pub is_armed: bool,
    pub mode: Option<String>,
    /// Remaining battery in percent
    pub battery: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Altitude in meters
    pub altitude: Option<f64>,
    /// Orientation in degrees
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub landed: bool,
    pub reached: bool,
    pub returned: bool,
    pub tookoff: bool,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            is_connected: false,
            is_armed: false,
            mode: None,
            battery: 100.0,
            latitude: None,
            longitude: None,
            altitude: None,
            roll: None,
            pitch: None,
            yaw: None,
            landed: true,
            reached: false,
            returned: false,
            tookoff: false,
        }
    }
}

/// How to reach a drone's bridge
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Bridge address (e.g. "udpin:0.0.0.0:14550")
    pub bridge_url: Option<String>,
    /// Use the simulated link instead of a network one
    #[serde(default)]
    pub simulated: bool,
    /// Parameters for the simulated link
    pub sim_config: Option<Value>,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(url) = &self.bridge_url {
            check_len("bridge_url", url, 1, defaults::MAX_URL_LEN)?;
        }
        if let Some(cfg) = &self.sim_config {
            if !cfg.is_object() {
                return Err(ValidationError("sim_config must be a JSON object".into()));
            }
        }
        Ok(())
    }
}

/// Persisted drone record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drone {
    pub id: i64,
    /// Unique identifier, immutable after creation
    pub drone_id: String,
    pub name: String,
    pub device_id: Option<i64>,
    pub status: DroneStatus,
    pub state: StateSnapshot,
    pub link: LinkConfig,
    pub metadata: Option<Value>,
    pub last_state_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Drone {
    /// Move to a new status through the transition table
    pub fn transition(&mut self, to: DroneStatus, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        check_transition(self.status, to)?;
        self.status = to;
        self.state.is_connected = to.is_live();
        self.updated_at = at;
        Ok(())
    }

    /// Overwrite the live snapshot fields
    pub fn apply_snapshot(&mut self, snapshot: StateSnapshot, at: DateTime<Utc>) {
        self.state = snapshot;
        self.last_state_update = Some(at);
        self.updated_at = at;
    }

    /// Apply the non-status fields of a patch
    pub fn apply_patch(&mut self, patch: &DronePatch, at: DateTime<Utc>) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(device_id) = patch.device_id {
            self.device_id = Some(device_id);
        }
        if let Some(link) = &patch.link {
            self.link = link.clone();
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = Some(metadata.clone());
        }
        self.updated_at = at;
    }
}

/// Drone creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDrone {
    pub name: String,
    pub drone_id: String,
    pub device_id: Option<i64>,
    #[serde(default)]
    pub link: LinkConfig,
    pub metadata: Option<Value>,
}

impl NewDrone {
    pub fn new(name: impl Into<String>, drone_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            drone_id: drone_id.into(),
            ..Default::default()
        }
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_len("name", &self.name, 1, defaults::MAX_NAME_LEN)?;
        check_len("drone_id", &self.drone_id, 1, defaults::MAX_DRONE_ID_LEN)?;
        self.link.validate()
    }
}

/// Partial drone update; unset fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DronePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DroneStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DronePatch {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            check_len("name", name, 1, defaults::MAX_NAME_LEN)?;
        }
        if let Some(link) = &self.link {
            link.validate()?;
        }
        if let Some(status) = self.status {
            if status.is_orchestrator_owned() {
                return Err(ValidationError(format!(
                    "status {} can only be set by connect",
                    status
                )));
            }
        }
        Ok(())
    }

    /// The fields this patch sets, for the audit payload
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Listing filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneFilter {
    pub status: Option<DroneStatus>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for DroneFilter {
    fn default() -> Self {
        Self {
            status: None,
            offset: 0,
            limit: defaults::DEFAULT_LIST_LIMIT,
        }
    }
}

impl DroneFilter {
    pub fn with_status(status: DroneStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Connection request for a drone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub bridge_url: String,
    #[serde(default)]
    pub simulated: bool,
    pub sim_config: Option<Value>,
}

impl ConnectRequest {
    pub fn network(bridge_url: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into(),
            simulated: false,
            sim_config: None,
        }
    }

    pub fn simulated(bridge_url: impl Into<String>, sim_config: Value) -> Self {
        Self {
            bridge_url: bridge_url.into(),
            simulated: true,
            sim_config: Some(sim_config),
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            bridge_url: Some(self.bridge_url.clone()),
            simulated: self.simulated,
            sim_config: self.sim_config.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.link_config().validate()
    }
}

/// One row per connection attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: i64,
    pub drone_id: i64,
    pub address: String,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub disconnect_reason: Option<String>,
}

impl ConnectionRecord {
    pub fn is_open(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Close the record; closing an already closed record is a no-op
    pub fn close(&mut self, reason: &str, at: DateTime<Utc>) {
        if !self.is_open() {
            return;
        }
        self.disconnected_at = Some(at);
        self.duration_secs = Some(seconds_between(self.connected_at, at));
        self.disconnect_reason = Some(reason.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub drone_id: i64,
    pub address: String,
    pub connected_at: DateTime<Utc>,
}

/// Identity an operation is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<i64>,
    pub name: String,
}

impl Actor {
    pub fn user(user_id: i64, name: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            name: name.into(),
        }
    }

    /// The service itself (shutdown, link-loss handling)
    pub fn system() -> Self {
        Self {
            user_id: None,
            name: "system".into(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user_id {
            Some(id) => write!(f, "{}#{}", self.name, id),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Connect,
    Disconnect,
    Arm,
    Disarm,
    Takeoff,
    Land,
    SetMode,
    Publish,
    ServiceCall,
    Waypoint,
    ReturnToHome,
    EmergencyStop,
    RecordingStart,
    RecordingStop,
    AgentAction,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Success => "success",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("operation {id} already reached terminal status {status}")]
    AlreadyTerminal { id: i64, status: OperationStatus },

    #[error("{0} is not a terminal status")]
    NotTerminal(OperationStatus),
}

/// Append-only audit entry for a user-triggered action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationAudit {
    pub id: i64,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub actor: Actor,
    pub drone_id: Option<i64>,
    pub topic: Option<String>,
    pub payload: Option<Value>,
    pub response: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub metadata: Option<Value>,
}

impl OperationAudit {
    /// Move to a terminal status; an entry is finished at most once
    pub fn finish(
        &mut self,
        status: OperationStatus,
        response: Option<Value>,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        if self.status.is_terminal() {
            return Err(AuditError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        if !status.is_terminal() {
            return Err(AuditError::NotTerminal(status));
        }
        self.status = status;
        if response.is_some() {
            self.response = response;
        }
        if error_message.is_some() {
            self.error_message = error_message;
        }
        self.completed_at = Some(at);
        self.duration_secs = Some(seconds_between(self.started_at, at));
        Ok(())
    }
}

/// Audit entry about to be inserted
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub actor: Actor,
    pub drone_id: Option<i64>,
    pub topic: Option<String>,
    pub payload: Option<Value>,
    pub response: Option<Value>,
    pub error_message: Option<String>,
    pub metadata: Option<Value>,
}

impl NewOperation {
    pub fn new(kind: OperationKind, actor: &Actor) -> Self {
        Self {
            kind,
            status: OperationStatus::Pending,
            actor: actor.clone(),
            drone_id: None,
            topic: None,
            payload: None,
            response: None,
            error_message: None,
            metadata: None,
        }
    }

    pub fn for_drone(mut self, drone_id: i64) -> Self {
        self.drone_id = Some(drone_id);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn in_progress(mut self) -> Self {
        self.status = OperationStatus::InProgress;
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.status = OperationStatus::Success;
        self
    }

    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.status = OperationStatus::Failed;
        self.error_message = Some(error_message.into());
        self
    }

    /// Materialize the entry with a store-assigned id
    pub fn into_audit(self, id: i64, at: DateTime<Utc>) -> OperationAudit {
        let terminal = self.status.is_terminal();
        OperationAudit {
            id,
            kind: self.kind,
            status: self.status,
            actor: self.actor,
            drone_id: self.drone_id,
            topic: self.topic,
            payload: self.payload,
            response: self.response,
            error_message: self.error_message,
            started_at: at,
            completed_at: terminal.then_some(at),
            duration_secs: terminal.then_some(0.0),
            metadata: self.metadata,
        }
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}
