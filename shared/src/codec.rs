//! Compact binary encoding of drone records for the state cache
//!
//! Records are stored as a protobuf `CachedDrone` message. JSON-valued fields
//! travel as strings and timestamps as milliseconds since the Unix epoch.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use thiserror::Error;

use crate::model::{Drone, LinkConfig, StateSnapshot};
use crate::status::DroneStatus;

/// Maximum encoded record size (1 MB); larger payloads are not cached
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Record too large: {0} bytes (max: {MAX_RECORD_SIZE})")]
    RecordTooLarge(usize),

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    EncodeError(#[from] prost::EncodeError),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Clone, PartialEq, Message)]
pub struct CachedState {
    #[prost(bool, tag = "1")]
    pub is_connected: bool,
    #[prost(bool, tag = "2")]
    pub is_armed: bool,
    #[prost(string, optional, tag = "3")]
    pub mode: Option<String>,
    #[prost(double, tag = "4")]
    pub battery: f64,
    #[prost(double, optional, tag = "5")]
    pub latitude: Option<f64>,
    #[prost(double, optional, tag = "6")]
    pub longitude: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub altitude: Option<f64>,
    #[prost(double, optional, tag = "8")]
    pub roll: Option<f64>,
    #[prost(double, optional, tag = "9")]
    pub pitch: Option<f64>,
    #[prost(double, optional, tag = "10")]
    pub yaw: Option<f64>,
    #[prost(bool, tag = "11")]
    pub landed: bool,
    #[prost(bool, tag = "12")]
    pub reached: bool,
    #[prost(bool, tag = "13")]
    pub returned: bool,
    #[prost(bool, tag = "14")]
    pub tookoff: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct CachedDrone {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub drone_id: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(int64, optional, tag = "4")]
    pub device_id: Option<i64>,
    #[prost(string, tag = "5")]
    pub status: String,
    #[prost(message, optional, tag = "6")]
    pub state: Option<CachedState>,
    #[prost(string, optional, tag = "7")]
    pub bridge_url: Option<String>,
    #[prost(bool, tag = "8")]
    pub simulated: bool,
    #[prost(string, optional, tag = "9")]
    pub sim_config_json: Option<String>,
    #[prost(string, optional, tag = "10")]
    pub metadata_json: Option<String>,
    #[prost(int64, optional, tag = "11")]
    pub last_state_update_ms: Option<i64>,
    #[prost(int64, tag = "12")]
    pub created_at_ms: i64,
    #[prost(int64, tag = "13")]
    pub updated_at_ms: i64,
}

impl From<&StateSnapshot> for CachedState {
    fn from(s: &StateSnapshot) -> Self {
        Self {
            is_connected: s.is_connected,
            is_armed: s.is_armed,
            mode: s.mode.clone(),
            battery: s.battery,
            latitude: s.latitude,
            longitude: s.longitude,
            altitude: s.altitude,
            roll: s.roll,
            pitch: s.pitch,
            yaw: s.yaw,
            landed: s.landed,
            reached: s.reached,
            returned: s.returned,
            tookoff: s.tookoff,
        }
    }
}

impl From<CachedState> for StateSnapshot {
    fn from(s: CachedState) -> Self {
        Self {
            is_connected: s.is_connected,
            is_armed: s.is_armed,
            mode: s.mode,
            battery: s.battery,
            latitude: s.latitude,
            longitude: s.longitude,
            altitude: s.altitude,
            roll: s.roll,
            pitch: s.pitch,
            yaw: s.yaw,
            landed: s.landed,
            reached: s.reached,
            returned: s.returned,
            tookoff: s.tookoff,
        }
    }
}

fn json_field(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<serde_json::Value>, CodecError> {
    value
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| CodecError::InvalidField {
                field,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn timestamp_field(field: &'static str, ms: i64) -> Result<DateTime<Utc>, CodecError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CodecError::InvalidField {
            field,
            reason: format!("timestamp out of range: {}", ms),
        })
}

/// Encode a drone record into a byte buffer
pub fn encode(drone: &Drone) -> Result<Bytes, CodecError> {
    let msg = CachedDrone {
        id: drone.id,
        drone_id: drone.drone_id.clone(),
        name: drone.name.clone(),
        device_id: drone.device_id,
        status: drone.status.as_str().to_string(),
        state: Some(CachedState::from(&drone.state)),
        bridge_url: drone.link.bridge_url.clone(),
        simulated: drone.link.simulated,
        sim_config_json: drone.link.sim_config.as_ref().map(|v| v.to_string()),
        metadata_json: drone.metadata.as_ref().map(|v| v.to_string()),
        last_state_update_ms: drone.last_state_update.map(|t| t.timestamp_millis()),
        created_at_ms: drone.created_at.timestamp_millis(),
        updated_at_ms: drone.updated_at.timestamp_millis(),
    };

    let len = msg.encoded_len();
    if len > MAX_RECORD_SIZE {
        return Err(CodecError::RecordTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(len);
    msg.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a drone record previously produced by [`encode`]
pub fn decode(buf: &[u8]) -> Result<Drone, CodecError> {
    let msg = CachedDrone::decode(buf)?;

    let status = msg
        .status
        .parse::<DroneStatus>()
        .map_err(|e| CodecError::InvalidField {
            field: "status",
            reason: e.to_string(),
        })?;

    Ok(Drone {
        id: msg.id,
        drone_id: msg.drone_id,
        name: msg.name,
        device_id: msg.device_id,
        status,
        state: msg.state.map(StateSnapshot::from).unwrap_or_default(),
        link: LinkConfig {
            bridge_url: msg.bridge_url,
            simulated: msg.simulated,
            sim_config: json_field("sim_config", msg.sim_config_json)?,
        },
        metadata: json_field("metadata", msg.metadata_json)?,
        last_state_update: msg
            .last_state_update_ms
            .map(|ms| timestamp_field("last_state_update", ms))
            .transpose()?,
        created_at: timestamp_field("created_at", msg.created_at_ms)?,
        updated_at: timestamp_field("updated_at", msg.updated_at_ms)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_drone() -> Drone {
        // Millisecond precision survives the round trip
        let now = Utc.timestamp_millis_opt(1_760_000_000_123).unwrap();
        Drone {
            id: 42,
            drone_id: "uav-042".into(),
            name: "Survey".into(),
            device_id: Some(3),
            status: DroneStatus::Connected,
            state: StateSnapshot {
                is_connected: true,
                mode: Some("GUIDED".into()),
                battery: 87.5,
                latitude: Some(47.397742),
                longitude: Some(8.545594),
                altitude: Some(488.0),
                landed: false,
                tookoff: true,
                ..Default::default()
            },
            link: LinkConfig {
                bridge_url: Some("sim://uav-042".into()),
                simulated: true,
                sim_config: Some(json!({"connect_delay_ms": 10})),
            },
            metadata: Some(json!({"team": "north"})),
            last_state_update: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_encode_decode_preserves_record() {
        let original = create_test_drone();
        let encoded = encode(&original).expect("encode failed");
        let decoded = decode(&encoded).expect("decode failed");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let msg = CachedDrone {
            status: "hovering".into(),
            ..Default::default()
        };
        let bytes = msg.encode_to_vec();
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::InvalidField { field: "status", .. })
        ));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
