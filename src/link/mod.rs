//! Drone Link Clients
//!
//! A link is the handle to a live connection with a drone's control bridge.
//! Calls on a link may block on network I/O, so async callers run them on the
//! blocking pool. Two variants exist:
//! - `MavlinkLink`: MAVLink over UDP/TCP/serial
//! - `SimulatedLink`: in-process stand-in driven by a JSON payload

mod mavlink;
mod simulated;

pub use self::mavlink::MavlinkLink;
pub use simulated::{SimConfig, SimulatedLink};

use crate::config::LinkSettings;
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skyfleet_shared::{Drone, StateSnapshot};
use std::sync::Arc;

/// Vehicle status reported by a link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub connected: bool,
    pub armed: bool,
    pub mode: Option<String>,
    pub battery: f64,
    pub landed: bool,
    pub reached: bool,
    pub returned: bool,
    pub tookoff: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Orientation in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    pub frame_id: String,
    pub points: Vec<[f32; 3]>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingRequest {
    /// Recording name; the link picks one when unset
    pub name: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Capability every drone link provides
///
/// `connect` may block until the bridge answers. A link is live once
/// `is_connected` reports true; the caller bounds that wait.
pub trait LinkClient: Send + Sync {
    /// Short variant name for logs
    fn kind(&self) -> &'static str;

    /// Address this link talks to
    fn address(&self) -> &str;

    fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Close the link and release its resources; safe to call repeatedly
    fn terminate(&self) -> Result<()>;

    fn status(&self) -> Result<LinkStatus>;

    fn position(&self) -> Result<Option<Position>>;

    fn orientation(&self) -> Result<Option<Orientation>>;

    fn publish(&self, topic: &str, msg_type: &str, message: &Value) -> Result<()>;

    fn latest_image(&self) -> Option<ImageFrame> {
        None
    }

    fn fetch_camera_image(&self) -> Result<Option<ImageFrame>> {
        Ok(self.latest_image())
    }

    fn latest_point_cloud(&self) -> Option<PointCloud> {
        None
    }

    fn fetch_point_cloud(&self) -> Result<Option<PointCloud>> {
        Ok(self.latest_point_cloud())
    }

    fn start_recording(&self, _request: &RecordingRequest) -> Result<Value> {
        bail!("{} link does not support recording", self.kind())
    }

    fn stop_recording(&self) -> Result<Value> {
        bail!("{} link does not support recording", self.kind())
    }

    /// Combined snapshot of status, position and orientation
    fn snapshot(&self) -> Result<StateSnapshot> {
        let status = self.status()?;
        let position = self.position()?;
        let orientation = self.orientation()?;
        Ok(StateSnapshot {
            is_connected: status.connected,
            is_armed: status.armed,
            mode: status.mode,
            battery: status.battery,
            latitude: position.map(|p| p.latitude),
            longitude: position.map(|p| p.longitude),
            altitude: position.map(|p| p.altitude),
            roll: orientation.map(|o| o.roll),
            pitch: orientation.map(|o| o.pitch),
            yaw: orientation.map(|o| o.yaw),
            landed: status.landed,
            reached: status.reached,
            returned: status.returned,
            tookoff: status.tookoff,
        })
    }
}

/// Flight commands understood by both link variants
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Arm,
    Disarm,
    Takeoff { altitude: f64 },
    Land,
    ReturnToLaunch,
    SetMode { mode: String },
    Goto { latitude: f64, longitude: f64, altitude: f64 },
}

impl LinkCommand {
    /// Parse a command topic; `None` means the topic is not a flight command
    pub fn parse(topic: &str, message: &Value) -> Result<Option<Self>> {
        let number = |field: &str| -> Result<f64> {
            message
                .get(field)
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow!("{} requires numeric field '{}'", topic, field))
        };

        let command = match topic.trim_start_matches('/') {
            "arm" => LinkCommand::Arm,
            "disarm" => LinkCommand::Disarm,
            "takeoff" => LinkCommand::Takeoff {
                altitude: number("altitude")?,
            },
            "land" => LinkCommand::Land,
            "rtl" => LinkCommand::ReturnToLaunch,
            "set_mode" => {
                let mode = message
                    .get("mode")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("set_mode requires string field 'mode'"))?;
                LinkCommand::SetMode {
                    mode: mode.to_ascii_uppercase(),
                }
            }
            "goto" => LinkCommand::Goto {
                latitude: number("latitude")?,
                longitude: number("longitude")?,
                altitude: number("altitude")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(command))
    }
}

/// Builds the link for a drone's configuration
pub trait LinkFactory: Send + Sync + 'static {
    fn build(&self, drone: &Drone) -> Result<Arc<dyn LinkClient>>;
}

/// Simulated links for simulated drones, MAVLink otherwise
pub struct DefaultLinkFactory {
    settings: LinkSettings,
}

impl DefaultLinkFactory {
    pub fn new(settings: LinkSettings) -> Self {
        Self { settings }
    }
}

impl LinkFactory for DefaultLinkFactory {
    fn build(&self, drone: &Drone) -> Result<Arc<dyn LinkClient>> {
        let address = drone
            .link
            .bridge_url
            .clone()
            .unwrap_or_else(|| format!("sim://{}", drone.drone_id));

        if drone.link.simulated {
            let config = SimConfig::from_value(drone.link.sim_config.as_ref())?;
            return Ok(Arc::new(SimulatedLink::new(address, config)));
        }

        if drone.link.bridge_url.is_none() {
            bail!("drone {} has no bridge address", drone.drone_id);
        }
        Ok(Arc::new(MavlinkLink::new(&address, &self.settings)?))
    }
}
