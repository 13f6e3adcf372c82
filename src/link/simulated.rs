//! Simulated drone link driven by a JSON parameter payload

use super::{
    ImageFrame, LinkClient, LinkCommand, LinkStatus, Orientation, PointCloud, Position,
    RecordingRequest,
};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

/// Simulation parameters, read from the drone's `sim_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Time after `connect` before the link reports live
    pub connect_delay_ms: u64,
    /// Time `connect` itself blocks
    pub block_connect_ms: u64,
    pub never_live: bool,
    pub fail_connect: bool,
    pub fail_snapshot: bool,
    pub battery: f64,
    pub mode: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub camera_width: u32,
    pub camera_height: u32,
    pub point_count: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            connect_delay_ms: 0,
            block_connect_ms: 0,
            never_live: false,
            fail_connect: false,
            fail_snapshot: false,
            battery: 100.0,
            mode: "STABILIZE".into(),
            latitude: 47.397742,
            longitude: 8.545594,
            altitude: 0.0,
            camera_width: 64,
            camera_height: 48,
            point_count: 256,
        }
    }
}

impl SimConfig {
    pub fn from_value(value: Option<&Value>) -> Result<Self> {
        match value {
            Some(v) => serde_json::from_value(v.clone()).context("Invalid simulation config"),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug)]
struct SimState {
    connected_at: Option<Instant>,
    terminated: bool,
    armed: bool,
    mode: String,
    battery: f64,
    position: Position,
    orientation: Orientation,
    landed: bool,
    reached: bool,
    returned: bool,
    tookoff: bool,
    recording: Option<(String, DateTime<Utc>)>,
}

/// In-process drone link used for development and tests
pub struct SimulatedLink {
    address: String,
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimulatedLink {
    pub fn new(address: impl Into<String>, config: SimConfig) -> Self {
        let state = SimState {
            connected_at: None,
            terminated: false,
            armed: false,
            mode: config.mode.clone(),
            battery: config.battery,
            position: Position {
                latitude: config.latitude,
                longitude: config.longitude,
                altitude: config.altitude,
            },
            orientation: Orientation {
                roll: 0.0,
                pitch: 0.0,
                yaw: 0.0,
            },
            landed: config.altitude <= 0.0,
            reached: false,
            returned: false,
            tookoff: false,
            recording: None,
        };
        Self {
            address: address.into(),
            config,
            state: Mutex::new(state),
        }
    }

    /// Last non-command topic published on the link
    fn apply(&self, state: &mut SimState, command: LinkCommand) -> Result<()> {
        match command {
            LinkCommand::Arm => {
                if state.battery <= 0.0 {
                    bail!("battery depleted");
                }
                state.armed = true;
            }
            LinkCommand::Disarm => {
                if !state.landed {
                    bail!("cannot disarm while airborne");
                }
                state.armed = false;
            }
            LinkCommand::Takeoff { altitude } => {
                if !state.armed {
                    bail!("vehicle is not armed");
                }
                state.position.altitude = altitude;
                state.mode = "GUIDED".into();
                state.landed = false;
                state.tookoff = true;
                state.reached = false;
                state.returned = false;
            }
            LinkCommand::Land => {
                state.mode = "LAND".into();
                self.touch_down(state);
            }
            LinkCommand::ReturnToLaunch => {
                state.mode = "RTL".into();
                state.position.latitude = self.config.latitude;
                state.position.longitude = self.config.longitude;
                if state.tookoff {
                    state.returned = true;
                }
                self.touch_down(state);
            }
            LinkCommand::SetMode { mode } => state.mode = mode,
            LinkCommand::Goto {
                latitude,
                longitude,
                altitude,
            } => {
                if state.landed {
                    bail!("vehicle is on the ground");
                }
                state.position = Position {
                    latitude,
                    longitude,
                    altitude,
                };
                state.reached = true;
            }
        }
        Ok(())
    }

    fn touch_down(&self, state: &mut SimState) {
        state.position.altitude = 0.0;
        state.landed = true;
        state.armed = false;
    }

    fn is_live(&self, state: &SimState) -> bool {
        if state.terminated || self.config.never_live {
            return false;
        }
        state.connected_at.map_or(false, |t| {
            t.elapsed() >= Duration::from_millis(self.config.connect_delay_ms)
        })
    }

    fn ensure_live(&self, state: &SimState) -> Result<()> {
        if !self.is_live(state) {
            bail!("simulated link {} is not connected", self.address);
        }
        Ok(())
    }

    fn render_image(&self) -> ImageFrame {
        let (width, height) = (self.config.camera_width, self.config.camera_height);
        let data: Vec<u8> = (0..height)
            .flat_map(|y| (0..width).flat_map(move |x| [(x % 256) as u8, (y % 256) as u8, 128]))
            .collect();
        ImageFrame {
            width,
            height,
            encoding: "rgb8".into(),
            data: Bytes::from(data),
            captured_at: Utc::now(),
        }
    }

    fn render_point_cloud(&self) -> PointCloud {
        let n = self.config.point_count.max(1);
        let points = (0..n)
            .map(|i| {
                let angle = i as f32 / n as f32 * std::f32::consts::TAU;
                [angle.cos() * 5.0, angle.sin() * 5.0, (i % 8) as f32 * 0.25]
            })
            .collect();
        PointCloud {
            frame_id: "base_link".into(),
            points,
            captured_at: Utc::now(),
        }
    }
}

impl LinkClient for SimulatedLink {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self) -> Result<()> {
        if self.config.block_connect_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.block_connect_ms));
        }
        if self.config.fail_connect {
            bail!("simulated connect failure for {}", self.address);
        }

        let mut state = self.state.lock();
        if state.terminated {
            bail!("simulated link {} was terminated", self.address);
        }
        state.connected_at = Some(Instant::now());
        debug!(address = %self.address, "Simulated link connecting");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let state = self.state.lock();
        self.is_live(&state)
    }

    fn terminate(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.terminated = true;
        state.recording = None;
        Ok(())
    }

    fn status(&self) -> Result<LinkStatus> {
        if self.config.fail_snapshot {
            bail!("simulated telemetry failure");
        }
        let state = self.state.lock();
        Ok(LinkStatus {
            connected: self.is_live(&state),
            armed: state.armed,
            mode: Some(state.mode.clone()),
            battery: state.battery,
            landed: state.landed,
            reached: state.reached,
            returned: state.returned,
            tookoff: state.tookoff,
        })
    }

    fn position(&self) -> Result<Option<Position>> {
        if self.config.fail_snapshot {
            bail!("simulated telemetry failure");
        }
        Ok(Some(self.state.lock().position))
    }

    fn orientation(&self) -> Result<Option<Orientation>> {
        if self.config.fail_snapshot {
            bail!("simulated telemetry failure");
        }
        Ok(Some(self.state.lock().orientation))
    }

    fn publish(&self, topic: &str, msg_type: &str, message: &Value) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_live(&state)?;

        match LinkCommand::parse(topic, message)? {
            Some(command) => {
                debug!(address = %self.address, "Simulated command {:?}", command);
                self.apply(&mut state, command)
            }
            None => {
                debug!(address = %self.address, topic, msg_type, "Simulated publish");
                Ok(())
            }
        }
    }

    fn latest_image(&self) -> Option<ImageFrame> {
        let live = {
            let state = self.state.lock();
            self.is_live(&state)
        };
        live.then(|| self.render_image())
    }

    fn latest_point_cloud(&self) -> Option<PointCloud> {
        let live = {
            let state = self.state.lock();
            self.is_live(&state)
        };
        live.then(|| self.render_point_cloud())
    }

    fn start_recording(&self, request: &RecordingRequest) -> Result<Value> {
        let mut state = self.state.lock();
        self.ensure_live(&state)?;
        if let Some((name, _)) = &state.recording {
            bail!("recording {} already in progress", name);
        }

        let started_at = Utc::now();
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("rec-{}", started_at.format("%Y%m%d-%H%M%S")));
        state.recording = Some((name.clone(), started_at));
        Ok(json!({
            "recording": true,
            "name": name,
            "topics": request.topics,
            "started_at": started_at,
        }))
    }

    fn stop_recording(&self) -> Result<Value> {
        let mut state = self.state.lock();
        let (name, started_at) = state
            .recording
            .take()
            .ok_or_else(|| anyhow!("no recording in progress"))?;
        let duration = (Utc::now() - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        Ok(json!({
            "recording": false,
            "name": name,
            "duration_secs": duration,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_link(config: SimConfig) -> SimulatedLink {
        let link = SimulatedLink::new("sim://test", config);
        link.connect().unwrap();
        link
    }

    #[test]
    fn test_config_from_json() {
        let config = SimConfig::from_value(Some(&json!({
            "connect_delay_ms": 50,
            "battery": 42.0,
        })))
        .unwrap();
        assert_eq!(config.connect_delay_ms, 50);
        assert_eq!(config.battery, 42.0);
        assert_eq!(config.mode, "STABILIZE");

        assert!(SimConfig::from_value(Some(&json!({"battery": "full"}))).is_err());
        assert_eq!(SimConfig::from_value(None).unwrap(), SimConfig::default());
    }

    #[test]
    fn test_liveness() {
        let link = SimulatedLink::new("sim://a", SimConfig::default());
        assert!(!link.is_connected());
        link.connect().unwrap();
        assert!(link.is_connected());
        link.terminate().unwrap();
        assert!(!link.is_connected());
        assert!(link.connect().is_err());

        let never = live_link(SimConfig {
            never_live: true,
            ..Default::default()
        });
        assert!(!never.is_connected());

        let failing = SimulatedLink::new(
            "sim://b",
            SimConfig {
                fail_connect: true,
                ..Default::default()
            },
        );
        assert!(failing.connect().is_err());
    }

    #[test]
    fn test_connect_delay() {
        let link = live_link(SimConfig {
            connect_delay_ms: 30,
            ..Default::default()
        });
        assert!(!link.is_connected());
        std::thread::sleep(Duration::from_millis(40));
        assert!(link.is_connected());
    }

    #[test]
    fn test_flight_commands() {
        let link = live_link(SimConfig::default());

        assert!(link.publish("takeoff", "", &json!({"altitude": 10.0})).is_err());
        link.publish("arm", "std_msgs/Empty", &Value::Null).unwrap();
        link.publish("takeoff", "", &json!({"altitude": 10.0})).unwrap();

        let snapshot = link.snapshot().unwrap();
        assert!(snapshot.is_armed);
        assert!(snapshot.tookoff);
        assert!(!snapshot.landed);
        assert_eq!(snapshot.altitude, Some(10.0));
        assert_eq!(snapshot.mode.as_deref(), Some("GUIDED"));

        assert!(link.publish("disarm", "", &Value::Null).is_err());
        link.publish("goto", "", &json!({"latitude": 47.4, "longitude": 8.55, "altitude": 20.0}))
            .unwrap();
        link.publish("rtl", "", &Value::Null).unwrap();

        let snapshot = link.snapshot().unwrap();
        assert!(snapshot.reached);
        assert!(snapshot.returned);
        assert!(snapshot.landed);
        assert!(!snapshot.is_armed);
        assert_eq!(snapshot.latitude, Some(47.397742));
    }

    #[test]
    fn test_publish_requires_live_link() {
        let link = SimulatedLink::new("sim://c", SimConfig::default());
        assert!(link.publish("arm", "", &Value::Null).is_err());
        link.connect().unwrap();
        link.publish("/camera/trigger", "std_msgs/Bool", &json!({"data": true}))
            .unwrap();
        link.terminate().unwrap();
        assert!(link.publish("/camera/trigger", "", &Value::Null).is_err());
    }

    #[test]
    fn test_depleted_battery_refuses_arm() {
        let link = live_link(SimConfig {
            battery: 0.0,
            ..Default::default()
        });
        assert!(link.publish("arm", "", &Value::Null).is_err());
        assert!(!link.status().unwrap().armed);
    }

    #[test]
    fn test_snapshot_failure() {
        let link = live_link(SimConfig {
            fail_snapshot: true,
            ..Default::default()
        });
        assert!(link.is_connected());
        assert!(link.snapshot().is_err());
    }

    #[test]
    fn test_media() {
        let link = SimulatedLink::new(
            "sim://d",
            SimConfig {
                camera_width: 4,
                camera_height: 2,
                point_count: 10,
                ..Default::default()
            },
        );
        assert!(link.latest_image().is_none());
        link.connect().unwrap();

        let image = link.fetch_camera_image().unwrap().unwrap();
        assert_eq!(image.data.len(), 4 * 2 * 3);
        assert_eq!(image.encoding, "rgb8");
        assert_eq!(link.fetch_point_cloud().unwrap().unwrap().points.len(), 10);
    }

    #[test]
    fn test_recording() {
        let link = live_link(SimConfig::default());
        assert!(link.stop_recording().is_err());

        let started = link
            .start_recording(&RecordingRequest {
                name: Some("survey".into()),
                topics: vec!["/camera".into()],
            })
            .unwrap();
        assert_eq!(started["name"], "survey");
        assert!(link.start_recording(&RecordingRequest::default()).is_err());

        let stopped = link.stop_recording().unwrap();
        assert_eq!(stopped["recording"], false);
    }
}
