//! MAVLink Link
//!
//! Talks to ArduPilot/PX4 flight controllers (or a MAVLink router in front of
//! them) over UDP, TCP or serial. A reader thread keeps the latest telemetry;
//! the link counts as live while heartbeats keep arriving.

use super::{LinkClient, LinkCommand, LinkStatus, Orientation, Position};
use crate::config::LinkSettings;
use ::mavlink::ardupilotmega::{
    MavAutopilot, MavCmd, MavFrame, MavLandedState, MavMessage, MavModeFlag, MavState, MavType,
    COMMAND_LONG_DATA, HEARTBEAT_DATA, MISSION_ITEM_INT_DATA,
};
use ::mavlink::error::MessageReadError;
use ::mavlink::{MavConnection, MavHeader};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type Connection = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

const ADDRESS_SCHEMES: [&str; 6] = ["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

/// Normalize a bridge address into a MAVLink connection string
///
/// Bare `host:port` listens for UDP, the flight-controller default.
pub fn normalize_address(address: &str) -> Result<String> {
    let address = address.trim();
    if address.is_empty() {
        bail!("empty MAVLink address");
    }
    if ADDRESS_SCHEMES.iter().any(|s| address.starts_with(s)) {
        return Ok(address.to_string());
    }
    if let Some(rest) = address.strip_prefix("udp://") {
        return Ok(format!("udpin:{}", rest));
    }
    if let Some(rest) = address.strip_prefix("tcp://") {
        return Ok(format!("tcpout:{}", rest));
    }
    if address.contains("://") {
        bail!("unsupported MAVLink address scheme: {}", address);
    }
    Ok(format!("udpin:{}", address))
}

/// Latest vehicle telemetry seen on the link
#[derive(Debug, Default)]
struct Telemetry {
    last_heartbeat: Option<Instant>,
    closed: bool,
    armed: bool,
    custom_mode: Option<u32>,
    battery: Option<f64>,
    position: Option<Position>,
    orientation: Option<Orientation>,
    landed_state: Option<MavLandedState>,
    reached: bool,
    returned: bool,
    tookoff: bool,
}

impl Telemetry {
    fn process(&mut self, msg: &MavMessage, now: Instant) {
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                // Other ground stations share the link
                if hb.mavtype == MavType::MAV_TYPE_GCS {
                    return;
                }
                self.last_heartbeat = Some(now);
                self.armed = (hb.base_mode.bits() & 0x80) != 0; // MAV_MODE_FLAG_SAFETY_ARMED
                self.custom_mode = Some(hb.custom_mode);
            }

            MavMessage::SYS_STATUS(sys) => {
                // -1 means the autopilot does not estimate it
                if sys.battery_remaining >= 0 {
                    self.battery = Some(sys.battery_remaining as f64);
                }
            }

            MavMessage::GLOBAL_POSITION_INT(pos) => {
                self.position = Some(Position {
                    latitude: pos.lat as f64 / 1e7,
                    longitude: pos.lon as f64 / 1e7,
                    altitude: pos.relative_alt as f64 / 1000.0, // mm to m
                });
            }

            MavMessage::ATTITUDE(att) => {
                self.orientation = Some(Orientation {
                    roll: (att.roll as f64).to_degrees(),
                    pitch: (att.pitch as f64).to_degrees(),
                    yaw: (att.yaw as f64).to_degrees(),
                });
            }

            MavMessage::EXTENDED_SYS_STATE(ext) => {
                match ext.landed_state {
                    MavLandedState::MAV_LANDED_STATE_TAKEOFF => {
                        self.tookoff = true;
                        self.reached = false;
                        self.returned = false;
                    }
                    MavLandedState::MAV_LANDED_STATE_IN_AIR => self.tookoff = true,
                    MavLandedState::MAV_LANDED_STATE_ON_GROUND => {
                        if self.tookoff && self.custom_mode == Some(MODE_RTL) {
                            self.returned = true;
                        }
                    }
                    _ => {}
                }
                self.landed_state = Some(ext.landed_state);
            }

            MavMessage::MISSION_ITEM_REACHED(_) => {
                self.reached = true;
            }

            _ => {}
        }
    }

    fn is_fresh(&self, now: Instant, timeout: Duration) -> bool {
        !self.closed
            && self
                .last_heartbeat
                .map_or(false, |t| now.saturating_duration_since(t) <= timeout)
    }

    fn landed(&self) -> bool {
        match self.landed_state {
            Some(MavLandedState::MAV_LANDED_STATE_ON_GROUND) => true,
            Some(MavLandedState::MAV_LANDED_STATE_UNDEFINED) | None => !self.armed,
            Some(_) => false,
        }
    }
}

/// MAVLink-backed drone link
pub struct MavlinkLink {
    address: String,
    system_id: u8,
    component_id: u8,
    target_system: u8,
    target_component: u8,
    heartbeat_timeout: Duration,
    connection: RwLock<Option<Connection>>,
    telemetry: Arc<RwLock<Telemetry>>,
    stop: Arc<AtomicBool>,
}

impl MavlinkLink {
    /// Create an unopened link; nothing touches the network until `connect`
    pub fn new(address: &str, settings: &LinkSettings) -> Result<Self> {
        Ok(Self {
            address: normalize_address(address)?,
            system_id: settings.system_id,
            component_id: settings.component_id,
            target_system: settings.target_system,
            target_component: settings.target_component,
            heartbeat_timeout: settings.heartbeat_timeout(),
            connection: RwLock::new(None),
            telemetry: Arc::new(RwLock::new(Telemetry::default())),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn make_header(&self) -> MavHeader {
        MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence: 0, // Set by the connection
        }
    }

    fn send(&self, msg: &MavMessage) -> Result<()> {
        let conn = self
            .connection
            .read()
            .clone()
            .ok_or_else(|| anyhow!("MAVLink connection to {} is not open", self.address))?;
        conn.send(&self.make_header(), msg)
            .map_err(|e| anyhow!("Failed to send to {}: {}", self.address, e))?;
        Ok(())
    }

    fn command_long(&self, command: MavCmd, params: [f32; 7]) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        })
    }

    fn set_mode_message(&self, mode: u32) -> MavMessage {
        // param1 = MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
        self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            [1.0, mode as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    /// Translate a flight command into the MAVLink message carrying it
    fn command_message(&self, command: &LinkCommand) -> Result<MavMessage> {
        let msg = match command {
            LinkCommand::Arm => self.command_long(
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ),
            LinkCommand::Disarm => self.command_long(
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ),
            // NAN keeps the current yaw and position
            LinkCommand::Takeoff { altitude } => self.command_long(
                MavCmd::MAV_CMD_NAV_TAKEOFF,
                [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, *altitude as f32],
            ),
            LinkCommand::Land => self.command_long(
                MavCmd::MAV_CMD_NAV_LAND,
                [0.0, 0.0, 0.0, f32::NAN, f32::NAN, f32::NAN, 0.0],
            ),
            LinkCommand::ReturnToLaunch => self.set_mode_message(MODE_RTL),
            LinkCommand::SetMode { mode } => {
                let mode = mode_number(mode)
                    .ok_or_else(|| anyhow!("unknown flight mode: {}", mode))?;
                self.set_mode_message(mode)
            }
            LinkCommand::Goto {
                latitude,
                longitude,
                altitude,
            } => MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
                target_system: self.target_system,
                target_component: self.target_component,
                seq: 0,
                frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
                command: MavCmd::MAV_CMD_NAV_WAYPOINT,
                current: 2, // Guided mode waypoint
                autocontinue: 0,
                param1: 0.0,
                param2: 0.0,
                param3: 0.0,
                param4: 0.0,
                x: (latitude * 1e7) as i32,
                y: (longitude * 1e7) as i32,
                z: *altitude as f32,
            }),
        };
        Ok(msg)
    }
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Reader thread body; exits when stopped or when the transport fails
///
/// A blocking `recv` only observes the stop flag after the next frame.
fn read_loop(
    conn: Connection,
    telemetry: Arc<RwLock<Telemetry>>,
    stop: Arc<AtomicBool>,
    address: String,
) {
    while !stop.load(Ordering::Acquire) {
        match conn.recv() {
            Ok((_header, msg)) => telemetry.write().process(&msg, Instant::now()),
            Err(MessageReadError::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(MessageReadError::Io(e)) => {
                warn!(address = %address, "MAVLink read error: {}", e);
                break;
            }
            Err(e) => {
                debug!(address = %address, "Skipping malformed frame: {}", e);
            }
        }
    }
    telemetry.write().closed = true;
    debug!(address = %address, "MAVLink reader exited");
}

impl LinkClient for MavlinkLink {
    fn kind(&self) -> &'static str {
        "mavlink"
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            bail!("link to {} was terminated", self.address);
        }

        info!(address = %self.address, "Opening MAVLink connection");
        let conn: Connection = Arc::from(
            ::mavlink::connect::<MavMessage>(&self.address)
                .with_context(|| format!("Failed to open {}", self.address))?,
        );

        // Announce ourselves so outbound peers start streaming
        if let Err(e) = conn.send(&self.make_header(), &gcs_heartbeat()) {
            warn!(address = %self.address, "Initial heartbeat failed: {}", e);
        }

        *self.connection.write() = Some(conn.clone());

        let telemetry = self.telemetry.clone();
        let stop = self.stop.clone();
        let address = self.address.clone();
        std::thread::Builder::new()
            .name("mavlink-reader".into())
            .spawn(move || read_loop(conn, telemetry, stop, address))
            .context("Failed to spawn MAVLink reader")?;

        Ok(())
    }

    fn is_connected(&self) -> bool {
        if self.stop.load(Ordering::Acquire) || self.connection.read().is_none() {
            return false;
        }
        self.telemetry
            .read()
            .is_fresh(Instant::now(), self.heartbeat_timeout)
    }

    fn terminate(&self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        if self.connection.write().take().is_some() {
            info!(address = %self.address, "MAVLink connection closed");
        }
        Ok(())
    }

    fn status(&self) -> Result<LinkStatus> {
        let connected = self.is_connected();
        let t = self.telemetry.read();
        Ok(LinkStatus {
            connected,
            armed: t.armed,
            mode: t.custom_mode.map(mode_to_string),
            battery: t.battery.unwrap_or(0.0),
            landed: t.landed(),
            reached: t.reached,
            returned: t.returned,
            tookoff: t.tookoff,
        })
    }

    fn position(&self) -> Result<Option<Position>> {
        Ok(self.telemetry.read().position)
    }

    fn orientation(&self) -> Result<Option<Orientation>> {
        Ok(self.telemetry.read().orientation)
    }

    fn publish(&self, topic: &str, msg_type: &str, message: &Value) -> Result<()> {
        let command = LinkCommand::parse(topic, message)?
            .ok_or_else(|| anyhow!("topic {} is not supported over MAVLink", topic))?;
        debug!(address = %self.address, topic, msg_type, "Sending {:?}", command);
        let msg = self.command_message(&command)?;
        self.send(&msg)
    }
}

impl Drop for MavlinkLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// ArduPilot Copter flight modes by `custom_mode` number
const COPTER_MODES: [(u32, &str); 19] = [
    (0, "STABILIZE"),
    (1, "ACRO"),
    (2, "ALT_HOLD"),
    (3, "AUTO"),
    (4, "GUIDED"),
    (5, "LOITER"),
    (6, "RTL"),
    (7, "CIRCLE"),
    (9, "LAND"),
    (11, "DRIFT"),
    (13, "SPORT"),
    (14, "FLIP"),
    (15, "AUTOTUNE"),
    (16, "POSHOLD"),
    (17, "BRAKE"),
    (18, "THROW"),
    (19, "AVOID_ADSB"),
    (20, "GUIDED_NOGPS"),
    (21, "SMART_RTL"),
];

const MODE_RTL: u32 = 6;

fn mode_number(name: &str) -> Option<u32> {
    COPTER_MODES
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name))
        .map(|(number, _)| *number)
}

/// Convert ArduPilot mode number to string
fn mode_to_string(mode: u32) -> String {
    COPTER_MODES
        .iter()
        .find(|(number, _)| *number == mode)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("UNKNOWN({})", mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::mavlink::ardupilotmega::{ATTITUDE_DATA, EXTENDED_SYS_STATE_DATA, GLOBAL_POSITION_INT_DATA, MavVtolState};

    fn heartbeat(armed: bool, custom_mode: u32, mavtype: MavType) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: if armed {
                MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
            } else {
                MavModeFlag::empty()
            },
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn landed_state(state: MavLandedState) -> MavMessage {
        MavMessage::EXTENDED_SYS_STATE(EXTENDED_SYS_STATE_DATA {
            vtol_state: MavVtolState::MAV_VTOL_STATE_UNDEFINED,
            landed_state: state,
        })
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("127.0.0.1:14550").unwrap(), "udpin:127.0.0.1:14550");
        assert_eq!(normalize_address("tcpout:10.0.0.2:5760").unwrap(), "tcpout:10.0.0.2:5760");
        assert_eq!(normalize_address("udp://0.0.0.0:14551").unwrap(), "udpin:0.0.0.0:14551");
        assert_eq!(normalize_address("serial:/dev/ttyACM0:57600").unwrap(), "serial:/dev/ttyACM0:57600");
        assert!(normalize_address("ws://bridge:9090").is_err());
        assert!(normalize_address("  ").is_err());
    }

    #[test]
    fn test_heartbeat_updates_liveness() {
        let mut t = Telemetry::default();
        let now = Instant::now();
        assert!(!t.is_fresh(now, Duration::from_secs(3)));

        t.process(&heartbeat(true, 4, MavType::MAV_TYPE_QUADROTOR), now);
        assert!(t.armed);
        assert_eq!(t.custom_mode.map(mode_to_string).as_deref(), Some("GUIDED"));
        assert!(t.is_fresh(now + Duration::from_secs(2), Duration::from_secs(3)));
        assert!(!t.is_fresh(now + Duration::from_secs(4), Duration::from_secs(3)));

        t.closed = true;
        assert!(!t.is_fresh(now, Duration::from_secs(3)));
    }

    #[test]
    fn test_gcs_heartbeats_are_ignored() {
        let mut t = Telemetry::default();
        t.process(&heartbeat(true, 6, MavType::MAV_TYPE_GCS), Instant::now());
        assert!(t.last_heartbeat.is_none());
        assert!(!t.armed);
    }

    #[test]
    fn test_position_and_attitude() {
        let mut t = Telemetry::default();
        let now = Instant::now();
        t.process(
            &MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
                time_boot_ms: 1000,
                lat: 473_977_420,
                lon: 85_455_940,
                alt: 488_000,
                relative_alt: 12_500,
                vx: 0,
                vy: 0,
                vz: 0,
                hdg: 9000,
            }),
            now,
        );
        t.process(
            &MavMessage::ATTITUDE(ATTITUDE_DATA {
                time_boot_ms: 1000,
                roll: 0.0,
                pitch: 0.0,
                yaw: std::f32::consts::FRAC_PI_2,
                rollspeed: 0.0,
                pitchspeed: 0.0,
                yawspeed: 0.0,
            }),
            now,
        );

        let pos = t.position.unwrap();
        assert!((pos.latitude - 47.397742).abs() < 1e-6);
        assert!((pos.altitude - 12.5).abs() < 1e-9);
        let att = t.orientation.unwrap();
        assert!((att.yaw - 90.0).abs() < 1e-3);
    }

    #[test]
    fn test_flight_phase_flags() {
        let mut t = Telemetry::default();
        let now = Instant::now();
        assert!(t.landed());

        t.process(&heartbeat(true, 4, MavType::MAV_TYPE_QUADROTOR), now);
        t.process(&landed_state(MavLandedState::MAV_LANDED_STATE_TAKEOFF), now);
        assert!(t.tookoff);
        assert!(!t.landed());

        t.process(&heartbeat(true, 6, MavType::MAV_TYPE_QUADROTOR), now);
        t.process(&landed_state(MavLandedState::MAV_LANDED_STATE_ON_GROUND), now);
        assert!(t.landed());
        assert!(t.returned);
    }

    #[test]
    fn test_command_messages() {
        let link = MavlinkLink::new("127.0.0.1:14550", &LinkSettings::default()).unwrap();

        match link.command_message(&LinkCommand::Takeoff { altitude: 15.0 }).unwrap() {
            MavMessage::COMMAND_LONG(cmd) => {
                assert_eq!(cmd.command, MavCmd::MAV_CMD_NAV_TAKEOFF);
                assert_eq!(cmd.param7, 15.0);
                assert_eq!(cmd.target_system, 1);
            }
            other => panic!("unexpected message {:?}", other),
        }

        match link
            .command_message(&LinkCommand::SetMode { mode: "loiter".into() })
            .unwrap()
        {
            MavMessage::COMMAND_LONG(cmd) => assert_eq!(cmd.param2, 5.0),
            other => panic!("unexpected message {:?}", other),
        }

        assert!(link
            .command_message(&LinkCommand::SetMode { mode: "WARP".into() })
            .is_err());
    }

    #[test]
    fn test_unopened_link() {
        let link = MavlinkLink::new("udpin:127.0.0.1:14550", &LinkSettings::default()).unwrap();
        assert!(!link.is_connected());
        assert!(link.publish("arm", "", &Value::Null).is_err());
        assert!(link.publish("/camera/trigger", "", &Value::Null).is_err());
        assert!(link.terminate().is_ok());
        assert!(link.connect().is_err());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(mode_to_string(0), "STABILIZE");
        assert_eq!(mode_to_string(6), "RTL");
        assert_eq!(mode_to_string(99), "UNKNOWN(99)");
        assert_eq!(mode_number("smart_rtl"), Some(21));
        assert_eq!(mode_number("WARP"), None);
    }
}
