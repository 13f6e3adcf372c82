//! Drone Status Machine
//!
//! Defines the closed set of drone statuses and the valid transitions between
//! them. Every status mutation goes through [`check_transition`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Connection and flight status of a drone record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    /// Never connected since creation
    #[default]
    Idle,
    /// A link attempt is in flight
    Connecting,
    /// Link is live
    Connected,
    /// Link is live and the vehicle reports armed
    Armed,
    /// Link is live and the vehicle is airborne
    Flying,
    /// Link is live and the vehicle is landing
    Landing,
    /// Link is live and the vehicle is on the ground after a flight
    Landed,
    /// Unrecoverable failure during a link attempt or session
    Error,
    /// Link closed (manually, by timeout, or by failure)
    Disconnected,
}

impl DroneStatus {
    pub const ALL: [DroneStatus; 9] = [
        DroneStatus::Idle,
        DroneStatus::Connecting,
        DroneStatus::Connected,
        DroneStatus::Armed,
        DroneStatus::Flying,
        DroneStatus::Landing,
        DroneStatus::Landed,
        DroneStatus::Error,
        DroneStatus::Disconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DroneStatus::Idle => "idle",
            DroneStatus::Connecting => "connecting",
            DroneStatus::Connected => "connected",
            DroneStatus::Armed => "armed",
            DroneStatus::Flying => "flying",
            DroneStatus::Landing => "landing",
            DroneStatus::Landed => "landed",
            DroneStatus::Error => "error",
            DroneStatus::Disconnected => "disconnected",
        }
    }

    /// Statuses that imply a registered live link
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            DroneStatus::Connected
                | DroneStatus::Armed
                | DroneStatus::Flying
                | DroneStatus::Landing
                | DroneStatus::Landed
        )
    }

    /// Resting statuses: no link and no attempt in flight
    pub fn is_resting(&self) -> bool {
        matches!(self, DroneStatus::Idle | DroneStatus::Disconnected)
    }

    /// Statuses only the connection orchestrator may assign
    pub fn is_orchestrator_owned(&self) -> bool {
        matches!(self, DroneStatus::Connecting | DroneStatus::Connected)
    }
}

impl fmt::Display for DroneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DroneStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DroneStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown drone status: {0}")]
pub struct UnknownStatus(pub String);

/// A rejected status change
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DroneStatus,
    pub to: DroneStatus,
}

/// Check if a transition from one status to another is valid
pub fn is_valid_transition(from: DroneStatus, to: DroneStatus) -> bool {
    use DroneStatus::*;

    match (from, to) {
        // Re-asserting the current status is always valid, except for a
        // second attempt stacked on an in-flight one
        (Connecting, Connecting) => false,
        (a, b) if a == b => true,

        // Starting an attempt from a status without a live link
        (Idle | Disconnected | Error, Connecting) => true,

        // Resolution of an attempt
        (Connecting, Connected | Disconnected | Error) => true,

        // Flight progression while the link is live
        (Connected, Armed) => true,
        (Armed, Connected | Flying) => true,
        (Flying, Landing) => true,
        (Landing, Landed | Flying) => true,
        (Landed, Armed | Connected | Flying) => true,

        // Link loss, manual disconnect or failure from any live status
        (Connected | Armed | Flying | Landing | Landed, Disconnected | Error) => true,

        // Disconnect is idempotent from resting and error statuses
        (Idle | Error, Disconnected) => true,

        _ => false,
    }
}

/// Validate a transition, returning the rejected pair on failure
pub fn check_transition(from: DroneStatus, to: DroneStatus) -> Result<(), InvalidTransition> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lifecycle() {
        use DroneStatus::*;
        assert!(is_valid_transition(Idle, Connecting));
        assert!(is_valid_transition(Connecting, Connected));
        assert!(is_valid_transition(Connected, Disconnected));
        assert!(is_valid_transition(Disconnected, Connecting));
        assert!(is_valid_transition(Connecting, Error));
        assert!(is_valid_transition(Connected, Error));
        assert!(is_valid_transition(Error, Connecting));
    }

    #[test]
    fn test_flight_progression() {
        use DroneStatus::*;
        assert!(is_valid_transition(Connected, Armed));
        assert!(is_valid_transition(Armed, Flying));
        assert!(is_valid_transition(Flying, Landing));
        assert!(is_valid_transition(Landing, Landed));
        assert!(is_valid_transition(Flying, Disconnected));
    }

    #[test]
    fn test_invalid_transitions() {
        use DroneStatus::*;
        // A link cannot appear without an attempt
        assert!(!is_valid_transition(Idle, Connected));
        assert!(!is_valid_transition(Disconnected, Connected));
        // No stacking attempts
        assert!(!is_valid_transition(Connecting, Connecting));
        // Flight statuses need a live link
        assert!(!is_valid_transition(Disconnected, Flying));
        assert!(!is_valid_transition(Idle, Armed));

        let err = check_transition(Idle, Flying).unwrap_err();
        assert_eq!(err.from, Idle);
        assert_eq!(err.to, Flying);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        use DroneStatus::*;
        assert!(is_valid_transition(Idle, Disconnected));
        assert!(is_valid_transition(Disconnected, Disconnected));
        assert!(is_valid_transition(Error, Disconnected));
    }

    #[test]
    fn test_status_names() {
        for status in DroneStatus::ALL {
            assert_eq!(status.as_str().parse::<DroneStatus>().unwrap(), status);
        }
        assert!("hovering".parse::<DroneStatus>().is_err());
        assert!(DroneStatus::Landed.is_live());
        assert!(!DroneStatus::Connecting.is_live());
        assert!(DroneStatus::Disconnected.is_resting());
    }
}
