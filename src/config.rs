//! Session configuration.
//!
//! Collects the retry/timeout/rate knobs that used to live as scattered
//! constants next to each engine. All fields have working defaults; embedders
//! typically start from [`SessionConfig::default`] and override a field or
//! two (tests shorten the command timeout, simulators move the UDP port).

use serde::{Deserialize, Serialize};

/// Tunables for one vehicle session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Retransmissions after the initial send of a command (total
    /// transmissions = retries + 1).
    pub command_default_retries: u8,
    /// Ack deadline per command transmission, in milliseconds.
    pub command_default_timeout_ms: u32,
    /// Inactivity deadline for a mission upload/download/set-current
    /// exchange, in seconds.
    pub mission_timeout_s: f32,
    /// Rate at which the follow-me target location is streamed to the
    /// vehicle.
    pub follow_target_rate_hz: f32,
    /// Local UDP port to bind. 0 binds an ephemeral port.
    pub local_udp_port: u16,
    /// MAVLink system id this SDK reports as.
    pub own_system_id: u8,
    /// MAVLink component id this SDK reports as.
    pub own_component_id: u8,
    /// Rate of our own GCS heartbeat, in seconds between beats.
    pub heartbeat_interval_s: f32,
    /// Vehicle is considered lost when no heartbeat arrives for this long.
    pub heartbeat_timeout_s: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_default_retries: 3,
            command_default_timeout_ms: 500,
            mission_timeout_s: 1.0,
            follow_target_rate_hz: 1.0,
            local_udp_port: 14540,
            own_system_id: 245,
            own_component_id: 190,
            heartbeat_interval_s: 1.0,
            heartbeat_timeout_s: 3.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SessionConfig::default();
        assert_eq!(config.command_default_retries, 3);
        assert_eq!(config.command_default_timeout_ms, 500);
        assert_eq!(config.mission_timeout_s, 1.0);
        assert_eq!(config.follow_target_rate_hz, 1.0);
        assert_eq!(config.local_udp_port, 14540);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"local_udp_port": 14550}"#).unwrap();
        assert_eq!(config.local_udp_port, 14550);
        assert_eq!(config.command_default_retries, 3);
        assert_eq!(config.own_system_id, 245);
    }
}
