//! Per-vehicle state learned from the inbound stream.
//!
//! The vehicle's system/component ids are latched from its first HEARTBEAT;
//! until then no request can be addressed and engines report `NoDevice`.
//! Arming state rides along on every heartbeat, mission-int support on
//! AUTOPILOT_VERSION.

use std::time::Instant;

use mavlink::common::{MavModeFlag, MavProtocolCapability, HEARTBEAT_DATA};
use mavlink::MavHeader;
use parking_lot::Mutex;

struct Inner {
    target_system_id: u8,
    target_component_id: u8,
    discovered: bool,
    armed: bool,
    connected: bool,
    last_heartbeat_at: Option<Instant>,
    supports_mission_int: bool,
    seen_systems: Vec<u8>,
}

/// Shared vehicle state, updated by the receive thread.
pub(crate) struct TargetState {
    inner: Mutex<Inner>,
}

impl TargetState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                target_system_id: 0,
                target_component_id: 0,
                discovered: false,
                armed: false,
                connected: false,
                last_heartbeat_at: None,
                // Assume support until AUTOPILOT_VERSION says otherwise.
                supports_mission_int: true,
                seen_systems: Vec::new(),
            }),
        }
    }

    /// Latch ids and liveness from a heartbeat. Returns the system id when
    /// this is the first heartbeat seen from it.
    pub fn observe_heartbeat(&self, header: &MavHeader, data: &HEARTBEAT_DATA) -> Option<u8> {
        let mut inner = self.inner.lock();
        inner.target_system_id = header.system_id;
        inner.target_component_id = header.component_id;
        inner.discovered = true;
        inner.connected = true;
        inner.armed = data.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
        inner.last_heartbeat_at = Some(Instant::now());

        if inner.seen_systems.contains(&header.system_id) {
            None
        } else {
            inner.seen_systems.push(header.system_id);
            Some(header.system_id)
        }
    }

    /// Latch mission-int support from the advertised capability bits.
    pub fn observe_capabilities(&self, capabilities: MavProtocolCapability) {
        let mut inner = self.inner.lock();
        inner.supports_mission_int =
            capabilities.contains(MavProtocolCapability::MAV_PROTOCOL_CAPABILITY_MISSION_INT);
    }

    /// Called when the heartbeat deadline elapses.
    pub fn mark_disconnected(&self) {
        self.inner.lock().connected = false;
    }

    /// `(system_id, component_id)` of the vehicle, once discovered.
    pub fn target_ids(&self) -> Option<(u8, u8)> {
        let inner = self.inner.lock();
        inner
            .discovered
            .then_some((inner.target_system_id, inner.target_component_id))
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().armed
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn supports_mission_int(&self) -> bool {
        self.inner.lock().supports_mission_int
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.inner.lock().last_heartbeat_at
    }

    /// Every system id a heartbeat has been seen from.
    pub fn seen_systems(&self) -> Vec<u8> {
        self.inner.lock().seen_systems.clone()
    }
}
