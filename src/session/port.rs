//! Outbound capability handed to the engines.
//!
//! Engines never hold a reference back to the session. Everything they need
//! from it (sending a message, timer control, the learned ids) goes through
//! this narrow trait, which also makes the engines testable against a
//! recording fake.

use std::sync::Arc;
use std::time::Duration;

use mavlink::common::MavMessage;

use crate::codec::MavSender;
use crate::error::LinkError;
use crate::scheduler::{Scheduler, TimerCallback, TimerCookie};
use crate::session::state::TargetState;

pub(crate) trait EnginePort: Send + Sync {
    fn send_message(&self, message: &MavMessage) -> Result<(), LinkError>;
    fn register_timeout(&self, callback: TimerCallback, after: Duration) -> TimerCookie;
    fn refresh_timeout(&self, cookie: TimerCookie);
    fn unregister_timeout(&self, cookie: TimerCookie);
    fn own_ids(&self) -> (u8, u8);
    fn target_ids(&self) -> Option<(u8, u8)>;
    fn target_supports_mission_int(&self) -> bool;
}

/// The production port: serializer + scheduler + learned vehicle state.
pub(crate) struct SessionPort {
    pub sender: Arc<MavSender>,
    pub scheduler: Arc<Scheduler>,
    pub target: Arc<TargetState>,
    pub own_system_id: u8,
    pub own_component_id: u8,
}

impl EnginePort for SessionPort {
    fn send_message(&self, message: &MavMessage) -> Result<(), LinkError> {
        self.sender.send(message)
    }

    fn register_timeout(&self, callback: TimerCallback, after: Duration) -> TimerCookie {
        self.scheduler.register_timeout(callback, after)
    }

    fn refresh_timeout(&self, cookie: TimerCookie) {
        self.scheduler.refresh(cookie);
    }

    fn unregister_timeout(&self, cookie: TimerCookie) {
        self.scheduler.unregister(cookie);
    }

    fn own_ids(&self) -> (u8, u8) {
        (self.own_system_id, self.own_component_id)
    }

    fn target_ids(&self) -> Option<(u8, u8)> {
        self.target.target_ids()
    }

    fn target_supports_mission_int(&self) -> bool {
        self.target.supports_mission_int()
    }
}
