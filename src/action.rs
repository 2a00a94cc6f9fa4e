//! Arm, disarm, takeoff, land and related one-shot vehicle commands,
//! including mission run control (start and pause the uploaded mission).
//!
//! Thin veneer over the session's command engine: every operation maps to
//! one `COMMAND_LONG` exchange and lifts its [`CommandResult`] unchanged.
//! Mission start/pause are not mission-protocol messages; they switch the
//! PX4 custom flight mode in and out of auto-mission.

use std::sync::Arc;

use mavlink::common::MavCmd;

use crate::error::CommandResult;
use crate::px4;
use crate::session::commands::CommandCallback;
use crate::session::{Session, DEFAULT_COMPONENT_ID_AUTOPILOT};

/// Magic value in param2 of `MAV_CMD_COMPONENT_ARM_DISARM` that forces a
/// disarm even in flight.
const KILL_FORCE_MAGIC: f32 = 21196.0;

/// One-shot flight commands for a vehicle.
#[derive(Clone)]
pub struct Action {
    session: Session,
}

impl Action {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
        }
    }

    pub fn arm(&self) -> CommandResult {
        self.command([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], MavCmd::MAV_CMD_COMPONENT_ARM_DISARM)
    }

    pub fn arm_async(&self, callback: CommandCallback) {
        self.command_async(
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            callback,
        );
    }

    pub fn disarm(&self) -> CommandResult {
        self.command([0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], MavCmd::MAV_CMD_COMPONENT_ARM_DISARM)
    }

    pub fn disarm_async(&self, callback: CommandCallback) {
        self.command_async(
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            callback,
        );
    }

    /// Disarm immediately, even in flight. The vehicle will fall.
    pub fn kill(&self) -> CommandResult {
        self.command(
            [0.0, KILL_FORCE_MAGIC, 0.0, 0.0, 0.0, 0.0, 0.0],
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
        )
    }

    pub fn kill_async(&self, callback: CommandCallback) {
        self.command_async(
            [0.0, KILL_FORCE_MAGIC, 0.0, 0.0, 0.0, 0.0, 0.0],
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            callback,
        );
    }

    pub fn takeoff(&self) -> CommandResult {
        self.command([f32::NAN; 7], MavCmd::MAV_CMD_NAV_TAKEOFF)
    }

    pub fn takeoff_async(&self, callback: CommandCallback) {
        self.command_async([f32::NAN; 7], MavCmd::MAV_CMD_NAV_TAKEOFF, callback);
    }

    pub fn land(&self) -> CommandResult {
        self.command([f32::NAN; 7], MavCmd::MAV_CMD_NAV_LAND)
    }

    pub fn land_async(&self, callback: CommandCallback) {
        self.command_async([f32::NAN; 7], MavCmd::MAV_CMD_NAV_LAND, callback);
    }

    pub fn return_to_launch(&self) -> CommandResult {
        self.command([f32::NAN; 7], MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH)
    }

    pub fn return_to_launch_async(&self, callback: CommandCallback) {
        self.command_async([f32::NAN; 7], MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, callback);
    }

    /// Fly the uploaded mission, switching into auto-mission mode.
    pub fn start_mission(&self) -> CommandResult {
        self.command(
            self.auto_mode_params(px4::PX4_CUSTOM_SUB_MODE_AUTO_MISSION),
            MavCmd::MAV_CMD_DO_SET_MODE,
        )
    }

    pub fn start_mission_async(&self, callback: CommandCallback) {
        self.command_async(
            self.auto_mode_params(px4::PX4_CUSTOM_SUB_MODE_AUTO_MISSION),
            MavCmd::MAV_CMD_DO_SET_MODE,
            callback,
        );
    }

    /// Pause the running mission by switching into hold. Resume with
    /// [`Action::start_mission`].
    pub fn pause_mission(&self) -> CommandResult {
        self.command(
            self.auto_mode_params(px4::PX4_CUSTOM_SUB_MODE_AUTO_LOITER),
            MavCmd::MAV_CMD_DO_SET_MODE,
        )
    }

    pub fn pause_mission_async(&self, callback: CommandCallback) {
        self.command_async(
            self.auto_mode_params(px4::PX4_CUSTOM_SUB_MODE_AUTO_LOITER),
            MavCmd::MAV_CMD_DO_SET_MODE,
            callback,
        );
    }

    fn auto_mode_params(&self, sub_mode: u32) -> [f32; 7] {
        px4::auto_mode_params(self.session.is_armed(), sub_mode)
    }

    fn command(&self, params: [f32; 7], command: MavCmd) -> CommandResult {
        self.session
            .send_command_with_ack(command, params, DEFAULT_COMPONENT_ID_AUTOPILOT)
    }

    fn command_async(&self, params: [f32; 7], command: MavCmd, callback: CommandCallback) {
        self.session
            .send_command_with_ack_async(command, params, DEFAULT_COMPONENT_ID_AUTOPILOT, callback);
    }
}
