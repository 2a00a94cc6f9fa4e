//! Logical ⇄ wire mission translation.
//!
//! One logical [`MissionItem`] expands into one to four wire items: the
//! waypoint itself, then a speed change, a gimbal move, a pre-capture
//! loiter and the camera action, each as its own `MISSION_ITEM_INT`. Wire
//! sequence numbers are dense from 0 and every emitted item records a
//! `wire seq → logical index` entry so progress reports can be translated
//! back.
//!
//! Assembly is the inverse walk. Only the exact wire forms this module
//! emits are accepted; anything else fails with `Unsupported` rather than
//! guessing.

use std::collections::BTreeMap;

use mavlink::common::{MavCmd, MavFrame, MavMissionType, MavMountMode, MISSION_ITEM_INT_DATA};
use tracing::warn;

use crate::error::MissionError;
use crate::mission::item::{CameraAction, MissionItem, Position};

/// Waypoint acceptance radius when not flying through, in meters.
const ACCEPTANCE_RADIUS_M: f32 = 1.0;

/// Wire items plus the seq → logical-index map for one mission.
#[derive(Debug, Clone, Default)]
pub(crate) struct WirePlan {
    pub items: Vec<MISSION_ITEM_INT_DATA>,
    pub index_map: BTreeMap<u16, usize>,
}

struct Expander {
    target_system: u8,
    target_component: u8,
    plan: WirePlan,
}

impl Expander {
    fn emit(
        &mut self,
        logical_index: usize,
        frame: MavFrame,
        command: MavCmd,
        params: [f32; 4],
        x: i32,
        y: i32,
        z: f32,
    ) {
        let seq = self.plan.items.len() as u16;
        self.plan.items.push(MISSION_ITEM_INT_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
            seq,
            frame,
            command,
            // Current is the 0th waypoint.
            current: u8::from(seq == 0),
            autocontinue: 1,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            x,
            y,
            z,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        });
        self.plan.index_map.insert(seq, logical_index);
    }
}

/// Expand logical items into the wire item list, applying the expansion
/// rules in order per item.
pub(crate) fn expand_mission(items: &[MissionItem], target: (u8, u8)) -> WirePlan {
    let mut expander = Expander {
        target_system: target.0,
        target_component: target.1,
        plan: WirePlan::default(),
    };

    // Valid once any waypoint has been emitted; the pre-capture loiter
    // reuses it.
    let mut last_position: Option<(MavFrame, i32, i32, f32)> = None;

    for (logical_index, item) in items.iter().enumerate() {
        if let Some(position) = &item.position {
            let x = (position.latitude_deg * 1e7) as i32;
            let y = (position.longitude_deg * 1e7) as i32;
            let z = position.relative_altitude_m;
            let frame = MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT;
            let accept_radius = if item.fly_through { 0.0 } else { ACCEPTANCE_RADIUS_M };
            expander.emit(
                logical_index,
                frame,
                MavCmd::MAV_CMD_NAV_WAYPOINT,
                [accept_radius, 0.0, 0.0, 0.0],
                x,
                y,
                z,
            );
            last_position = Some((frame, x, y, z));
        }

        if let Some(speed) = item.speed_m_s {
            expander.emit(
                logical_index,
                MavFrame::MAV_FRAME_MISSION,
                MavCmd::MAV_CMD_DO_CHANGE_SPEED,
                // Ground speed, value, no throttle change, absolute.
                [1.0, speed, -1.0, 0.0],
                0,
                0,
                f32::NAN,
            );
        }

        if item.gimbal_pitch_deg.is_some() || item.gimbal_yaw_deg.is_some() {
            let pitch = item.gimbal_pitch_deg.unwrap_or(f32::NAN);
            let yaw = item.gimbal_yaw_deg.unwrap_or(f32::NAN);
            expander.emit(
                logical_index,
                MavFrame::MAV_FRAME_MISSION,
                MavCmd::MAV_CMD_DO_MOUNT_CONTROL,
                // Pitch, roll, yaw (yes, that order), empty.
                [pitch, 0.0, yaw, f32::NAN],
                0,
                0,
                MavMountMode::MAV_MOUNT_MODE_MAVLINK_TARGETING as i32 as f32,
            );
        }

        if let Some(delay) = item.camera_action_delay_s {
            // A loiter at the previous waypoint stands in for a proper
            // NAV_DELAY, which older firmware does not support.
            match last_position {
                Some((frame, x, y, z)) => {
                    expander.emit(
                        logical_index,
                        frame,
                        MavCmd::MAV_CMD_NAV_LOITER_TIME,
                        [delay, f32::NAN, 0.0, 0.0],
                        x,
                        y,
                        z,
                    );
                }
                None => {
                    warn!("camera action delay without a previous position, dropping it");
                }
            }
        }

        if let Some(action) = item.camera_action {
            let (command, params) = match action {
                CameraAction::TakePhoto => (
                    MavCmd::MAV_CMD_IMAGE_START_CAPTURE,
                    // All camera ids, no interval, exactly one picture.
                    [0.0, 0.0, 1.0, f32::NAN],
                ),
                CameraAction::StartPhotoInterval { interval_s } => (
                    MavCmd::MAV_CMD_IMAGE_START_CAPTURE,
                    [0.0, interval_s, 0.0, f32::NAN],
                ),
                CameraAction::StopPhotoInterval => (
                    MavCmd::MAV_CMD_IMAGE_STOP_CAPTURE,
                    [0.0, f32::NAN, f32::NAN, f32::NAN],
                ),
                CameraAction::StartVideo => (
                    MavCmd::MAV_CMD_VIDEO_START_CAPTURE,
                    [0.0, f32::NAN, f32::NAN, f32::NAN],
                ),
                CameraAction::StopVideo => (
                    MavCmd::MAV_CMD_VIDEO_STOP_CAPTURE,
                    [0.0, f32::NAN, f32::NAN, f32::NAN],
                ),
            };
            expander.emit(
                logical_index,
                MavFrame::MAV_FRAME_MISSION,
                command,
                params,
                0,
                0,
                f32::NAN,
            );
        }
    }

    expander.plan
}

/// Assembled logical mission plus the wire → logical index map.
#[derive(Debug)]
pub(crate) struct AssembledMission {
    pub items: Vec<MissionItem>,
    pub index_map: BTreeMap<u16, usize>,
}

/// Reconstruct logical items from downloaded wire items.
pub(crate) fn assemble_mission(wire: &[MISSION_ITEM_INT_DATA]) -> Result<AssembledMission, MissionError> {
    if wire.is_empty() {
        return Err(MissionError::NoMissionAvailable);
    }
    // The first mission item needs to be a waypoint with position.
    if wire[0].command != MavCmd::MAV_CMD_NAV_WAYPOINT {
        warn!("first mission item is not a waypoint");
        return Err(MissionError::Unsupported);
    }

    let mut items: Vec<MissionItem> = Vec::new();
    let mut index_map = BTreeMap::new();
    let mut current = MissionItem::default();
    let mut have_position = false;

    for entry in wire {
        match entry.command {
            MavCmd::MAV_CMD_NAV_WAYPOINT => {
                if entry.frame != MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT {
                    warn!(frame = ?entry.frame, "waypoint frame not supported");
                    return Err(MissionError::Unsupported);
                }
                if have_position {
                    // A new position starts the next logical item.
                    items.push(std::mem::take(&mut current));
                }
                current.position = Some(Position {
                    latitude_deg: f64::from(entry.x) * 1e-7,
                    longitude_deg: f64::from(entry.y) * 1e-7,
                    relative_altitude_m: entry.z,
                });
                current.fly_through = !(entry.param1 > 0.0);
                have_position = true;
            }
            MavCmd::MAV_CMD_DO_MOUNT_CONTROL => {
                if entry.z as i32 != MavMountMode::MAV_MOUNT_MODE_MAVLINK_TARGETING as i32 {
                    warn!("gimbal mount mode not supported");
                    return Err(MissionError::Unsupported);
                }
                current.gimbal_pitch_deg = entry.param1.is_finite().then_some(entry.param1);
                current.gimbal_yaw_deg = entry.param3.is_finite().then_some(entry.param3);
            }
            MavCmd::MAV_CMD_IMAGE_START_CAPTURE => {
                if entry.param2 > 0.0 && entry.param3 as i32 == 0 {
                    current.camera_action = Some(CameraAction::StartPhotoInterval {
                        interval_s: entry.param2,
                    });
                } else if entry.param2 as i32 == 0 && entry.param3 as i32 == 1 {
                    current.camera_action = Some(CameraAction::TakePhoto);
                } else {
                    warn!("IMAGE_START_CAPTURE params not supported");
                    return Err(MissionError::Unsupported);
                }
            }
            MavCmd::MAV_CMD_IMAGE_STOP_CAPTURE => {
                current.camera_action = Some(CameraAction::StopPhotoInterval);
            }
            MavCmd::MAV_CMD_VIDEO_START_CAPTURE => {
                current.camera_action = Some(CameraAction::StartVideo);
            }
            MavCmd::MAV_CMD_VIDEO_STOP_CAPTURE => {
                current.camera_action = Some(CameraAction::StopVideo);
            }
            MavCmd::MAV_CMD_DO_CHANGE_SPEED => {
                if entry.param1 as i32 == 1 && entry.param3 < 0.0 && entry.param4 as i32 == 0 {
                    current.speed_m_s = Some(entry.param2);
                } else {
                    warn!("DO_CHANGE_SPEED params not supported");
                    return Err(MissionError::Unsupported);
                }
            }
            MavCmd::MAV_CMD_NAV_LOITER_TIME => {
                if !have_position {
                    warn!("loiter without a previous waypoint");
                    return Err(MissionError::Unsupported);
                }
                current.camera_action_delay_s = Some(entry.param1);
            }
            other => {
                warn!(command = ?other, "mission item command not supported");
                return Err(MissionError::Unsupported);
            }
        }
        index_map.insert(entry.seq, items.len());
    }

    items.push(current);

    Ok(AssembledMission { items, index_map })
}
