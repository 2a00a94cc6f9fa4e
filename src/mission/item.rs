//! Logical mission item model.
//!
//! One logical item bundles everything that should happen at (or on the way
//! to) a waypoint: the position itself, an optional speed change, a gimbal
//! move, a pre-capture loiter and a camera action. On the wire each of
//! those is its own mission entry; the transfer module handles the
//! expansion.

/// A global position with altitude relative to the takeoff point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub relative_altitude_m: f32,
}

/// Camera trigger attached to a mission item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraAction {
    /// Take a single photo.
    TakePhoto,
    /// Start taking photos every `interval_s` seconds.
    StartPhotoInterval { interval_s: f32 },
    /// Stop the photo interval.
    StopPhotoInterval,
    /// Start video capture.
    StartVideo,
    /// Stop video capture.
    StopVideo,
}

/// One user-level step of a mission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionItem {
    /// Waypoint position; items without one attach their actions to the
    /// previous waypoint.
    pub position: Option<Position>,
    /// Ground speed to fly at from this item on.
    pub speed_m_s: Option<f32>,
    /// Gimbal pitch to set at this item.
    pub gimbal_pitch_deg: Option<f32>,
    /// Gimbal yaw to set at this item.
    pub gimbal_yaw_deg: Option<f32>,
    /// Pass through the waypoint instead of stopping at it.
    pub fly_through: bool,
    /// Loiter this long before running the camera action.
    pub camera_action_delay_s: Option<f32>,
    /// Camera trigger to run at this item.
    pub camera_action: Option<CameraAction>,
}

impl MissionItem {
    /// Item at a position, stopping at the waypoint.
    pub fn at(latitude_deg: f64, longitude_deg: f64, relative_altitude_m: f32) -> Self {
        Self {
            position: Some(Position {
                latitude_deg,
                longitude_deg,
                relative_altitude_m,
            }),
            ..Self::default()
        }
    }
}
