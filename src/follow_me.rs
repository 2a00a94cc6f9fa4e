//! Follow-me: stream a ground target location to the vehicle.
//!
//! While active, the facade sends `FOLLOW_TARGET` at the configured rate
//! through the session's periodic scheduler. Updating the target resets the
//! periodic sender and sends one report immediately, so a fast-moving
//! target is never a full period stale. Start and stop switch the PX4
//! custom mode through the command engine; the heartbeat tells us whether
//! the vehicle actually is in follow-me mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mavlink::common::{MavCmd, MavMessage, MavModeFlag, FOLLOW_TARGET_DATA, HEARTBEAT_DATA};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::msg_id;
use crate::error::{CommandResult, ParamError};
use crate::px4;
use crate::router::HandlerOwner;
use crate::scheduler::TimerCookie;
use crate::session::{Session, DEFAULT_COMPONENT_ID_AUTOPILOT};

// FOLLOW_TARGET estimation capability bits.
const EST_CAPABILITY_POS: u8 = 1 << 0;

/// Target position to follow, in global coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetLocation {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub absolute_altitude_m: f32,
    pub velocity_x_m_s: f32,
    pub velocity_y_m_s: f32,
    pub velocity_z_m_s: f32,
}

/// Side of the target the vehicle keeps to (PX4 `NAV_FT_FS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowDirection {
    FrontRight,
    #[default]
    Behind,
    Front,
    FrontLeft,
}

impl FollowDirection {
    fn to_param(self) -> i32 {
        match self {
            FollowDirection::FrontRight => 0,
            FollowDirection::Behind => 1,
            FollowDirection::Front => 2,
            FollowDirection::FrontLeft => 3,
        }
    }
}

/// Follow-me behavior configuration, written to the vehicle as parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FollowMeConfig {
    /// Minimum follow height above the target, in meters (>= 8).
    pub min_height_m: f32,
    /// Horizontal distance kept to the target, in meters (>= 1).
    pub follow_distance_m: f32,
    /// Side of the target to follow from.
    pub follow_direction: FollowDirection,
    /// How aggressively to track, in [0, 1].
    pub responsiveness: f32,
}

impl Default for FollowMeConfig {
    fn default() -> Self {
        Self {
            min_height_m: 8.0,
            follow_distance_m: 8.0,
            follow_direction: FollowDirection::Behind,
            responsiveness: 0.5,
        }
    }
}

impl FollowMeConfig {
    fn is_valid(&self) -> bool {
        self.min_height_m >= 8.0
            && self.follow_distance_m >= 1.0
            && (0.0..=1.0).contains(&self.responsiveness)
    }
}

struct FollowState {
    target_location: Option<TargetLocation>,
    config: FollowMeConfig,
    active: bool,
    sender_cookie: Option<TimerCookie>,
}

/// Follow-me control for one vehicle.
pub struct FollowMe {
    session: Session,
    owner: HandlerOwner,
    state: Arc<Mutex<FollowState>>,
    started_at: Instant,
}

impl FollowMe {
    pub fn new(session: &Session) -> Self {
        let facade = Self {
            session: session.clone(),
            owner: HandlerOwner::new(),
            state: Arc::new(Mutex::new(FollowState {
                target_location: None,
                config: FollowMeConfig::default(),
                active: false,
                sender_cookie: None,
            })),
            started_at: Instant::now(),
        };
        facade.register_heartbeat_handler();
        facade
    }

    /// The configuration last written to the vehicle.
    pub fn get_config(&self) -> FollowMeConfig {
        self.state.lock().config
    }

    /// Validate and write the follow-me parameters to the vehicle.
    pub fn set_config(&self, config: FollowMeConfig) -> bool {
        if !config.is_valid() {
            warn!("invalid follow-me configuration, keeping the previous one");
            return false;
        }
        self.state.lock().config = config;

        self.session.set_param_float_async(
            "NAV_MIN_FT_HT",
            config.min_height_m,
            Box::new(log_param_result("NAV_MIN_FT_HT")),
        );
        self.session.set_param_float_async(
            "NAV_FT_DST",
            config.follow_distance_m,
            Box::new(log_param_result("NAV_FT_DST")),
        );
        self.session.set_param_int_async(
            "NAV_FT_FS",
            config.follow_direction.to_param(),
            Box::new(log_param_result("NAV_FT_FS")),
        );
        self.session.set_param_float_async(
            "NAV_FT_RS",
            config.responsiveness,
            Box::new(log_param_result("NAV_FT_RS")),
        );
        true
    }

    /// The last target location handed to [`FollowMe::set_target_location`].
    pub fn get_last_location(&self) -> Option<TargetLocation> {
        self.state.lock().target_location
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Update the target. While follow-me is active this reschedules the
    /// periodic sender and streams the new location immediately.
    pub fn set_target_location(&self, location: TargetLocation) {
        let send_now = {
            let mut state = self.state.lock();
            state.target_location = Some(location);
            if state.active {
                match state.sender_cookie {
                    Some(cookie) => self.session.reset_call_every(cookie),
                    None => state.sender_cookie = Some(self.schedule_sender()),
                }
            }
            state.active
        };

        if send_now {
            self.send_target_location();
        }
    }

    /// Switch the vehicle into follow-me mode and start streaming.
    pub fn start(&self) -> CommandResult {
        let result = self.set_flight_mode(px4::PX4_CUSTOM_SUB_MODE_AUTO_FOLLOW_TARGET);
        if result == CommandResult::Success {
            let mut state = self.state.lock();
            state.active = true;
            if state.target_location.is_some() && state.sender_cookie.is_none() {
                state.sender_cookie = Some(self.schedule_sender());
            }
        }
        result
    }

    /// Stop streaming and put the vehicle into hold.
    pub fn stop(&self) -> CommandResult {
        {
            let mut state = self.state.lock();
            if let Some(cookie) = state.sender_cookie.take() {
                self.session.remove_call_every(cookie);
            }
            state.active = false;
        }
        self.set_flight_mode(px4::PX4_CUSTOM_SUB_MODE_AUTO_LOITER)
    }

    fn set_flight_mode(&self, sub_mode: u32) -> CommandResult {
        self.session.send_command_with_ack(
            MavCmd::MAV_CMD_DO_SET_MODE,
            px4::auto_mode_params(self.session.is_armed(), sub_mode),
            DEFAULT_COMPONENT_ID_AUTOPILOT,
        )
    }

    /// Track the actual vehicle mode; a pilot can leave follow-me from the
    /// RC side at any time.
    fn register_heartbeat_handler(&self) {
        let state = Arc::clone(&self.state);
        let session = self.session.clone();
        self.session.register_mavlink_message_handler(
            msg_id::HEARTBEAT,
            Arc::new(move |_, message| {
                if let MavMessage::HEARTBEAT(data) = message {
                    let vehicle_following = heartbeat_reports_follow_me(data);
                    let mut locked = state.lock();
                    if locked.active && !vehicle_following {
                        debug!("vehicle left follow-me mode");
                        if let Some(cookie) = locked.sender_cookie.take() {
                            session.remove_call_every(cookie);
                        }
                        locked.active = false;
                    } else if !locked.active && vehicle_following {
                        debug!("vehicle entered follow-me mode");
                        locked.active = true;
                    }
                }
            }),
            self.owner,
        );
    }

    fn schedule_sender(&self) -> TimerCookie {
        let state = Arc::clone(&self.state);
        let session = self.session.clone();
        let started_at = self.started_at;
        let period = Duration::from_secs_f32(1.0 / self.session.config().follow_target_rate_hz);
        self.session.add_call_every(
            move || {
                send_location(&session, &state, started_at);
            },
            period,
        )
    }

    fn send_target_location(&self) {
        send_location(&self.session, &self.state, self.started_at);
    }
}

impl Drop for FollowMe {
    fn drop(&mut self) {
        if let Some(cookie) = self.state.lock().sender_cookie.take() {
            self.session.remove_call_every(cookie);
        }
        self.session.unregister_all_mavlink_message_handlers(self.owner);
    }
}

fn heartbeat_reports_follow_me(data: &HEARTBEAT_DATA) -> bool {
    if !data.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED) {
        return false;
    }
    px4::main_mode(data.custom_mode) == px4::PX4_CUSTOM_MAIN_MODE_AUTO
        && px4::sub_mode(data.custom_mode) == px4::PX4_CUSTOM_SUB_MODE_AUTO_FOLLOW_TARGET
}

fn send_location(session: &Session, state: &Mutex<FollowState>, started_at: Instant) {
    let location = {
        let state = state.lock();
        if !state.active {
            return;
        }
        match state.target_location {
            Some(location) => location,
            None => return,
        }
    };

    let unknown = [f32::NAN, f32::NAN, f32::NAN];
    let message = MavMessage::FOLLOW_TARGET(FOLLOW_TARGET_DATA {
        timestamp: started_at.elapsed().as_millis() as u64,
        custom_state: 0,
        lat: (location.latitude_deg * 1e7) as i32,
        lon: (location.longitude_deg * 1e7) as i32,
        alt: location.absolute_altitude_m,
        // Only the position estimate is streamed.
        vel: unknown,
        acc: unknown,
        attitude_q: [1.0, f32::NAN, f32::NAN, f32::NAN],
        rates: unknown,
        position_cov: unknown,
        est_capabilities: EST_CAPABILITY_POS,
    });

    if !session.send_message(&message) {
        warn!("sending follow target location failed");
    }
}

fn log_param_result(name: &'static str) -> impl FnOnce(Result<(), ParamError>) + Send {
    move |result| match result {
        Ok(()) => debug!(name, "follow-me parameter applied"),
        Err(e) => warn!(name, "follow-me parameter not applied: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn test_facade() -> FollowMe {
        let session = Session::connect(SessionConfig {
            local_udp_port: 0,
            ..SessionConfig::default()
        })
        .unwrap();
        FollowMe::new(&session)
    }

    fn location() -> TargetLocation {
        TargetLocation {
            latitude_deg: 47.3977,
            longitude_deg: 8.5456,
            absolute_altitude_m: 490.0,
            velocity_x_m_s: 0.0,
            velocity_y_m_s: 0.0,
            velocity_z_m_s: 0.0,
        }
    }

    #[test]
    fn test_target_location_is_stored() {
        let follow_me = test_facade();
        assert_eq!(follow_me.get_last_location(), None);

        follow_me.set_target_location(location());
        assert_eq!(follow_me.get_last_location(), Some(location()));
        assert!(!follow_me.is_active());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let follow_me = test_facade();

        let too_low = FollowMeConfig {
            min_height_m: 2.0,
            ..FollowMeConfig::default()
        };
        assert!(!follow_me.set_config(too_low));
        assert_eq!(follow_me.get_config(), FollowMeConfig::default());

        let too_twitchy = FollowMeConfig {
            responsiveness: 1.5,
            ..FollowMeConfig::default()
        };
        assert!(!follow_me.set_config(too_twitchy));
    }

    #[test]
    fn test_start_without_vehicle_reports_no_device() {
        let follow_me = test_facade();
        assert_eq!(follow_me.start(), CommandResult::NoDevice);
        assert!(!follow_me.is_active());
    }

    #[test]
    fn test_follow_mode_heartbeat_detection() {
        use mavlink::common::{MavAutopilot, MavState, MavType};

        let following = HEARTBEAT_DATA {
            custom_mode: (px4::PX4_CUSTOM_SUB_MODE_AUTO_FOLLOW_TARGET << 24)
                | (px4::PX4_CUSTOM_MAIN_MODE_AUTO << 16),
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        assert!(heartbeat_reports_follow_me(&following));

        let loitering = HEARTBEAT_DATA {
            custom_mode: (px4::PX4_CUSTOM_SUB_MODE_AUTO_LOITER << 24)
                | (px4::PX4_CUSTOM_MAIN_MODE_AUTO << 16),
            ..following
        };
        assert!(!heartbeat_reports_follow_me(&loitering));

        let manual = HEARTBEAT_DATA {
            base_mode: MavModeFlag::empty(),
            ..following
        };
        assert!(!heartbeat_reports_follow_me(&manual));
    }
}
