//! PX4 custom flight mode encoding.
//!
//! PX4 packs its flight mode into the MAVLink `custom_mode` word: the main
//! mode in byte 2, the sub mode in byte 3. Mode switches go out as
//! `MAV_CMD_DO_SET_MODE` with the same values spread over the first three
//! params. Mission run control and follow-me both ride on this.

use mavlink::common::MavModeFlag;

pub(crate) const PX4_CUSTOM_MAIN_MODE_AUTO: u32 = 4;

pub(crate) const PX4_CUSTOM_SUB_MODE_AUTO_LOITER: u32 = 3;
pub(crate) const PX4_CUSTOM_SUB_MODE_AUTO_MISSION: u32 = 4;
pub(crate) const PX4_CUSTOM_SUB_MODE_AUTO_FOLLOW_TARGET: u32 = 8;

/// `MAV_CMD_DO_SET_MODE` params selecting an auto sub mode.
///
/// The safety flag is not needed on newer firmware but is kept for the
/// older ones.
pub(crate) fn auto_mode_params(armed: bool, sub_mode: u32) -> [f32; 7] {
    let safety_armed = if armed {
        MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED.bits()
    } else {
        0
    };
    let base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() | safety_armed;
    [
        f32::from(base_mode),
        PX4_CUSTOM_MAIN_MODE_AUTO as f32,
        sub_mode as f32,
        f32::NAN,
        f32::NAN,
        f32::NAN,
        f32::NAN,
    ]
}

pub(crate) fn main_mode(custom_mode: u32) -> u32 {
    (custom_mode >> 16) & 0xff
}

pub(crate) fn sub_mode(custom_mode: u32) -> u32 {
    custom_mode >> 24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_mode_params() {
        let params = auto_mode_params(false, PX4_CUSTOM_SUB_MODE_AUTO_MISSION);
        assert_eq!(params[0], 1.0); // custom mode enabled, not armed
        assert_eq!(params[1], PX4_CUSTOM_MAIN_MODE_AUTO as f32);
        assert_eq!(params[2], PX4_CUSTOM_SUB_MODE_AUTO_MISSION as f32);
        assert!(params[3].is_nan());

        let armed = auto_mode_params(true, PX4_CUSTOM_SUB_MODE_AUTO_LOITER);
        assert_eq!(armed[0], 129.0); // custom mode enabled | safety armed
        assert_eq!(armed[2], PX4_CUSTOM_SUB_MODE_AUTO_LOITER as f32);
    }

    #[test]
    fn test_custom_mode_word_extraction() {
        let word = (PX4_CUSTOM_SUB_MODE_AUTO_FOLLOW_TARGET << 24) | (PX4_CUSTOM_MAIN_MODE_AUTO << 16);
        assert_eq!(main_mode(word), PX4_CUSTOM_MAIN_MODE_AUTO);
        assert_eq!(sub_mode(word), PX4_CUSTOM_SUB_MODE_AUTO_FOLLOW_TARGET);
    }
}
