//! Flight-log control.
//!
//! Starts and stops the vehicle's log streaming over MAVLink. The actual
//! log data sink is out of scope here; this facade only drives the
//! start/stop command exchange.

use mavlink::common::MavCmd;

use crate::error::CommandResult;
use crate::session::commands::CommandCallback;
use crate::session::{Session, DEFAULT_COMPONENT_ID_AUTOPILOT};

/// Flight-log streaming control for one vehicle.
#[derive(Clone)]
pub struct Logging {
    session: Session,
}

impl Logging {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
        }
    }

    /// Ask the vehicle to start streaming flight logs (ULog format).
    pub fn start_logging(&self) -> CommandResult {
        self.session.send_command_with_ack(
            MavCmd::MAV_CMD_LOGGING_START,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            DEFAULT_COMPONENT_ID_AUTOPILOT,
        )
    }

    pub fn start_logging_async(&self, callback: CommandCallback) {
        self.session.send_command_with_ack_async(
            MavCmd::MAV_CMD_LOGGING_START,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            DEFAULT_COMPONENT_ID_AUTOPILOT,
            callback,
        );
    }

    /// Ask the vehicle to stop streaming flight logs.
    pub fn stop_logging(&self) -> CommandResult {
        self.session.send_command_with_ack(
            MavCmd::MAV_CMD_LOGGING_STOP,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            DEFAULT_COMPONENT_ID_AUTOPILOT,
        )
    }

    pub fn stop_logging_async(&self, callback: CommandCallback) {
        self.session.send_command_with_ack_async(
            MavCmd::MAV_CMD_LOGGING_STOP,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            DEFAULT_COMPONENT_ID_AUTOPILOT,
            callback,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    #[test]
    fn test_logging_without_vehicle_reports_no_device() {
        let session = Session::connect(SessionConfig {
            local_udp_port: 0,
            ..SessionConfig::default()
        })
        .unwrap();
        let logging = Logging::new(&session);
        assert_eq!(logging.start_logging(), CommandResult::NoDevice);
        assert_eq!(logging.stop_logging(), CommandResult::NoDevice);
    }
}
