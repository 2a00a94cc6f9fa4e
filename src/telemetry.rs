//! Telemetry subscriptions.
//!
//! Each subscription registers a router handler under this facade's owner
//! token; dropping the facade (or calling [`Telemetry::unsubscribe_all`])
//! removes them, so attaching and detaching repeatedly is fine.

use std::sync::Arc;

use mavlink::common::{MavMessage, MavModeFlag};

use crate::codec::msg_id;
use crate::router::HandlerOwner;
use crate::session::Session;

/// Global position report, derived from `GLOBAL_POSITION_INT`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub absolute_altitude_m: f32,
    pub relative_altitude_m: f32,
}

/// Battery report, derived from `SYS_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Battery {
    pub voltage_v: f32,
    /// Remaining charge in [0, 1], NaN when the vehicle does not estimate
    /// it.
    pub remaining_percent: f32,
}

/// Telemetry subscriptions for one vehicle.
pub struct Telemetry {
    session: Session,
    owner: HandlerOwner,
}

impl Telemetry {
    pub fn new(session: &Session) -> Self {
        Self {
            session: session.clone(),
            owner: HandlerOwner::new(),
        }
    }

    /// Subscribe to position updates.
    pub fn subscribe_position<F>(&self, callback: F)
    where
        F: Fn(Position) + Send + Sync + 'static,
    {
        self.session.register_mavlink_message_handler(
            msg_id::GLOBAL_POSITION_INT,
            Arc::new(move |_, message| {
                if let MavMessage::GLOBAL_POSITION_INT(data) = message {
                    callback(Position {
                        latitude_deg: f64::from(data.lat) * 1e-7,
                        longitude_deg: f64::from(data.lon) * 1e-7,
                        absolute_altitude_m: data.alt as f32 * 1e-3,
                        relative_altitude_m: data.relative_alt as f32 * 1e-3,
                    });
                }
            }),
            self.owner,
        );
    }

    /// Subscribe to battery updates.
    pub fn subscribe_battery<F>(&self, callback: F)
    where
        F: Fn(Battery) + Send + Sync + 'static,
    {
        self.session.register_mavlink_message_handler(
            msg_id::SYS_STATUS,
            Arc::new(move |_, message| {
                if let MavMessage::SYS_STATUS(data) = message {
                    let remaining = if data.battery_remaining < 0 {
                        f32::NAN
                    } else {
                        f32::from(data.battery_remaining) * 1e-2
                    };
                    callback(Battery {
                        voltage_v: f32::from(data.voltage_battery) * 1e-3,
                        remaining_percent: remaining,
                    });
                }
            }),
            self.owner,
        );
    }

    /// Subscribe to arming state changes carried by the heartbeat.
    pub fn subscribe_armed<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.session.register_mavlink_message_handler(
            msg_id::HEARTBEAT,
            Arc::new(move |_, message| {
                if let MavMessage::HEARTBEAT(data) = message {
                    callback(data.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED));
                }
            }),
            self.owner,
        );
    }

    /// Remove every subscription made through this facade.
    pub fn unsubscribe_all(&self) {
        self.session.unregister_all_mavlink_message_handlers(self.owner);
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

// Wire-level behavior is exercised in tests/integration.rs; these check the
// unit conversions.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use mavlink::common::{GLOBAL_POSITION_INT_DATA, SYS_STATUS_DATA};
    use mavlink::MavHeader;
    use parking_lot::Mutex;

    fn test_session() -> Session {
        Session::connect(SessionConfig {
            local_udp_port: 0,
            ..SessionConfig::default()
        })
        .unwrap()
    }

    fn header() -> MavHeader {
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        }
    }

    #[test]
    fn test_position_conversion() {
        let session = test_session();
        let telemetry = Telemetry::new(&session);
        let positions = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&positions);
        telemetry.subscribe_position(move |p| sink.lock().push(p));

        // Drive the handler directly through the router, as the receive
        // thread would.
        let message = MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 473977000,
            lon: 85456000,
            alt: 488_000,
            relative_alt: 10_000,
            ..Default::default()
        });
        dispatch(&session, &message);

        let positions = positions.lock();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].latitude_deg - 47.3977).abs() < 1e-9);
        assert!((positions[0].longitude_deg - 8.5456).abs() < 1e-9);
        assert_eq!(positions[0].absolute_altitude_m, 488.0);
        assert_eq!(positions[0].relative_altitude_m, 10.0);
    }

    #[test]
    fn test_battery_conversion_and_unsubscribe() {
        let session = test_session();
        let telemetry = Telemetry::new(&session);
        let batteries = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&batteries);
        telemetry.subscribe_battery(move |b| sink.lock().push(b));

        let message = MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: 12600,
            battery_remaining: 80,
            ..Default::default()
        });
        dispatch(&session, &message);
        assert_eq!(
            *batteries.lock(),
            vec![Battery {
                voltage_v: 12.6,
                remaining_percent: 0.8,
            }]
        );

        telemetry.unsubscribe_all();
        dispatch(&session, &message);
        assert_eq!(batteries.lock().len(), 1);
    }

    fn dispatch(session: &Session, message: &MavMessage) {
        // Tests reach the router through the public registration API only;
        // loop the message back through a local UDP datagram instead.
        let mut buf = std::io::Cursor::new(Vec::with_capacity(280));
        mavlink::write_v2_msg(&mut buf, header(), message).unwrap();
        let socket = std::net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = session.local_addr().unwrap().port();
        socket.send_to(&buf.into_inner(), ("127.0.0.1", port)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(150));
    }
}
