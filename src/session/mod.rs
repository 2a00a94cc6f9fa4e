//! Session facade: one vehicle, one UDP link, one set of engines.
//!
//! [`Session`] owns the link, router, scheduler and the command, parameter
//! and mission engines, and is the single entry point the capability
//! facades build on. Datagrams from the receive thread run through the
//! codec and router here; heartbeats drive peer discovery, arming state and
//! the connection watchdog.
//!
//! `Session` is a cheap clone (a shared handle); the underlying threads
//! stop when the last handle drops.

pub(crate) mod commands;
pub(crate) mod params;
pub(crate) mod port;
pub(crate) mod state;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
};
use mavlink::MavHeader;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{msg_id, parse_datagram, MavSender};
use crate::config::SessionConfig;
use crate::error::{CommandResult, ConnectionError, ParamError};
use crate::mission::MissionEngine;
use crate::router::{HandlerOwner, MessageHandler, MessageRouter};
use crate::scheduler::{Scheduler, TimerCookie};
use crate::session::commands::{CommandCallback, CommandEngine};
use crate::session::params::{GetFloatCallback, GetIntCallback, ParamEngine, SetParamCallback};
use crate::session::port::{EnginePort, SessionPort};
use crate::session::state::TargetState;
use crate::transport::UdpLink;

pub use crate::session::commands::DEFAULT_COMPONENT_ID_AUTOPILOT;

/// How often the command queue pump promotes pending work.
const COMMAND_PUMP_INTERVAL: Duration = Duration::from_millis(100);

type DiscoverCallback = Arc<dyn Fn(u8) + Send + Sync>;

pub(crate) struct SessionInner {
    config: SessionConfig,
    scheduler: Arc<Scheduler>,
    router: Arc<MessageRouter>,
    link: Arc<UdpLink>,
    sender: Arc<MavSender>,
    target: Arc<TargetState>,
    commands: Arc<CommandEngine>,
    params: Arc<ParamEngine>,
    mission: Arc<MissionEngine>,
    owner: HandlerOwner,
    discover_subscribers: Mutex<Vec<DiscoverCallback>>,
    connection_cookie: Mutex<Option<TimerCookie>>,
}

/// Handle to one vehicle session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Bind the UDP port, start the receive and scheduler threads and wire
    /// up the engines. The vehicle is discovered by its first heartbeat.
    pub fn connect(config: SessionConfig) -> Result<Session, ConnectionError> {
        let scheduler = Arc::new(Scheduler::new());
        let router = Arc::new(MessageRouter::new());
        let link = Arc::new(UdpLink::bind(config.local_udp_port)?);
        let sender = Arc::new(MavSender::new(
            Arc::clone(&link),
            config.own_system_id,
            config.own_component_id,
        ));
        let target = Arc::new(TargetState::new());

        let port = Arc::new(SessionPort {
            sender: Arc::clone(&sender),
            scheduler: Arc::clone(&scheduler),
            target: Arc::clone(&target),
            own_system_id: config.own_system_id,
            own_component_id: config.own_component_id,
        });

        let command_timeout = Duration::from_millis(u64::from(config.command_default_timeout_ms));
        let commands = CommandEngine::new(
            Arc::clone(&port) as Arc<dyn EnginePort>,
            config.command_default_retries,
            command_timeout,
        );
        let params = ParamEngine::new(
            Arc::clone(&port) as Arc<dyn EnginePort>,
            config.command_default_retries,
            command_timeout,
        );
        let mission = MissionEngine::new(
            Arc::clone(&port) as Arc<dyn EnginePort>,
            Duration::from_secs_f32(config.mission_timeout_s),
        );

        let inner = Arc::new(SessionInner {
            config,
            scheduler,
            router: Arc::clone(&router),
            link: Arc::clone(&link),
            sender,
            target,
            commands,
            params,
            mission,
            owner: HandlerOwner::new(),
            discover_subscribers: Mutex::new(Vec::new()),
            connection_cookie: Mutex::new(None),
        });

        inner.register_core_handlers();

        link.start(move |bytes| {
            for (header, message) in parse_datagram(bytes) {
                router.dispatch(&header, &message);
            }
        })?;

        inner.start_services();

        Ok(Session { inner })
    }

    // -- Raw messaging --

    /// Send one MAVLink message to the vehicle. Returns whether the link
    /// accepted it.
    pub fn send_message(&self, message: &MavMessage) -> bool {
        match self.inner.sender.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("send_message failed: {e}");
                false
            }
        }
    }

    /// Register a handler for all inbound messages with `message_id`.
    pub fn register_mavlink_message_handler(
        &self,
        message_id: u32,
        callback: MessageHandler,
        owner: HandlerOwner,
    ) {
        self.inner.router.register(message_id, callback, owner);
    }

    /// Drop every handler registered under `owner`.
    pub fn unregister_all_mavlink_message_handlers(&self, owner: HandlerOwner) {
        self.inner.router.unregister_all(owner);
    }

    // -- Commands --

    pub fn send_command_with_ack(
        &self,
        command: MavCmd,
        params: [f32; 7],
        target_component: u8,
    ) -> CommandResult {
        self.inner.commands.send_with_ack(command, params, target_component)
    }

    pub fn send_command_with_ack_async(
        &self,
        command: MavCmd,
        params: [f32; 7],
        target_component: u8,
        callback: CommandCallback,
    ) {
        self.inner
            .commands
            .send_with_ack_async(command, params, target_component, callback);
    }

    // -- Parameters --

    pub fn set_param_float_async(&self, name: &str, value: f32, callback: SetParamCallback) {
        self.inner.params.set_param_float_async(name, value, callback);
    }

    pub fn set_param_int_async(&self, name: &str, value: i32, callback: SetParamCallback) {
        self.inner.params.set_param_int_async(name, value, callback);
    }

    pub fn get_param_float_async(&self, name: &str, callback: GetFloatCallback) {
        self.inner.params.get_param_float_async(name, callback);
    }

    pub fn get_param_int_async(&self, name: &str, callback: GetIntCallback) {
        self.inner.params.get_param_int_async(name, callback);
    }

    pub fn set_param_float(&self, name: &str, value: f32) -> Result<(), ParamError> {
        self.inner.params.set_param_float(name, value)
    }

    pub fn set_param_int(&self, name: &str, value: i32) -> Result<(), ParamError> {
        self.inner.params.set_param_int(name, value)
    }

    pub fn get_param_float(&self, name: &str) -> Result<f32, ParamError> {
        self.inner.params.get_param_float(name)
    }

    pub fn get_param_int(&self, name: &str) -> Result<i32, ParamError> {
        self.inner.params.get_param_int(name)
    }

    // -- Mission --

    /// The mission transfer engine for this vehicle.
    pub fn mission(&self) -> Arc<MissionEngine> {
        Arc::clone(&self.inner.mission)
    }

    // -- Timers --

    /// Run `callback` every `period` until removed.
    pub fn add_call_every<F>(&self, callback: F, period: Duration) -> TimerCookie
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.scheduler.register_periodic(Arc::new(callback), period)
    }

    pub fn remove_call_every(&self, cookie: TimerCookie) {
        self.inner.scheduler.unregister(cookie);
    }

    /// Restart the period of a periodic callback from now.
    pub fn reset_call_every(&self, cookie: TimerCookie) {
        self.inner.scheduler.refresh(cookie);
    }

    /// Run `callback` once after `after` unless refreshed or unregistered.
    pub fn register_timeout_handler<F>(&self, callback: F, after: Duration) -> TimerCookie
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.scheduler.register_timeout(Arc::new(callback), after)
    }

    pub fn refresh_timeout_handler(&self, cookie: TimerCookie) {
        self.inner.scheduler.refresh(cookie);
    }

    pub fn unregister_timeout_handler(&self, cookie: TimerCookie) {
        self.inner.scheduler.unregister(cookie);
    }

    // -- Identity and state --

    pub fn get_own_system_id(&self) -> u8 {
        self.inner.config.own_system_id
    }

    pub fn get_own_component_id(&self) -> u8 {
        self.inner.config.own_component_id
    }

    /// System id of the vehicle, 0 until discovered.
    pub fn get_target_system_id(&self) -> u8 {
        self.inner.target.target_ids().map_or(0, |(system, _)| system)
    }

    /// Component id of the vehicle, 0 until discovered.
    pub fn get_target_component_id(&self) -> u8 {
        self.inner.target.target_ids().map_or(0, |(_, component)| component)
    }

    pub fn is_armed(&self) -> bool {
        self.inner.target.is_armed()
    }

    /// Whether a heartbeat arrived within the heartbeat timeout.
    pub fn is_connected(&self) -> bool {
        self.inner.target.is_connected()
    }

    pub fn target_supports_mission_int(&self) -> bool {
        self.inner.target.supports_mission_int()
    }

    /// `callback` fires once per unique system id observed, including ids
    /// already discovered at subscription time.
    pub fn register_on_discover<F>(&self, callback: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let callback: DiscoverCallback = Arc::new(callback);
        let already_seen = {
            let mut subscribers = self.inner.discover_subscribers.lock();
            subscribers.push(Arc::clone(&callback));
            self.inner.target.seen_systems()
        };
        for system_id in already_seen {
            callback(system_id);
        }
    }

    /// The locally bound UDP address (useful when binding port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.link.local_addr()
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

impl SessionInner {
    /// Wire the engines and the session's own bookkeeping into the router.
    fn register_core_handlers(self: &Arc<Self>) {
        let owner = self.owner;
        let router = &self.router;

        let commands = Arc::clone(&self.commands);
        router.register(
            msg_id::COMMAND_ACK,
            Arc::new(move |_, message| {
                if let MavMessage::COMMAND_ACK(data) = message {
                    commands.handle_command_ack(data);
                }
            }),
            owner,
        );

        let params = Arc::clone(&self.params);
        router.register(
            msg_id::PARAM_VALUE,
            Arc::new(move |_, message| {
                if let MavMessage::PARAM_VALUE(data) = message {
                    params.handle_param_value(data);
                }
            }),
            owner,
        );

        let mission = Arc::clone(&self.mission);
        router.register(
            msg_id::MISSION_REQUEST,
            Arc::new(move |_, message| {
                if let MavMessage::MISSION_REQUEST(data) = message {
                    mission.handle_mission_request(data);
                }
            }),
            owner,
        );
        let mission = Arc::clone(&self.mission);
        router.register(
            msg_id::MISSION_REQUEST_INT,
            Arc::new(move |_, message| {
                if let MavMessage::MISSION_REQUEST_INT(data) = message {
                    mission.handle_mission_request_int(data);
                }
            }),
            owner,
        );
        let mission = Arc::clone(&self.mission);
        router.register(
            msg_id::MISSION_ACK,
            Arc::new(move |_, message| {
                if let MavMessage::MISSION_ACK(data) = message {
                    mission.handle_mission_ack(data);
                }
            }),
            owner,
        );
        let mission = Arc::clone(&self.mission);
        router.register(
            msg_id::MISSION_COUNT,
            Arc::new(move |_, message| {
                if let MavMessage::MISSION_COUNT(data) = message {
                    mission.handle_mission_count(data);
                }
            }),
            owner,
        );
        let mission = Arc::clone(&self.mission);
        router.register(
            msg_id::MISSION_ITEM_INT,
            Arc::new(move |_, message| {
                if let MavMessage::MISSION_ITEM_INT(data) = message {
                    mission.handle_mission_item_int(data);
                }
            }),
            owner,
        );
        let mission = Arc::clone(&self.mission);
        router.register(
            msg_id::MISSION_CURRENT,
            Arc::new(move |_, message| {
                if let MavMessage::MISSION_CURRENT(data) = message {
                    mission.handle_mission_current(data);
                }
            }),
            owner,
        );
        let mission = Arc::clone(&self.mission);
        router.register(
            msg_id::MISSION_ITEM_REACHED,
            Arc::new(move |_, message| {
                if let MavMessage::MISSION_ITEM_REACHED(data) = message {
                    mission.handle_mission_item_reached(data);
                }
            }),
            owner,
        );

        let session = Arc::downgrade(self);
        router.register(
            msg_id::HEARTBEAT,
            Arc::new(move |header, message| {
                if let (Some(session), MavMessage::HEARTBEAT(data)) = (session.upgrade(), message) {
                    session.handle_heartbeat(header, data);
                }
            }),
            owner,
        );

        let target = Arc::clone(&self.target);
        router.register(
            msg_id::AUTOPILOT_VERSION,
            Arc::new(move |_, message| {
                if let MavMessage::AUTOPILOT_VERSION(data) = message {
                    debug!(capabilities = ?data.capabilities, "autopilot capabilities received");
                    target.observe_capabilities(data.capabilities);
                }
            }),
            owner,
        );
    }

    /// Start our own heartbeat and the command queue pump.
    fn start_services(self: &Arc<Self>) {
        let sender = Arc::clone(&self.sender);
        self.scheduler.register_periodic(
            Arc::new(move || {
                // Fails silently until the peer is known.
                let _ = sender.send(&own_heartbeat());
            }),
            Duration::from_secs_f32(self.config.heartbeat_interval_s),
        );

        let commands = Arc::downgrade(&self.commands);
        self.scheduler.register_periodic(
            Arc::new(move || {
                if let Some(commands) = commands.upgrade() {
                    commands.do_work();
                }
            }),
            COMMAND_PUMP_INTERVAL,
        );
    }

    #[allow(deprecated)]
    fn handle_heartbeat(self: &Arc<Self>, header: &MavHeader, data: &HEARTBEAT_DATA) {
        let newly_discovered = self.target.observe_heartbeat(header, data);
        self.refresh_connection_watchdog();

        if let Some(system_id) = newly_discovered {
            info!(system_id, component_id = header.component_id, "vehicle discovered");

            // Learn whether the vehicle speaks the int mission protocol.
            self.commands.send_with_ack_async(
                MavCmd::MAV_CMD_REQUEST_AUTOPILOT_CAPABILITIES,
                [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                DEFAULT_COMPONENT_ID_AUTOPILOT,
                Arc::new(|result| {
                    if result.is_terminal() && result != CommandResult::Success {
                        debug!(?result, "capability request not answered");
                    }
                }),
            );

            let subscribers = self.discover_subscribers.lock().clone();
            for callback in subscribers {
                callback(system_id);
            }
        }
    }

    /// (Re-)arm the heartbeat watchdog; when it fires the vehicle is
    /// reported lost until the next heartbeat.
    fn refresh_connection_watchdog(self: &Arc<Self>) {
        let mut cookie = self.connection_cookie.lock();
        if let Some(cookie) = *cookie {
            self.scheduler.refresh(cookie);
            return;
        }

        let session = Arc::downgrade(self);
        *cookie = Some(self.scheduler.register_timeout(
            Arc::new(move || {
                if let Some(session) = session.upgrade() {
                    warn!("heartbeats stopped, vehicle connection lost");
                    session.target.mark_disconnected();
                    // The one-shot is spent; the next heartbeat re-arms it.
                    *session.connection_cookie.lock() = None;
                }
            }),
            Duration::from_secs_f32(self.config.heartbeat_timeout_s),
        ));
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.link.stop();
        self.scheduler.stop();
    }
}

fn own_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}
