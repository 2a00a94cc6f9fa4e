//! groundlink - Ground-side MAVLink SDK core
//!
//! Connects to an autopilot-equipped vehicle over UDP, decodes the MAVLink
//! stream, and exposes the per-vehicle session machinery everything else is
//! built on: a message router, a command engine with retries and timeouts,
//! a parameter engine, a mission transfer engine, and a shared scheduler
//! driving retransmissions and periodic senders.
//!
//! # Architecture
//!
//! One [`Session`] per vehicle. Three long-lived threads:
//!
//! - the **receive thread** blocks on the UDP socket, drives the frame codec
//!   and dispatches every decoded message through the router;
//! - the **scheduler thread** sleeps until the nearest deadline and fires
//!   timeouts and periodic callbacks;
//! - **caller threads** invoke session operations; the synchronous variants
//!   block on the result produced by the other two threads.
//!
//! Engines never call back into the session; they hold a narrow outbound
//! port (send a message, arm/refresh/cancel a timer) instead. Lock order is
//! facade → engine → router → scheduler → link, never ascending, and no
//! engine lock is held while a user callback runs.

pub mod action;
pub mod codec;
pub mod config;
pub mod error;
pub mod follow_me;
pub mod logging;
pub mod mission;
mod px4;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use action::Action;
pub use config::SessionConfig;
pub use error::{CommandResult, ConnectionError, LinkError, MissionError, ParamError};
pub use follow_me::{FollowDirection, FollowMe, FollowMeConfig, TargetLocation};
pub use logging::Logging;
pub use mission::item::{CameraAction, MissionItem, Position};
pub use router::HandlerOwner;
pub use scheduler::TimerCookie;
pub use session::Session;
pub use telemetry::Telemetry;
