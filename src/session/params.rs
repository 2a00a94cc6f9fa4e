//! Parameter engine: named float/int32 get and set.
//!
//! Same send → wait-for-typed-reply → timeout-with-retry discipline as the
//! command engine, but keyed on the parameter name: the vehicle acknowledges
//! a `PARAM_SET` (and answers a `PARAM_REQUEST_READ`) by echoing a
//! `PARAM_VALUE` with the same name. Requests for the same name are
//! serialized through a per-name FIFO so overlapping echoes cannot be
//! attributed to the wrong request; different names proceed independently.
//!
//! Int32 values travel bytewise in the wire float field (PX4-style bytewise
//! parameter encoding).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mavlink::common::{
    MavMessage, MavParamType, PARAM_REQUEST_READ_DATA, PARAM_SET_DATA, PARAM_VALUE_DATA,
};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::ParamError;
use crate::scheduler::TimerCookie;
use crate::session::port::EnginePort;

pub type SetParamCallback = Box<dyn FnOnce(Result<(), ParamError>) + Send>;
pub type GetFloatCallback = Box<dyn FnOnce(Result<f32, ParamError>) + Send>;
pub type GetIntCallback = Box<dyn FnOnce(Result<i32, ParamError>) + Send>;

enum Request {
    SetFloat { value: f32, callback: SetParamCallback },
    SetInt { value: i32, callback: SetParamCallback },
    GetFloat { callback: GetFloatCallback },
    GetInt { callback: GetIntCallback },
}

struct Active {
    request: Request,
    retries_left: u8,
    cookie: TimerCookie,
}

#[derive(Default)]
struct Slot {
    active: Option<Active>,
    queued: VecDeque<Request>,
}

pub(crate) struct ParamEngine {
    port: Arc<dyn EnginePort>,
    default_retries: u8,
    default_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    self_ref: Weak<ParamEngine>,
}

impl ParamEngine {
    pub fn new(port: Arc<dyn EnginePort>, default_retries: u8, default_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            port,
            default_retries,
            default_timeout,
            slots: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn set_param_float_async(&self, name: &str, value: f32, callback: SetParamCallback) {
        self.submit(name, Request::SetFloat { value, callback });
    }

    pub fn set_param_int_async(&self, name: &str, value: i32, callback: SetParamCallback) {
        self.submit(name, Request::SetInt { value, callback });
    }

    pub fn get_param_float_async(&self, name: &str, callback: GetFloatCallback) {
        self.submit(name, Request::GetFloat { callback });
    }

    pub fn get_param_int_async(&self, name: &str, callback: GetIntCallback) {
        self.submit(name, Request::GetInt { callback });
    }

    pub fn set_param_float(&self, name: &str, value: f32) -> Result<(), ParamError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.set_param_float_async(name, value, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap_or(Err(ParamError::ConnectionError))
    }

    pub fn set_param_int(&self, name: &str, value: i32) -> Result<(), ParamError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.set_param_int_async(name, value, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap_or(Err(ParamError::ConnectionError))
    }

    pub fn get_param_float(&self, name: &str) -> Result<f32, ParamError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.get_param_float_async(name, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap_or(Err(ParamError::ConnectionError))
    }

    pub fn get_param_int(&self, name: &str) -> Result<i32, ParamError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.get_param_int_async(name, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap_or(Err(ParamError::ConnectionError))
    }

    /// Feed a received PARAM_VALUE into the engine.
    pub fn handle_param_value(&self, data: &PARAM_VALUE_DATA) {
        let name = name_from_param_id(data.param_id.as_ref());
        self.finish_active(&name, Ok(data.param_value));
    }

    fn submit(&self, name: &str, request: Request) {
        if self.port.target_ids().is_none() {
            resolve_request(request, Err(ParamError::NoDevice));
            return;
        }

        let message = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(name.to_string()).or_default();
            if slot.active.is_some() {
                slot.queued.push_back(request);
                return;
            }
            match self.activate(name, request, slot) {
                Ok(message) => message,
                Err(request) => {
                    drop(slots);
                    resolve_request(request, Err(ParamError::NoDevice));
                    return;
                }
            }
        };

        self.transmit(name, &message);
    }

    /// Arm the head request of a slot: build its message and start its
    /// timer. Returns the request untouched when no target is known.
    fn activate(&self, name: &str, request: Request, slot: &mut Slot) -> Result<MavMessage, Request> {
        let Some(message) = self.build_message(name, &request) else {
            return Err(request);
        };
        let cookie = self.arm_timer(name);
        slot.active = Some(Active {
            request,
            retries_left: self.default_retries,
            cookie,
        });
        Ok(message)
    }

    /// Resolve the active request for `name` and promote the next queued
    /// one.
    fn finish_active(&self, name: &str, outcome: Result<f32, ParamError>) {
        let (finished, starved, promoted) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(name) else {
                trace!(name, "param value with no request pending");
                return;
            };
            let Some(finished) = slot.active.take() else {
                trace!(name, "param value with no request active");
                return;
            };

            let mut starved = Vec::new();
            let mut promoted = None;
            while let Some(next) = slot.queued.pop_front() {
                match self.activate(name, next, slot) {
                    Ok(message) => {
                        promoted = Some(message);
                        break;
                    }
                    Err(request) => starved.push(request),
                }
            }
            if slot.active.is_none() && slot.queued.is_empty() {
                slots.remove(name);
            }
            (finished, starved, promoted)
        };

        self.port.unregister_timeout(finished.cookie);
        resolve_request(finished.request, outcome);
        for request in starved {
            resolve_request(request, Err(ParamError::NoDevice));
        }
        if let Some(message) = promoted {
            self.transmit(name, &message);
        }
    }

    fn handle_timeout(&self, name: &str) {
        enum After {
            Retransmit(MavMessage),
            GiveUp,
        }

        let after = {
            let mut slots = self.slots.lock();
            let Some(active) = slots.get_mut(name).and_then(|slot| slot.active.as_mut()) else {
                return;
            };
            if active.retries_left > 0 {
                active.retries_left -= 1;
                match self.build_message(name, &active.request) {
                    Some(message) => {
                        warn!(name, retries_left = active.retries_left, "param request timed out, retrying");
                        active.cookie = self.arm_timer(name);
                        After::Retransmit(message)
                    }
                    None => After::GiveUp,
                }
            } else {
                warn!(name, "param request timed out, no retries left");
                After::GiveUp
            }
        };

        match after {
            After::Retransmit(message) => self.transmit(name, &message),
            After::GiveUp => self.finish_active(name, Err(ParamError::Timeout)),
        }
    }

    fn transmit(&self, name: &str, message: &MavMessage) {
        if self.port.send_message(message).is_ok() {
            return;
        }
        self.finish_active(name, Err(ParamError::ConnectionError));
    }

    fn arm_timer(&self, name: &str) -> TimerCookie {
        let engine = self.self_ref.clone();
        let name = name.to_string();
        self.port.register_timeout(
            Arc::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.handle_timeout(&name);
                }
            }),
            self.default_timeout,
        )
    }

    fn build_message(&self, name: &str, request: &Request) -> Option<MavMessage> {
        let (target_system, target_component) = self.port.target_ids()?;
        let message = match request {
            Request::SetFloat { value, .. } => MavMessage::PARAM_SET(PARAM_SET_DATA {
                target_system,
                target_component,
                param_id: param_id_from_name(name).into(),
                param_value: *value,
                param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
            }),
            Request::SetInt { value, .. } => MavMessage::PARAM_SET(PARAM_SET_DATA {
                target_system,
                target_component,
                param_id: param_id_from_name(name).into(),
                param_value: f32::from_le_bytes(value.to_le_bytes()),
                param_type: MavParamType::MAV_PARAM_TYPE_INT32,
            }),
            Request::GetFloat { .. } | Request::GetInt { .. } => {
                MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
                    param_index: -1,
                    target_system,
                    target_component,
                    param_id: param_id_from_name(name).into(),
                })
            }
        };
        Some(message)
    }
}

fn resolve_request(request: Request, outcome: Result<f32, ParamError>) {
    match request {
        Request::SetFloat { callback, .. } | Request::SetInt { callback, .. } => {
            callback(outcome.map(|_| ()));
        }
        Request::GetFloat { callback } => callback(outcome),
        Request::GetInt { callback } => {
            callback(outcome.map(|raw| i32::from_le_bytes(raw.to_le_bytes())));
        }
    }
}

fn param_id_from_name(name: &str) -> [u8; 16] {
    let mut id = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    id[..len].copy_from_slice(&bytes[..len]);
    id
}

fn name_from_param_id(id: &[u8]) -> String {
    let end = id.iter().position(|&b| b == 0).unwrap_or(id.len());
    String::from_utf8_lossy(&id[..end]).to_string()
}
