//! Command engine: COMMAND_LONG request/ack with retries.
//!
//! At most one command is in flight per session. Further submissions queue
//! FIFO and are promoted when the slot frees up: eagerly on completion, and
//! by the periodic `do_work` pump the session drives. Never by preemption.
//!
//! Per in-flight command the engine arms one one-shot timer. An ack and the
//! timer firing race; whichever takes the slot first wins and the loser is
//! a no-op. Retries rebuild and resend the same COMMAND_LONG and re-arm the
//! timer, at most `retries` times after the initial transmission.
//!
//! User callbacks always run with the engine lock released: every transition
//! mutates state under the lock, records what to do, then acts after
//! unlocking.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mavlink::common::{MavCmd, MavMessage, MavResult, COMMAND_ACK_DATA, COMMAND_LONG_DATA};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::CommandResult;
use crate::session::port::EnginePort;
use crate::scheduler::TimerCookie;

/// Component id of the autopilot, the default command target.
pub const DEFAULT_COMPONENT_ID_AUTOPILOT: u8 = 1;

/// Delivered once per `InProgress` ack and exactly once with a terminal
/// result.
pub type CommandCallback = Arc<dyn Fn(CommandResult) + Send + Sync>;

struct Work {
    command: MavCmd,
    params: [f32; 7],
    target_component: u8,
    retries_left: u8,
    timeout: Duration,
    callback: CommandCallback,
}

struct InFlight {
    work: Work,
    cookie: TimerCookie,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Work>,
    current: Option<InFlight>,
}

pub(crate) struct CommandEngine {
    port: Arc<dyn EnginePort>,
    default_retries: u8,
    default_timeout: Duration,
    inner: Mutex<Inner>,
    self_ref: Weak<CommandEngine>,
}

impl CommandEngine {
    pub fn new(port: Arc<dyn EnginePort>, default_retries: u8, default_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            port,
            default_retries,
            default_timeout,
            inner: Mutex::new(Inner::default()),
            self_ref: self_ref.clone(),
        })
    }

    /// Submit a command and return immediately; `callback` receives any
    /// number of `InProgress` deliveries and exactly one terminal result.
    pub fn send_with_ack_async(
        &self,
        command: MavCmd,
        params: [f32; 7],
        target_component: u8,
        callback: CommandCallback,
    ) {
        if self.port.target_ids().is_none() {
            callback(CommandResult::NoDevice);
            return;
        }

        self.inner.lock().queue.push_back(Work {
            command,
            params,
            target_component,
            retries_left: self.default_retries,
            timeout: self.default_timeout,
            callback,
        });
        self.do_work();
    }

    /// Blocking form: submit and wait for the terminal result.
    pub fn send_with_ack(&self, command: MavCmd, params: [f32; 7], target_component: u8) -> CommandResult {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send_with_ack_async(
            command,
            params,
            target_component,
            Arc::new(move |result| {
                if result.is_terminal() {
                    let _ = tx.try_send(result);
                }
            }),
        );
        rx.recv().unwrap_or(CommandResult::ConnectionError)
    }

    /// Promote the queue head into the free in-flight slot.
    ///
    /// Called on submission and completion, and periodically by the session
    /// as a pump.
    pub fn do_work(&self) {
        let message = {
            let mut inner = self.inner.lock();
            if inner.current.is_some() {
                return;
            }
            let Some(work) = inner.queue.pop_front() else {
                return;
            };

            let Some(message) = self.build_command(&work) else {
                drop(inner);
                (work.callback)(CommandResult::NoDevice);
                return self.do_work();
            };

            let cookie = self.arm_timer(work.timeout);
            inner.current = Some(InFlight { work, cookie });
            message
        };

        self.transmit(&message);
    }

    /// Feed a received COMMAND_ACK into the state machine.
    pub fn handle_command_ack(&self, ack: &COMMAND_ACK_DATA) {
        enum After {
            Terminal(CommandCallback, TimerCookie, CommandResult),
            Progress(CommandCallback, TimerCookie, f32),
        }

        let after = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(current) = inner.current.as_ref() else {
                debug!(command = ?ack.command, "ack with no command in flight");
                return;
            };
            if current.work.command != ack.command {
                warn!(
                    expected = ?current.work.command,
                    got = ?ack.command,
                    "ack for a different command, ignoring"
                );
                return;
            }
            let callback = Arc::clone(&current.work.callback);
            let cookie = current.cookie;

            match ack.result {
                MavResult::MAV_RESULT_ACCEPTED => {
                    inner.current = None;
                    After::Terminal(callback, cookie, CommandResult::Success)
                }
                MavResult::MAV_RESULT_IN_PROGRESS => {
                    After::Progress(callback, cookie, ack.progress as f32)
                }
                MavResult::MAV_RESULT_TEMPORARILY_REJECTED => {
                    After::Progress(callback, cookie, f32::NAN)
                }
                // DENIED, UNSUPPORTED, FAILED and anything newer.
                rejected => {
                    warn!(command = ?ack.command, result = ?rejected, "command rejected");
                    inner.current = None;
                    After::Terminal(callback, cookie, CommandResult::CommandDenied)
                }
            }
        };

        match after {
            After::Terminal(callback, cookie, result) => {
                self.port.unregister_timeout(cookie);
                callback(result);
                self.do_work();
            }
            After::Progress(callback, cookie, progress) => {
                // Still being worked on; give it more time.
                self.port.refresh_timeout(cookie);
                callback(CommandResult::InProgress(progress));
            }
        }
    }

    /// The retry timer fired for the in-flight command.
    fn handle_timeout(&self) {
        enum After {
            Retransmit(MavMessage),
            Fail(CommandCallback),
        }

        let after = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(current) = inner.current.as_mut() else {
                // The ack won the race; nothing to do.
                return;
            };

            if current.work.retries_left > 0 {
                current.work.retries_left -= 1;
                warn!(
                    command = ?current.work.command,
                    retries_left = current.work.retries_left,
                    "command ack timed out, retrying"
                );
                match self.build_command(&current.work) {
                    Some(message) => {
                        // The one-shot expired; arm a fresh deadline.
                        current.cookie = self.arm_timer(current.work.timeout);
                        After::Retransmit(message)
                    }
                    None => {
                        let callback = Arc::clone(&current.work.callback);
                        inner.current = None;
                        After::Fail(callback)
                    }
                }
            } else {
                warn!(command = ?current.work.command, "command timed out, no retries left");
                let callback = Arc::clone(&current.work.callback);
                inner.current = None;
                After::Fail(callback)
            }
        };

        match after {
            After::Retransmit(message) => self.transmit(&message),
            After::Fail(callback) => {
                callback(CommandResult::Timeout);
                self.do_work();
            }
        }
    }

    fn transmit(&self, message: &MavMessage) {
        if self.port.send_message(message).is_ok() {
            return;
        }
        // The link rejected the send; resolve the in-flight command.
        let taken = self.inner.lock().current.take();
        if let Some(current) = taken {
            self.port.unregister_timeout(current.cookie);
            (current.work.callback)(CommandResult::ConnectionError);
            self.do_work();
        }
    }

    fn arm_timer(&self, timeout: Duration) -> TimerCookie {
        let engine = self.self_ref.clone();
        self.port.register_timeout(
            Arc::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.handle_timeout();
                }
            }),
            timeout,
        )
    }

    fn build_command(&self, work: &Work) -> Option<MavMessage> {
        let (target_system, _) = self.port.target_ids()?;
        Some(MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system,
            target_component: work.target_component,
            command: work.command,
            confirmation: 0,
            param1: work.params[0],
            param2: work.params[1],
            param3: work.params[2],
            param4: work.params[3],
            param5: work.params[4],
            param6: work.params[5],
            param7: work.params[6],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::port::testutil::RecordingPort;
    use std::thread;

    const PARAMS: [f32; 7] = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

    fn engine_with(port: &Arc<RecordingPort>, retries: u8, timeout_ms: u64) -> Arc<CommandEngine> {
        CommandEngine::new(
            Arc::clone(port) as Arc<dyn EnginePort>,
            retries,
            Duration::from_millis(timeout_ms),
        )
    }

    fn collecting_callback() -> (CommandCallback, Arc<Mutex<Vec<CommandResult>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        (Arc::new(move |r| sink.lock().push(r)), results)
    }

    fn ack(command: MavCmd, result: MavResult) -> COMMAND_ACK_DATA {
        COMMAND_ACK_DATA {
            command,
            result,
            progress: 0,
            result_param2: 0,
            target_system: 245,
            target_component: 190,
        }
    }

    #[test]
    fn test_accepted_ack_resolves_success() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 3, 500);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);
        assert_eq!(port.sent_count(), 1);

        engine.handle_command_ack(&ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_ACCEPTED,
        ));
        assert_eq!(*results.lock(), vec![CommandResult::Success]);
        // Exactly one transmission, no retries.
        assert_eq!(port.sent_count(), 1);
    }

    #[test]
    fn test_denied_ack_resolves_command_denied() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 3, 500);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);
        engine.handle_command_ack(&ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_DENIED,
        ));
        assert_eq!(*results.lock(), vec![CommandResult::CommandDenied]);
    }

    #[test]
    fn test_single_flight_serializes_submissions() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 3, 500);
        let (cb1, results1) = collecting_callback();
        let (cb2, results2) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, cb1);
        engine.send_with_ack_async(MavCmd::MAV_CMD_NAV_TAKEOFF, PARAMS, 1, cb2);

        // Only the first is transmitted until it resolves.
        assert_eq!(port.sent_count(), 1);
        assert!(results2.lock().is_empty());

        engine.handle_command_ack(&ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_ACCEPTED,
        ));
        assert_eq!(*results1.lock(), vec![CommandResult::Success]);

        // Completion promoted the queued command.
        assert_eq!(port.sent_count(), 2);
        engine.handle_command_ack(&ack(MavCmd::MAV_CMD_NAV_TAKEOFF, MavResult::MAV_RESULT_ACCEPTED));
        assert_eq!(*results2.lock(), vec![CommandResult::Success]);
    }

    #[test]
    fn test_timeout_retries_then_fails() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 2, 30);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);

        thread::sleep(Duration::from_millis(200));
        // Initial + 2 retries.
        assert_eq!(port.sent_count(), 3);
        assert_eq!(*results.lock(), vec![CommandResult::Timeout]);
    }

    #[test]
    fn test_zero_retries_times_out_after_one_transmission() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 0, 30);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);

        thread::sleep(Duration::from_millis(120));
        assert_eq!(port.sent_count(), 1);
        assert_eq!(*results.lock(), vec![CommandResult::Timeout]);
    }

    #[test]
    fn test_ack_after_retry_resolves() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 3, 40);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);

        // Let at least one retry happen, then ack.
        thread::sleep(Duration::from_millis(100));
        assert!(port.sent_count() >= 2);
        engine.handle_command_ack(&ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_ACCEPTED,
        ));

        thread::sleep(Duration::from_millis(100));
        let results = results.lock();
        assert_eq!(*results, vec![CommandResult::Success]);
    }

    #[test]
    fn test_in_progress_refreshes_and_keeps_slot() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 3, 60);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);

        let mut in_progress = ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_IN_PROGRESS,
        );
        in_progress.progress = 42;
        engine.handle_command_ack(&in_progress);

        assert_eq!(*results.lock(), vec![CommandResult::InProgress(42.0)]);

        engine.handle_command_ack(&ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_ACCEPTED,
        ));
        assert_eq!(
            *results.lock(),
            vec![CommandResult::InProgress(42.0), CommandResult::Success]
        );
        // No retransmission happened in between.
        assert_eq!(port.sent_count(), 1);
    }

    #[test]
    fn test_no_device_before_discovery() {
        let port = Arc::new(RecordingPort::undiscovered());
        let engine = engine_with(&port, 3, 500);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);
        assert_eq!(*results.lock(), vec![CommandResult::NoDevice]);
        assert_eq!(port.sent_count(), 0);
    }

    #[test]
    fn test_send_failure_resolves_connection_error() {
        let port = Arc::new(RecordingPort::new());
        *port.fail_sends.lock() = true;
        let engine = engine_with(&port, 3, 500);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);
        assert_eq!(*results.lock(), vec![CommandResult::ConnectionError]);
    }

    #[test]
    fn test_ack_for_other_command_is_ignored() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 3, 500);
        let (callback, results) = collecting_callback();

        engine.send_with_ack_async(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1, callback);
        engine.handle_command_ack(&ack(MavCmd::MAV_CMD_NAV_TAKEOFF, MavResult::MAV_RESULT_ACCEPTED));
        assert!(results.lock().is_empty());

        engine.handle_command_ack(&ack(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            MavResult::MAV_RESULT_ACCEPTED,
        ));
        assert_eq!(*results.lock(), vec![CommandResult::Success]);
    }

    #[test]
    fn test_blocking_form_returns_terminal_result() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 3, 500);

        let ack_engine = Arc::clone(&engine);
        let acker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            ack_engine.handle_command_ack(&ack(
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                MavResult::MAV_RESULT_ACCEPTED,
            ));
        });

        let result = engine.send_with_ack(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, PARAMS, 1);
        assert_eq!(result, CommandResult::Success);
        acker.join().unwrap();
    }
}
