//! MAVLink message router.
//!
//! Maps message ids to ordered handler lists and dispatches every inbound
//! message to the handlers registered for its id. Handlers belong to an
//! owner token so a capability can bulk-remove its registrations when it
//! detaches.
//!
//! Dispatch runs on the receive thread only. It iterates over a snapshot of
//! the handler list, so a handler that registers or unregisters during
//! dispatch affects subsequent dispatches, never the one in progress, with
//! one exception: each entry's presence is re-checked right before its
//! callback runs, so nothing is invoked after its owner unregistered.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mavlink::common::MavMessage;
use mavlink::{MavHeader, Message};
use parking_lot::Mutex;
use tracing::{error, trace};

/// Opaque identity scoping a set of handler registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerOwner(u64);

impl HandlerOwner {
    /// Mint a fresh owner token.
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandlerOwner {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler invoked on the receive thread for each matching message.
pub type MessageHandler = Arc<dyn Fn(&MavHeader, &MavMessage) + Send + Sync>;

struct Registration {
    id: u64,
    owner: HandlerOwner,
    callback: MessageHandler,
}

#[derive(Default)]
struct Table {
    by_message: HashMap<u32, Vec<Registration>>,
    next_id: u64,
}

/// Demultiplexes inbound messages to registered handlers.
#[derive(Default)]
pub struct MessageRouter {
    table: Mutex<Table>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `message_id` under `owner`. Insertion order
    /// within a message id is preserved for dispatch.
    pub fn register(&self, message_id: u32, callback: MessageHandler, owner: HandlerOwner) {
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.by_message.entry(message_id).or_default().push(Registration {
            id,
            owner,
            callback,
        });
    }

    /// Remove every registration whose owner matches, across all message ids.
    pub fn unregister_all(&self, owner: HandlerOwner) {
        let mut table = self.table.lock();
        for registrations in table.by_message.values_mut() {
            registrations.retain(|r| r.owner != owner);
        }
        table.by_message.retain(|_, registrations| !registrations.is_empty());
    }

    /// Invoke every handler registered for the message's id, in insertion
    /// order. Handler panics are caught and logged; dispatch continues.
    pub fn dispatch(&self, header: &MavHeader, message: &MavMessage) {
        let message_id = message.message_id();

        let snapshot: Vec<(u64, MessageHandler)> = {
            let table = self.table.lock();
            match table.by_message.get(&message_id) {
                Some(registrations) => registrations
                    .iter()
                    .map(|r| (r.id, Arc::clone(&r.callback)))
                    .collect(),
                None => {
                    trace!(message_id, "no handler registered");
                    return;
                }
            }
        };

        for (id, callback) in snapshot {
            let still_registered = {
                let table = self.table.lock();
                table
                    .by_message
                    .get(&message_id)
                    .is_some_and(|registrations| registrations.iter().any(|r| r.id == id))
            };
            if !still_registered {
                continue;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| callback(header, message))).is_err() {
                error!(message_id, "message handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        MavAutopilot, MavModeFlag, MavState, MavType, HEARTBEAT_DATA, MISSION_ITEM_REACHED_DATA,
    };

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    fn header() -> MavHeader {
        MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        }
    }

    #[test]
    fn test_dispatch_in_insertion_order() {
        let router = MessageRouter::new();
        let owner = HandlerOwner::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in [1u32, 2, 3] {
            let order = Arc::clone(&order);
            router.register(0, Arc::new(move |_, _| order.lock().push(label)), owner);
        }

        router.dispatch(&header(), &heartbeat());
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dispatch_only_matching_id() {
        let router = MessageRouter::new();
        let owner = HandlerOwner::new();
        let count = Arc::new(Mutex::new(0));

        let hits = Arc::clone(&count);
        router.register(46, Arc::new(move |_, _| *hits.lock() += 1), owner);

        router.dispatch(&header(), &heartbeat());
        assert_eq!(*count.lock(), 0);

        let reached = MavMessage::MISSION_ITEM_REACHED(MISSION_ITEM_REACHED_DATA { seq: 4 });
        router.dispatch(&header(), &reached);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_unregister_all_removes_every_owner_entry() {
        let router = MessageRouter::new();
        let owner_a = HandlerOwner::new();
        let owner_b = HandlerOwner::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for (message_id, owner, label) in [(0u32, owner_a, "a0"), (46, owner_a, "a46"), (0, owner_b, "b0")] {
            let calls = Arc::clone(&calls);
            router.register(message_id, Arc::new(move |_, _| calls.lock().push(label)), owner);
        }

        router.unregister_all(owner_a);
        router.dispatch(&header(), &heartbeat());
        router.dispatch(
            &header(),
            &MavMessage::MISSION_ITEM_REACHED(MISSION_ITEM_REACHED_DATA { seq: 0 }),
        );
        assert_eq!(*calls.lock(), vec!["b0"]);
    }

    #[test]
    fn test_register_during_dispatch_applies_next_time() {
        let router = Arc::new(MessageRouter::new());
        let owner = HandlerOwner::new();
        let calls = Arc::new(Mutex::new(0u32));

        let inner_router = Arc::clone(&router);
        let inner_calls = Arc::clone(&calls);
        router.register(
            0,
            Arc::new(move |_, _| {
                let calls = Arc::clone(&inner_calls);
                inner_router.register(0, Arc::new(move |_, _| *calls.lock() += 1), owner);
            }),
            owner,
        );

        router.dispatch(&header(), &heartbeat());
        assert_eq!(*calls.lock(), 0, "handler registered mid-dispatch must not run");

        router.dispatch(&header(), &heartbeat());
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn test_unregister_during_dispatch_suppresses_pending_handler() {
        let router = Arc::new(MessageRouter::new());
        let owner_a = HandlerOwner::new();
        let owner_b = HandlerOwner::new();
        let calls = Arc::new(Mutex::new(0u32));

        let inner_router = Arc::clone(&router);
        router.register(0, Arc::new(move |_, _| inner_router.unregister_all(owner_b)), owner_a);

        let b_calls = Arc::clone(&calls);
        router.register(0, Arc::new(move |_, _| *b_calls.lock() += 1), owner_b);

        router.dispatch(&header(), &heartbeat());
        assert_eq!(*calls.lock(), 0, "unregistered handler must not be invoked");
    }

    #[test]
    fn test_handler_panic_does_not_stop_dispatch() {
        let router = MessageRouter::new();
        let owner = HandlerOwner::new();
        let calls = Arc::new(Mutex::new(0u32));

        router.register(0, Arc::new(|_, _| panic!("boom")), owner);
        let after = Arc::clone(&calls);
        router.register(0, Arc::new(move |_, _| *after.lock() += 1), owner);

        router.dispatch(&header(), &heartbeat());
        assert_eq!(*calls.lock(), 1);
    }
}
