//! Mission transfer engine.
//!
//! Upload (count → request-int → item-int… → ack) and download
//! (request-list → count → request-int… → ack) state machines sharing one
//! activity slot, so at most one of upload / download / set-current runs at
//! a time. Vehicles speaking the older non-int item protocol are nacked
//! with `UNSUPPORTED` to force the int variant.
//!
//! Each activity arms one inactivity timer which every inbound protocol
//! message refreshes; when it fires the slot is cleared and `Timeout`
//! reported. Progress (`MISSION_CURRENT` / `MISSION_ITEM_REACHED`) is
//! tracked independently of the slot and reported in logical item indices
//! through the wire→logical index map. Whether a mission has finished is
//! decided from the reached counter, because current wraps back to 0 at
//! completion.

pub mod item;
pub(crate) mod transfer;

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mavlink::common::{
    MavMessage, MavMissionResult, MavMissionType, MISSION_ACK_DATA, MISSION_COUNT_DATA,
    MISSION_CURRENT_DATA, MISSION_ITEM_INT_DATA, MISSION_ITEM_REACHED_DATA,
    MISSION_REQUEST_INT_DATA, MISSION_REQUEST_LIST_DATA, MISSION_SET_CURRENT_DATA,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::MissionError;
use crate::mission::item::MissionItem;
use crate::mission::transfer::{assemble_mission, expand_mission};
use crate::scheduler::TimerCookie;
use crate::session::port::EnginePort;

pub type MissionResultCallback = Box<dyn FnOnce(Result<(), MissionError>) + Send>;
pub type MissionDownloadCallback = Box<dyn FnOnce(Result<Vec<MissionItem>, MissionError>) + Send>;
pub type MissionProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

enum Activity {
    None,
    Upload {
        callback: MissionResultCallback,
    },
    Download {
        expected: Option<u16>,
        items: Vec<MISSION_ITEM_INT_DATA>,
        callback: MissionDownloadCallback,
    },
    SetCurrent {
        wire_seq: u16,
        callback: MissionResultCallback,
    },
}

struct Inner {
    activity: Activity,
    cookie: Option<TimerCookie>,
    /// Wire items of the last completed upload or download; request replies
    /// and the finished calculation read these.
    wire_items: Vec<MISSION_ITEM_INT_DATA>,
    index_map: BTreeMap<u16, usize>,
    total_logical: usize,
    last_current: Option<u16>,
    last_reached: Option<u16>,
    progress_callback: Option<MissionProgressCallback>,
}

pub struct MissionEngine {
    port: Arc<dyn EnginePort>,
    timeout: Duration,
    inner: Mutex<Inner>,
    self_ref: Weak<MissionEngine>,
}

impl MissionEngine {
    pub(crate) fn new(port: Arc<dyn EnginePort>, timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            port,
            timeout,
            inner: Mutex::new(Inner {
                activity: Activity::None,
                cookie: None,
                wire_items: Vec::new(),
                index_map: BTreeMap::new(),
                total_logical: 0,
                last_current: None,
                last_reached: None,
                progress_callback: None,
            }),
            self_ref: self_ref.clone(),
        })
    }

    // -- Upload --

    /// Send `items` to the vehicle. `callback` resolves exactly once.
    pub fn upload_mission_async(&self, items: Vec<MissionItem>, callback: MissionResultCallback) {
        let Some(target) = self.port.target_ids() else {
            callback(Err(MissionError::NoDevice));
            return;
        };
        if !self.port.target_supports_mission_int() {
            warn!("mission int messages not supported by vehicle");
            callback(Err(MissionError::Error));
            return;
        }

        let message = {
            let mut inner = self.inner.lock();
            if !matches!(inner.activity, Activity::None) {
                drop(inner);
                callback(Err(MissionError::Busy));
                return;
            }

            let plan = expand_mission(&items, target);
            let count = plan.items.len() as u16;
            inner.wire_items = plan.items;
            inner.index_map = plan.index_map;
            inner.total_logical = items.len();
            inner.activity = Activity::Upload { callback };
            inner.cookie = Some(self.arm_timer());

            MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                target_system: target.0,
                target_component: target.1,
                count,
                mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
                opaque_id: 0,
            })
        };

        self.transmit(&message);
    }

    /// Blocking form of [`MissionEngine::upload_mission_async`].
    pub fn upload_mission(&self, items: Vec<MissionItem>) -> Result<(), MissionError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.upload_mission_async(items, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap_or(Err(MissionError::ConnectionError))
    }

    // -- Download --

    /// Fetch the mission stored on the vehicle. `callback` resolves exactly
    /// once with the assembled logical items.
    pub fn download_mission_async(&self, callback: MissionDownloadCallback) {
        let Some(target) = self.port.target_ids() else {
            callback(Err(MissionError::NoDevice));
            return;
        };

        let message = {
            let mut inner = self.inner.lock();
            if !matches!(inner.activity, Activity::None) {
                drop(inner);
                callback(Err(MissionError::Busy));
                return;
            }

            inner.activity = Activity::Download {
                expected: None,
                items: Vec::new(),
                callback,
            };
            inner.cookie = Some(self.arm_timer());

            MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
                target_system: target.0,
                target_component: target.1,
                mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
            })
        };

        self.transmit(&message);
    }

    /// Blocking form of [`MissionEngine::download_mission_async`].
    pub fn download_mission(&self) -> Result<Vec<MissionItem>, MissionError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.download_mission_async(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap_or(Err(MissionError::ConnectionError))
    }

    // -- Set current --

    /// Make the vehicle jump to the given logical item. Resolves when the
    /// vehicle reports the matching `MISSION_CURRENT`.
    pub fn set_current_mission_item_async(&self, index: usize, callback: MissionResultCallback) {
        let Some(target) = self.port.target_ids() else {
            callback(Err(MissionError::NoDevice));
            return;
        };

        let message = {
            let mut inner = self.inner.lock();
            if !matches!(inner.activity, Activity::None) {
                drop(inner);
                callback(Err(MissionError::Busy));
                return;
            }

            // The first wire item mapping to this logical item.
            let Some(wire_seq) = inner
                .index_map
                .iter()
                .find(|(_, &logical)| logical == index)
                .map(|(&seq, _)| seq)
            else {
                drop(inner);
                callback(Err(MissionError::InvalidArgument));
                return;
            };

            inner.activity = Activity::SetCurrent { wire_seq, callback };
            inner.cookie = Some(self.arm_timer());

            MavMessage::MISSION_SET_CURRENT(MISSION_SET_CURRENT_DATA {
                target_system: target.0,
                target_component: target.1,
                seq: wire_seq,
            })
        };

        self.transmit(&message);
    }

    /// Blocking form of [`MissionEngine::set_current_mission_item_async`].
    pub fn set_current_mission_item(&self, index: usize) -> Result<(), MissionError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.set_current_mission_item_async(index, Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap_or(Err(MissionError::ConnectionError))
    }

    // -- Progress --

    /// Subscribe to `(current_item, total_items)` updates in logical
    /// indices. Replaces any previous subscription.
    pub fn subscribe_progress<F>(&self, callback: F)
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.inner.lock().progress_callback = Some(Arc::new(callback));
    }

    /// Whether every wire item of the current mission has been reached.
    ///
    /// Decided from the reached counter: current is no help because it
    /// wraps to 0 once the last item is done.
    pub fn is_mission_finished(&self) -> bool {
        let inner = self.inner.lock();
        mission_finished(&inner)
    }

    /// `(current_item, total_items)` in logical indices. Current is 0 until
    /// the vehicle reports progress and equals the total once the mission
    /// finished.
    pub fn mission_progress(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let current = if mission_finished(&inner) {
            inner.total_logical
        } else {
            inner
                .last_current
                .and_then(|seq| inner.index_map.get(&seq).copied())
                .unwrap_or(0)
        };
        (current, inner.total_logical)
    }

    // -- Inbound protocol messages --

    /// Vehicle speaks the old item protocol; nack to force the int variant.
    pub(crate) fn handle_mission_request(&self, _data: &mavlink::common::MISSION_REQUEST_DATA) {
        let message = {
            let inner = self.inner.lock();
            if !matches!(inner.activity, Activity::Upload { .. }) {
                debug!("ignoring mission request, no upload active");
                return;
            }
            if let Some(cookie) = inner.cookie {
                self.port.refresh_timeout(cookie);
            }
            let Some(ack) = self.build_ack(MavMissionResult::MAV_MISSION_UNSUPPORTED) else {
                return;
            };
            ack
        };
        self.transmit(&message);
    }

    pub(crate) fn handle_mission_request_int(&self, data: &MISSION_REQUEST_INT_DATA) {
        let message = {
            let inner = self.inner.lock();
            if !matches!(inner.activity, Activity::Upload { .. }) {
                debug!("ignoring mission request int, no upload active");
                return;
            }
            let Some(item) = inner.wire_items.get(data.seq as usize) else {
                warn!(seq = data.seq, "mission item requested out of bounds");
                return;
            };
            debug!(seq = data.seq, "sending mission item");
            if let Some(cookie) = inner.cookie {
                self.port.refresh_timeout(cookie);
            }
            MavMessage::MISSION_ITEM_INT(item.clone())
        };
        self.transmit(&message);
    }

    pub(crate) fn handle_mission_ack(&self, data: &MISSION_ACK_DATA) {
        let (cookie, activity, result) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.activity, Activity::Upload { .. }) {
                debug!("ignoring mission ack, no upload active");
                return;
            }
            let cookie = inner.cookie.take();
            let activity = mem::replace(&mut inner.activity, Activity::None);
            let result = match data.mavtype {
                MavMissionResult::MAV_MISSION_ACCEPTED => {
                    // Forget stale progress from an earlier mission.
                    inner.last_current = None;
                    inner.last_reached = None;
                    debug!("mission accepted");
                    Ok(())
                }
                MavMissionResult::MAV_MISSION_NO_SPACE => {
                    warn!("vehicle storage exhausted, too many mission items");
                    Err(MissionError::TooManyItems)
                }
                other => {
                    warn!(ack = ?other, "mission upload failed");
                    Err(MissionError::Error)
                }
            };
            (cookie, activity, result)
        };

        if let Some(cookie) = cookie {
            self.port.unregister_timeout(cookie);
        }
        resolve_result(activity, result);
    }

    pub(crate) fn handle_mission_count(&self, data: &MISSION_COUNT_DATA) {
        enum After {
            RequestFirst(MavMessage),
            Empty {
                cookie: Option<TimerCookie>,
                activity: Activity,
                ack: Option<MavMessage>,
            },
        }

        let after = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &mut inner.activity {
                Activity::Download { expected, .. } => {
                    if data.count == 0 {
                        let cookie = inner.cookie.take();
                        let activity = mem::replace(&mut inner.activity, Activity::None);
                        After::Empty {
                            cookie,
                            activity,
                            ack: self.build_ack(MavMissionResult::MAV_MISSION_ACCEPTED),
                        }
                    } else {
                        debug!(count = data.count, "mission download counted");
                        *expected = Some(data.count);
                        if let Some(cookie) = inner.cookie {
                            self.port.refresh_timeout(cookie);
                        }
                        match self.build_request_int(0) {
                            Some(request) => After::RequestFirst(request),
                            None => return,
                        }
                    }
                }
                _ => {
                    debug!("ignoring mission count, no download active");
                    return;
                }
            }
        };

        match after {
            After::RequestFirst(message) => self.transmit(&message),
            After::Empty { cookie, activity, ack } => {
                if let Some(cookie) = cookie {
                    self.port.unregister_timeout(cookie);
                }
                if let Some(ack) = ack {
                    self.transmit(&ack);
                }
                resolve_download(activity, Err(MissionError::NoMissionAvailable));
            }
        }
    }

    pub(crate) fn handle_mission_item_int(&self, data: &MISSION_ITEM_INT_DATA) {
        enum After {
            RequestNext(MavMessage),
            Complete {
                cookie: Option<TimerCookie>,
                activity: Activity,
                ack: Option<MavMessage>,
                result: Result<Vec<MissionItem>, MissionError>,
            },
        }

        let after = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let complete = match &mut inner.activity {
                Activity::Download {
                    expected: Some(expected),
                    items,
                    ..
                } => {
                    debug!(seq = data.seq, "received mission item");
                    items.push(data.clone());
                    u32::from(data.seq) + 1 >= u32::from(*expected)
                }
                _ => {
                    debug!("ignoring mission item int, no download active");
                    return;
                }
            };

            if complete {
                let cookie = inner.cookie.take();
                let activity = mem::replace(&mut inner.activity, Activity::None);
                let downloaded = match &activity {
                    Activity::Download { items, .. } => items.clone(),
                    _ => Vec::new(),
                };
                let result = assemble_mission(&downloaded).map(|assembled| {
                    inner.index_map = assembled.index_map;
                    inner.total_logical = assembled.items.len();
                    inner.wire_items = downloaded;
                    assembled.items
                });
                After::Complete {
                    cookie,
                    activity,
                    ack: self.build_ack(MavMissionResult::MAV_MISSION_ACCEPTED),
                    result,
                }
            } else {
                if let Some(cookie) = inner.cookie {
                    self.port.refresh_timeout(cookie);
                }
                match self.build_request_int(data.seq + 1) {
                    Some(request) => After::RequestNext(request),
                    None => return,
                }
            }
        };

        match after {
            After::RequestNext(message) => self.transmit(&message),
            After::Complete {
                cookie,
                activity,
                ack,
                result,
            } => {
                if let Some(cookie) = cookie {
                    self.port.unregister_timeout(cookie);
                }
                if let Some(ack) = ack {
                    self.transmit(&ack);
                }
                match activity {
                    Activity::Download { callback, .. } => callback(result),
                    _ => {}
                }
            }
        }
    }

    pub(crate) fn handle_mission_current(&self, data: &MISSION_CURRENT_DATA) {
        let (progress, resolution) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let changed = inner.last_current != Some(data.seq);
            if changed {
                inner.last_current = Some(data.seq);
            }
            let progress = changed.then(|| progress_snapshot(inner)).flatten();

            let awaited = matches!(
                inner.activity,
                Activity::SetCurrent { wire_seq, .. } if wire_seq == data.seq
            );
            let resolution = if awaited {
                let cookie = inner.cookie.take();
                let activity = mem::replace(&mut inner.activity, Activity::None);
                inner.last_current = None;
                Some((cookie, activity))
            } else {
                None
            };
            (progress, resolution)
        };

        if let Some((cookie, activity)) = resolution {
            if let Some(cookie) = cookie {
                self.port.unregister_timeout(cookie);
            }
            resolve_result(activity, Ok(()));
        }
        if let Some((callback, current, total)) = progress {
            callback(current, total);
        }
    }

    pub(crate) fn handle_mission_item_reached(&self, data: &MISSION_ITEM_REACHED_DATA) {
        let progress = {
            let mut inner = self.inner.lock();
            if inner.last_reached == Some(data.seq) {
                return;
            }
            inner.last_reached = Some(data.seq);
            progress_snapshot(&inner)
        };

        if let Some((callback, current, total)) = progress {
            callback(current, total);
        }
    }

    // -- Internals --

    fn handle_timeout(&self) {
        let activity = {
            let mut inner = self.inner.lock();
            if matches!(inner.activity, Activity::None) {
                return;
            }
            warn!("mission operation timed out");
            inner.cookie = None;
            mem::replace(&mut inner.activity, Activity::None)
        };

        match activity {
            Activity::None => {}
            Activity::Upload { callback } | Activity::SetCurrent { callback, .. } => {
                callback(Err(MissionError::Timeout));
            }
            Activity::Download { callback, .. } => callback(Err(MissionError::Timeout)),
        }
    }

    fn transmit(&self, message: &MavMessage) {
        if self.port.send_message(message).is_ok() {
            return;
        }
        let (cookie, activity) = {
            let mut inner = self.inner.lock();
            (inner.cookie.take(), mem::replace(&mut inner.activity, Activity::None))
        };
        if let Some(cookie) = cookie {
            self.port.unregister_timeout(cookie);
        }
        match activity {
            Activity::None => {}
            Activity::Upload { callback } | Activity::SetCurrent { callback, .. } => {
                callback(Err(MissionError::ConnectionError));
            }
            Activity::Download { callback, .. } => callback(Err(MissionError::ConnectionError)),
        }
    }

    fn arm_timer(&self) -> TimerCookie {
        let engine = self.self_ref.clone();
        self.port.register_timeout(
            Arc::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.handle_timeout();
                }
            }),
            self.timeout,
        )
    }

    fn build_ack(&self, result: MavMissionResult) -> Option<MavMessage> {
        let (target_system, target_component) = self.port.target_ids()?;
        Some(MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system,
            target_component,
            mavtype: result,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
            opaque_id: 0,
        }))
    }

    fn build_request_int(&self, seq: u16) -> Option<MavMessage> {
        let (target_system, target_component) = self.port.target_ids()?;
        Some(MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            target_system,
            target_component,
            seq,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        }))
    }
}

fn mission_finished(inner: &Inner) -> bool {
    let (Some(_), Some(reached)) = (inner.last_current, inner.last_reached) else {
        return false;
    };
    !inner.wire_items.is_empty() && usize::from(reached) + 1 == inner.wire_items.len()
}

fn progress_snapshot(inner: &Inner) -> Option<(MissionProgressCallback, usize, usize)> {
    let callback = inner.progress_callback.clone()?;
    let current = if mission_finished(inner) {
        inner.total_logical
    } else {
        inner
            .last_current
            .and_then(|seq| inner.index_map.get(&seq).copied())?
    };
    Some((callback, current, inner.total_logical))
}

fn resolve_result(activity: Activity, result: Result<(), MissionError>) {
    match activity {
        Activity::Upload { callback } | Activity::SetCurrent { callback, .. } => callback(result),
        Activity::Download { callback, .. } => callback(result.map(|_| Vec::new())),
        Activity::None => {}
    }
}

fn resolve_download(activity: Activity, result: Result<Vec<MissionItem>, MissionError>) {
    match activity {
        Activity::Download { callback, .. } => callback(result),
        Activity::Upload { callback } | Activity::SetCurrent { callback, .. } => {
            callback(result.map(|_| ()));
        }
        Activity::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::item::CameraAction;
    use crate::session::port::testutil::RecordingPort;
    use std::thread;
    use std::time::Duration;

    fn engine_with(port: &Arc<RecordingPort>, timeout_ms: u64) -> Arc<MissionEngine> {
        MissionEngine::new(
            Arc::clone(port) as Arc<dyn EnginePort>,
            Duration::from_millis(timeout_ms),
        )
    }

    fn photo_mission() -> Vec<MissionItem> {
        vec![
            MissionItem {
                camera_action: Some(CameraAction::TakePhoto),
                ..MissionItem::at(47.3977, 8.5456, 10.0)
            },
            MissionItem::at(47.3980, 8.5460, 10.0),
        ]
    }

    fn request_int(seq: u16) -> MISSION_REQUEST_INT_DATA {
        MISSION_REQUEST_INT_DATA {
            target_system: 245,
            target_component: 190,
            seq,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        }
    }

    fn ack(result: MavMissionResult) -> MISSION_ACK_DATA {
        MISSION_ACK_DATA {
            target_system: 245,
            target_component: 190,
            mavtype: result,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
            opaque_id: 0,
        }
    }

    fn collecting_result() -> (MissionResultCallback, Arc<Mutex<Vec<Result<(), MissionError>>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        (Box::new(move |r| sink.lock().push(r)), results)
    }

    #[test]
    fn test_upload_flow() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);
        let (callback, results) = collecting_result();

        engine.upload_mission_async(photo_mission(), callback);

        // 1. MISSION_COUNT with the expanded item count.
        match &port.sent_messages()[0] {
            MavMessage::MISSION_COUNT(data) => assert_eq!(data.count, 3),
            other => panic!("expected MISSION_COUNT, got {other:?}"),
        }

        // 2. Vehicle requests every item in turn.
        for seq in 0..3u16 {
            engine.handle_mission_request_int(&request_int(seq));
            match port.sent_messages().last() {
                Some(MavMessage::MISSION_ITEM_INT(data)) => assert_eq!(data.seq, seq),
                other => panic!("expected MISSION_ITEM_INT, got {other:?}"),
            }
        }

        // 3. Final ack resolves the upload.
        assert!(results.lock().is_empty());
        engine.handle_mission_ack(&ack(MavMissionResult::MAV_MISSION_ACCEPTED));
        assert_eq!(*results.lock(), vec![Ok(())]);
    }

    #[test]
    fn test_upload_zero_items() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);
        let (callback, results) = collecting_result();

        engine.upload_mission_async(Vec::new(), callback);
        match &port.sent_messages()[0] {
            MavMessage::MISSION_COUNT(data) => assert_eq!(data.count, 0),
            other => panic!("expected MISSION_COUNT, got {other:?}"),
        }

        engine.handle_mission_ack(&ack(MavMissionResult::MAV_MISSION_ACCEPTED));
        assert_eq!(*results.lock(), vec![Ok(())]);
    }

    #[test]
    fn test_upload_busy_while_active() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);
        let (first, _first_results) = collecting_result();
        let (second, second_results) = collecting_result();

        engine.upload_mission_async(photo_mission(), first);
        engine.upload_mission_async(photo_mission(), second);
        assert_eq!(*second_results.lock(), vec![Err(MissionError::Busy)]);
    }

    #[test]
    fn test_upload_no_space_reports_too_many_items() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);
        let (callback, results) = collecting_result();

        engine.upload_mission_async(photo_mission(), callback);
        engine.handle_mission_ack(&ack(MavMissionResult::MAV_MISSION_NO_SPACE));
        assert_eq!(*results.lock(), vec![Err(MissionError::TooManyItems)]);
    }

    #[test]
    fn test_upload_nacks_non_int_request() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);
        let (callback, _results) = collecting_result();

        engine.upload_mission_async(photo_mission(), callback);
        engine.handle_mission_request(&mavlink::common::MISSION_REQUEST_DATA {
            target_system: 245,
            target_component: 190,
            seq: 0,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        });

        match port.sent_messages().last() {
            Some(MavMessage::MISSION_ACK(data)) => {
                assert_eq!(data.mavtype, MavMissionResult::MAV_MISSION_UNSUPPORTED);
            }
            other => panic!("expected MISSION_ACK, got {other:?}"),
        }
    }

    #[test]
    fn test_upload_timeout() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 40);
        let (callback, results) = collecting_result();

        engine.upload_mission_async(photo_mission(), callback);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(*results.lock(), vec![Err(MissionError::Timeout)]);
    }

    #[test]
    fn test_upload_requires_mission_int_support() {
        let port = Arc::new(RecordingPort::new());
        *port.supports_mission_int.lock() = false;
        let engine = engine_with(&port, 1_000);
        let (callback, results) = collecting_result();

        engine.upload_mission_async(photo_mission(), callback);
        assert_eq!(*results.lock(), vec![Err(MissionError::Error)]);
        assert_eq!(port.sent_count(), 0);
    }

    #[test]
    fn test_download_flow_roundtrips_upload() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);

        // Stage the wire items by uploading first.
        let (upload_cb, _upload_results) = collecting_result();
        engine.upload_mission_async(photo_mission(), upload_cb);
        let wire: Vec<MISSION_ITEM_INT_DATA> = {
            let mut wire = Vec::new();
            for seq in 0..3u16 {
                engine.handle_mission_request_int(&request_int(seq));
                match port.sent_messages().last() {
                    Some(MavMessage::MISSION_ITEM_INT(data)) => wire.push(data.clone()),
                    other => panic!("expected MISSION_ITEM_INT, got {other:?}"),
                }
            }
            wire
        };
        engine.handle_mission_ack(&ack(MavMissionResult::MAV_MISSION_ACCEPTED));

        // Download: the engine walks request-list → count → items → ack.
        let downloads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&downloads);
        engine.download_mission_async(Box::new(move |r| sink.lock().push(r)));

        assert!(matches!(
            port.sent_messages().last(),
            Some(MavMessage::MISSION_REQUEST_LIST(_))
        ));

        engine.handle_mission_count(&MISSION_COUNT_DATA {
            target_system: 245,
            target_component: 190,
            count: 3,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
            opaque_id: 0,
        });

        for item in &wire {
            match port.sent_messages().last() {
                Some(MavMessage::MISSION_REQUEST_INT(data)) => assert_eq!(data.seq, item.seq),
                other => panic!("expected MISSION_REQUEST_INT, got {other:?}"),
            }
            engine.handle_mission_item_int(item);
        }

        // The engine acked the transfer and assembled the logical mission.
        assert!(matches!(
            port.sent_messages().last(),
            Some(MavMessage::MISSION_ACK(_))
        ));
        let downloads = downloads.lock();
        assert_eq!(downloads.len(), 1);
        let downloaded = downloads[0].as_ref().unwrap();
        assert_eq!(*downloaded, photo_mission());
    }

    #[test]
    fn test_download_zero_items_reports_no_mission() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);
        let downloads = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&downloads);
        engine.download_mission_async(Box::new(move |r| sink.lock().push(r)));
        engine.handle_mission_count(&MISSION_COUNT_DATA {
            target_system: 245,
            target_component: 190,
            count: 0,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
            opaque_id: 0,
        });

        assert_eq!(*downloads.lock(), vec![Err(MissionError::NoMissionAvailable)]);
        assert!(matches!(
            port.sent_messages().last(),
            Some(MavMessage::MISSION_ACK(_))
        ));
    }

    #[test]
    fn test_set_current_resolves_on_matching_current() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);

        let (upload_cb, _r) = collecting_result();
        engine.upload_mission_async(photo_mission(), upload_cb);
        engine.handle_mission_ack(&ack(MavMissionResult::MAV_MISSION_ACCEPTED));

        let (callback, results) = collecting_result();
        engine.set_current_mission_item_async(1, callback);

        // Logical item 1 starts at wire seq 2 (waypoint, photo, waypoint).
        match port.sent_messages().last() {
            Some(MavMessage::MISSION_SET_CURRENT(data)) => assert_eq!(data.seq, 2),
            other => panic!("expected MISSION_SET_CURRENT, got {other:?}"),
        }

        // A current report for a different seq does not resolve.
        engine.handle_mission_current(&MISSION_CURRENT_DATA {
            seq: 0,
            ..Default::default()
        });
        assert!(results.lock().is_empty());

        engine.handle_mission_current(&MISSION_CURRENT_DATA {
            seq: 2,
            ..Default::default()
        });
        assert_eq!(*results.lock(), vec![Ok(())]);
    }

    #[test]
    fn test_set_current_unknown_index_is_invalid() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);
        let (callback, results) = collecting_result();

        engine.set_current_mission_item_async(7, callback);
        assert_eq!(*results.lock(), vec![Err(MissionError::InvalidArgument)]);
    }

    #[test]
    fn test_progress_reports_logical_indices() {
        let port = Arc::new(RecordingPort::new());
        let engine = engine_with(&port, 1_000);

        let (upload_cb, _r) = collecting_result();
        engine.upload_mission_async(photo_mission(), upload_cb);
        engine.handle_mission_ack(&ack(MavMissionResult::MAV_MISSION_ACCEPTED));

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        engine.subscribe_progress(move |current, total| sink.lock().push((current, total)));

        engine.handle_mission_current(&MISSION_CURRENT_DATA {
            seq: 2,
            ..Default::default()
        });
        assert_eq!(*reports.lock(), vec![(1, 2)]);
        assert!(!engine.is_mission_finished());

        // Reaching the last wire item finishes the mission; current is
        // reported as the total.
        engine.handle_mission_item_reached(&MISSION_ITEM_REACHED_DATA { seq: 2 });
        assert_eq!(*reports.lock(), vec![(1, 2), (2, 2)]);
        assert!(engine.is_mission_finished());
        assert_eq!(engine.mission_progress(), (2, 2));
    }

    #[test]
    fn test_no_device_before_discovery() {
        let port = Arc::new(RecordingPort::undiscovered());
        let engine = engine_with(&port, 1_000);
        let (callback, results) = collecting_result();

        engine.upload_mission_async(photo_mission(), callback);
        assert_eq!(*results.lock(), vec![Err(MissionError::NoDevice)]);
    }
}
