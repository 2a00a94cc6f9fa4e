//! Timeout and periodic-call scheduling.
//!
//! One worker thread per session sleeps until the earliest deadline and
//! fires expired entries in deadline order. Entries are identified by a
//! [`TimerCookie`] which stays valid until the entry is unregistered or a
//! one-shot fires; cancellation and refresh race-safely against dispatch
//! because presence is re-checked under the lock right before a callback is
//! invoked.
//!
//! Callbacks run on the scheduler thread with the wheel lock released, so
//! they may re-enter the scheduler (refresh, unregister, register new
//! entries). A periodic entry whose callback runs long is rescheduled at
//! `now + period` after the callback returns; missed beats are not made up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Callback invoked on the scheduler thread when an entry fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle to a scheduled entry, used for refresh and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerCookie(u64);

struct Entry {
    fire_at: Instant,
    period: Duration,
    periodic: bool,
    callback: TimerCallback,
}

#[derive(Default)]
struct Wheel {
    entries: HashMap<u64, Entry>,
    next_cookie: u64,
}

struct Shared {
    wheel: Mutex<Wheel>,
    wakeup: Condvar,
    running: AtomicBool,
}

/// The session's clock and timer wheel.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the scheduler and spawn its worker thread.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            wheel: Mutex::new(Wheel::default()),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("groundlink-sched".into())
            .spawn(move || run(&worker_shared))
            .ok();

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Register a one-shot entry firing once after `after`.
    pub fn register_timeout(&self, callback: TimerCallback, after: Duration) -> TimerCookie {
        self.insert(callback, after, false)
    }

    /// Register a periodic entry firing every `period` until unregistered.
    pub fn register_periodic(&self, callback: TimerCallback, period: Duration) -> TimerCookie {
        self.insert(callback, period, true)
    }

    /// Push an entry's deadline out to `now + period`.
    ///
    /// For one-shots the period is the original `after`. No-op when the
    /// cookie has already fired or been unregistered.
    pub fn refresh(&self, cookie: TimerCookie) {
        let mut wheel = self.shared.wheel.lock();
        if let Some(entry) = wheel.entries.get_mut(&cookie.0) {
            entry.fire_at = Instant::now() + entry.period;
            self.shared.wakeup.notify_all();
        }
    }

    /// Remove an entry. Idempotent; an expired-but-undispatched entry will
    /// not fire after this returns.
    pub fn unregister(&self, cookie: TimerCookie) {
        let mut wheel = self.shared.wheel.lock();
        if wheel.entries.remove(&cookie.0).is_some() {
            self.shared.wakeup.notify_all();
        }
    }

    /// Stop the worker thread. Idempotent; also invoked from `Drop`.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // Entries may hold the last strong references to engines; clear them
        // so nothing outlives the session.
        self.shared.wheel.lock().entries.clear();
    }

    fn insert(&self, callback: TimerCallback, period: Duration, periodic: bool) -> TimerCookie {
        let mut wheel = self.shared.wheel.lock();
        let cookie = wheel.next_cookie;
        wheel.next_cookie += 1;
        wheel.entries.insert(
            cookie,
            Entry {
                fire_at: Instant::now() + period,
                period,
                periodic,
                callback,
            },
        );
        self.shared.wakeup.notify_all();
        TimerCookie(cookie)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared) {
    let mut wheel = shared.wheel.lock();
    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let next_deadline = wheel.entries.values().map(|e| e.fire_at).min();

        match next_deadline {
            None => {
                shared.wakeup.wait(&mut wheel);
            }
            Some(at) if at > now => {
                shared.wakeup.wait_until(&mut wheel, at);
            }
            Some(_) => {
                dispatch_due(shared, &mut wheel, now);
            }
        }
    }
}

/// Fire every entry due at `now`, in non-decreasing deadline order.
fn dispatch_due(shared: &Shared, wheel: &mut MutexGuard<'_, Wheel>, now: Instant) {
    let mut due: Vec<(Instant, u64)> = wheel
        .entries
        .iter()
        .filter(|(_, entry)| entry.fire_at <= now)
        .map(|(cookie, entry)| (entry.fire_at, *cookie))
        .collect();
    due.sort_by_key(|(fire_at, _)| *fire_at);

    for (_, cookie) in due {
        if !shared.running.load(Ordering::Acquire) {
            return;
        }
        // Re-check presence: the entry may have been unregistered or
        // refreshed since it was collected.
        let Some(entry) = wheel.entries.get(&cookie) else {
            continue;
        };
        if entry.fire_at > now {
            continue;
        }
        let callback = Arc::clone(&entry.callback);
        let periodic = entry.periodic;
        if !periodic {
            wheel.entries.remove(&cookie);
        }

        MutexGuard::unlocked(wheel, || callback());

        if periodic {
            // Unless the callback unregistered it meanwhile.
            if let Some(entry) = wheel.entries.get_mut(&cookie) {
                entry.fire_at = Instant::now() + entry.period;
            }
        }
    }
}
