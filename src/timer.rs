//! Deadline timers.
//!
//! A [`Timer`] is one deadline plus a callback, linked into the master's
//! global timer list. The list is a `BTreeMap` keyed by
//! `(deadline, sequence)`, so it is always sorted ascending and timers
//! with equal deadlines fire in schedule order.
//!
//! Firing batches: `run_timers` removes every due entry from the list
//! first, then invokes the callbacks with no locks held. A callback that
//! reschedules its own timer re-enters the list for a later scan, never
//! the current batch. Each timer carries a generation counter bumped by
//! every schedule/unschedule, so a timer cancelled (or repositioned)
//! between collection and invocation is suppressed: a timer never fires
//! after its owner unscheduled it in a cleanup path.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::counters;
use crate::element::Element;
use crate::master::Master;

type TimerKey = (Instant, u64);

enum TimerAction {
    Element(Arc<dyn Element>),
    Hook(Box<dyn Fn(&Timer) + Send + Sync>),
}

struct TimerPosition {
    key: Option<TimerKey>,
    /// Bumped by every schedule and unschedule; a pending fire collected
    /// under an older generation is dropped.
    generation: u64,
}

pub(crate) struct TimerCore {
    action: TimerAction,
    master: OnceLock<Weak<Master>>,
    /// Lock order: the global timer list lock, if held, is taken first.
    position: Mutex<TimerPosition>,
}

impl TimerCore {
    fn fire(self: &Arc<Self>) {
        let timer = Timer { core: self.clone() };
        match &self.action {
            TimerAction::Element(element) => element.run_timer(&timer),
            TimerAction::Hook(hook) => hook(&timer),
        }
    }
}

/// Handle to a deadline timer. Cheap to clone; all clones refer to the
/// same underlying timer.
#[derive(Clone)]
pub struct Timer {
    core: Arc<TimerCore>,
}

impl Timer {
    /// Creates a timer whose callback is the element's `run_timer`.
    pub fn new(element: Arc<dyn Element>) -> Timer {
        Timer::with_action(TimerAction::Element(element))
    }

    /// Creates a timer driven by a plain hook function.
    pub fn from_hook<F>(hook: F) -> Timer
    where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        Timer::with_action(TimerAction::Hook(Box::new(hook)))
    }

    fn with_action(action: TimerAction) -> Timer {
        Timer {
            core: Arc::new(TimerCore {
                action,
                master: OnceLock::new(),
                position: Mutex::new(TimerPosition {
                    key: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Binds the timer to a master's timer list. A timer binds once for
    /// its lifetime; the binding does not schedule it.
    pub fn initialize(&self, master: &Arc<Master>) {
        let _ = self.core.master.set(Arc::downgrade(master));
    }

    fn master(&self) -> Option<Arc<Master>> {
        self.core.master.get().and_then(Weak::upgrade)
    }

    /// Schedules (or repositions) the timer to fire at `deadline`.
    pub fn schedule_at(&self, deadline: Instant) {
        let Some(master) = self.master() else {
            return;
        };
        if master.timers().schedule(&self.core, deadline) {
            // New earliest deadline: shrink the sleepers' wait bound.
            master.wake_all();
        }
    }

    /// Schedules the timer to fire `delay` from now.
    pub fn schedule_after(&self, delay: Duration) {
        self.schedule_at(Instant::now() + delay);
    }

    /// Removes the timer from the list. No-op if not scheduled; always
    /// safe, including from inside the timer's own callback.
    pub fn unschedule(&self) {
        if let Some(master) = self.master() {
            master.timers().unschedule(&self.core);
        }
    }

    pub fn scheduled(&self) -> bool {
        self.core.position.lock().key.is_some()
    }

    /// The pending deadline, if scheduled.
    pub fn expiry(&self) -> Option<Instant> {
        self.core.position.lock().key.map(|k| k.0)
    }

    /// Whether two handles refer to the same underlying timer.
    pub fn same_timer(&self, other: &Timer) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("scheduled", &self.scheduled())
            .finish()
    }
}

/// The master's global timer list.
pub(crate) struct TimerList {
    inner: Mutex<TimerListInner>,
}

struct TimerListInner {
    entries: BTreeMap<TimerKey, Arc<TimerCore>>,
    next_seq: u64,
}

impl TimerList {
    pub(crate) fn new() -> TimerList {
        TimerList {
            inner: Mutex::new(TimerListInner {
                entries: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Inserts or repositions `core`; returns true when it became the
    /// earliest entry.
    fn schedule(&self, core: &Arc<TimerCore>, deadline: Instant) -> bool {
        let mut inner = self.inner.lock();
        let mut pos = core.position.lock();
        if let Some(key) = pos.key.take() {
            inner.entries.remove(&key);
        }
        let key = (deadline, inner.next_seq);
        inner.next_seq += 1;
        inner.entries.insert(key, core.clone());
        pos.key = Some(key);
        pos.generation = pos.generation.wrapping_add(1);
        inner.entries.keys().next() == Some(&key)
    }

    fn unschedule(&self, core: &Arc<TimerCore>) {
        let mut inner = self.inner.lock();
        let mut pos = core.position.lock();
        if let Some(key) = pos.key.take() {
            inner.entries.remove(&key);
        }
        pos.generation = pos.generation.wrapping_add(1);
    }

    /// Time until the earliest deadline, `None` when the list is empty.
    /// Already-due entries yield a zero delay.
    pub(crate) fn timer_delay(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .entries
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Fires every timer with deadline ≤ `now`, each exactly once. Due
    /// entries are unlinked first and invoked with no locks held, so
    /// callbacks may freely reschedule themselves or other timers.
    pub(crate) fn run_timers(&self, now: Instant) {
        let mut batch: Vec<(Arc<TimerCore>, u64)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some((&key, _)) = inner.entries.first_key_value() {
                if key.0 > now {
                    break;
                }
                let (_, core) = inner.entries.pop_first().expect("due entry");
                let mut pos = core.position.lock();
                pos.key = None;
                let generation = pos.generation;
                drop(pos);
                batch.push((core, generation));
            }
        }
        for (core, generation) in batch {
            if core.position.lock().generation != generation {
                // Rescheduled or unscheduled since collection.
                continue;
            }
            counters::inc_timer_fires();
            core.fire();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
