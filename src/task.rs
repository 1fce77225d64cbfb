//! Schedulable tasks.
//!
//! A [`Task`] is the unit of recurring work bound to one element. It lives
//! on at most one router thread's run queue at any instant; scheduling
//! state is an explicit five-state machine, never an inferred link check:
//!
//! - `Idle` — on no queue.
//! - `Queued` — linked on its home thread's queue.
//! - `Running` — popped off the queue, callback executing.
//! - `RunningRescheduled` — reschedule arrived mid-run; requeued at end.
//! - `RunningCancelled` — unschedule arrived mid-run; applied at end.
//!
//! Idle↔Queued transitions happen under the owning queue's lock; the
//! Running-family transitions are lock-free CASes, settled by the run loop
//! when the callback returns. The last reschedule/unschedule call always
//! wins, including calls made from inside the running callback itself.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::counters;
use crate::element::Element;
use crate::master::Master;
use crate::thread::{ThreadSet, NIL};

/// Thread id of the quiescent pseudo-thread. Tasks initialized here are
/// parked: queued, but never dispatched until moved to a real thread.
pub const QUIESCENT_THREAD_ID: i32 = -1;

pub(crate) const STATE_IDLE: u8 = 0;
pub(crate) const STATE_QUEUED: u8 = 1;
pub(crate) const STATE_RUNNING: u8 = 2;
pub(crate) const STATE_RUN_RESCHEDULE: u8 = 3;
pub(crate) const STATE_RUN_CANCEL: u8 = 4;

enum TaskAction {
    Element(Arc<dyn Element>),
    Hook(Box<dyn Fn(&Task) -> bool + Send + Sync>),
}

pub(crate) struct TaskCore {
    action: TaskAction,
    /// Home thread id; changes only under the current home queue's lock.
    home: AtomicI32,
    pub(crate) state: AtomicU8,
    /// Arena slot on the home queue. Meaningful only while `Queued`, and
    /// only read or written under that queue's lock.
    pub(crate) slot: AtomicUsize,
    /// Bound once, by `initialize`.
    threads: OnceLock<Arc<ThreadSet>>,
}

/// Handle to a schedulable task. Cheap to clone; all clones refer to the
/// same underlying task.
#[derive(Clone)]
pub struct Task {
    core: Arc<TaskCore>,
}

impl Task {
    /// Creates a task whose callback is the element's `run_task`.
    pub fn new(element: Arc<dyn Element>) -> Task {
        Task::with_action(TaskAction::Element(element))
    }

    /// Creates a task driven by a plain hook function.
    pub fn from_hook<F>(hook: F) -> Task
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        Task::with_action(TaskAction::Hook(Box::new(hook)))
    }

    fn with_action(action: TaskAction) -> Task {
        Task {
            core: Arc::new(TaskCore {
                action,
                home: AtomicI32::new(QUIESCENT_THREAD_ID),
                state: AtomicU8::new(STATE_IDLE),
                slot: AtomicUsize::new(NIL),
                threads: OnceLock::new(),
            }),
        }
    }

    /// Binds the task to `master` and places it, scheduled, on the named
    /// thread's queue (`QUIESCENT_THREAD_ID` parks it on the quiescent
    /// list). A task binds to one master for its lifetime; later calls
    /// only retarget the thread.
    ///
    /// # Panics
    ///
    /// Panics if `thread_id` is neither the quiescent id nor a valid
    /// worker id for `master`.
    pub fn initialize(&self, master: &Master, thread_id: i32) {
        let threads = master.thread_set();
        assert!(
            threads.valid_id(thread_id),
            "task initialized onto unknown thread {thread_id}"
        );
        let _ = self.core.threads.set(threads.clone());
        self.move_thread(thread_id);
        self.reschedule();
    }

    /// Thread the task currently belongs to.
    pub fn home_thread_id(&self) -> i32 {
        self.core.home.load(Ordering::Acquire)
    }

    /// True while the task is on a run queue (or will be requeued at the
    /// end of its current invocation).
    pub fn scheduled(&self) -> bool {
        matches!(
            self.core.state.load(Ordering::Acquire),
            STATE_QUEUED | STATE_RUN_RESCHEDULE
        )
    }

    /// Schedules the task onto its home thread. Idempotent: rescheduling
    /// an already-scheduled task is a no-op. A reschedule arriving while
    /// the task is mid-run settles to scheduled when the callback returns.
    pub fn reschedule(&self) {
        self.core.reschedule();
    }

    /// Removes the task from its queue. Safe from any thread, including
    /// from inside the task's own callback; a mid-run unschedule is
    /// applied at the end of the invocation and wins over a `true` return.
    pub fn unschedule(&self) {
        self.core.unschedule();
    }

    /// Moves the task to another thread's queue as one atomic unlink and
    /// relink: the task is never visible on both queues, nor lost from
    /// both, and its scheduled state is preserved.
    ///
    /// # Panics
    ///
    /// Panics if `new_id` is not a valid thread id for the bound master.
    pub fn move_thread(&self, new_id: i32) {
        self.core.move_thread(new_id);
    }

    /// Whether two handles refer to the same underlying task.
    pub fn same_task(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.core.state.load(Ordering::Acquire) {
            STATE_IDLE => "idle",
            STATE_QUEUED => "queued",
            STATE_RUNNING => "running",
            STATE_RUN_RESCHEDULE => "running+rescheduled",
            STATE_RUN_CANCEL => "running+cancelled",
            _ => "corrupt",
        };
        f.debug_struct("Task")
            .field("home", &self.home_thread_id())
            .field("state", &state)
            .finish()
    }
}

impl TaskCore {
    fn reschedule(self: &Arc<Self>) {
        let Some(threads) = self.threads.get() else {
            return;
        };
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_QUEUED | STATE_RUN_RESCHEDULE => return,
                s @ (STATE_RUNNING | STATE_RUN_CANCEL) => {
                    if self
                        .state
                        .compare_exchange(s, STATE_RUN_RESCHEDULE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                STATE_IDLE => {
                    let home = self.home.load(Ordering::Acquire);
                    let thread = threads.get(home);
                    {
                        let mut queue = thread.queue.lock();
                        if self.home.load(Ordering::Acquire) != home {
                            continue;
                        }
                        if self
                            .state
                            .compare_exchange(STATE_IDLE, STATE_QUEUED, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            continue;
                        }
                        let slot = queue.push_back(self.clone());
                        self.slot.store(slot, Ordering::Release);
                    }
                    thread.wake();
                    return;
                }
                s => unreachable!("task in unknown state {s}"),
            }
        }
    }

    fn unschedule(self: &Arc<Self>) {
        let Some(threads) = self.threads.get() else {
            return;
        };
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_IDLE | STATE_RUN_CANCEL => return,
                s @ (STATE_RUNNING | STATE_RUN_RESCHEDULE) => {
                    if self
                        .state
                        .compare_exchange(s, STATE_RUN_CANCEL, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                STATE_QUEUED => {
                    let home = self.home.load(Ordering::Acquire);
                    let thread = threads.get(home);
                    let mut queue = thread.queue.lock();
                    if self.home.load(Ordering::Acquire) != home {
                        continue;
                    }
                    // Under the home queue's lock a Queued task is frozen:
                    // its slot is valid and only we can transition it.
                    if self.state.load(Ordering::Acquire) != STATE_QUEUED {
                        continue;
                    }
                    let slot = self.slot.swap(NIL, Ordering::AcqRel);
                    queue.remove(slot);
                    self.state.store(STATE_IDLE, Ordering::Release);
                    return;
                }
                s => unreachable!("task in unknown state {s}"),
            }
        }
    }

    fn move_thread(self: &Arc<Self>, new_id: i32) {
        let Some(threads) = self.threads.get() else {
            // Not yet bound; nothing is queued anywhere.
            self.home.store(new_id, Ordering::Release);
            return;
        };
        assert!(
            threads.valid_id(new_id),
            "task moved onto unknown thread {new_id}"
        );
        loop {
            let old = self.home.load(Ordering::Acquire);
            if old == new_id {
                return;
            }
            // Both queue locks, in ascending thread-index order, so that
            // simultaneous opposite-direction migrations cannot deadlock.
            let (_ga, _gb, mut old_guard, mut new_guard) = {
                let t_old = threads.get(old);
                let t_new = threads.get(new_id);
                if old < new_id {
                    let a = t_old.queue.lock();
                    let b = t_new.queue.lock();
                    (t_old, t_new, a, b)
                } else {
                    let b = t_new.queue.lock();
                    let a = t_old.queue.lock();
                    (t_old, t_new, a, b)
                }
            };
            if self.home.load(Ordering::Acquire) != old {
                continue;
            }
            match self.state.load(Ordering::Acquire) {
                STATE_QUEUED => {
                    let slot = self.slot.load(Ordering::Acquire);
                    old_guard.remove(slot);
                    self.home.store(new_id, Ordering::Release);
                    let nslot = new_guard.push_back(self.clone());
                    self.slot.store(nslot, Ordering::Release);
                    drop(old_guard);
                    drop(new_guard);
                    counters::inc_task_migrations();
                    threads.get(new_id).wake();
                }
                _ => {
                    // Idle or mid-run: nothing linked, just retarget. A
                    // mid-run requeue lands on the new home.
                    self.home.store(new_id, Ordering::Release);
                }
            }
            return;
        }
    }

    /// Called by the run loop after popping the task (state `Running`).
    pub(crate) fn invoke(self: &Arc<Self>) -> bool {
        counters::inc_task_runs();
        let task = Task { core: self.clone() };
        match &self.action {
            TaskAction::Element(element) => element.run_task(&task),
            TaskAction::Hook(hook) => hook(&task),
        }
    }

    /// Settles the state machine after an invocation. `keep` is the
    /// callback's return value; a mid-run unschedule overrides it, a
    /// mid-run reschedule forces a requeue.
    pub(crate) fn finish(self: &Arc<Self>, keep: bool) {
        let threads = self.threads.get().expect("running task must be bound");
        loop {
            let home = self.home.load(Ordering::Acquire);
            let thread = threads.get(home);
            let mut queue = thread.queue.lock();
            if self.home.load(Ordering::Acquire) != home {
                // Migrated while running; settle on the new home.
                continue;
            }
            // Home is frozen under its queue lock; only the state can
            // still flip among the Running family.
            let requeued = loop {
                let (from, to) = match self.state.load(Ordering::Acquire) {
                    STATE_RUNNING if keep => (STATE_RUNNING, STATE_QUEUED),
                    STATE_RUNNING => (STATE_RUNNING, STATE_IDLE),
                    STATE_RUN_RESCHEDULE => (STATE_RUN_RESCHEDULE, STATE_QUEUED),
                    STATE_RUN_CANCEL => (STATE_RUN_CANCEL, STATE_IDLE),
                    s => unreachable!("finished task in unknown state {s}"),
                };
                if self
                    .state
                    .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if to == STATE_QUEUED {
                        let slot = queue.push_back(self.clone());
                        self.slot.store(slot, Ordering::Release);
                        break true;
                    }
                    break false;
                }
            };
            drop(queue);
            if requeued {
                // The task may have run on a thread other than its home;
                // make sure the home thread notices the queued work.
                thread.wake();
            }
            return;
        }
    }
}
