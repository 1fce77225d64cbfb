//! Router worker threads.
//!
//! Each [`RouterThread`] owns a run queue of tasks and drives the loop:
//! run a bounded burst of ready tasks (round-robin: a task that wants more
//! work is requeued at the tail), fire due timers, then either service the
//! I/O multiplexer or park until woken. A thread with nothing to do sleeps
//! for at most the delay until the next timer; scheduling a task onto a
//! sleeping thread interrupts the sleep.
//!
//! The run queue is an arena-backed doubly linked list: nodes live in a
//! slab, links are indices, and removal from any position is O(1). The
//! whole structure is guarded by one mutex per thread.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use slab::Slab;

use crate::master::Master;
use crate::select::IoWake;
use crate::task::{TaskCore, QUIESCENT_THREAD_ID, STATE_QUEUED, STATE_RUNNING};

/// Null link / invalid slot index.
pub(crate) const NIL: usize = usize::MAX;

struct TaskNode {
    task: Arc<TaskCore>,
    prev: usize,
    next: usize,
}

/// A thread's run queue. Lock the owning thread's `queue` mutex before
/// touching it.
pub(crate) struct TaskQueue {
    arena: Slab<TaskNode>,
    head: usize,
    tail: usize,
    len: usize,
}

impl TaskQueue {
    fn new() -> TaskQueue {
        TaskQueue {
            arena: Slab::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Links a task at the tail; returns its slot.
    pub(crate) fn push_back(&mut self, task: Arc<TaskCore>) -> usize {
        let slot = self.arena.insert(TaskNode {
            task,
            prev: self.tail,
            next: NIL,
        });
        if self.tail != NIL {
            self.arena[self.tail].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.len += 1;
        slot
    }

    /// Unlinks the node at `slot`.
    pub(crate) fn remove(&mut self, slot: usize) -> Arc<TaskCore> {
        let node = self.arena.remove(slot);
        if node.prev != NIL {
            self.arena[node.prev].next = node.next;
        } else {
            self.head = node.next;
        }
        if node.next != NIL {
            self.arena[node.next].prev = node.prev;
        } else {
            self.tail = node.prev;
        }
        self.len -= 1;
        node.task
    }

    fn pop_front(&mut self) -> Option<Arc<TaskCore>> {
        if self.head == NIL {
            return None;
        }
        Some(self.remove(self.head))
    }
}

/// One worker's run loop, task queue, and parking state.
///
/// Thread ids are `-1` (the quiescent pseudo-thread, which parks tasks but
/// never runs them) and `0..nthreads` for the workers.
pub struct RouterThread {
    id: i32,
    pub(crate) queue: Mutex<TaskQueue>,
    /// Wake-pending flag; absorbs wakes that arrive before the park.
    park: Mutex<bool>,
    unpark: Condvar,
    io: OnceLock<Arc<IoWake>>,
}

impl RouterThread {
    pub(crate) fn new(id: i32) -> Arc<RouterThread> {
        Arc::new(RouterThread {
            id,
            queue: Mutex::new(TaskQueue::new()),
            park: Mutex::new(false),
            unpark: Condvar::new(),
            io: OnceLock::new(),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_quiescent(&self) -> bool {
        self.id == QUIESCENT_THREAD_ID
    }

    /// Number of tasks currently linked on this thread's queue.
    pub fn task_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs one dispatch round: up to `burst` ready tasks off the head of
    /// the queue, each requeued at the tail if it asks to run again.
    /// Returns the number of tasks run. On the quiescent pseudo-thread
    /// this is a no-op.
    ///
    /// This is the building block of the driver loop, exposed so embedders
    /// and tests can step a thread without spawning it.
    pub fn run_pending(&self, burst: usize) -> usize {
        let mut ran = 0;
        while ran < burst {
            let Some(core) = self.next_task() else {
                break;
            };
            let keep = core.invoke();
            core.finish(keep);
            ran += 1;
        }
        ran
    }

    fn next_task(&self) -> Option<Arc<TaskCore>> {
        if self.is_quiescent() {
            return None;
        }
        let mut queue = self.queue.lock();
        let core = queue.pop_front()?;
        core.slot.store(NIL, Ordering::Release);
        if core
            .state
            .compare_exchange(STATE_QUEUED, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("task on run queue in non-queued state");
        }
        Some(core)
    }

    pub(crate) fn set_io(&self, io: Arc<IoWake>) {
        let _ = self.io.set(io);
    }

    /// Interrupts this thread's sleep: sets the wake-pending flag, pokes
    /// the condvar, and kicks the I/O poller if this thread is inside it.
    pub(crate) fn wake(&self) {
        if self.is_quiescent() {
            return;
        }
        {
            let mut pending = self.park.lock();
            *pending = true;
            self.unpark.notify_one();
        }
        if let Some(io) = self.io.get() {
            io.wake_if_polling(self.id);
        }
    }

    /// Consumes a pending wake. Called by the poller after it has
    /// published itself as the polling thread, closing the window where a
    /// wake could land between the last queue check and the blocking
    /// poll.
    pub(crate) fn take_wake_pending(&self) -> bool {
        let mut pending = self.park.lock();
        std::mem::take(&mut *pending)
    }

    fn park(&self, timeout: Option<Duration>) {
        let mut pending = self.park.lock();
        if !*pending {
            match timeout {
                Some(t) => {
                    let _ = self.unpark.wait_for(&mut pending, t);
                }
                None => self.unpark.wait(&mut pending),
            }
        }
        *pending = false;
    }

    /// The driver loop. Runs until the master's run-count gate closes.
    pub(crate) fn run(&self, master: &Arc<Master>) {
        tracing::debug!(thread = self.id, "router thread started");
        let burst = master.burst();
        loop {
            if !master.check_driver() {
                break;
            }
            self.run_pending(burst);
            master.run_timers();
            if self.task_count() > 0 {
                // Tasks are pending: service ready descriptors without
                // blocking, then go straight into the next round.
                master.run_selects(Some(Duration::ZERO), self);
                continue;
            }
            let delay = master.timer_delay();
            if !master.run_selects(delay, self) {
                // Another thread holds the poller; sleep on our own
                // parker with the same bound.
                self.park(delay);
            }
        }
        master.note_thread_exit();
        tracing::debug!(thread = self.id, "router thread stopped");
    }
}

impl std::fmt::Debug for RouterThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterThread")
            .field("id", &self.id)
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// The fixed set of threads a master owns: the quiescent pseudo-thread at
/// internal index 0, workers after it (external id + 1).
pub(crate) struct ThreadSet {
    threads: Box<[Arc<RouterThread>]>,
}

impl ThreadSet {
    pub(crate) fn new(nthreads: usize) -> Arc<ThreadSet> {
        let mut threads = Vec::with_capacity(nthreads + 1);
        for id in -1..nthreads as i32 {
            threads.push(RouterThread::new(id));
        }
        Arc::new(ThreadSet {
            threads: threads.into_boxed_slice(),
        })
    }

    pub(crate) fn valid_id(&self, id: i32) -> bool {
        id >= QUIESCENT_THREAD_ID && (id as i64 + 1) < self.threads.len() as i64
    }

    pub(crate) fn get(&self, id: i32) -> &Arc<RouterThread> {
        &self.threads[(id + 1) as usize]
    }

    /// Worker threads, quiescent excluded.
    pub(crate) fn workers(&self) -> &[Arc<RouterThread>] {
        &self.threads[1..]
    }

    pub(crate) fn nthreads(&self) -> usize {
        self.threads.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn test_queue_links() {
        let mut q = TaskQueue::new();
        let t1 = Task::from_hook(|_| false);
        let t2 = Task::from_hook(|_| false);
        let t3 = Task::from_hook(|_| false);
        let s1 = q.push_back(t1.core().clone());
        let s2 = q.push_back(t2.core().clone());
        let s3 = q.push_back(t3.core().clone());
        assert_eq!(q.len(), 3);
        // Remove from the middle, then check FIFO order of the rest.
        let removed = q.remove(s2);
        assert!(Arc::ptr_eq(&removed, t2.core()));
        let first = q.pop_front().expect("first");
        assert!(Arc::ptr_eq(&first, t1.core()));
        let last = q.pop_front().expect("last");
        assert!(Arc::ptr_eq(&last, t3.core()));
        assert_eq!(q.len(), 0);
        let _ = (s1, s3);
    }

    #[test]
    fn test_thread_set_layout() {
        let set = ThreadSet::new(2);
        assert_eq!(set.nthreads(), 2);
        assert!(set.get(QUIESCENT_THREAD_ID).is_quiescent());
        assert_eq!(set.get(0).id(), 0);
        assert_eq!(set.get(1).id(), 1);
        assert!(set.valid_id(-1));
        assert!(set.valid_id(1));
        assert!(!set.valid_id(2));
        assert!(!set.valid_id(-2));
    }
}
