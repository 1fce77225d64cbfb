//! The master.
//!
//! Process-wide owner of the thread pool, the run-count gate, the global
//! timer list, and the descriptor registry. Routers register themselves
//! here; packets never pass through the master, it only decides when each
//! element's task runs.
//!
//! Locking: the run-count and pause flag live under the driver lock; the
//! timer list, the descriptor bindings, and each thread's run queue have
//! their own locks. Pausing or stopping the pool therefore never contends
//! with descriptor registration while packets are in flight.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::counters::Counters;
use crate::element::Element;
use crate::error::MasterError;
use crate::router::Router;
use crate::select::{SelectMask, SelectSet};
use crate::thread::{RouterThread, ThreadSet};
use crate::timer::TimerList;

/// Run-count value meaning "no router has activated yet": threads park
/// instead of exiting.
const RUNCOUNT_NOT_STARTED: i32 = i32::MIN;

struct DriverState {
    /// Countdown gate; the driver stops once this reaches zero.
    runcount: i32,
    /// Pause depth; workers hold at the top of their loop while nonzero.
    paused: u32,
    /// Spawned worker threads that have not exited.
    live: usize,
    /// Workers currently held inside `check_driver`.
    quiesced: usize,
}

/// Owner of the router thread pool and its shared scheduling state.
///
/// Built by [`Builder`](crate::Builder) or [`Master::new`]; worker threads
/// are spawned by [`Master::start`] and reaped by [`Master::join`] after
/// the run-count gate closes.
pub struct Master {
    threads: Arc<ThreadSet>,
    driver: Mutex<DriverState>,
    driver_cv: Condvar,
    timers: TimerList,
    selects: SelectSet,
    routers: Mutex<Vec<Arc<Router>>>,
    config: SchedulerConfig,
    joins: Mutex<Vec<JoinHandle<()>>>,
    _counters: Counters,
}

impl Master {
    /// Creates a master with `nthreads` workers (plus the quiescent
    /// pseudo-thread) and default configuration.
    pub fn new(nthreads: usize) -> io::Result<Arc<Master>> {
        Master::with_config(nthreads, SchedulerConfig::default())
    }

    pub(crate) fn with_config(nthreads: usize, config: SchedulerConfig) -> io::Result<Arc<Master>> {
        let selects = SelectSet::new()?;
        let threads = ThreadSet::new(nthreads);
        let io = selects.io_handle();
        for thread in threads.workers() {
            thread.set_io(io.clone());
        }
        Ok(Arc::new(Master {
            threads,
            driver: Mutex::new(DriverState {
                runcount: RUNCOUNT_NOT_STARTED,
                paused: 0,
                live: 0,
                quiesced: 0,
            }),
            driver_cv: Condvar::new(),
            timers: TimerList::new(),
            selects,
            routers: Mutex::new(Vec::new()),
            config,
            joins: Mutex::new(Vec::new()),
            _counters: Counters,
        }))
    }

    /// Number of worker threads, the quiescent pseudo-thread excluded.
    pub fn nthreads(&self) -> usize {
        self.threads.nthreads()
    }

    /// Looks up a thread by id; `-1` is the quiescent pseudo-thread.
    pub fn thread(&self, id: i32) -> Option<&Arc<RouterThread>> {
        if self.threads.valid_id(id) {
            Some(self.threads.get(id))
        } else {
            None
        }
    }

    pub(crate) fn thread_set(&self) -> &Arc<ThreadSet> {
        &self.threads
    }

    pub(crate) fn burst(&self) -> usize {
        self.config.burst
    }

    // ---- driver gate -------------------------------------------------

    /// Spawns the worker threads. They park until a router activates the
    /// run-count gate.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut joins = self.joins.lock();
        if !joins.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "master already started",
            ));
        }
        for thread in self.threads.workers() {
            let thread = thread.clone();
            let master = Arc::clone(self);
            let core = self
                .config
                .cores
                .as_ref()
                .and_then(|cores| cores.get(thread.id() as usize).copied());
            let name = format!("{}-{}", self.config.thread_name, thread.id());
            self.driver.lock().live += 1;
            let spawned = std::thread::Builder::new().name(name).spawn(move || {
                #[cfg(target_os = "linux")]
                if let Some(core) = core {
                    set_cpu_affinity(core);
                }
                #[cfg(not(target_os = "linux"))]
                let _ = core;
                thread.run(&master);
            });
            match spawned {
                Ok(handle) => joins.push(handle),
                Err(e) => {
                    self.driver.lock().live -= 1;
                    return Err(e);
                }
            }
        }
        tracing::debug!(threads = self.nthreads(), "master started");
        Ok(())
    }

    /// Forces the run-count gate to zero; all workers exit after their
    /// current burst.
    pub fn stop(&self) {
        {
            let mut driver = self.driver.lock();
            driver.runcount = 0;
        }
        self.driver_cv.notify_all();
        self.wake_all();
    }

    /// Reaps the worker threads. Call after the gate has closed.
    pub fn join(&self) {
        let handles: Vec<_> = self.joins.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("router thread panicked");
            }
        }
    }

    /// Adjusts the run-count gate. A negative adjustment that brings it to
    /// zero (or below) stops the driver.
    pub fn adjust_runcount(&self, delta: i32) {
        let stopped = {
            let mut driver = self.driver.lock();
            if driver.runcount == RUNCOUNT_NOT_STARTED {
                if delta >= 0 {
                    return;
                }
                driver.runcount = 0;
            } else {
                driver.runcount = driver.runcount.saturating_add(delta);
            }
            driver.runcount <= 0
        };
        if stopped {
            self.driver_cv.notify_all();
            self.wake_all();
        }
    }

    /// Requests a driver stop: one decrement of the run-count gate.
    pub fn please_stop_driver(&self) {
        self.adjust_runcount(-1);
    }

    pub fn runcount(&self) -> i32 {
        self.driver.lock().runcount
    }

    /// Holds every worker at the top of its loop. Returns once all live
    /// workers have reached the hold point; nests. Must not be called
    /// from a worker thread.
    pub fn pause(&self) {
        self.driver.lock().paused += 1;
        self.wake_all();
        let mut driver = self.driver.lock();
        while driver.quiesced < driver.live {
            self.driver_cv.wait(&mut driver);
        }
    }

    pub fn unpause(&self) {
        let mut driver = self.driver.lock();
        driver.paused = driver.paused.saturating_sub(1);
        self.driver_cv.notify_all();
    }

    pub fn paused(&self) -> bool {
        self.driver.lock().paused > 0
    }

    /// Worker-side gate check. Parks while no router has activated or the
    /// pool is paused; false once the run-count gate has closed.
    pub(crate) fn check_driver(&self) -> bool {
        let mut driver = self.driver.lock();
        loop {
            if driver.runcount != RUNCOUNT_NOT_STARTED && driver.runcount <= 0 {
                return false;
            }
            if driver.runcount == RUNCOUNT_NOT_STARTED || driver.paused > 0 {
                driver.quiesced += 1;
                self.driver_cv.notify_all();
                self.driver_cv.wait(&mut driver);
                driver.quiesced -= 1;
                continue;
            }
            return true;
        }
    }

    pub(crate) fn note_thread_exit(&self) {
        let mut driver = self.driver.lock();
        driver.live -= 1;
        self.driver_cv.notify_all();
    }

    /// First router activation: open the gate and release parked workers.
    pub(crate) fn driver_activate(&self) {
        {
            let mut driver = self.driver.lock();
            if driver.runcount == RUNCOUNT_NOT_STARTED {
                driver.runcount = 1;
            }
        }
        self.driver_cv.notify_all();
        self.wake_all();
    }

    pub(crate) fn wake_all(&self) {
        for thread in self.threads.workers() {
            thread.wake();
        }
    }

    // ---- timers ------------------------------------------------------

    /// Fires every timer whose deadline has passed, each exactly once.
    /// No-op while the pool is paused.
    pub fn run_timers(&self) {
        if self.paused() {
            return;
        }
        self.timers.run_timers(Instant::now());
    }

    /// Time until the earliest pending timer; `None` when there is none.
    /// Idle threads use this to bound their blocking wait.
    pub fn timer_delay(&self) -> Option<Duration> {
        self.timers.timer_delay(Instant::now())
    }

    pub(crate) fn timers(&self) -> &TimerList {
        &self.timers
    }

    /// Number of scheduled timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // ---- descriptor registry -----------------------------------------

    /// Registers `element` for readiness events on `fd`. Failure is
    /// reported to the caller and the registration skipped; it is not
    /// fatal to the pool.
    pub fn add_select(
        &self,
        fd: RawFd,
        element: &Arc<dyn Element>,
        mask: SelectMask,
    ) -> io::Result<()> {
        self.selects.add_select(fd, element, mask)
    }

    /// Drops `element`'s registration on the masked sides of `fd`.
    pub fn remove_select(
        &self,
        fd: RawFd,
        element: &Arc<dyn Element>,
        mask: SelectMask,
    ) -> io::Result<()> {
        self.selects.remove_select(fd, element, mask)
    }

    pub(crate) fn run_selects(&self, timeout: Option<Duration>, thread: &RouterThread) -> bool {
        self.selects.run_selects(timeout, thread)
    }

    // ---- routers -----------------------------------------------------

    pub(crate) fn register_router(&self, router: &Arc<Router>) {
        self.routers.lock().push(router.clone());
        tracing::debug!("router registered");
        self.driver_activate();
    }

    /// Detaches a router. Fails with [`MasterError::RouterInUse`] while
    /// the router still has scheduled tasks or timers; tear it down first.
    pub fn remove_router(&self, router: &Arc<Router>) -> Result<(), MasterError> {
        let in_use = router.scheduled_work();
        if in_use > 0 {
            return Err(MasterError::RouterInUse(in_use));
        }
        let mut routers = self.routers.lock();
        let Some(idx) = routers.iter().position(|r| Arc::ptr_eq(r, router)) else {
            return Err(MasterError::NotRegistered);
        };
        routers.remove(idx);
        tracing::debug!("router removed");
        Ok(())
    }

    /// Number of registered routers.
    pub fn nrouters(&self) -> usize {
        self.routers.lock().len()
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("nthreads", &self.nthreads())
            .field("runcount", &self.runcount())
            .field("timers", &self.timer_count())
            .finish()
    }
}

/// Pins the current thread to one CPU core.
#[cfg(target_os = "linux")]
fn set_cpu_affinity(core_id: usize) {
    unsafe {
        let mut cpuset = std::mem::zeroed::<libc::cpu_set_t>();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(core_id, &mut cpuset);
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        );
    }
}
