//! Internal counters for debugging the scheduler.
//!
//! Only active when the `pktgraph_internal_counters` cfg flag is set; the
//! totals are dumped when the master drops.

#[cfg(pktgraph_internal_counters)]
mod imp {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;

    static NUM_TASK_RUNS: AtomicUsize = AtomicUsize::new(0);
    static NUM_TASK_MIGRATIONS: AtomicUsize = AtomicUsize::new(0);
    static NUM_TIMER_FIRES: AtomicUsize = AtomicUsize::new(0);
    static NUM_POLLS: AtomicUsize = AtomicUsize::new(0);

    impl Drop for super::Counters {
        fn drop(&mut self) {
            let task_runs = NUM_TASK_RUNS.load(Relaxed);
            let migrations = NUM_TASK_MIGRATIONS.load(Relaxed);
            let timer_fires = NUM_TIMER_FIRES.load(Relaxed);
            let polls = NUM_POLLS.load(Relaxed);

            println!("--- pktgraph scheduler counters ---");
            println!("      task runs: {}", task_runs);
            println!("     migrations: {}", migrations);
            println!("    timer fires: {}", timer_fires);
            println!("      i/o polls: {}", polls);
        }
    }

    pub(crate) fn inc_task_runs() {
        NUM_TASK_RUNS.fetch_add(1, Relaxed);
    }

    pub(crate) fn inc_task_migrations() {
        NUM_TASK_MIGRATIONS.fetch_add(1, Relaxed);
    }

    pub(crate) fn inc_timer_fires() {
        NUM_TIMER_FIRES.fetch_add(1, Relaxed);
    }

    pub(crate) fn inc_polls() {
        NUM_POLLS.fetch_add(1, Relaxed);
    }
}

#[cfg(not(pktgraph_internal_counters))]
mod imp {
    pub(crate) fn inc_task_runs() {}
    pub(crate) fn inc_task_migrations() {}
    pub(crate) fn inc_timer_fires() {}
    pub(crate) fn inc_polls() {}
}

/// Empty struct that triggers the counter dump on drop (when enabled).
#[derive(Debug)]
pub(crate) struct Counters;

pub(crate) use imp::*;
