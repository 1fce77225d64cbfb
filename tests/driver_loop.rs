//! The live thread pool: start/stop, the run-count gate, wake-from-idle,
//! timers during sleep, pause, and cross-thread migration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pktgraph::{Builder, ErrorSink, Master, Router, RouterBuilder, Task, Timer};

/// Builds a master and activates its run-count gate with an empty router.
fn activated_master(threads: usize) -> (Arc<Master>, Arc<Router>) {
    let master = Builder::new()
        .threads(threads)
        .thread_name("test-worker")
        .build()
        .expect("master builds");
    let mut errh = ErrorSink::new();
    let router = RouterBuilder::new()
        .initialize(&master, &mut errh)
        .expect("empty router activates");
    (master, router)
}

fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

#[test]
fn test_stop_without_activation() {
    let master = Builder::new().threads(2).build().unwrap();
    master.start().unwrap();
    // Workers are parked on the not-yet-running gate; stop releases them.
    master.stop();
    master.join();
}

#[test]
fn test_task_runs_until_runcount_closes() {
    let (master, _router) = activated_master(2);
    master.start().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let task = Task::from_hook({
        let runs = runs.clone();
        let master = master.clone();
        move |_| {
            if runs.fetch_add(1, Ordering::SeqCst) + 1 >= 1000 {
                master.please_stop_driver();
                false
            } else {
                true
            }
        }
    });
    task.initialize(&master, 0);

    // The stop request closes the gate; join reaps every worker.
    master.join();
    assert_eq!(runs.load(Ordering::SeqCst), 1000);
}

#[test]
fn test_external_schedule_wakes_sleeping_pool() {
    let (master, _router) = activated_master(1);
    master.start().unwrap();

    // No tasks, no timers: the worker blocks in the multiplexer.
    std::thread::sleep(Duration::from_millis(50));

    let hits = Arc::new(AtomicUsize::new(0));
    let task = Task::from_hook({
        let hits = hits.clone();
        move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
            false
        }
    });
    task.initialize(&master, 0);

    assert!(
        wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) > 0),
        "schedule onto a sleeping thread must interrupt its sleep"
    );
    master.stop();
    master.join();
}

#[test]
fn test_timer_fires_while_pool_sleeps() {
    let (master, _router) = activated_master(1);
    master.start().unwrap();

    let fires = Arc::new(AtomicUsize::new(0));
    let timer = Timer::from_hook({
        let fires = fires.clone();
        move |_| {
            fires.fetch_add(1, Ordering::SeqCst);
        }
    });
    timer.initialize(&master);
    timer.schedule_after(Duration::from_millis(30));

    assert!(
        wait_until(Duration::from_secs(2), || fires.load(Ordering::SeqCst) > 0),
        "idle pool must wake for the timer deadline"
    );
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    master.stop();
    master.join();
}

#[test]
fn test_pause_holds_the_pool() {
    let (master, _router) = activated_master(2);
    master.start().unwrap();

    master.pause();
    let runs = Arc::new(AtomicUsize::new(0));
    let task = Task::from_hook({
        let runs = runs.clone();
        move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            true
        }
    });
    task.initialize(&master, 0);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), 0, "paused pool runs nothing");

    master.unpause();
    assert!(wait_until(Duration::from_secs(2), || {
        runs.load(Ordering::SeqCst) > 0
    }));

    task.unschedule();
    master.stop();
    master.join();
}

#[test]
fn test_live_migration_keeps_task_running() {
    let (master, _router) = activated_master(2);
    master.start().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let task = Task::from_hook({
        let runs = runs.clone();
        move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            true
        }
    });
    task.initialize(&master, 0);

    assert!(wait_until(Duration::from_secs(2), || {
        runs.load(Ordering::SeqCst) > 100
    }));

    task.move_thread(1);
    assert_eq!(task.home_thread_id(), 1);
    let at_move = runs.load(Ordering::SeqCst);
    assert!(
        wait_until(Duration::from_secs(2), || {
            runs.load(Ordering::SeqCst) > at_move + 100
        }),
        "task keeps running on its new thread"
    );

    task.unschedule();
    assert!(wait_until(Duration::from_secs(2), || !task.scheduled()));
    master.stop();
    master.join();
}

#[test]
fn test_runcount_gate_counts_down() {
    let (master, _router) = activated_master(1);
    assert_eq!(master.runcount(), 1);
    master.adjust_runcount(2);
    assert_eq!(master.runcount(), 3);
    master.start().unwrap();

    // Three stop requests close the gate.
    master.please_stop_driver();
    master.please_stop_driver();
    assert!(master.runcount() > 0);
    master.please_stop_driver();
    master.join();
    assert!(master.runcount() <= 0);
}
