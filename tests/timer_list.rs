//! Timer list ordering, firing, and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pktgraph::{Builder, Master, Timer};

fn master() -> Arc<Master> {
    Builder::new().threads(1).build().expect("master builds")
}

fn counting_timer(master: &Arc<Master>, fires: &Arc<AtomicUsize>) -> Timer {
    let fires = fires.clone();
    let timer = Timer::from_hook(move |_| {
        fires.fetch_add(1, Ordering::SeqCst);
    });
    timer.initialize(master);
    timer
}

const FAR: Duration = Duration::from_secs(3600);

#[test]
fn test_fires_due_subset_exactly_once() {
    let master = master();
    let now = Instant::now();
    let fires: Vec<Arc<AtomicUsize>> = (0..4).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let timers: Vec<Timer> = fires.iter().map(|f| counting_timer(&master, f)).collect();

    // Insert in arbitrary order: two due, two far out.
    timers[2].schedule_at(now + FAR);
    timers[0].schedule_at(now);
    timers[3].schedule_at(now + FAR + Duration::from_secs(1));
    timers[1].schedule_at(now);
    assert_eq!(master.timer_count(), 4);

    master.run_timers();
    assert_eq!(fires[0].load(Ordering::SeqCst), 1);
    assert_eq!(fires[1].load(Ordering::SeqCst), 1);
    assert_eq!(fires[2].load(Ordering::SeqCst), 0);
    assert_eq!(fires[3].load(Ordering::SeqCst), 0);
    assert_eq!(master.timer_count(), 2);
    assert!(!timers[0].scheduled());
    assert!(timers[2].scheduled());

    // A second pass fires nothing new.
    master.run_timers();
    assert_eq!(fires[0].load(Ordering::SeqCst), 1);
    assert_eq!(fires[1].load(Ordering::SeqCst), 1);
}

#[test]
fn test_timer_delay_bounds_the_wait() {
    let master = master();
    assert_eq!(master.timer_delay(), None);

    let fires = Arc::new(AtomicUsize::new(0));
    let timer = counting_timer(&master, &fires);
    timer.schedule_after(Duration::from_millis(50));

    let delay = master.timer_delay().expect("one timer pending");
    assert!(delay <= Duration::from_millis(50));

    // An already-due timer yields a zero bound.
    timer.schedule_at(Instant::now());
    assert_eq!(master.timer_delay(), Some(Duration::ZERO));
}

#[test]
fn test_unschedule_cancels() {
    let master = master();
    let fires = Arc::new(AtomicUsize::new(0));
    let timer = counting_timer(&master, &fires);

    // Unscheduling an idle timer is a no-op.
    timer.unschedule();
    assert!(!timer.scheduled());

    timer.schedule_at(Instant::now());
    timer.unschedule();
    assert_eq!(master.timer_count(), 0);
    master.run_timers();
    assert_eq!(fires.load(Ordering::SeqCst), 0);
}

#[test]
fn test_reschedule_repositions() {
    let master = master();
    let fires = Arc::new(AtomicUsize::new(0));
    let timer = counting_timer(&master, &fires);

    timer.schedule_at(Instant::now() + FAR);
    assert!(timer.expiry().expect("scheduled") > Instant::now());
    timer.schedule_at(Instant::now());
    // Repositioned, not duplicated.
    assert_eq!(master.timer_count(), 1);

    master.run_timers();
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert_eq!(master.timer_count(), 0);
}

#[test]
fn test_self_reschedule_waits_for_next_scan() {
    let master = master();
    let fires = Arc::new(AtomicUsize::new(0));
    let timer = Timer::from_hook({
        let fires = fires.clone();
        move |timer| {
            fires.fetch_add(1, Ordering::SeqCst);
            // Immediately due again, but never in the same scan.
            timer.schedule_after(Duration::ZERO);
        }
    });
    timer.initialize(&master);
    timer.schedule_at(Instant::now());

    master.run_timers();
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert!(timer.scheduled());

    master.run_timers();
    assert_eq!(fires.load(Ordering::SeqCst), 2);
}

#[test]
fn test_equal_deadlines_fire_in_schedule_order() {
    let master = master();
    let order = Arc::new(Mutex::new(Vec::new()));
    let deadline = Instant::now();
    let timers: Vec<Timer> = (0..3)
        .map(|i| {
            let order = order.clone();
            let timer = Timer::from_hook(move |_| order.lock().push(i));
            timer.initialize(&master);
            timer
        })
        .collect();
    for timer in &timers {
        timer.schedule_at(deadline);
    }
    master.run_timers();
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[test]
fn test_callback_may_cancel_a_collected_timer() {
    // Two timers due in the same scan; the first one's callback
    // unschedules the second, which then must not fire.
    let master = master();
    let fires = Arc::new(AtomicUsize::new(0));
    let victim = counting_timer(&master, &fires);
    let killer = Timer::from_hook({
        let victim = victim.clone();
        move |_| victim.unschedule()
    });
    killer.initialize(&master);

    let now = Instant::now();
    killer.schedule_at(now);
    victim.schedule_at(now);

    master.run_timers();
    assert_eq!(fires.load(Ordering::SeqCst), 0);
    assert_eq!(master.timer_count(), 0);
}

#[test]
fn test_run_timers_paused_is_deferred() {
    let master = master();
    let fires = Arc::new(AtomicUsize::new(0));
    let timer = counting_timer(&master, &fires);
    timer.schedule_at(Instant::now());

    master.pause();
    master.run_timers();
    assert_eq!(fires.load(Ordering::SeqCst), 0);
    master.unpause();
    master.run_timers();
    assert_eq!(fires.load(Ordering::SeqCst), 1);
}
