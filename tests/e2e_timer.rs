//! Timer E2E test suite entry point.
//!
//! Verifies tick cadence, affinity of tick execution, interval changes on
//! a running timer, and stop/shutdown behavior.
//!
//! Run with: `cargo test --test e2e_timer`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use monorail::{DispatchPriority, Dispatcher};

mod common {
    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    }
}

/// Phase tracking macro for structured test logging.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Assertion with logging for better test output.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

fn init_test(name: &str) {
    common::init_test_logging();
    test_phase!(name);
}

fn wait_for_ticks(counter: &AtomicUsize, target: usize, deadline: Duration) {
    let cutoff = Instant::now() + deadline;
    while counter.load(Ordering::SeqCst) < target {
        assert!(
            Instant::now() < cutoff,
            "timer produced only {} ticks before the deadline",
            counter.load(Ordering::SeqCst)
        );
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn ticks_land_on_the_affinity_thread_at_cadence() {
    init_test("ticks_land_on_the_affinity_thread_at_cadence");
    let (dispatcher, worker) = Dispatcher::spawn();
    let timer = dispatcher.create_timer(DispatchPriority::Background);
    timer.set_interval(Duration::from_millis(20)).unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    let off_thread_tick = Arc::new(AtomicBool::new(false));
    {
        let ticks = Arc::clone(&ticks);
        let off_thread_tick = Arc::clone(&off_thread_tick);
        let probe = dispatcher.clone();
        timer.on_tick(move || {
            if !probe.check_access() {
                off_thread_tick.store(true, Ordering::SeqCst);
            }
            ticks.fetch_add(1, Ordering::SeqCst);
        });
    }
    timer.start().unwrap();

    // An otherwise idle dispatcher running for 5x the interval must see at
    // least 4 ticks; the deadline is generous to absorb scheduler jitter.
    wait_for_ticks(&ticks, 4, Duration::from_secs(2));
    assert_with_log!(
        !off_thread_tick.load(Ordering::SeqCst),
        "every tick ran on the affinity thread",
        false,
        off_thread_tick.load(Ordering::SeqCst)
    );

    timer.stop();
    assert_with_log!(!timer.is_enabled(), "stop disables", false, timer.is_enabled());

    dispatcher.shutdown();
    worker.join().unwrap();
}

#[test]
fn interval_change_on_a_running_timer_keeps_it_running() {
    init_test("interval_change_on_a_running_timer_keeps_it_running");
    let (dispatcher, worker) = Dispatcher::spawn();
    let timer = dispatcher.create_timer(DispatchPriority::Normal);
    timer.set_interval(Duration::from_millis(250)).unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    {
        let ticks = Arc::clone(&ticks);
        timer.on_tick(move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        });
    }
    timer.start().unwrap();

    // Rearm much faster; the timer must stay enabled and tick at the new
    // cadence well before the old interval would have fired four times.
    timer.set_interval(Duration::from_millis(10)).unwrap();
    assert_with_log!(timer.is_enabled(), "still enabled after rearm", true, timer.is_enabled());
    wait_for_ticks(&ticks, 4, Duration::from_millis(900));

    timer.stop();
    dispatcher.shutdown();
    worker.join().unwrap();
}

#[test]
fn stopped_timer_produces_no_further_ticks() {
    init_test("stopped_timer_produces_no_further_ticks");
    let (dispatcher, worker) = Dispatcher::spawn();
    let timer = dispatcher.create_timer(DispatchPriority::Normal);
    timer.set_interval(Duration::from_millis(10)).unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    {
        let ticks = Arc::clone(&ticks);
        timer.on_tick(move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        });
    }
    timer.start().unwrap();
    wait_for_ticks(&ticks, 2, Duration::from_secs(2));
    timer.stop();

    // Let any tick already queued at stop() time flush through, then the
    // count must freeze: in-flight ticks observe the stopped state.
    dispatcher
        .process(DispatchPriority::SystemIdle)
        .unwrap()
        .wait()
        .unwrap();
    let frozen = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(60));
    let observed = ticks.load(Ordering::SeqCst);
    assert_with_log!(observed == frozen, "no ticks after stop", frozen, observed);

    dispatcher.shutdown();
    worker.join().unwrap();
}

#[test]
fn shutdown_force_stops_every_registered_timer() {
    init_test("shutdown_force_stops_every_registered_timer");
    let (dispatcher, worker) = Dispatcher::spawn();

    let timers: Vec<_> = [
        DispatchPriority::Background,
        DispatchPriority::Normal,
        DispatchPriority::Render,
    ]
    .into_iter()
    .map(|priority| {
        let timer = dispatcher.create_timer(priority);
        timer.set_interval(Duration::from_millis(50)).unwrap();
        timer.start().unwrap();
        timer
    })
    .collect();

    dispatcher.shutdown();
    worker.join().unwrap();

    for timer in &timers {
        assert_with_log!(
            !timer.is_enabled(),
            "timer force-stopped by shutdown",
            false,
            timer.is_enabled()
        );
    }
}
