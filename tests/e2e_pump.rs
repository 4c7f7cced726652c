//! Message pump E2E test suite entry point.
//!
//! Exercises the FIFO contract, the drain-on-exit guarantee, panic
//! containment for awaitable work, and the dedicated-thread convenience.
//!
//! Run with: `cargo test --test e2e_pump`

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use monorail::{CancelSource, CancelToken, MessagePump};

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

#[test]
fn entries_run_in_submission_order() {
    init_test("entries_run_in_submission_order");
    let pump = MessagePump::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in 0..10u32 {
        let order = Arc::clone(&order);
        pump.post(None, move || order.lock().unwrap().push(tag)).unwrap();
    }
    pump.run(CancelToken::canceled());

    let observed = order.lock().unwrap().clone();
    let expected: Vec<u32> = (0..10).collect();
    assert_with_log!(observed == expected, "plain FIFO", expected, observed);
}

#[test]
fn everything_enqueued_before_exit_runs_exactly_once() {
    init_test("everything_enqueued_before_exit_runs_exactly_once");
    let pump = MessagePump::new();
    let exit = CancelSource::new();
    let worker = pump.run_in_thread(exit.token());

    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let runs = Arc::clone(&runs);
        pump.post(None, move || {
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    exit.cancel();
    worker.join().unwrap();

    let observed = runs.load(Ordering::SeqCst);
    assert_with_log!(observed == 64, "no drop, no double-run", 64usize, observed);
    assert!(pump.is_empty());
}

#[test]
fn invoke_async_returns_values_across_threads() {
    init_test("invoke_async_returns_values_across_threads");
    let pump = MessagePump::new();
    let exit = CancelSource::new();
    let worker = pump.run_in_thread(exit.token());

    let ticket = pump.invoke_async(None, || 6 * 7).unwrap();
    assert_eq!(ticket.wait(), Ok(42));

    exit.cancel();
    worker.join().unwrap();
}

#[test]
fn awaitable_panic_is_contained_and_the_loop_survives() {
    init_test("awaitable_panic_is_contained_and_the_loop_survives");
    let pump = MessagePump::new();
    let exit = CancelSource::new();
    let worker = pump.run_in_thread(exit.token());

    let faulted = pump
        .invoke_async::<(), _>(None, || panic!("pump boom"))
        .unwrap();
    let resumed = catch_unwind(AssertUnwindSafe(|| faulted.wait())).unwrap_err();
    assert_eq!(*resumed.downcast::<&str>().unwrap(), "pump boom");

    let alive = pump.invoke_async(None, || 1).unwrap();
    assert_eq!(alive.wait(), Ok(1));

    exit.cancel();
    worker.join().unwrap();
}

#[test]
fn setup_action_runs_on_the_pump_thread_before_the_loop() {
    init_test("setup_action_runs_on_the_pump_thread_before_the_loop");
    let pump = MessagePump::new();
    let exit = CancelSource::new();

    let setup_thread = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&setup_thread);
    let worker = pump.run_in_thread_with(
        move || {
            *recorded.lock().unwrap() = Some(thread::current().id());
        },
        exit.token(),
    );

    let observed_thread = pump
        .invoke_async(None, || thread::current().id())
        .unwrap()
        .wait()
        .unwrap();

    let setup_ran_on = setup_thread.lock().unwrap().expect("setup ran");
    assert_with_log!(
        setup_ran_on == observed_thread,
        "setup and callbacks share the pump thread",
        setup_ran_on,
        observed_thread
    );

    exit.cancel();
    worker.join().unwrap();
}
