//! End-to-end scheduler scenarios: one pinned worker, real context
//! switches.
//!
//! Every test runs against the shared scheduler singleton configured by
//! `conf/sched_test.conf` (one group, one processor), so the tests
//! serialize on a guard mutex. Timing assertions use bounds loose
//! enough for a loaded CI machine.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rover_runtime::config;
use rover_runtime::croutine::factory::{create_routine_factory, create_routine_factory_fn};
use rover_runtime::croutine::Routine;
use rover_runtime::data::{self, ChannelBuffer, DataVisitor1};
use rover_runtime::scheduler;
use rover_runtime::RoutineState;

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn setup() -> parking_lot::MutexGuard<'static, ()> {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        std::env::set_var(config::PROCESS_GROUP_ENV, "sched_test");
        let _ = env_logger::builder().is_test(true).try_init();
    });
    TEST_GUARD.lock()
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    done()
}

#[test]
fn test_priority_ordering_single_processor() {
    let _guard = setup();
    let scheduler = scheduler::instance();
    assert_eq!(scheduler.task_pool_size(), 1);

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(AtomicBool::new(false));

    // Stall the only worker at top priority while the contenders are
    // dispatched, so all three are queued before the first pick.
    {
        let gate = gate.clone();
        assert!(scheduler.create_task(
            create_routine_factory_fn(move || {
                while !gate.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
            }),
            "blocker",
        ));
    }

    for (name, marks) in [
        ("prio_a", &["A"][..]),
        ("prio_b", &["B", "B2"][..]),
        ("prio_c", &["C"][..]),
    ] {
        let order = order.clone();
        let marks: Vec<&'static str> = marks.to_vec();
        assert!(scheduler.create_task(
            create_routine_factory_fn(move || {
                order.lock().push(marks[0]);
                for &mark in &marks[1..] {
                    // Give the slice up as still-runnable; with no
                    // higher priority ready, the same routine must be
                    // picked again before any lower one.
                    Routine::yield_with(RoutineState::Ready);
                    order.lock().push(mark);
                }
            }),
            name,
        ));
    }

    gate.store(true, Ordering::Release);
    assert!(wait_until(Duration::from_secs(5), || order.lock().len() == 4));
    assert_eq!(*order.lock(), vec!["B", "B2", "C", "A"]);
}

#[test]
fn test_data_wait_wakeup() {
    let _guard = setup();
    let scheduler = scheduler::instance();

    let channel_id = 77_001;
    let buffer = ChannelBuffer::<i64>::new(channel_id, 8);
    let visitor = Arc::new(DataVisitor1::new(buffer.clone()));
    let observed = Arc::new(AtomicI64::new(-1));

    {
        let observed = observed.clone();
        assert!(scheduler.create_task(
            create_routine_factory(
                move |value: i64| {
                    observed.store(value, Ordering::SeqCst);
                },
                visitor,
            ),
            "range_consumer",
        ));
    }

    // Let the routine run its first empty slice and park in DataWait.
    // The update-flag protocol makes the wakeup correct in every
    // interleaving, so this is just realism, not a precondition.
    std::thread::sleep(Duration::from_millis(20));

    let pushed_at = Instant::now();
    buffer.push(42);
    assert!(data::notifier::instance().notify(channel_id));

    assert!(wait_until(Duration::from_secs(2), || {
        observed.load(Ordering::SeqCst) == 42
    }));
    assert!(pushed_at.elapsed() < Duration::from_millis(500));

    assert!(scheduler.remove_task("range_consumer"));
}

#[test]
fn test_sleep_precision() {
    let _guard = setup();
    let scheduler = scheduler::instance();

    let slept: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));
    {
        let slept = slept.clone();
        assert!(scheduler.create_task(
            create_routine_factory_fn(move || {
                let before = Instant::now();
                Routine::sleep(Duration::from_millis(50));
                *slept.lock() = Some(before.elapsed());
            }),
            "napper",
        ));
    }

    assert!(wait_until(Duration::from_secs(3), || slept.lock().is_some()));
    let elapsed = slept.lock().take().unwrap();
    assert!(elapsed >= Duration::from_millis(50), "woke early: {:?}", elapsed);
    assert!(
        elapsed < Duration::from_millis(150),
        "sleep wake too late: {:?}",
        elapsed
    );
}

#[test]
fn test_remove_during_resume_waits_for_completion() {
    let _guard = setup();
    let scheduler = scheduler::instance();

    let started = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicBool::new(false));
    {
        let started = started.clone();
        let completed = completed.clone();
        assert!(scheduler.create_task(
            create_routine_factory_fn(move || {
                started.store(true, Ordering::SeqCst);
                // A callback that holds the worker for a while.
                std::thread::sleep(Duration::from_millis(20));
                completed.store(true, Ordering::SeqCst);
                loop {
                    Routine::hang_up();
                }
            }),
            "remove_me",
        ));
    }

    assert!(wait_until(Duration::from_secs(2), || {
        started.load(Ordering::SeqCst)
    }));

    // The worker is inside resume; removal must block until the
    // callback finishes and the routine yields.
    let remove_started = Instant::now();
    assert!(scheduler.remove_task("remove_me"));
    assert!(completed.load(Ordering::SeqCst));
    assert!(
        remove_started.elapsed() >= Duration::from_millis(5),
        "remove returned while the callback should still have been running"
    );

    // Gone from the registry: data notifications find nobody.
    assert!(!scheduler.notify_processor(config::generate_hash_id("remove_me")));
}
