//! Timing-wheel scenarios against the live tick thread.
//!
//! Uses the default scheduler configuration (no config document for
//! this process group). Wall-clock bounds are loose enough for CI; the
//! lower bounds are the contract, the upper bounds only catch gross
//! stalls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rover_runtime::timer::{timing_wheel, TimerTask};

static TEST_GUARD: Mutex<()> = Mutex::new(());

fn setup() -> parking_lot::MutexGuard<'static, ()> {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
    TEST_GUARD.lock()
}

struct Firing {
    at: Instant,
    thread_name: String,
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
fn test_fire_window_and_execution_thread() {
    let _guard = setup();

    let fired: Arc<Mutex<Option<Firing>>> = Arc::new(Mutex::new(None));
    let task = {
        let fired = fired.clone();
        Arc::new(TimerTask::new(1, 100, move || {
            *fired.lock() = Some(Firing {
                at: Instant::now(),
                thread_name: std::thread::current().name().unwrap_or("").to_owned(),
            });
        }))
    };

    let added_at = Instant::now();
    timing_wheel::instance().add_task(&task);
    assert!(wait_until(Duration::from_secs(3), || fired.lock().is_some()));

    let firing = fired.lock().take().unwrap();
    let elapsed = firing.at - added_at;
    assert!(elapsed >= Duration::from_millis(95), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "fired late: {:?}", elapsed);

    // Callbacks run on scheduler workers, never on the tick thread.
    assert!(
        firing.thread_name.starts_with("processor_"),
        "callback ran on {}",
        firing.thread_name
    );
}

#[test]
fn test_delay_zero_fires_on_next_tick() {
    let _guard = setup();

    let fired: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let task = {
        let fired = fired.clone();
        Arc::new(TimerTask::new(2, 0, move || {
            *fired.lock() = Some(Instant::now());
        }))
    };

    let added_at = Instant::now();
    timing_wheel::instance().add_task(&task);
    assert!(wait_until(Duration::from_secs(2), || fired.lock().is_some()));
    let elapsed = fired.lock().take().unwrap() - added_at;
    assert!(elapsed < Duration::from_millis(200), "next-tick fire took {:?}", elapsed);
}

#[test]
fn test_cascade_across_outer_wheel() {
    let _guard = setup();

    // 1000 ms exceeds one work-wheel revolution (512 ticks), so the
    // task parks in the assistant wheel and must cascade down before
    // firing.
    let fired: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let task = {
        let fired = fired.clone();
        Arc::new(TimerTask::new(3, 1000, move || {
            *fired.lock() = Some(Instant::now());
        }))
    };

    let added_at = Instant::now();
    timing_wheel::instance().add_task(&task);
    assert!(wait_until(Duration::from_secs(5), || fired.lock().is_some()));
    let elapsed = fired.lock().take().unwrap() - added_at;
    assert!(elapsed >= Duration::from_millis(950), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1800), "fired late: {:?}", elapsed);
}

#[test]
fn test_dropped_task_never_fires() {
    let _guard = setup();

    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = hits.clone();
        let task = Arc::new(TimerTask::new(4, 50, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        timing_wheel::instance().add_task(&task);
        // Strong reference dropped here: the wheel holds only a weak
        // one, which cancels the timer.
    }

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_periodic_task_readds_itself() {
    let _guard = setup();

    let hits = Arc::new(AtomicUsize::new(0));
    let self_slot: Arc<OnceLock<Weak<TimerTask>>> = Arc::new(OnceLock::new());

    let task = {
        let hits = hits.clone();
        let self_slot = self_slot.clone();
        Arc::new(TimerTask::new(5, 30, move || {
            let count = hits.fetch_add(1, Ordering::SeqCst) + 1;
            if count < 3 {
                if let Some(task) = self_slot.get().and_then(Weak::upgrade) {
                    timing_wheel::instance().add_task(&task);
                }
            }
        }))
    };
    self_slot.set(Arc::downgrade(&task)).ok().unwrap();

    timing_wheel::instance().add_task(&task);
    assert!(wait_until(Duration::from_secs(3), || {
        hits.load(Ordering::SeqCst) >= 3
    }));
}
