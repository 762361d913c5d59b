//! Context-pool exhaustion: a pool of two stacks must serve a third
//! routine through direct allocation, with exactly one warning.
//!
//! Runs in its own process (`conf/pool_test.conf`, `routine_num = 2`)
//! so no other test can drain or refill the pool underneath it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{Level, LevelFilter, Log, Metadata, Record};

use rover_runtime::config;
use rover_runtime::croutine::Routine;
use rover_runtime::scheduler;

struct CountingLogger {
    exceeded_warnings: AtomicUsize,
}

impl Log for CountingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if record.level() == Level::Warn
            && record
                .args()
                .to_string()
                .contains("Maximum routine context number exceeded")
        {
            self.exceeded_warnings.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

static LOGGER: CountingLogger = CountingLogger {
    exceeded_warnings: AtomicUsize::new(0),
};

fn parked_routine() -> Arc<Routine> {
    Routine::new(Box::new(|| loop {
        Routine::hang_up();
    }))
    .unwrap()
}

#[test]
fn test_pool_exhaustion_falls_back_with_one_warning() {
    std::env::set_var(config::PROCESS_GROUP_ENV, "pool_test");
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Warn);

    assert_eq!(config::routine_num(), 2);

    // Create before dispatching so no stack can be recycled in
    // between: the third creation must overflow the pool.
    let routines = [parked_routine(), parked_routine(), parked_routine()];
    assert_eq!(LOGGER.exceeded_warnings.load(Ordering::SeqCst), 1);

    let scheduler = scheduler::instance();
    for (i, cr) in routines.iter().enumerate() {
        cr.set_id(i as u64 + 1);
        cr.set_name(&format!("pool_task_{}", i));
        assert!(scheduler.dispatch_task(cr.clone()));
    }

    // All three dispatched; still exactly one warning.
    assert_eq!(LOGGER.exceeded_warnings.load(Ordering::SeqCst), 1);

    for cr in &routines {
        assert!(scheduler.remove_routine(cr.id()));
    }
}
