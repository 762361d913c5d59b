//! Task scheduling.
//!
//! The scheduler is a process-wide singleton built lazily from the
//! configuration document on first use. Its policy is `classic`:
//! priority-bucketed groups of routines, each group served by a fixed
//! set of CPU-pinned worker threads.

pub mod classic;
pub mod classic_context;
pub mod pin_thread;
pub mod processor;
pub mod processor_context;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;

pub use classic::SchedulerClassic;
pub use classic_context::{ClassicContext, GroupState};
pub use processor::Processor;
pub use processor_context::ProcessorContext;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref SCHEDULER: Arc<SchedulerClassic> = {
        INITIALIZED.store(true, Ordering::Release);
        SchedulerClassic::create()
    };
}

/// The process-wide scheduler, constructed on first access.
pub fn instance() -> &'static SchedulerClassic {
    &SCHEDULER
}

/// Shut the scheduler down if it was ever constructed; never
/// constructs one just to tear it down.
pub fn shutdown() {
    if INITIALIZED.load(Ordering::Acquire) {
        SCHEDULER.shutdown();
    }
}
