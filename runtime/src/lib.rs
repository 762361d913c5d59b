//! Rover task runtime.
//!
//! The task runtime core of the Rover robotics framework: a cooperative
//! stackful-coroutine scheduler that multiplexes many short-lived
//! computation routines across a small pool of CPU-pinned worker
//! threads, a data-arrival notification bus that wakes routines when
//! messages land on their channels, and a hierarchical timing wheel for
//! deferred work.
//!
//! # Overview
//!
//! - [`croutine`]: stackful coroutines, contexts and switches.
//! - [`scheduler`]: groups, priority buckets, processors, dispatch.
//! - [`data`]: channel buffers, visitors and the notifier bus.
//! - [`timer`]: timer tasks and the timing wheel.
//!
//! Routines are cooperative: suspension happens only at explicit
//! yields inside the routine body, never by preemption. Within a group,
//! strict priority applies across the `0..MAX_PRIO` levels and FIFO
//! order within one level.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rover_runtime::croutine::factory::create_routine_factory;
//! use rover_runtime::data::{ChannelBuffer, DataVisitor1};
//! use rover_runtime::{data, scheduler};
//!
//! let buffer = ChannelBuffer::<u64>::new(7, 16);
//! let visitor = Arc::new(DataVisitor1::new(buffer.clone()));
//! scheduler::instance().create_task(
//!     create_routine_factory(|range: u64| println!("obstacle at {} cm", range), visitor),
//!     "range_filter",
//! );
//!
//! // Transport side: deposit and notify.
//! buffer.push(142);
//! data::notifier::instance().notify(7);
//! ```

pub mod config;
pub mod croutine;
pub mod data;
pub mod error;
pub mod scheduler;
pub mod timer;

pub use croutine::{Routine, RoutineState};
pub use error::RuntimeError;

/// Tear the runtime down: timing wheel first (its callbacks feed the
/// scheduler), then the scheduler. Singletons that were never touched
/// are not constructed just to be torn down.
pub fn shutdown() {
    timer::timing_wheel::shutdown();
    scheduler::shutdown();
}
