//! Processor-facing scheduling context.
//!
//! A processor drives its group through exactly three operations; the
//! classic and choreography policies differ only behind this seam.

use std::sync::Arc;

use crate::croutine::Routine;

pub trait ProcessorContext: Send + Sync {
    /// Highest-priority runnable routine, with its scheduling lock
    /// held, or `None` when nothing is runnable (or the context was
    /// shut down).
    fn next_routine(&self) -> Option<Arc<Routine>>;

    /// Block until the group is signalled or a bounded timeout
    /// elapses.
    fn wait(&self);

    /// Stop handing out routines and release every waiting worker.
    fn shutdown(&self);
}
