//! Processor: a worker thread bound to one scheduling context.
//!
//! The loop is deliberately small: take the next runnable routine,
//! resume it, release its lock, and either clean it up (when it
//! finished) or go find another; block on the group when nothing is
//! runnable.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::croutine::{Routine, RoutineState};
use crate::error::RuntimeError;
use crate::scheduler::pin_thread;
use crate::scheduler::processor_context::ProcessorContext;

/// Hook invoked after a routine was observed `Finished`; removes it
/// from the registry and its bucket.
pub type FinishHook = Arc<dyn Fn(Arc<Routine>) + Send + Sync>;

static PROCESSOR_SEQ: AtomicU32 = AtomicU32::new(1);

pub struct Processor {
    context: Arc<dyn ProcessorContext>,
    running: Arc<AtomicBool>,
    tid: Arc<AtomicI32>,
    thread: Option<JoinHandle<()>>,
}

impl Processor {
    /// Spawn the worker thread immediately, bound to `context`.
    pub fn new(context: Arc<dyn ProcessorContext>, on_finished: FinishHook) -> Result<Processor, RuntimeError> {
        let running = Arc::new(AtomicBool::new(true));
        let tid = Arc::new(AtomicI32::new(-1));
        let name = format!("processor_{}", PROCESSOR_SEQ.fetch_add(1, Ordering::Relaxed));

        let thread = {
            let context = context.clone();
            let running = running.clone();
            let tid = tid.clone();
            let thread_name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    tid.store(pin_thread::this_tid(), Ordering::Release);
                    debug!("{} started, tid {}", thread_name, tid.load(Ordering::Relaxed));

                    while running.load(Ordering::Acquire) {
                        match context.next_routine() {
                            Some(cr) => {
                                let state = cr.resume();
                                cr.release();
                                if state == RoutineState::Finished {
                                    on_finished(cr);
                                }
                            }
                            None => context.wait(),
                        }
                    }
                })
                .map_err(|source| RuntimeError::ThreadSpawn { name, source })?
        };

        Ok(Processor {
            context,
            running,
            tid,
            thread: Some(thread),
        })
    }

    /// Native pthread handle of the worker, for affinity and policy.
    pub fn pthread(&self) -> Option<libc::pthread_t> {
        use std::os::unix::thread::JoinHandleExt;
        self.thread.as_ref().map(|t| t.as_pthread_t())
    }

    /// Kernel tid of the worker. Spins briefly until the thread
    /// published it.
    pub fn tid(&self) -> libc::pid_t {
        loop {
            let tid = self.tid.load(Ordering::Acquire);
            if tid != -1 {
                return tid;
            }
            std::hint::spin_loop();
        }
    }

    /// Stop the worker: shut the context down (broadcasting its
    /// condition variable) and join the thread.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.context.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::classic_context::{ClassicContext, GroupState};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_processor_drains_group() {
        let group = GroupState::new("proc_test");
        let hits = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let hits = hits.clone();
            let cr = Routine::new(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
            cr.set_id(i);
            group.enqueue(cr);
        }

        let ctx = Arc::new(ClassicContext::new(group.clone()));
        let fin = finished.clone();
        let grp = group.clone();
        let hook: FinishHook = Arc::new(move |cr| {
            grp.erase(&cr);
            fin.fetch_add(1, Ordering::SeqCst);
        });

        let mut processor = Processor::new(ctx, hook).unwrap();
        group.notify();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while finished.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        processor.stop();

        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let group = GroupState::new("proc_stop_test");
        let ctx = Arc::new(ClassicContext::new(group));
        let hook: FinishHook = Arc::new(|_| {});
        let mut processor = Processor::new(ctx, hook).unwrap();
        assert!(processor.tid() > 0);
        processor.stop();
        processor.stop();
    }
}
