//! Classic per-group scheduling structure.
//!
//! Each group owns `MAX_PRIO` FIFO buckets of routine handles, one
//! read-write lock per bucket, and a condition variable with a
//! coalescing notify counter for idle workers. Any worker bound to the
//! group may pick any of its routines; the routine's own scheduling
//! lock keeps two workers from resuming the same routine.
//!
//! The notify counter is an upper bound on pending signals: a spurious
//! or timed-out wake does not consume it. That keeps a `notify` sent
//! between a failed scan and the wait from being lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::{Condvar, Mutex};

use crate::config::MAX_PRIO;
use crate::croutine::{Routine, RoutineState};
use crate::scheduler::processor_context::ProcessorContext;

/// Upper bound for one condition-variable wait; bounds lost-wakeup
/// damage.
const WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interval between lock probes while removing a routine that a worker
/// is still resuming.
const REMOVE_SPIN_INTERVAL: Duration = Duration::from_micros(1);

/// Shared state of one scheduling group.
pub struct GroupState {
    name: String,
    buckets: [spin::RwLock<Vec<Arc<Routine>>>; MAX_PRIO as usize],
    notify_counter: Mutex<u32>,
    cv: Condvar,
}

impl GroupState {
    pub fn new(name: &str) -> Arc<GroupState> {
        Arc::new(GroupState {
            name: name.to_owned(),
            buckets: core::array::from_fn(|_| spin::RwLock::new(Vec::new())),
            notify_counter: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append to the tail of the routine's priority bucket.
    pub fn enqueue(&self, cr: Arc<Routine>) {
        let prio = cr.priority().min(MAX_PRIO - 1) as usize;
        self.buckets[prio].write().push(cr);
    }

    /// Signal one waiting worker; signals coalesce in the counter.
    pub fn notify(&self) {
        {
            let mut counter = self.notify_counter.lock();
            *counter += 1;
        }
        self.cv.notify_one();
    }

    /// Stop-and-erase a routine from its bucket. Spins until the
    /// routine's scheduling lock can be taken, so no worker is inside
    /// `resume` when the handle is dropped.
    pub fn remove_routine(&self, cr: &Arc<Routine>) -> bool {
        let prio = cr.priority().min(MAX_PRIO - 1) as usize;
        let mut bucket = self.buckets[prio].write();
        let pos = match bucket.iter().position(|c| c.id() == cr.id()) {
            Some(pos) => pos,
            None => return false,
        };
        let target = bucket[pos].clone();
        target.stop();
        let mut spins: u64 = 0;
        while !target.acquire() {
            std::thread::sleep(REMOVE_SPIN_INTERVAL);
            spins += 1;
            if spins % 1000 == 0 {
                info!("waiting for task {} completion", target.name());
            }
        }
        bucket.remove(pos);
        target.release();
        true
    }

    /// Erase a finished routine from its bucket. No stop/spin: the
    /// caller just observed `Finished` from its own `resume`, so no
    /// other worker can be running it.
    pub fn erase(&self, cr: &Arc<Routine>) -> bool {
        let prio = cr.priority().min(MAX_PRIO - 1) as usize;
        let mut bucket = self.buckets[prio].write();
        match bucket.iter().position(|c| c.id() == cr.id()) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// One processor's binding to its group.
pub struct ClassicContext {
    group: Arc<GroupState>,
    stop: AtomicBool,
    /// Earliest wake deadline among sleeping routines seen by the last
    /// empty scan; bounds the next wait so sleeps resume on time.
    sleep_deadline: Mutex<Option<Instant>>,
}

impl ClassicContext {
    pub fn new(group: Arc<GroupState>) -> ClassicContext {
        ClassicContext {
            group,
            stop: AtomicBool::new(false),
            sleep_deadline: Mutex::new(None),
        }
    }

    pub fn group(&self) -> &Arc<GroupState> {
        &self.group
    }
}

impl ProcessorContext for ClassicContext {
    fn next_routine(&self) -> Option<Arc<Routine>> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }

        let mut earliest_wake: Option<Instant> = None;
        for prio in (0..MAX_PRIO as usize).rev() {
            let bucket = self.group.buckets[prio].read();
            for cr in bucket.iter() {
                if !cr.acquire() {
                    continue;
                }
                match cr.update_state() {
                    RoutineState::Ready => {
                        // Lock stays held; the worker releases it after
                        // resume.
                        return Some(cr.clone());
                    }
                    RoutineState::Sleep => {
                        let wake = cr.wake_time();
                        if earliest_wake.map_or(true, |cur| wake < cur) {
                            earliest_wake = Some(wake);
                        }
                        cr.release();
                    }
                    _ => cr.release(),
                }
            }
        }

        *self.sleep_deadline.lock() = earliest_wake;
        None
    }

    fn wait(&self) {
        let mut timeout = WAIT_TIMEOUT;
        if let Some(wake) = self.sleep_deadline.lock().take() {
            let until_wake = wake.saturating_duration_since(Instant::now());
            if until_wake < timeout {
                timeout = until_wake;
            }
        }

        let deadline = Instant::now() + timeout;
        let mut counter = self.group.notify_counter.lock();
        while *counter == 0 {
            if self.group.cv.wait_until(&mut counter, deadline).timed_out() {
                break;
            }
        }
        if *counter > 0 {
            *counter -= 1;
        }
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        {
            let mut counter = self.group.notify_counter.lock();
            *counter = u8::MAX as u32;
        }
        self.group.cv.notify_all();
    }
}
