//! Hierarchical timing wheel.
//!
//! Two levels: a work wheel of `WORK_WHEEL_SIZE` buckets advanced every
//! `TIMER_RESOLUTION_MS`, and an assistant wheel where one slot equals
//! one full work-wheel revolution. A dedicated tick thread empties the
//! current work bucket and submits each still-alive task to the
//! scheduler as a one-shot routine; callbacks never run on the tick
//! thread. When the work index wraps, the next assistant bucket
//! cascades its tasks down into the work wheel.
//!
//! Insertion and cascade are O(1) per task. A live task sits in exactly
//! one bucket, and cascades down at most once per registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, error};
use parking_lot::Mutex;

use crate::config::{ASSISTANT_WHEEL_SIZE, TIMER_RESOLUTION_MS, WORK_WHEEL_SIZE};
use crate::scheduler;
use crate::timer::TimerTask;

lazy_static! {
    static ref TIMING_WHEEL: TimingWheel = TimingWheel::new();
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The process-wide timing wheel.
pub fn instance() -> &'static TimingWheel {
    INITIALIZED.store(true, Ordering::Release);
    &TIMING_WHEEL
}

/// Stop the tick thread if the wheel was ever constructed.
pub fn shutdown() {
    if INITIALIZED.load(Ordering::Acquire) {
        TIMING_WHEEL.shutdown();
    }
}

struct TimerBucket {
    tasks: Mutex<Vec<Weak<TimerTask>>>,
}

impl TimerBucket {
    fn new() -> TimerBucket {
        TimerBucket {
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn add_task(&self, task: &Arc<TimerTask>) {
        self.tasks.lock().push(Arc::downgrade(task));
    }
}

/// Paces the tick thread on absolute deadlines so tick length errors do
/// not accumulate.
struct Rate {
    period: Duration,
    next: Instant,
}

impl Rate {
    fn new(period: Duration) -> Rate {
        Rate {
            period,
            next: Instant::now() + period,
        }
    }

    fn sleep(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
        }
        self.next += self.period;
        // After a long stall, realign instead of firing a burst.
        let now = Instant::now();
        if self.next + self.period < now {
            self.next = now + self.period;
        }
    }
}

pub struct TimingWheel {
    work_wheel: Vec<TimerBucket>,
    assistant_wheel: Vec<TimerBucket>,
    current_work_index: Mutex<u64>,
    current_assistant_index: Mutex<u64>,
    running: AtomicBool,
    /// Guards start/shutdown transitions.
    running_mutex: Mutex<()>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
    tick_count: AtomicU64,
}

impl TimingWheel {
    fn new() -> TimingWheel {
        TimingWheel {
            work_wheel: (0..WORK_WHEEL_SIZE).map(|_| TimerBucket::new()).collect(),
            assistant_wheel: (0..ASSISTANT_WHEEL_SIZE)
                .map(|_| TimerBucket::new())
                .collect(),
            current_work_index: Mutex::new(0),
            current_assistant_index: Mutex::new(0),
            running: AtomicBool::new(false),
            running_mutex: Mutex::new(()),
            tick_thread: Mutex::new(None),
            tick_count: AtomicU64::new(0),
        }
    }

    /// Start the tick thread. Idempotent; `add_task` starts the wheel
    /// lazily.
    pub fn start(&'static self) {
        let _running_guard = self.running_mutex.lock();
        if self.running.load(Ordering::Acquire) {
            return;
        }
        debug!("timing wheel start");
        self.running.store(true, Ordering::Release);
        match thread::Builder::new()
            .name("timing_wheel".to_owned())
            .spawn(move || self.tick_func())
        {
            Ok(handle) => *self.tick_thread.lock() = Some(handle),
            Err(e) => {
                error!("failed to spawn timing wheel tick thread: {}", e);
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// Stop and join the tick thread.
    pub fn shutdown(&self) {
        let _running_guard = self.running_mutex.lock();
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.tick_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    /// Schedule `task` relative to the current tick.
    pub fn add_task(&'static self, task: &Arc<TimerTask>) {
        let base_index = *self.current_work_index.lock();
        self.add_task_at(task, base_index);
    }

    /// Schedule `task` relative to `base_index`, the insertion rules of
    /// the two-level wheel:
    ///
    /// - target within the work wheel: insert directly;
    /// - exactly one revolution out but behind the current index:
    ///   still this revolution, insert into the work wheel;
    /// - otherwise park in the assistant wheel, remembering the work
    ///   index to cascade into.
    pub fn add_task_at(&'static self, task: &Arc<TimerTask>, base_index: u64) {
        if !self.running.load(Ordering::Acquire) {
            self.start();
        }

        let ticks = task
            .next_fire_duration_ms
            .div_ceil(TIMER_RESOLUTION_MS)
            .max(1);
        let work_wheel_index = base_index + ticks;
        if work_wheel_index < WORK_WHEEL_SIZE {
            self.work_wheel[work_wheel_index as usize].add_task(task);
            debug!(
                "add task [{}] to work wheel, index {}",
                task.timer_id, work_wheel_index
            );
            return;
        }

        let real_work_index = work_wheel_index % WORK_WHEEL_SIZE;
        task.set_remainder_interval(real_work_index);
        let assistant_ticks = work_wheel_index / WORK_WHEEL_SIZE;
        if assistant_ticks == 1 && real_work_index < *self.current_work_index.lock() {
            // Still lands in the current work-wheel revolution.
            self.work_wheel[real_work_index as usize].add_task(task);
            debug!(
                "add task [{}] to work wheel, index {}",
                task.timer_id, real_work_index
            );
        } else {
            let assistant_index = {
                let current = self.current_assistant_index.lock();
                (*current + assistant_ticks) % ASSISTANT_WHEEL_SIZE
            };
            self.assistant_wheel[assistant_index as usize].add_task(task);
            debug!(
                "add task [{}] to assistant wheel, index {}",
                task.timer_id, assistant_index
            );
        }
    }

    /// Fire the current work bucket: every still-alive task is handed
    /// to the scheduler; dead weak references are dropped silently.
    fn tick(&'static self) {
        let index = *self.current_work_index.lock();
        let bucket = &self.work_wheel[index as usize];
        let mut tasks = bucket.tasks.lock();
        for weak_task in tasks.drain(..) {
            if let Some(task) = weak_task.upgrade() {
                debug!("index: {} timer id: {}", index, task.timer_id);
                scheduler::instance().async_task(move || {
                    if TIMING_WHEEL.running.load(Ordering::Acquire) {
                        task.run();
                    }
                });
            }
        }
    }

    /// Promote the given assistant bucket down into the work wheel.
    fn cascade(&'static self, assistant_index: u64) {
        let bucket = &self.assistant_wheel[assistant_index as usize];
        let mut tasks = bucket.tasks.lock();
        for weak_task in tasks.drain(..) {
            if let Some(task) = weak_task.upgrade() {
                let work_index = task.remainder_interval() % WORK_WHEEL_SIZE;
                self.work_wheel[work_index as usize].add_task(&task);
            }
        }
    }

    fn tick_func(&'static self) {
        scheduler::instance().set_inner_thread_attr(
            "timer",
            // SAFETY: handle/tid of the calling thread.
            unsafe { libc::pthread_self() },
            scheduler::pin_thread::this_tid(),
        );

        let mut rate = Rate::new(Duration::from_millis(TIMER_RESOLUTION_MS));
        while self.running.load(Ordering::Acquire) {
            self.tick();
            self.tick_count.fetch_add(1, Ordering::Release);
            rate.sleep();

            let wrapped = {
                let mut work_index = self.current_work_index.lock();
                *work_index = (*work_index + 1) % WORK_WHEEL_SIZE;
                *work_index == 0
            };

            if wrapped {
                let assistant_index = {
                    let mut index = self.current_assistant_index.lock();
                    *index = (*index + 1) % ASSISTANT_WHEEL_SIZE;
                    *index
                };
                self.cascade(assistant_index);
            }
        }
    }
}
