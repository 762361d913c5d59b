//! Stackful coroutines ("routines").
//!
//! A routine is the unit of scheduling: a user body running on its own
//! stack, switched in and out by register save/restore. Each worker
//! thread keeps two thread-local slots: the routine currently executing
//! on it and the saved stack pointer of the worker's own OS stack, so
//! any number of workers can resume routines independently.
//!
//! State machine: `Ready` is the only state `resume` accepts. The body
//! leaves the running state through `yield_with` (explicit state),
//! `hang_up` (`DataWait`), or `sleep`. Reconciliation back to `Ready`
//! happens in `update_state`, driven by wake deadlines and the update
//! flag that notifiers clear.

pub mod context;
pub mod factory;
pub mod pool;

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;
use parking_lot::{Mutex, RwLock};

use crate::croutine::context::{RoutineContext, StackPtr};
use crate::error::RuntimeError;

/// Scheduling state of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutineState {
    /// Runnable; `resume` may switch to it.
    Ready = 0,
    /// Terminal; the body returned or the routine was force-stopped.
    Finished = 1,
    /// Waiting for a wake deadline.
    Sleep = 2,
    /// Waiting for an I/O event.
    IoWait = 3,
    /// Waiting for new data on an input channel.
    DataWait = 4,
}

impl RoutineState {
    fn from_u8(raw: u8) -> RoutineState {
        match raw {
            0 => RoutineState::Ready,
            1 => RoutineState::Finished,
            2 => RoutineState::Sleep,
            3 => RoutineState::IoWait,
            _ => RoutineState::DataWait,
        }
    }
}

/// Body of a routine. Runs at most once, on the routine's own stack.
pub type RoutineBody = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Routine currently executing on this thread, if any.
    static CURRENT_ROUTINE: Cell<*const Routine> = const { Cell::new(ptr::null()) };
    /// Saved stack pointer of this worker thread's own stack while a
    /// routine runs on top of it.
    static MAIN_STACK: Cell<StackPtr> = const { Cell::new(ptr::null_mut()) };
}

fn main_stack_slot() -> *mut StackPtr {
    MAIN_STACK.with(|slot| slot.as_ptr())
}

/// A stackful coroutine managed by the scheduler.
pub struct Routine {
    id: AtomicU64,
    name: RwLock<String>,
    group_name: RwLock<String>,
    priority: AtomicU32,
    state: AtomicU8,
    body: Mutex<Option<RoutineBody>>,
    context: RoutineContext,
    wake_time: Mutex<Instant>,
    force_stop: AtomicBool,
    /// Scheduling lock: whoever holds it may resume the routine and
    /// mutate its state.
    lock: AtomicBool,
    /// Reversed update flag: `false` means an event is pending.
    updated: AtomicBool,
}

impl Routine {
    /// Wrap a body into a dispatchable routine. The context is prepared
    /// so that the first `resume` enters the body.
    pub fn new(body: RoutineBody) -> Result<Arc<Routine>, RuntimeError> {
        let context = RoutineContext::new()?;
        let routine = Arc::new(Routine {
            id: AtomicU64::new(0),
            name: RwLock::new(String::new()),
            group_name: RwLock::new(String::new()),
            priority: AtomicU32::new(0),
            state: AtomicU8::new(RoutineState::Ready as u8),
            body: Mutex::new(Some(body)),
            context,
            wake_time: Mutex::new(Instant::now()),
            force_stop: AtomicBool::new(false),
            lock: AtomicBool::new(false),
            updated: AtomicBool::new(true),
        });
        // SAFETY: the context owns a fresh stack, and the routine's
        // address is stable behind the Arc for as long as the context
        // can be resumed.
        unsafe {
            context::make_context(
                routine_entry,
                Arc::as_ptr(&routine) as *mut c_void,
                &routine.context,
            );
        }
        Ok(routine)
    }

    // ---- static interfaces (operate on the current routine) ----

    /// Yield the current routine back to its worker after setting the
    /// given state.
    pub fn yield_with(state: RoutineState) {
        let current = CURRENT_ROUTINE.with(|slot| slot.get());
        if current.is_null() {
            error!("yield called outside of a routine");
            return;
        }
        // SAFETY: the pointer was installed by `resume` on this thread
        // and stays valid until the routine yields back.
        let routine = unsafe { &*current };
        routine.set_state(state);
        // SAFETY: both slots are valid; the main-stack slot holds the
        // worker's save from `resume`.
        unsafe {
            context::swap_context(routine.context.sp_slot(), main_stack_slot());
        }
    }

    /// Yield without changing state ("no data, give up the slice").
    pub fn yield_now() {
        let current = CURRENT_ROUTINE.with(|slot| slot.get());
        if current.is_null() {
            error!("yield called outside of a routine");
            return;
        }
        // SAFETY: as in `yield_with`.
        let routine = unsafe { &*current };
        unsafe {
            context::swap_context(routine.context.sp_slot(), main_stack_slot());
        }
    }

    /// Yield with state `DataWait`.
    pub fn hang_up() {
        Routine::yield_with(RoutineState::DataWait);
    }

    /// Set the wake deadline and yield with state `Sleep`.
    pub fn sleep(duration: Duration) {
        let armed = Routine::with_current(|r| {
            *r.wake_time.lock() = Instant::now() + duration;
        });
        if armed.is_some() {
            Routine::yield_with(RoutineState::Sleep);
        }
    }

    /// Run `f` against the routine executing on this thread, if any.
    pub fn with_current<R>(f: impl FnOnce(&Routine) -> R) -> Option<R> {
        let current = CURRENT_ROUTINE.with(|slot| slot.get());
        if current.is_null() {
            None
        } else {
            // SAFETY: installed by `resume` on this thread; valid while
            // the routine runs.
            Some(f(unsafe { &*current }))
        }
    }

    // ---- public interfaces ----

    /// Try to take the scheduling lock.
    pub fn acquire(&self) -> bool {
        !self.lock.swap(true, Ordering::Acquire)
    }

    /// Drop the scheduling lock.
    pub fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Signal that new data or an event is pending for this routine.
    pub fn set_update_flag(&self) {
        self.updated.store(false, Ordering::Release);
    }

    /// Switch to the routine's stack and run it until it yields.
    ///
    /// Caller must hold the scheduling lock. Only `Ready` routines are
    /// resumed; any other state is reported back unchanged. A pending
    /// `stop` turns into `Finished` without running the body.
    pub fn resume(&self) -> RoutineState {
        if self.force_stop.load(Ordering::Acquire) {
            self.set_state(RoutineState::Finished);
            return RoutineState::Finished;
        }

        let state = self.state();
        if state != RoutineState::Ready {
            error!("invalid routine state: resume of {} in {:?}", self.name(), state);
            return state;
        }

        CURRENT_ROUTINE.with(|slot| slot.set(self as *const Routine));
        // SAFETY: the scheduling lock serializes resumes, so the
        // context's saved stack pointer is owned by this thread for the
        // duration of the switch.
        unsafe {
            context::swap_context(main_stack_slot(), self.context.sp_slot());
        }
        CURRENT_ROUTINE.with(|slot| slot.set(ptr::null()));
        self.state()
    }

    /// Reconcile the state with elapsed deadlines and pending events,
    /// and return it.
    pub fn update_state(&self) -> RoutineState {
        // Synchronous event: wake deadline elapsed.
        if self.state() == RoutineState::Sleep && Instant::now() > *self.wake_time.lock() {
            self.set_state(RoutineState::Ready);
            return RoutineState::Ready;
        }

        // Asynchronous event: consume the update flag. A clear flag
        // means a notifier signalled since the last reconciliation.
        if !self.updated.swap(true, Ordering::AcqRel) {
            let state = self.state();
            if state == RoutineState::DataWait || state == RoutineState::IoWait {
                self.set_state(RoutineState::Ready);
            }
        }
        self.state()
    }

    /// Force the state to `Ready` (timers, external waking).
    pub fn wake(&self) {
        self.set_state(RoutineState::Ready);
    }

    /// Request termination; the next `resume` finishes without running.
    pub fn stop(&self) {
        self.force_stop.store(true, Ordering::Release);
    }

    // ---- getters and setters ----

    pub fn state(&self) -> RoutineState {
        RoutineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RoutineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_owned();
    }

    pub fn group_name(&self) -> String {
        self.group_name.read().clone()
    }

    pub fn set_group_name(&self, group_name: &str) {
        *self.group_name.write() = group_name.to_owned();
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Set the scheduling priority; values at or above `MAX_PRIO` are
    /// the dispatcher's responsibility to clamp.
    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn wake_time(&self) -> Instant {
        *self.wake_time.lock()
    }

    fn run(&self) {
        let body = self.body.lock().take();
        if let Some(body) = body {
            body();
        }
    }
}

/// Entry trampoline, invoked on the routine's stack by the first
/// resume. Runs the body once, then parks the routine in `Finished`
/// forever; it must never return.
extern "C" fn routine_entry(arg: *mut c_void) {
    // SAFETY: `arg` is the routine address installed by `make_context`;
    // the scheduler keeps the routine alive while it can run.
    let routine = unsafe { &*(arg as *const Routine) };
    routine.run();
    loop {
        Routine::yield_with(RoutineState::Finished);
    }
}
