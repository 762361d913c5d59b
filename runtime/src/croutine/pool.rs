//! Bounded routine context pool.
//!
//! Stacks are expensive to map, so a fixed number of them is allocated
//! up front and recycled as routines finish. Past capacity, stacks are
//! allocated directly with a warning and are not returned to the pool.

use lazy_static::lazy_static;
use log::warn;
use parking_lot::Mutex;

use crate::config;
use crate::croutine::context::GuardedStack;
use crate::error::RuntimeError;

lazy_static! {
    static ref CONTEXT_POOL: ContextPool = ContextPool::with_capacity(config::routine_num());
}

struct ContextPool {
    free: Mutex<Vec<GuardedStack>>,
}

impl ContextPool {
    fn with_capacity(capacity: u32) -> ContextPool {
        let mut free = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            match GuardedStack::new() {
                Ok(stack) => free.push(stack),
                Err(e) => {
                    warn!("routine context preallocation stopped early: {}", e);
                    break;
                }
            }
        }
        ContextPool {
            free: Mutex::new(free),
        }
    }
}

/// A stack checked out of the pool. Pooled stacks return to the free
/// list when dropped; overflow stacks are simply unmapped.
pub struct PooledStack {
    stack: Option<GuardedStack>,
    pooled: bool,
}

impl PooledStack {
    pub fn top(&self) -> *mut u8 {
        match &self.stack {
            Some(stack) => stack.top(),
            // The stack is only None transiently inside drop.
            None => std::ptr::null_mut(),
        }
    }
}

impl Drop for PooledStack {
    fn drop(&mut self) {
        if self.pooled {
            if let Some(stack) = self.stack.take() {
                CONTEXT_POOL.free.lock().push(stack);
            }
        }
    }
}

/// Check a stack out of the pool, falling back to a direct allocation
/// when every pooled slot is in use.
pub fn acquire_stack() -> Result<PooledStack, RuntimeError> {
    if let Some(stack) = CONTEXT_POOL.free.lock().pop() {
        return Ok(PooledStack {
            stack: Some(stack),
            pooled: true,
        });
    }
    warn!(
        "Maximum routine context number exceeded! Please check [routine_num] in config file."
    );
    Ok(PooledStack {
        stack: Some(GuardedStack::new()?),
        pooled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_returns_usable_stack() {
        let stack = acquire_stack().unwrap();
        assert!(!stack.top().is_null());
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn test_pooled_stack_recycles() {
        let before = CONTEXT_POOL.free.lock().len();
        if before == 0 {
            // Pool drained by concurrent tests; nothing to observe.
            return;
        }
        {
            let _stack = acquire_stack().unwrap();
            assert!(CONTEXT_POOL.free.lock().len() < before);
        }
        assert!(CONTEXT_POOL.free.lock().len() <= before);
    }
}
