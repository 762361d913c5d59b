//! Thread pinning and real-time scheduling policy.
//!
//! Workers are bound to CPU cores per their group's cpuset and affinity
//! mode, and put under the group's kernel scheduling policy. All of
//! this is best effort: on failure (insufficient privileges, bad CPU
//! index) the runtime logs and keeps going on default scheduling.

use std::mem;

use log::{info, warn};

use crate::error::RuntimeError;

/// Parse a CPU list: comma-separated items, each a single index or an
/// inclusive `a-b` range, e.g. `"0-3,5,7"`.
pub fn parse_cpuset(list: &str) -> Result<Vec<usize>, RuntimeError> {
    let mut cpus = Vec::new();
    for item in list.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('-') {
            None => {
                let cpu = item
                    .parse::<usize>()
                    .map_err(|_| RuntimeError::InvalidCpuset(item.to_owned()))?;
                cpus.push(cpu);
            }
            Some((lo, hi)) => {
                let lo = lo
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| RuntimeError::InvalidCpuset(item.to_owned()))?;
                let hi = hi
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| RuntimeError::InvalidCpuset(item.to_owned()))?;
                if lo > hi {
                    return Err(RuntimeError::InvalidCpuset(item.to_owned()));
                }
                cpus.extend(lo..=hi);
            }
        }
    }
    Ok(cpus)
}

/// Bind a thread to CPUs from `cpus`.
///
/// `"range"` allows the thread on every listed CPU; `"1to1"` pins it to
/// `cpus[cpu_index]`. Any other mode leaves the thread unbound.
pub fn set_sched_affinity(thread: libc::pthread_t, cpus: &[usize], affinity: &str, cpu_index: usize) {
    if cpus.is_empty() {
        return;
    }

    // SAFETY: cpu_set_t is plain old data; an all-zero set is valid.
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    unsafe { libc::CPU_ZERO(&mut set) };

    match affinity {
        "range" => {
            for &cpu in cpus {
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
        }
        "1to1" => {
            if cpu_index >= cpus.len() {
                warn!(
                    "1to1 affinity index {} out of range for cpuset of {} entries",
                    cpu_index,
                    cpus.len()
                );
                return;
            }
            unsafe { libc::CPU_SET(cpus[cpu_index], &mut set) };
        }
        _ => return,
    }

    // SAFETY: `thread` is a live pthread handle and `set` a valid set.
    let rc = unsafe { libc::pthread_setaffinity_np(thread, mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc == 0 {
        info!("thread bound with {} affinity", affinity);
    } else {
        warn!("pthread_setaffinity_np failed: {}", rc);
    }
}

/// Restrict the whole process to `cpus`.
pub fn set_process_affinity(cpus: &[usize]) {
    if cpus.is_empty() {
        return;
    }
    // SAFETY: as in set_sched_affinity; pid 0 addresses this process.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        let rc = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!("sched_setaffinity failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Apply a kernel scheduling policy to a thread.
///
/// `SCHED_FIFO` and `SCHED_RR` go through `pthread_setschedparam` with
/// the given real-time priority; `SCHED_OTHER` sets the nice value of
/// the thread's tid instead.
pub fn set_sched_policy(thread: libc::pthread_t, policy: &str, priority: i32, tid: libc::pid_t) {
    // SAFETY: sched_param is plain old data.
    let mut param: libc::sched_param = unsafe { mem::zeroed() };
    param.sched_priority = priority;

    match policy {
        "SCHED_FIFO" => {
            // SAFETY: live pthread handle, initialized param.
            let rc = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };
            log_policy_result("SCHED_FIFO", tid, rc);
        }
        "SCHED_RR" => {
            // SAFETY: as above.
            let rc = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_RR, &param) };
            log_policy_result("SCHED_RR", tid, rc);
        }
        "SCHED_OTHER" => {
            // SAFETY: setpriority on our own tid.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, tid as libc::id_t, priority) };
            log_policy_result("SCHED_OTHER", tid, rc);
        }
        "" => {}
        other => warn!("unknown processor policy: {}", other),
    }
}

fn log_policy_result(policy: &str, tid: libc::pid_t, rc: i32) {
    if rc == 0 {
        info!("thread {} set sched_policy: {}", tid, policy);
    } else {
        warn!("thread {} failed to set sched_policy {} ({})", tid, policy, rc);
    }
}

/// Kernel thread id of the calling thread.
pub fn this_tid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_range() {
        assert_eq!(parse_cpuset("0-3,5,7").unwrap(), vec![0, 1, 2, 3, 5, 7]);
        assert_eq!(parse_cpuset("2").unwrap(), vec![2]);
        assert_eq!(parse_cpuset("").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpuset("a").is_err());
        assert!(parse_cpuset("3-1").is_err());
        assert!(parse_cpuset("1-x").is_err());
    }

    #[test]
    fn test_this_tid_is_stable() {
        assert_eq!(this_tid(), this_tid());
        assert!(this_tid() > 0);
    }
}
