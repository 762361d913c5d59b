//! Runtime configuration.
//!
//! Compile-time constants, the scheduler configuration document, and the
//! process-wide global data (process group, stable task ids).
//!
//! The configuration document is loaded once from
//! `conf/<process_group>.conf` under the working root. A missing or broken
//! file is not an error: the runtime logs a warning and continues with
//! defaults.

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use lazy_static::lazy_static;
use log::warn;
use serde::Deserialize;

use crate::error::RuntimeError;

/// Number of scheduling priorities; valid routine priorities are
/// `0..MAX_PRIO`, higher value runs first.
pub const MAX_PRIO: u32 = 20;

/// Usable stack space per routine (a guard page is mapped below it).
pub const STACK_SIZE: usize = 2 * 1024 * 1024;

/// Routine context pool capacity when the config does not raise it.
pub const DEFAULT_ROUTINE_NUM: u32 = 100;

/// Worker count for the implicit group when no groups are configured.
pub const DEFAULT_PROC_NUM: u32 = 2;

/// Name of the implicit group.
pub const DEFAULT_GROUP_NAME: &str = "default_grp";

/// Wall-clock milliseconds per timing-wheel tick.
pub const TIMER_RESOLUTION_MS: u64 = 1;

/// Inner (work) wheel bucket count; one revolution covers
/// `WORK_WHEEL_SIZE * TIMER_RESOLUTION_MS` milliseconds.
pub const WORK_WHEEL_SIZE: u64 = 512;

/// Outer (assistant) wheel bucket count; one assistant slot equals one
/// full inner revolution.
pub const ASSISTANT_WHEEL_SIZE: u64 = 64;

/// Environment variable selecting the process group (and thereby the
/// config file).
pub const PROCESS_GROUP_ENV: &str = "ROVER_PROCESS_GROUP";

const DEFAULT_PROCESS_GROUP: &str = "rover_default";

/// Root of the configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoverConf {
    #[serde(default)]
    pub scheduler_conf: SchedulerConf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConf {
    /// `classic` or `choreography`. Only the classic policy is built in;
    /// anything else falls back to it with a warning.
    pub policy: Option<String>,
    /// Capacity of the routine context pool.
    pub routine_num: Option<u32>,
    /// Worker count when no groups are configured.
    pub default_proc_num: Option<u32>,
    /// CPU set applied to the whole process before workers start.
    pub process_level_cpuset: Option<String>,
    #[serde(default)]
    pub classic_conf: ClassicConf,
    /// Attributes for named inner threads, e.g. `"timer"`.
    #[serde(default)]
    pub threads: Vec<InnerThreadConf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassicConf {
    #[serde(default)]
    pub groups: Vec<SchedGroupConf>,
}

/// One scheduling group: a named partition of routines together with the
/// workers that run them.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedGroupConf {
    pub name: String,
    #[serde(default = "default_processor_num")]
    pub processor_num: u32,
    /// CPU list, e.g. `"0-3,5,7"`.
    #[serde(default)]
    pub cpuset: String,
    /// `"range"` (every worker may run on any listed CPU) or `"1to1"`
    /// (the i-th worker is pinned to the i-th listed CPU).
    #[serde(default)]
    pub affinity: String,
    /// `"SCHED_FIFO"`, `"SCHED_RR"` or `"SCHED_OTHER"`.
    #[serde(default)]
    pub processor_policy: String,
    #[serde(default)]
    pub processor_prio: i32,
    #[serde(default)]
    pub tasks: Vec<TaskConf>,
}

fn default_processor_num() -> u32 {
    DEFAULT_PROC_NUM
}

/// Per-task scheduling override.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConf {
    pub name: String,
    #[serde(default)]
    pub prio: u32,
    /// Filled in from the enclosing group while the config is ingested.
    #[serde(default)]
    pub group_name: String,
}

/// Attributes for a named inner thread.
#[derive(Debug, Clone, Deserialize)]
pub struct InnerThreadConf {
    pub name: String,
    #[serde(default)]
    pub cpuset: String,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub prio: i32,
}

lazy_static! {
    static ref GLOBAL_CONF: RoverConf = load_conf();
}

/// The process-wide configuration, loaded on first access.
pub fn global_conf() -> &'static RoverConf {
    &GLOBAL_CONF
}

/// Name of the process group this process belongs to; selects the
/// configuration document.
pub fn process_group() -> String {
    env::var(PROCESS_GROUP_ENV).unwrap_or_else(|_| DEFAULT_PROCESS_GROUP.to_owned())
}

/// Path of the configuration document for the current process group.
pub fn conf_file_path() -> PathBuf {
    PathBuf::from("conf").join(format!("{}.conf", process_group()))
}

/// Routine context pool capacity resolved against the config.
pub fn routine_num() -> u32 {
    global_conf()
        .scheduler_conf
        .routine_num
        .unwrap_or(DEFAULT_ROUTINE_NUM)
}

/// Stable id for a task name. Dispatch and removal address routines by
/// this hash.
pub fn generate_hash_id(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

fn load_conf() -> RoverConf {
    match try_load_conf() {
        Ok(conf) => conf,
        Err(e) => {
            warn!("scheduler conf not usable ({}), using default scheduler", e);
            RoverConf::default()
        }
    }
}

fn try_load_conf() -> Result<RoverConf, RuntimeError> {
    let path = conf_file_path();
    let display = path.display().to_string();
    let text = fs::read_to_string(&path).map_err(|source| RuntimeError::ConfigIo {
        path: display.clone(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| RuntimeError::ConfigParse {
        path: display,
        source,
    })
}
