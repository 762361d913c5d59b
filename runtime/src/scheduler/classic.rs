//! Classic scheduler: the global registry and dispatch entry points.
//!
//! Owns every processor, the id→routine registry, the per-group ready
//! structures and the per-task configuration. Concurrent dispatch and
//! removal of the same routine id are linearized through a per-id
//! mutex map, so one of two racing dispatches of an id wins and the
//! loser observes the duplicate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{
    self, InnerThreadConf, SchedGroupConf, TaskConf, DEFAULT_GROUP_NAME, DEFAULT_PROC_NUM,
    MAX_PRIO,
};
use crate::croutine::factory::{create_routine_factory_fn, RoutineFactory};
use crate::croutine::{Routine, RoutineState};
use crate::data::notifier::{self, Notifier};
use crate::scheduler::classic_context::{ClassicContext, GroupState};
use crate::scheduler::pin_thread;
use crate::scheduler::processor::{FinishHook, Processor};

static ASYNC_TASK_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct SchedulerClassic {
    /// Registry of every dispatched routine.
    id_cr_map: RwLock<HashMap<u64, Arc<Routine>>>,
    /// Per-id mutexes serializing dispatch/remove of the same id.
    /// Entries persist for the life of the scheduler.
    id_mutex_map: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    groups: HashMap<String, Arc<GroupState>>,
    /// Routines without a per-task config land in the first configured
    /// group.
    first_group: String,
    task_confs: HashMap<String, TaskConf>,
    inner_thread_confs: HashMap<String, InnerThreadConf>,
    processors: Mutex<Vec<Processor>>,
    task_pool_size: u32,
    stop: AtomicBool,
}

impl SchedulerClassic {
    /// Build the scheduler from the global config and start its
    /// workers.
    pub(crate) fn create() -> Arc<SchedulerClassic> {
        let sched_conf = &config::global_conf().scheduler_conf;

        match sched_conf.policy.as_deref() {
            None | Some("classic") => {}
            Some("choreography") => {
                warn!("choreography policy is not built in, falling back to classic");
            }
            Some(other) => {
                warn!("invalid scheduler policy: {}, falling back to classic", other);
            }
        }

        let mut inner_thread_confs = HashMap::new();
        for thread_conf in &sched_conf.threads {
            inner_thread_confs.insert(thread_conf.name.clone(), thread_conf.clone());
        }

        if let Some(cpuset) = &sched_conf.process_level_cpuset {
            match pin_thread::parse_cpuset(cpuset) {
                Ok(cpus) => pin_thread::set_process_affinity(&cpus),
                Err(e) => warn!("ignoring process_level_cpuset: {}", e),
            }
        }

        let mut group_confs = sched_conf.classic_conf.groups.clone();
        if group_confs.is_empty() {
            group_confs.push(SchedGroupConf {
                name: DEFAULT_GROUP_NAME.to_owned(),
                processor_num: sched_conf.default_proc_num.unwrap_or(DEFAULT_PROC_NUM),
                cpuset: String::new(),
                affinity: String::new(),
                processor_policy: String::new(),
                processor_prio: 0,
                tasks: Vec::new(),
            });
        }

        let mut groups = HashMap::new();
        let mut task_confs = HashMap::new();
        let mut task_pool_size = 0;
        for group_conf in &group_confs {
            task_pool_size += group_conf.processor_num;
            groups.insert(group_conf.name.clone(), GroupState::new(&group_conf.name));
            for task in &group_conf.tasks {
                let mut task = task.clone();
                task.group_name = group_conf.name.clone();
                task_confs.insert(task.name.clone(), task);
            }
        }

        let scheduler = Arc::new(SchedulerClassic {
            id_cr_map: RwLock::new(HashMap::new()),
            id_mutex_map: Mutex::new(HashMap::new()),
            groups,
            first_group: group_confs[0].name.clone(),
            task_confs,
            inner_thread_confs,
            processors: Mutex::new(Vec::new()),
            task_pool_size,
            stop: AtomicBool::new(false),
        });
        scheduler.create_processors(&group_confs);
        scheduler
    }

    fn create_processors(self: &Arc<Self>, group_confs: &[SchedGroupConf]) {
        let weak = Arc::downgrade(self);
        let hook: FinishHook = Arc::new(move |cr| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.on_routine_finished(&cr);
            }
        });

        let mut processors = self.processors.lock();
        for group_conf in group_confs {
            let group = match self.groups.get(&group_conf.name) {
                Some(group) => group,
                None => continue,
            };
            let cpus = if group_conf.cpuset.is_empty() {
                Vec::new()
            } else {
                match pin_thread::parse_cpuset(&group_conf.cpuset) {
                    Ok(cpus) => cpus,
                    Err(e) => {
                        warn!("ignoring cpuset of group {}: {}", group_conf.name, e);
                        Vec::new()
                    }
                }
            };

            for i in 0..group_conf.processor_num {
                let context = Arc::new(ClassicContext::new(group.clone()));
                match Processor::new(context, hook.clone()) {
                    Ok(processor) => {
                        if let Some(pthread) = processor.pthread() {
                            pin_thread::set_sched_affinity(
                                pthread,
                                &cpus,
                                &group_conf.affinity,
                                i as usize,
                            );
                            pin_thread::set_sched_policy(
                                pthread,
                                &group_conf.processor_policy,
                                group_conf.processor_prio,
                                processor.tid(),
                            );
                        }
                        processors.push(processor);
                    }
                    Err(e) => error!("failed to start processor for group {}: {}", group_conf.name, e),
                }
            }
        }
    }

    fn id_mutex(&self, id: u64) -> Arc<Mutex<()>> {
        self.id_mutex_map
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn group_of(&self, cr: &Routine) -> Option<&Arc<GroupState>> {
        self.groups.get(&cr.group_name())
    }

    /// Register a routine and queue it as runnable.
    ///
    /// Applies the per-task configuration (priority, group), clamps the
    /// priority into `0..MAX_PRIO`, and signals the group. Fails on a
    /// duplicate id, leaving the registry unchanged.
    pub fn dispatch_task(&self, cr: Arc<Routine>) -> bool {
        let id_mutex = self.id_mutex(cr.id());
        let _id_guard = id_mutex.lock();

        {
            let mut id_map = self.id_cr_map.write();
            if id_map.contains_key(&cr.id()) {
                return false;
            }
            id_map.insert(cr.id(), cr.clone());
        }

        match self.task_confs.get(&cr.name()) {
            Some(task_conf) => {
                cr.set_priority(task_conf.prio);
                cr.set_group_name(&task_conf.group_name);
            }
            None => {
                // Routine not present in the config: first group, keep
                // whatever priority it carries.
                cr.set_group_name(&self.first_group);
            }
        }

        if cr.priority() >= MAX_PRIO {
            warn!(
                "{} prio is greater than MAX_PRIO[{}]",
                cr.name(),
                MAX_PRIO
            );
            cr.set_priority(MAX_PRIO - 1);
        }

        let group = match self.group_of(&cr) {
            Some(group) => group,
            None => {
                warn!(
                    "task {} configured into unknown group {}, using {}",
                    cr.name(),
                    cr.group_name(),
                    self.first_group
                );
                cr.set_group_name(&self.first_group);
                match self.group_of(&cr) {
                    Some(group) => group,
                    None => {
                        self.id_cr_map.write().remove(&cr.id());
                        return false;
                    }
                }
            }
        };

        group.enqueue(cr.clone());
        group.notify();
        true
    }

    /// Wake the routine with this id after new data arrived: flip its
    /// update flag (when it is actually waiting) and signal its group.
    pub fn notify_processor(&self, crid: u64) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }

        let cr = self.id_cr_map.read().get(&crid).cloned();
        match cr {
            Some(cr) => {
                let state = cr.state();
                if state == RoutineState::DataWait || state == RoutineState::IoWait {
                    cr.set_update_flag();
                }
                if let Some(group) = self.group_of(&cr) {
                    group.notify();
                }
                true
            }
            None => false,
        }
    }

    /// Remove the routine registered under this task name.
    pub fn remove_task(&self, name: &str) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }
        self.remove_routine(config::generate_hash_id(name))
    }

    /// Remove a routine by id. Blocks until no worker is inside its
    /// `resume`; frames suspended on the routine's stack are discarded
    /// without unwinding.
    pub fn remove_routine(&self, crid: u64) -> bool {
        let id_mutex = self.id_mutex(crid);
        let _id_guard = id_mutex.lock();

        let cr = {
            let mut id_map = self.id_cr_map.write();
            match id_map.remove(&crid) {
                Some(cr) => {
                    cr.stop();
                    cr
                }
                None => return false,
            }
        };

        match self.group_of(&cr) {
            Some(group) => group.remove_routine(&cr),
            None => false,
        }
    }

    /// Post-`Finished` cleanup, invoked from the worker that observed
    /// the terminal state.
    fn on_routine_finished(&self, cr: &Arc<Routine>) {
        let id_mutex = self.id_mutex(cr.id());
        let _id_guard = id_mutex.lock();

        self.id_cr_map.write().remove(&cr.id());
        if let Some(group) = self.group_of(cr) {
            group.erase(cr);
        }
    }

    /// Build a routine from a factory, dispatch it, and hook its data
    /// visitor's channels up to the notifier bus.
    pub fn create_task(&self, factory: RoutineFactory, name: &str) -> bool {
        if self.stop.load(Ordering::Acquire) {
            warn!("scheduler is stopped, can not create task {}", name);
            return false;
        }

        let task_id = config::generate_hash_id(name);
        let (body, visitor) = factory.into_parts();
        let cr = match Routine::new(body) {
            Ok(cr) => cr,
            Err(e) => {
                error!("failed to create routine for task {}: {}", name, e);
                return false;
            }
        };
        cr.set_id(task_id);
        cr.set_name(name);

        if !self.dispatch_task(cr) {
            return false;
        }

        if let Some(visitor) = visitor {
            for channel_id in visitor.channel_ids() {
                notifier::instance().add_notifier(
                    channel_id,
                    Arc::new(Notifier {
                        callback: Box::new(move || {
                            let scheduler = crate::scheduler::instance();
                            if scheduler.is_stopped() {
                                return;
                            }
                            scheduler.notify_processor(task_id);
                        }),
                    }),
                );
            }
        }
        true
    }

    /// Submit a one-shot closure as a routine ("fire and forget").
    pub fn async_task<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!("async_task_{}", ASYNC_TASK_SEQ.fetch_add(1, Ordering::Relaxed));
        self.create_task(create_routine_factory_fn(f), &name)
    }

    /// Total configured worker count across groups.
    pub fn task_pool_size(&self) -> u32 {
        self.task_pool_size
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Apply the configured attributes of a named inner thread (e.g.
    /// `"timer"`) to the given thread.
    pub fn set_inner_thread_attr(&self, name: &str, pthread: libc::pthread_t, tid: libc::pid_t) {
        if let Some(thread_conf) = self.inner_thread_confs.get(name) {
            if !thread_conf.cpuset.is_empty() {
                match pin_thread::parse_cpuset(&thread_conf.cpuset) {
                    Ok(cpus) => pin_thread::set_sched_affinity(pthread, &cpus, "range", 0),
                    Err(e) => warn!("ignoring cpuset of inner thread {}: {}", name, e),
                }
            }
            pin_thread::set_sched_policy(pthread, &thread_conf.policy, thread_conf.prio, tid);
        }
    }

    /// Stop handing out work and join every worker.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut processors = self.processors.lock();
        for processor in processors.iter_mut() {
            processor.stop();
        }
        processors.clear();
    }
}
