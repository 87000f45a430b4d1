//! System registry, dependency graph, and dispatch.
//!
//! Dispatch walks the topologically sorted registry one stage at a time;
//! systems inside a stage may run in parallel when declarations allow.
//! Failures never escape the failing system: errors and panics are
//! recorded, counted, surfaced to the optional error handler, and the tick
//! always completes.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, warn};

use super::{System, SystemId, SystemMetrics, ThreadSafety};
use crate::{
    error::{BoxedErr, SystemRegistryError},
    external::Renderer,
    world::World,
};

/// Callback invoked with every isolated system failure. Returning `Err`
/// escalates: dispatch finishes the tick, then returns that error.
pub type SystemErrorHandler =
    Arc<dyn Fn(SystemId, &BoxedErr) -> Result<(), BoxedErr> + Send + Sync>;

/// Per-system error log depth; older entries fall off.
const ERROR_LOG_DEPTH: usize = 32;

struct SystemEntry {
    id: SystemId,
    name: &'static str,
    system: Mutex<Box<dyn System>>,
    priority: i32,
    enabled: AtomicBool,
    thread_safety: ThreadSafety,
    components: Vec<std::any::TypeId>,
    depends_on: HashSet<SystemId>,
    timeout: Option<Duration>,
    metrics: Mutex<SystemMetrics>,
    error_log: Mutex<VecDeque<String>>,
}

impl SystemEntry {
    fn compatible_with(&self, other: &SystemEntry) -> bool {
        let overlap = self
            .components
            .iter()
            .any(|t| other.components.contains(t));
        if !overlap {
            return true;
        }
        self.thread_safety == ThreadSafety::Read && other.thread_safety == ThreadSafety::Read
    }
}

#[derive(Default)]
struct Registry {
    entries: Vec<SystemEntry>,
    index: HashMap<SystemId, usize>,
    order: Vec<usize>,
    stages: Vec<Vec<usize>>,
    stale: bool,
    parallel: bool,
    max_parallel: usize,
}

impl Registry {
    fn reaches(&self, from: SystemId, target: SystemId) -> bool {
        let mut stack = vec![from];
        let mut seen: HashSet<SystemId> = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(&i) = self.index.get(&id) {
                stack.extend(self.entries[i].depends_on.iter().copied());
            }
        }
        false
    }

    /// Topological sort (Kahn), tie-broken by priority descending then
    /// insertion order, followed by the greedy stage partition.
    fn recompute(&mut self) {
        let n = self.entries.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, entry) in self.entries.iter().enumerate() {
            for dep in &entry.depends_on {
                let d = self.index[dep];
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut order = Vec::with_capacity(n);
        let mut placed = vec![false; n];
        for _ in 0..n {
            let next = (0..n)
                .filter(|&i| !placed[i] && indegree[i] == 0)
                .max_by_key(|&i| (self.entries[i].priority, std::cmp::Reverse(i)))
                .expect("dependency graph contains a cycle");
            placed[next] = true;
            for &dep in &dependents[next] {
                indegree[dep] -= 1;
            }
            order.push(next);
        }

        self.stages = self.partition(&order);
        self.order = order;
        self.stale = false;
        debug!(
            "system order recomputed: {} systems in {} stages",
            n,
            self.stages.len()
        );
    }

    fn partition(&self, order: &[usize]) -> Vec<Vec<usize>> {
        let width_cap = if self.max_parallel == 0 {
            usize::MAX
        } else {
            self.max_parallel
        };
        let mut stages: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();

        for &idx in order {
            let entry = &self.entries[idx];
            let joins = self.parallel
                && entry.thread_safety != ThreadSafety::None
                && !current.is_empty()
                && current.len() < width_cap
                && current.iter().all(|&m| {
                    let member = &self.entries[m];
                    member.thread_safety != ThreadSafety::None
                        && entry.compatible_with(member)
                        && !entry.depends_on.contains(&member.id)
                });
            if joins {
                current.push(idx);
            } else {
                if !current.is_empty() {
                    stages.push(std::mem::take(&mut current));
                }
                current.push(idx);
            }
        }
        if !current.is_empty() {
            stages.push(current);
        }
        stages
    }
}

/// Registers, orders, and dispatches systems. All methods take `&self`; the
/// registry sits behind a reader-writer lock and dispatch holds the read
/// side for the duration of a tick.
pub struct SystemManager {
    registry: RwLock<Registry>,
    error_handler: RwLock<Option<SystemErrorHandler>>,
    failed: Mutex<Vec<SystemId>>,
    global_timeout: RwLock<Option<Duration>>,
    init_failed: AtomicBool,
}

impl Default for SystemManager {
    fn default() -> Self {
        SystemManager {
            registry: RwLock::new(Registry::default()),
            error_handler: RwLock::new(None),
            failed: Mutex::new(Vec::new()),
            global_timeout: RwLock::new(None),
            init_failed: AtomicBool::new(false),
        }
    }
}

impl SystemManager {
    /// Creates an empty manager with parallel dispatch off.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a system, capturing its declarations. Fails with
    /// `SystemAlreadyRegistered` if a system of the same type is present.
    pub fn register<S: System>(&self, system: S) -> Result<(), SystemRegistryError> {
        self.register_boxed(
            SystemId::of::<S>(),
            std::any::type_name::<S>(),
            Some(Box::new(system)),
        )
    }

    /// [`register`](Self::register) followed by a priority override.
    pub fn register_with_priority<S: System>(
        &self,
        system: S,
        priority: i32,
    ) -> Result<(), SystemRegistryError> {
        self.register::<S>(system)?;
        let mut reg = self.registry.write().expect("system registry poisoned");
        let idx = reg.index[&SystemId::of::<S>()];
        reg.entries[idx].priority = priority;
        reg.stale = true;
        Ok(())
    }

    /// Type-erased registration; `None` is rejected as `NilSystem`.
    pub fn register_boxed(
        &self,
        id: SystemId,
        name: &'static str,
        system: Option<Box<dyn System>>,
    ) -> Result<(), SystemRegistryError> {
        let system = system.ok_or(SystemRegistryError::NilSystem)?;
        let mut reg = self.registry.write().expect("system registry poisoned");
        if reg.index.contains_key(&id) {
            return Err(SystemRegistryError::SystemAlreadyRegistered(name));
        }

        let entry = SystemEntry {
            id,
            name,
            priority: system.priority(),
            thread_safety: system.thread_safety(),
            components: system.required_components(),
            system: Mutex::new(system),
            enabled: AtomicBool::new(true),
            depends_on: HashSet::new(),
            timeout: None,
            metrics: Mutex::new(SystemMetrics::default()),
            error_log: Mutex::new(VecDeque::new()),
        };
        let idx = reg.entries.len();
        reg.entries.push(entry);
        reg.index.insert(id, idx);
        reg.stale = true;
        debug!("registered system {}", name);
        Ok(())
    }

    /// Removes a system and every dependency edge touching it.
    pub fn unregister(&self, id: SystemId) -> Result<(), SystemRegistryError> {
        let mut reg = self.registry.write().expect("system registry poisoned");
        let idx = match reg.index.get(&id) {
            Some(&idx) => idx,
            None => return Err(SystemRegistryError::SystemNotFound("<unregistered>")),
        };
        reg.entries.remove(idx);
        for entry in reg.entries.iter_mut() {
            entry.depends_on.remove(&id);
        }
        reg.index = reg
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
        reg.stale = true;
        Ok(())
    }

    /// Whether a system with this id is registered.
    pub fn is_registered(&self, id: SystemId) -> bool {
        self.registry
            .read()
            .expect("system registry poisoned")
            .index
            .contains_key(&id)
    }

    /// Number of registered systems.
    pub fn system_count(&self) -> usize {
        self.registry
            .read()
            .expect("system registry poisoned")
            .entries
            .len()
    }

    /// Declares that `dependency` must finish before `dependent` starts.
    ///
    /// Rejects edges between unregistered systems (`InvalidDependency`) and
    /// edges that would close a cycle (`CyclicDependency`); a rejected edge
    /// leaves the graph untouched.
    pub fn add_dependency(
        &self,
        dependent: SystemId,
        dependency: SystemId,
    ) -> Result<(), SystemRegistryError> {
        let mut reg = self.registry.write().expect("system registry poisoned");
        if !reg.index.contains_key(&dependent) || !reg.index.contains_key(&dependency) {
            return Err(SystemRegistryError::InvalidDependency);
        }
        if reg.reaches(dependency, dependent) {
            return Err(SystemRegistryError::CyclicDependency);
        }
        let idx = reg.index[&dependent];
        if reg.entries[idx].depends_on.insert(dependency) {
            reg.stale = true;
        }
        Ok(())
    }

    /// Removes the edge if present; silent otherwise.
    pub fn remove_dependency(&self, dependent: SystemId, dependency: SystemId) {
        let mut reg = self.registry.write().expect("system registry poisoned");
        if let Some(&idx) = reg.index.get(&dependent) {
            if reg.entries[idx].depends_on.remove(&dependency) {
                reg.stale = true;
            }
        }
    }

    /// The systems `id` depends on.
    pub fn get_dependencies(&self, id: SystemId) -> Result<Vec<SystemId>, SystemRegistryError> {
        let reg = self.registry.read().expect("system registry poisoned");
        let idx = reg
            .index
            .get(&id)
            .ok_or(SystemRegistryError::SystemNotFound("<unregistered>"))?;
        Ok(reg.entries[*idx].depends_on.iter().copied().collect())
    }

    /// Enables or disables parallel stage execution.
    pub fn set_parallel(&self, parallel: bool) {
        let mut reg = self.registry.write().expect("system registry poisoned");
        if reg.parallel != parallel {
            reg.parallel = parallel;
            reg.stale = true;
        }
    }

    /// Caps how many systems one stage may hold; 0 removes the cap.
    pub fn set_max_parallel_systems(&self, max: usize) {
        let mut reg = self.registry.write().expect("system registry poisoned");
        if reg.max_parallel != max {
            reg.max_parallel = max;
            reg.stale = true;
        }
    }

    /// Enables or disables a system. Disabled systems are skipped by
    /// dispatch but keep their place in the graph and the ordering.
    pub fn set_enabled(&self, id: SystemId, enabled: bool) -> Result<(), SystemRegistryError> {
        let reg = self.registry.read().expect("system registry poisoned");
        let idx = reg
            .index
            .get(&id)
            .ok_or(SystemRegistryError::SystemNotFound("<unregistered>"))?;
        reg.entries[*idx].enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Whether a system is enabled.
    pub fn is_enabled(&self, id: SystemId) -> Result<bool, SystemRegistryError> {
        let reg = self.registry.read().expect("system registry poisoned");
        let idx = reg
            .index
            .get(&id)
            .ok_or(SystemRegistryError::SystemNotFound("<unregistered>"))?;
        Ok(reg.entries[*idx].enabled.load(Ordering::Acquire))
    }

    /// Abandon-threshold for one system's `update`.
    ///
    /// Cooperative limitation: a running system is never preempted. The
    /// elapsed time is checked when `update` returns; an overrun is
    /// recorded as a timeout error and the tick proceeds.
    pub fn set_system_timeout(
        &self,
        id: SystemId,
        timeout: Duration,
    ) -> Result<(), SystemRegistryError> {
        let mut reg = self.registry.write().expect("system registry poisoned");
        let idx = *reg
            .index
            .get(&id)
            .ok_or(SystemRegistryError::SystemNotFound("<unregistered>"))?;
        reg.entries[idx].timeout = Some(timeout);
        Ok(())
    }

    /// Fallback timeout for systems without their own.
    pub fn set_global_timeout(&self, timeout: Duration) {
        *self.global_timeout.write().expect("timeout poisoned") = Some(timeout);
    }

    /// Installs the handler notified of every isolated failure.
    pub fn set_error_handler(&self, handler: SystemErrorHandler) {
        *self.error_handler.write().expect("error handler poisoned") = Some(handler);
    }

    /// Systems that failed (error, panic, or timeout) during the most
    /// recent `update_systems` tick.
    pub fn get_failed_systems(&self) -> Vec<SystemId> {
        self.failed.lock().expect("failed set poisoned").clone()
    }

    /// The bounded error log of one system, oldest first.
    pub fn error_log(&self, id: SystemId) -> Result<Vec<String>, SystemRegistryError> {
        let reg = self.registry.read().expect("system registry poisoned");
        let idx = reg
            .index
            .get(&id)
            .ok_or(SystemRegistryError::SystemNotFound("<unregistered>"))?;
        let result = reg.entries[*idx]
            .error_log
            .lock()
            .expect("error log poisoned")
            .iter()
            .cloned()
            .collect();
        Ok(result)
    }

    /// A copy of one system's metrics record.
    pub fn metrics(&self, id: SystemId) -> Result<SystemMetrics, SystemRegistryError> {
        let reg = self.registry.read().expect("system registry poisoned");
        let idx = reg
            .index
            .get(&id)
            .ok_or(SystemRegistryError::SystemNotFound("<unregistered>"))?;
        let result = reg.entries[*idx]
            .metrics
            .lock()
            .expect("metrics poisoned")
            .clone();
        Ok(result)
    }

    fn ensure_order(&self) {
        if self
            .registry
            .read()
            .expect("system registry poisoned")
            .stale
        {
            let mut reg = self.registry.write().expect("system registry poisoned");
            if reg.stale {
                reg.recompute();
            }
        }
    }

    /// The current execution order, recomputing it if stale.
    pub fn execution_order(&self) -> Vec<SystemId> {
        self.ensure_order();
        let reg = self.registry.read().expect("system registry poisoned");
        reg.order.iter().map(|&i| reg.entries[i].id).collect()
    }

    /// The current stage partition, recomputing it if stale.
    pub fn stages(&self) -> Vec<Vec<SystemId>> {
        self.ensure_order();
        let reg = self.registry.read().expect("system registry poisoned");
        reg.stages
            .iter()
            .map(|stage| stage.iter().map(|&i| reg.entries[i].id).collect())
            .collect()
    }

    /// Checks that the stored order is consistent: not stale, covering
    /// every registered system exactly once, and respecting every edge.
    pub fn validate_order(&self) -> bool {
        let reg = self.registry.read().expect("system registry poisoned");
        if reg.stale || reg.order.len() != reg.entries.len() {
            return false;
        }
        let position: HashMap<SystemId, usize> = reg
            .order
            .iter()
            .enumerate()
            .map(|(pos, &i)| (reg.entries[i].id, pos))
            .collect();
        reg.entries.iter().all(|entry| {
            entry.depends_on.iter().all(|dep| {
                matches!((position.get(dep), position.get(&entry.id)),
                    (Some(d), Some(e)) if d < e)
            })
        })
    }

    /// Runs every enabled system's `update` for one tick.
    ///
    /// Failures are isolated per system; the tick always completes. The
    /// return value is `Ok` unless initialization previously failed or the
    /// installed error handler escalated a failure.
    pub fn update_systems(&self, world: &World, dt: f32) -> Result<(), BoxedErr> {
        if self.init_failed.load(Ordering::Acquire) {
            return Err(BoxedErr::msg(
                "system initialization failed; dispatch refused",
            ));
        }
        self.ensure_order();
        let reg = self.registry.read().expect("system registry poisoned");
        self.failed.lock().expect("failed set poisoned").clear();

        let global_timeout = *self.global_timeout.read().expect("timeout poisoned");
        let propagation: Mutex<Option<BoxedErr>> = Mutex::new(None);
        let propagation_ref = &propagation;

        for stage in &reg.stages {
            let enabled: Vec<&SystemEntry> = stage
                .iter()
                .map(|&i| &reg.entries[i])
                .filter(|e| e.enabled.load(Ordering::Acquire))
                .collect();
            if enabled.is_empty() {
                continue;
            }

            #[cfg(feature = "parallel")]
            if reg.parallel && enabled.len() > 1 {
                rayon::scope(|s| {
                    for &entry in &enabled {
                        s.spawn(move |_| {
                            self.run_update(entry, world, dt, global_timeout, propagation_ref)
                        });
                    }
                });
                continue;
            }

            for &entry in &enabled {
                self.run_update(entry, world, dt, global_timeout, propagation_ref);
            }
        }
        drop(reg);

        match propagation.into_inner().expect("propagation poisoned") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn run_update(
        &self,
        entry: &SystemEntry,
        world: &World,
        dt: f32,
        global_timeout: Option<Duration>,
        propagation: &Mutex<Option<BoxedErr>>,
    ) {
        let mut system = entry.system.lock().expect("system cell poisoned");
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| system.update(world, dt)));
        let elapsed = started.elapsed();
        let entities = system.entities_processed();
        drop(system);

        let mut faults: Vec<BoxedErr> = Vec::new();
        {
            let mut metrics = entry.metrics.lock().expect("metrics poisoned");
            metrics.record_run(elapsed, entities);
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    metrics.error_count += 1;
                    faults.push(err);
                }
                Err(payload) => {
                    metrics.error_count += 1;
                    metrics.panic_count += 1;
                    faults.push(BoxedErr::msg(format!(
                        "system panicked: {}",
                        panic_message(&payload)
                    )));
                }
            }
            if let Some(limit) = entry.timeout.or(global_timeout) {
                if elapsed > limit {
                    metrics.timeout_count += 1;
                    faults.push(BoxedErr::msg(format!(
                        "update took {:?}, exceeding the {:?} timeout",
                        elapsed, limit
                    )));
                }
            }
        }
        if faults.is_empty() {
            return;
        }

        self.failed.lock().expect("failed set poisoned").push(entry.id);
        let handler = self
            .error_handler
            .read()
            .expect("error handler poisoned")
            .clone();
        for fault in faults {
            warn!("system {} failed: {}", entry.name, fault);
            {
                let mut error_log = entry.error_log.lock().expect("error log poisoned");
                if error_log.len() == ERROR_LOG_DEPTH {
                    error_log.pop_front();
                }
                error_log.push_back(fault.to_string());
            }
            if let Some(ref handler) = handler {
                if let Err(escalated) = handler(entry.id, &fault) {
                    let mut slot = propagation.lock().expect("propagation poisoned");
                    if slot.is_none() {
                        *slot = Some(escalated);
                    }
                }
            }
        }
    }

    /// Runs every enabled system's `render` sequentially in execution
    /// order on the calling thread. Failures are isolated like `update`
    /// failures.
    pub fn render_systems(
        &self,
        world: &World,
        renderer: &mut dyn Renderer,
    ) -> Result<(), BoxedErr> {
        self.ensure_order();
        let reg = self.registry.read().expect("system registry poisoned");
        let propagation: Mutex<Option<BoxedErr>> = Mutex::new(None);

        for &idx in &reg.order {
            let entry = &reg.entries[idx];
            if !entry.enabled.load(Ordering::Acquire) {
                continue;
            }
            let mut system = entry.system.lock().expect("system cell poisoned");
            let result =
                catch_unwind(AssertUnwindSafe(|| system.render(world, &mut *renderer)));
            drop(system);

            let fault = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(payload) => {
                    let mut metrics = entry.metrics.lock().expect("metrics poisoned");
                    metrics.panic_count += 1;
                    Some(BoxedErr::msg(format!(
                        "system panicked in render: {}",
                        panic_message(&payload)
                    )))
                }
            };
            if let Some(fault) = fault {
                warn!("system {} failed in render: {}", entry.name, fault);
                {
                    let mut error_log = entry.error_log.lock().expect("error log poisoned");
                    if error_log.len() == ERROR_LOG_DEPTH {
                        error_log.pop_front();
                    }
                    error_log.push_back(fault.to_string());
                }
                let handler = self
                    .error_handler
                    .read()
                    .expect("error handler poisoned")
                    .clone();
                if let Some(handler) = handler {
                    if let Err(escalated) = handler(entry.id, &fault) {
                        let mut slot = propagation.lock().expect("propagation poisoned");
                        if slot.is_none() {
                            *slot = Some(escalated);
                        }
                    }
                }
            }
        }
        drop(reg);

        match propagation.into_inner().expect("propagation poisoned") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs every system's `init` in execution order, aborting on the
    /// first failure. After a failure, `update_systems` refuses to run
    /// until a subsequent `initialize_systems` succeeds end-to-end.
    pub fn initialize_systems(&self, world: &World) -> Result<(), BoxedErr> {
        self.ensure_order();
        let reg = self.registry.read().expect("system registry poisoned");
        for &idx in &reg.order {
            let entry = &reg.entries[idx];
            let mut system = entry.system.lock().expect("system cell poisoned");
            let result = catch_unwind(AssertUnwindSafe(|| system.init(world)));
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(payload) => Some(BoxedErr::msg(format!(
                    "system panicked in init: {}",
                    panic_message(&payload)
                ))),
            };
            if let Some(err) = failure {
                self.init_failed.store(true, Ordering::Release);
                return Err(BoxedErr::msg(format!(
                    "initialization of {} failed: {}",
                    entry.name, err
                )));
            }
        }
        self.init_failed.store(false, Ordering::Release);
        Ok(())
    }

    /// Runs every system's `shutdown` in reverse execution order. Errors
    /// are collected; the sweep never stops early.
    pub fn shutdown_systems(&self, world: &World) -> Vec<(SystemId, BoxedErr)> {
        self.ensure_order();
        let reg = self.registry.read().expect("system registry poisoned");
        let mut errors = Vec::new();
        for &idx in reg.order.iter().rev() {
            let entry = &reg.entries[idx];
            let mut system = entry.system.lock().expect("system cell poisoned");
            let result = catch_unwind(AssertUnwindSafe(|| system.shutdown(world)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push((entry.id, err)),
                Err(payload) => errors.push((
                    entry.id,
                    BoxedErr::msg(format!(
                        "system panicked in shutdown: {}",
                        panic_message(&payload)
                    )),
                )),
            }
        }
        errors
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
