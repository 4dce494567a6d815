//! Deferred destruction of GPU objects
//!
//! Every GPU object Orrery creates is paired with a [`CleanupTask`] pushed onto the collector's
//! stack. Subsystems never destroy their handles directly; instead, at teardown the stack is
//! unwound in strictly reverse creation order, which guarantees that dependent objects (views
//! before images, framebuffers before render passes, ...) die first.
//!
//! Tasks can also be run early with [`GarbageCollector::execute_cleanup_task`], which is what the
//! swapchain manager does on recreation. A task that already ran stays in the stack as a tombstone
//! until enough of them pile up, at which point the stack is compacted.

use crate::gpu::{Device, GpuObject};
use log::*;
use orrery_utils::{plural, Counter};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Amount of invalidated tasks after which the stack gets compacted.
const COMPACTION_THRESHOLD: usize = 20;

/// Stable identifier of a cleanup task. Ids are handed out in creation order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupId(u64);

impl fmt::Display for CleanupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    #[error("cleanup task {0} doesn't exist")]
    InvalidTaskId(CleanupId),
}

/// A deferred destructor, together with the objects it releases.
pub struct CleanupTask {
    /// Name of the subsystem that registered the task, for logs.
    pub caller: &'static str,
    pub object_names: Vec<String>,
    /// Objects the task releases. If any of them is already dead by the time the task runs,
    /// the task is skipped.
    pub objects: Vec<GpuObject>,
    pub cleanup: Box<dyn FnOnce() + Send>,
    /// Additional gates. The task only runs if all of them are true.
    pub conditions: Vec<bool>,
}

impl CleanupTask {
    pub fn new(caller: &'static str, cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            caller,
            object_names: Vec::new(),
            objects: Vec::new(),
            cleanup: Box::new(cleanup),
            conditions: Vec::new(),
        }
    }

    pub fn with_object(mut self, name: impl Into<String>, object: impl Into<GpuObject>) -> Self {
        self.object_names.push(name.into());
        self.objects.push(object.into());
        self
    }

    pub fn with_condition(mut self, condition: bool) -> Self {
        self.conditions.push(condition);
        self
    }

    fn describe(&self) -> String {
        if self.object_names.is_empty() {
            String::from("(no objects)")
        } else {
            self.object_names.join(", ")
        }
    }
}

impl fmt::Debug for CleanupTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupTask")
            .field("caller", &self.caller)
            .field("object_names", &self.object_names)
            .field("objects", &self.objects)
            .field("conditions", &self.conditions)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct CleanupStack {
    /// Ordered by id. `None` marks a task that was already executed.
    tasks: Vec<(CleanupId, Option<CleanupTask>)>,
    invalidated: usize,
}

impl CleanupStack {
    fn position(&self, id: CleanupId) -> Option<usize> {
        self.tasks.binary_search_by_key(&id, |(task_id, _)| *task_id).ok()
    }

    fn compact_if_needed(&mut self) {
        if self.invalidated >= COMPACTION_THRESHOLD {
            self.tasks.retain(|(_, task)| task.is_some());
            trace!("Compacted the cleanup stack ({} live tasks)", self.tasks.len());
            self.invalidated = 0;
        }
    }
}

pub struct GarbageCollector {
    device: Arc<dyn Device>,
    ids: Counter,
    stack: Mutex<CleanupStack>,
}

impl GarbageCollector {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            ids: Counter::new(0),
            stack: Mutex::new(CleanupStack::default()),
        }
    }

    /// Pushes a task onto the cleanup stack.
    pub fn create_cleanup_task(&self, task: CleanupTask) -> CleanupId {
        // Ids are taken under the lock, so the stack stays sorted
        let mut stack = self.stack.lock();
        let id = CleanupId(self.ids.next());
        trace!(
            "Cleanup task {id} registered by {}: {}",
            task.caller,
            task.describe()
        );
        stack.tasks.push((id, Some(task)));
        id
    }

    /// Mutates a task that hasn't run yet.
    pub fn modify_cleanup_task(
        &self,
        id: CleanupId,
        f: impl FnOnce(&mut CleanupTask),
    ) -> Result<(), GcError> {
        let mut stack = self.stack.lock();
        let task = stack
            .position(id)
            .and_then(|index| stack.tasks[index].1.as_mut())
            .ok_or(GcError::InvalidTaskId(id))?;
        f(task);
        Ok(())
    }

    /// Runs a task ahead of teardown. Returns whether the cleanup closure actually ran.
    ///
    /// A task only ever runs once, later calls with the same id return `false`.
    pub fn execute_cleanup_task(&self, id: CleanupId) -> Result<bool, GcError> {
        let task = {
            let mut stack = self.stack.lock();
            match stack.position(id) {
                Some(index) => {
                    let task = stack.tasks[index].1.take();
                    if task.is_some() {
                        stack.invalidated += 1;
                        stack.compact_if_needed();
                    }
                    task
                }
                // Ran and compacted away
                None if id.0 < self.ids.peek() => None,
                None => return Err(GcError::InvalidTaskId(id)),
            }
        };

        match task {
            Some(task) => Ok(self.run_task(id, task)),
            None => {
                warn!("Cleanup task {id} was already executed");
                Ok(false)
            }
        }
    }

    /// Waits for the device to go idle, then runs every pending task in reverse creation order.
    ///
    /// Calling this on an empty stack does nothing, so it's safe to call it multiple times.
    pub fn process_cleanup_stack(&self) {
        let tasks = {
            let mut stack = self.stack.lock();
            stack.invalidated = 0;
            std::mem::take(&mut stack.tasks)
        };

        let pending = tasks.iter().filter(|(_, task)| task.is_some()).count();
        if pending == 0 {
            return;
        }

        if let Err(error) = self.device.device_wait_idle() {
            error!("Couldn't wait for device idle before cleanup: {error}");
        }

        debug!(
            "Processing {pending} cleanup {}",
            plural(pending, "task", "tasks")
        );
        for (id, task) in tasks.into_iter().rev() {
            if let Some(task) = task {
                self.run_task(id, task);
            }
        }
    }

    /// Number of tasks that haven't run yet.
    pub fn pending_tasks(&self) -> usize {
        self.stack
            .lock()
            .tasks
            .iter()
            .filter(|(_, task)| task.is_some())
            .count()
    }

    fn run_task(&self, id: CleanupId, task: CleanupTask) -> bool {
        if let Some(dead) = task.objects.iter().find(|&&o| !self.device.is_alive(o)) {
            debug!(
                "Skipping cleanup task {id} from {}: {} {:#x} is already dead",
                task.caller,
                dead.kind(),
                dead.raw()
            );
            return false;
        }
        if task.conditions.iter().any(|condition| !condition) {
            debug!("Skipping cleanup task {id} from {}: condition not met", task.caller);
            return false;
        }

        trace!("Running cleanup task {id} ({})", task.describe());
        (task.cleanup)();
        true
    }
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("pending_tasks", &self.pending_tasks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::headless::HeadlessDevice;

    fn setup() -> (Arc<HeadlessDevice>, GarbageCollector) {
        let device = Arc::new(HeadlessDevice::default());
        let gc = GarbageCollector::new(device.clone());
        (device, gc)
    }

    fn record(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> impl FnOnce() + Send + 'static {
        let log = log.clone();
        move || log.lock().push(value)
    }

    #[test]
    pub fn stack_unwinds_in_reverse() {
        let (_device, gc) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            gc.create_cleanup_task(CleanupTask::new("test", record(&log, i)));
        }

        gc.process_cleanup_stack();
        assert_eq!(*log.lock(), vec![4, 3, 2, 1, 0]);

        // Idempotent
        gc.process_cleanup_stack();
        assert_eq!(log.lock().len(), 5);
    }

    #[test]
    pub fn executed_tasks_run_once() {
        let (_device, gc) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = gc.create_cleanup_task(CleanupTask::new("test", record(&log, 1)));
        gc.create_cleanup_task(CleanupTask::new("test", record(&log, 2)));

        assert_eq!(gc.execute_cleanup_task(first), Ok(true));
        assert_eq!(gc.execute_cleanup_task(first), Ok(false));
        gc.process_cleanup_stack();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    pub fn dead_objects_and_false_conditions_skip_tasks() {
        let (device, gc) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        let fence = device.create_fence(false).unwrap();
        let dead = gc.create_cleanup_task(
            CleanupTask::new("test", record(&log, 1)).with_object("fence", fence),
        );
        device.destroy_fence(fence);
        assert_eq!(gc.execute_cleanup_task(dead), Ok(false));

        let gated = gc.create_cleanup_task(CleanupTask::new("test", record(&log, 2)));
        gc.modify_cleanup_task(gated, |task| task.conditions.push(false))
            .unwrap();
        gc.process_cleanup_stack();

        assert!(log.lock().is_empty());
    }

    #[test]
    pub fn ids_survive_compaction() {
        let (_device, gc) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let ids: Vec<_> = (0..30)
            .map(|i| gc.create_cleanup_task(CleanupTask::new("test", record(&log, i))))
            .collect();

        for &id in &ids[..25] {
            assert_eq!(gc.execute_cleanup_task(id), Ok(true));
        }
        assert_eq!(gc.pending_tasks(), 5);

        // Compacted away, but still recognized
        assert_eq!(gc.execute_cleanup_task(ids[0]), Ok(false));
        assert!(gc.modify_cleanup_task(ids[27], |task| task.caller = "moved").is_ok());
        assert_eq!(gc.execute_cleanup_task(ids[29]), Ok(true));
    }

    #[test]
    pub fn concurrent_registration_keeps_ids_ordered() {
        let (_device, gc) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        let ids: Vec<CleanupId> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        (0..50)
                            .map(|i| {
                                gc.create_cleanup_task(CleanupTask::new("worker", record(&log, i)))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        {
            let stack = gc.stack.lock();
            assert_eq!(stack.tasks.len(), 16 * 50);
            assert!(stack.tasks.windows(2).all(|pair| pair[0].0 < pair[1].0));
        }

        for id in ids {
            assert_eq!(gc.execute_cleanup_task(id), Ok(true));
        }
        assert_eq!(log.lock().len(), 16 * 50);
        assert_eq!(gc.pending_tasks(), 0);
    }

    #[test]
    pub fn unknown_ids_are_errors() {
        let (_device, gc) = setup();
        let bogus = CleanupId(1000);
        assert_eq!(
            gc.execute_cleanup_task(bogus),
            Err(GcError::InvalidTaskId(bogus))
        );
        assert!(gc.modify_cleanup_task(bogus, |_| {}).is_err());
    }
}
