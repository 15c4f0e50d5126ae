//! Process-wide queue coordinator.
//!
//! The [`QueueManager`] owns the set of active queue workers, serializes
//! cross-queue mutations on one lock, routes submit/delete/priority
//! operations to the store, dispatches task execution through the
//! runner registry, and multicasts change notifications.
//!
//! Only one manager may be alive per process: cross-queue
//! synchronization happens on its lock, and a second instance would
//! bypass it. [`QueueManagerBuilder::build`] enforces this.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::codec::{Codec, JsonCodec};
use crate::config::QueueConfig;
use crate::event::Event;
use crate::listeners::{
    CallbackExecutor, EventAction, EventChangeListener, InlineExecutor, ListenerRegistry,
    TaskAction, TaskChangeListener,
};
use crate::store::{EventsCursor, Store, TaskSelection, TasksCursor};
use crate::task::Task;
use crate::worker::{spawn_worker, WorkerHandle};
use crate::{QueueError, Result};

/// Executes one task; returns `Ok(true)` on success, `Ok(false)` to
/// request a requeue.
pub type TaskRunner = dyn Fn(&QueueManager, &mut Task) -> Result<bool> + Send + Sync;

/// Process-wide slot enforcing the single-manager invariant.
static ACTIVE_MANAGER: Mutex<Weak<QueueManager>> = Mutex::new(Weak::new());

/// Worker bookkeeping behind the manager lock.
pub(crate) struct ManagerInner {
    active: HashMap<String, Arc<WorkerHandle>>,
}

impl ManagerInner {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
        }
    }

    /// Called when a worker is created; the caller holds the manager lock.
    pub(crate) fn register_worker(&mut self, handle: Arc<WorkerHandle>) {
        self.active.insert(handle.queue_name().to_owned(), handle);
    }

    /// Remove a worker by identity. A successor worker already
    /// registered under the same queue name is left alone.
    pub(crate) fn remove_worker(&mut self, handle: &Arc<WorkerHandle>) {
        if let Some(existing) = self.active.get(handle.queue_name()) {
            if Arc::ptr_eq(existing, handle) {
                self.active.remove(handle.queue_name());
            }
        }
    }

    fn worker(&self, queue_name: &str) -> Option<&Arc<WorkerHandle>> {
        self.active.get(queue_name)
    }

    fn workers(&self) -> impl Iterator<Item = &Arc<WorkerHandle>> {
        self.active.values()
    }
}

/// Builder for [`QueueManager`].
pub struct QueueManagerBuilder {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn Codec>,
    executor: Arc<dyn CallbackExecutor>,
    runners: HashMap<String, Arc<TaskRunner>>,
}

impl QueueManagerBuilder {
    fn new() -> Self {
        Self {
            config: QueueConfig::default(),
            clock: Arc::new(SystemClock),
            codec: Arc::new(JsonCodec),
            executor: Arc::new(InlineExecutor),
            runners: HashMap::new(),
        }
    }

    /// Use the given configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Point the manager at a database file.
    pub fn db_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.config.db_path = path.into();
        self
    }

    /// Replace the clock (tests inject a manual clock here).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the payload codec.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Replace the callback executor observer callbacks run on.
    pub fn callback_executor(mut self, executor: Arc<dyn CallbackExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Register a task runner for a payload kind.
    pub fn runner(
        mut self,
        kind: impl Into<String>,
        runner: impl Fn(&QueueManager, &mut Task) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.runners.insert(kind.into(), Arc::new(runner));
        self
    }

    /// Build the manager.
    ///
    /// Fails with [`QueueError::ManagerExists`] while another manager is
    /// alive in this process.
    pub fn build(self) -> Result<Arc<QueueManager>> {
        let mut slot = match ACTIVE_MANAGER.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.upgrade().is_some() {
            return Err(QueueError::ManagerExists);
        }

        let store = Store::open(
            &self.config.db_path,
            Arc::clone(&self.clock),
            Arc::clone(&self.codec),
            self.config.clone(),
        )?;

        let manager = Arc::new(QueueManager {
            config: self.config,
            clock: self.clock,
            codec: self.codec,
            executor: self.executor,
            store,
            inner: Mutex::new(ManagerInner::new()),
            runners: RwLock::new(self.runners),
            task_listeners: ListenerRegistry::new(),
            event_listeners: ListenerRegistry::new(),
        });

        *slot = Arc::downgrade(&manager);
        info!(db = %manager.config.db_path.display(), "queue manager created");
        Ok(manager)
    }
}

/// Coordinates queues, workers, persistence, and notifications.
pub struct QueueManager {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn Codec>,
    executor: Arc<dyn CallbackExecutor>,
    /// The manager's own store connection.
    store: Store,
    inner: Mutex<ManagerInner>,
    runners: RwLock<HashMap<String, Arc<TaskRunner>>>,
    task_listeners: ListenerRegistry<dyn TaskChangeListener>,
    event_listeners: ListenerRegistry<dyn EventChangeListener>,
}

impl QueueManager {
    /// Start building a manager.
    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::new()
    }

    /// The active configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ManagerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a fresh store connection against the manager's database;
    /// each worker thread gets its own.
    pub(crate) fn open_store(&self) -> Result<Store> {
        Store::open(
            &self.config.db_path,
            Arc::clone(&self.clock),
            Arc::clone(&self.codec),
            self.config.clone(),
        )
    }

    /// Spawn a worker for every queue known to the store. Called once
    /// at startup so persisted work resumes after a restart.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let names = self.store.queue_names()?;
        let mut inner = self.lock_inner();
        for name in names {
            if inner.worker(&name).is_none() {
                spawn_worker(self, &mut inner, &name)?;
            }
        }
        Ok(())
    }

    /// Create the named queue if it does not exist.
    pub fn initialize_queue(&self, name: &str) -> Result<i64> {
        self.store.create_queue(name)
    }

    /// Persist a task on the named queue (created on demand) and ensure
    /// a worker is servicing it. Returns the task id.
    pub fn submit(self: &Arc<Self>, task: &mut Task, queue_name: &str, priority: i64) -> Result<i64> {
        {
            let mut inner = self.lock_inner();
            self.store.create_queue(queue_name)?;
            self.store.enqueue(task, queue_name, priority)?;
            match inner.worker(queue_name) {
                Some(worker) => worker.wake(),
                None => spawn_worker(self, &mut inner, queue_name)?,
            }
        }
        self.notify_task_change(Some(task), TaskAction::Created);
        Ok(task.id())
    }

    /// Persist the payload of an existing task.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        self.store.update(task)?;
        self.notify_task_change(Some(task), TaskAction::Updated);
        Ok(())
    }

    /// Delete a task and its events.
    ///
    /// If a worker is currently running the task, its abort flag is set
    /// first; task code is expected to poll it. The row is removed
    /// either way, and any writes the ignored run makes afterwards are
    /// no-ops.
    pub fn delete_task(&self, id: i64) -> Result<()> {
        {
            let inner = self.lock_inner();
            for worker in inner.workers() {
                if worker.abort_current(id) {
                    debug!(task = id, "abort requested for running task");
                    break;
                }
            }
            self.store.delete_task(id)?;
        }
        // Deleting a task may cascade through orphan cleanup, so both
        // listener sets hear about it.
        self.notify_event_change(None, EventAction::Deleted);
        self.notify_task_change(None, TaskAction::Deleted);
        Ok(())
    }

    /// Delete a single event.
    pub fn delete_event(&self, id: i64) -> Result<()> {
        self.store.delete_event(id)?;
        self.notify_event_change(None, EventAction::Deleted);
        self.notify_task_change(None, TaskAction::Deleted);
        Ok(())
    }

    /// Delete task rows older than `days`, defaulting to the
    /// configured task retention age. Returns the rows removed.
    pub fn cleanup_old_tasks(&self, days: Option<u32>) -> Result<usize> {
        let days = days.unwrap_or(self.config.task_retention_days);
        let removed = self.store.cleanup_old_tasks(days)?;
        self.notify_event_change(None, EventAction::Deleted);
        self.notify_task_change(None, TaskAction::Deleted);
        Ok(removed)
    }

    /// Delete event rows older than `days`, defaulting to the
    /// configured event retention age. Returns the rows removed.
    pub fn cleanup_old_events(&self, days: Option<u32>) -> Result<usize> {
        let days = days.unwrap_or(self.config.event_retention_days);
        let removed = self.store.cleanup_old_events(days)?;
        self.notify_event_change(None, EventAction::Deleted);
        self.notify_task_change(None, TaskAction::Deleted);
        Ok(removed)
    }

    /// Move a task ahead of everything queued.
    pub fn bring_task_to_front(&self, id: i64) -> Result<()> {
        let _inner = self.lock_inner();
        self.store.bring_task_to_front(id)
    }

    /// Move a task behind everything queued.
    pub fn send_task_to_back(&self, id: i64) -> Result<()> {
        let _inner = self.lock_inner();
        self.store.send_task_to_back(id)
    }

    /// Record an event against a task, analogous to writing a line to
    /// the task's log file. Returns 0 when the task is already gone.
    pub fn store_task_event(&self, task: &Task, event: &mut Event) -> Result<i64> {
        let id = self.store.store_task_event(task, event)?;
        self.notify_event_change(Some(event), EventAction::Created);
        Ok(id)
    }

    /// Snapshot of tasks matching the selection.
    pub fn get_tasks(&self, selection: TaskSelection) -> Result<TasksCursor> {
        self.store.tasks(selection)
    }

    /// Snapshot of all events.
    pub fn get_all_events(&self) -> Result<EventsCursor> {
        self.store.all_events()
    }

    /// Snapshot of the events recorded for one task.
    pub fn get_task_events(&self, task_id: i64) -> Result<EventsCursor> {
        self.store.events_for_task(task_id)
    }

    /// Register a runner for a payload kind.
    pub fn register_runner(
        &self,
        kind: impl Into<String>,
        runner: impl Fn(&QueueManager, &mut Task) -> Result<bool> + Send + Sync + 'static,
    ) {
        let mut runners = match self.runners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        runners.insert(kind.into(), Arc::new(runner));
    }

    /// Execute one task through the runner registered for its kind.
    ///
    /// Fails with [`QueueError::UnsupportedTask`] when no runner is
    /// registered; the worker persists that as a task failure.
    pub fn run_one_task(&self, task: &mut Task) -> Result<bool> {
        let runner = {
            let runners = match self.runners.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            runners.get(task.kind()).cloned()
        };
        match runner {
            Some(runner) => runner(self, task),
            None => Err(QueueError::UnsupportedTask(task.kind().to_owned())),
        }
    }

    /// Remove a worker that is shutting down. Identity-compared so a
    /// freshly spawned successor for the same queue is not removed.
    pub(crate) fn queue_terminating(&self, handle: &Arc<WorkerHandle>) {
        self.lock_inner().remove_worker(handle);
    }

    /// Ask all workers to finish their current task and exit, then wait
    /// for them.
    pub fn shutdown(&self) {
        let handles: Vec<Arc<WorkerHandle>> =
            self.lock_inner().workers().map(Arc::clone).collect();
        for handle in &handles {
            handle.request_terminate();
        }
        for handle in handles {
            handle.join();
        }
    }

    // -----------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------

    /// Subscribe to task changes. The subscription is weak: dropping
    /// the listener is enough to end it.
    pub fn register_task_listener(&self, listener: &Arc<dyn TaskChangeListener>) {
        self.task_listeners.register(listener);
    }

    /// Remove a task change subscription.
    pub fn unregister_task_listener(&self, listener: &Arc<dyn TaskChangeListener>) {
        self.task_listeners.unregister(listener);
    }

    /// Subscribe to event changes.
    pub fn register_event_listener(&self, listener: &Arc<dyn EventChangeListener>) {
        self.event_listeners.register(listener);
    }

    /// Remove an event change subscription.
    pub fn unregister_event_listener(&self, listener: &Arc<dyn EventChangeListener>) {
        self.event_listeners.unregister(listener);
    }

    /// Multicast a task change to all live listeners via the callback
    /// executor. Listener panics are swallowed.
    pub(crate) fn notify_task_change(&self, task: Option<&Task>, action: TaskAction) {
        let executor = Arc::clone(&self.executor);
        self.task_listeners.notify(|listener| {
            let task = task.cloned();
            executor.execute(Box::new(move || {
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    listener.on_task_change(task.as_ref(), action);
                }));
            }));
        });
    }

    /// Multicast an event change to all live listeners via the callback
    /// executor. Listener panics are swallowed.
    pub(crate) fn notify_event_change(&self, event: Option<&Event>, action: EventAction) {
        let executor = Arc::clone(&self.executor);
        self.event_listeners.notify(|listener| {
            let event = event.cloned();
            executor.execute(Box::new(move || {
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    listener.on_event_change(event.as_ref(), action);
                }));
            }));
        });
    }
}
