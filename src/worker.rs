//! Per-queue worker threads.
//!
//! Each active queue is serviced by one long-lived thread that
//! repeatedly asks the store for the next task, sleeps (wakeably) when
//! the next task is not yet eligible, runs ready tasks, and records the
//! outcome. A worker terminates itself when its queue runs dry; the
//! manager spawns a fresh one on the next submit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::listeners::TaskAction;
use crate::manager::{ManagerInner, QueueManager};
use crate::store::Store;
use crate::task::{Task, TaskState};
use crate::Result;

/// The task a worker is currently executing, exposed so the manager can
/// signal a cooperative abort.
pub(crate) struct RunningTask {
    pub(crate) id: i64,
    pub(crate) abort: Arc<AtomicBool>,
}

/// Shared handle for one queue worker thread.
pub(crate) struct WorkerHandle {
    queue_name: String,
    /// Wake-up signal for the Waiting state. The flag records a wake
    /// that arrives while the worker is not yet parked.
    wake: Condvar,
    signalled: Mutex<bool>,
    terminate: AtomicBool,
    current: Mutex<Option<RunningTask>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub(crate) fn new(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_owned(),
            wake: Condvar::new(),
            signalled: Mutex::new(false),
            terminate: AtomicBool::new(false),
            current: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// The bare queue name, as opposed to the thread name.
    pub(crate) fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Wake the worker out of its Waiting sleep (or arrange for the
    /// next sleep to return immediately).
    pub(crate) fn wake(&self) {
        if let Ok(mut signalled) = self.signalled.lock() {
            *signalled = true;
        }
        self.wake.notify_all();
    }

    /// Ask the worker to exit after the current task.
    pub(crate) fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub(crate) fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, returning early when woken. After any
    /// wake-up the caller re-polls; the same task may no longer be next.
    fn wait_for_wake(&self, timeout: Duration) {
        let Ok(mut signalled) = self.signalled.lock() else {
            return;
        };
        if !*signalled {
            match self.wake.wait_timeout(signalled, timeout) {
                Ok((guard, _timed_out)) => signalled = guard,
                Err(_) => return,
            }
        }
        *signalled = false;
    }

    fn set_current(&self, task: &Task) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(RunningTask {
                id: task.id(),
                abort: task.abort_handle(),
            });
        }
    }

    fn clear_current(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }

    /// Set the abort flag on the running task if it matches `task_id`.
    /// Returns whether a match was found.
    pub(crate) fn abort_current(&self, task_id: i64) -> bool {
        if let Ok(current) = self.current.lock() {
            if let Some(running) = current.as_ref() {
                if running.id == task_id {
                    running.abort.store(true, Ordering::SeqCst);
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn attach_thread(&self, thread: JoinHandle<()>) {
        if let Ok(mut slot) = self.thread.lock() {
            *slot = Some(thread);
        }
    }

    /// Join the worker thread, if it is still attached.
    pub(crate) fn join(&self) {
        let thread = self.thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

/// Register a new worker for `queue_name` and start its thread.
///
/// Must be called with the manager lock held: registration and the
/// no-more-tasks termination check synchronize on the same lock, which
/// is what guarantees a submit never races a terminating worker into
/// a dropped task.
pub(crate) fn spawn_worker(
    manager: &Arc<QueueManager>,
    inner: &mut ManagerInner,
    queue_name: &str,
) -> Result<()> {
    let handle = Arc::new(WorkerHandle::new(queue_name));
    inner.register_worker(Arc::clone(&handle));

    let thread_manager = Arc::clone(manager);
    let thread_handle = Arc::clone(&handle);
    let spawned = std::thread::Builder::new()
        .name(format!("queue-{queue_name}"))
        .spawn(move || run_worker(thread_manager, thread_handle));

    match spawned {
        Ok(thread) => {
            handle.attach_thread(thread);
            Ok(())
        }
        Err(e) => {
            inner.remove_worker(&handle);
            Err(e.into())
        }
    }
}

/// Main worker thread logic.
fn run_worker(manager: Arc<QueueManager>, handle: Arc<WorkerHandle>) {
    let name = handle.queue_name().to_owned();
    info!(queue = %name, "queue worker starting");

    let store = match manager.open_store() {
        Ok(store) => store,
        Err(e) => {
            error!(queue = %name, error = %e, "worker cannot open store");
            manager.queue_terminating(&handle);
            return;
        }
    };

    while !handle.terminate_requested() {
        // All queue manipulation synchronizes on the manager: picking
        // the next task here cannot race a delete, a priority move, or
        // a submit deciding whether to spawn a successor worker.
        let scheduled = {
            let mut inner = manager.lock_inner();
            match store.next_task(&name) {
                Ok(Some(scheduled)) => scheduled,
                Ok(None) => {
                    // Queue is empty: deregister while still holding the
                    // lock so a concurrent submit spawns a replacement.
                    inner.remove_worker(&handle);
                    debug!(queue = %name, "queue empty, worker terminating");
                    return;
                }
                Err(e) => {
                    error!(queue = %name, error = %e, "cannot poll queue");
                    drop(inner);
                    manager.queue_terminating(&handle);
                    return;
                }
            }
        };

        if scheduled.is_ready() {
            let mut task = store.decode_scheduled(scheduled);
            debug!(queue = %name, task = task.id(), "running task");
            if let Err(e) = handle_task(&manager, &store, &handle, &mut task) {
                error!(queue = %name, task = task.id(), error = %e, "cannot record task outcome");
                break;
            }
        } else {
            debug!(
                queue = %name,
                task = scheduled.id(),
                wait_ms = scheduled.wait().as_millis() as u64,
                "waiting for next task"
            );
            handle.wait_for_wake(scheduled.wait());
        }
    }

    manager.queue_terminating(&handle);
    info!(queue = %name, "queue worker terminating");
}

/// Run one task and persist the outcome.
///
/// Every outcome maps to one of success, requeue, or failure; nothing
/// thrown by task code escapes this function. Only store errors
/// propagate, and they terminate the worker.
fn handle_task(
    manager: &Arc<QueueManager>,
    store: &Store,
    handle: &WorkerHandle,
    task: &mut Task,
) -> Result<()> {
    handle.set_current(task);
    let outcome = run_and_record(manager, store, task);
    handle.clear_current();
    outcome
}

fn run_and_record(manager: &Arc<QueueManager>, store: &Store, task: &mut Task) -> Result<()> {
    if task.is_legacy() {
        // A payload stored by an older schema: never executed, and the
        // original bytes are preserved by the failure write.
        warn!(task = task.id(), "stored task cannot be decoded");
        store.mark_failure(task, "cannot decode stored task payload")?;
        manager.notify_task_change(Some(task), TaskAction::Completed);
        return Ok(());
    }

    task.set_state(TaskState::Running);
    manager.notify_task_change(Some(task), TaskAction::Running);

    let run = catch_unwind(AssertUnwindSafe(|| manager.run_one_task(task)));

    match run {
        Ok(Ok(true)) => {
            debug!(task = task.id(), "task succeeded");
            store.mark_success(task)?;
            manager.notify_task_change(Some(task), TaskAction::Completed);
        }
        Ok(Ok(false)) => {
            debug!(task = task.id(), "task requested requeue");
            store.mark_requeue(task)?;
            manager.notify_task_change(Some(task), TaskAction::Waiting);
        }
        Ok(Err(e)) => {
            // Keep an error the task code recorded itself.
            task.record_error(e.to_string());
            store.mark_failure(task, &format!("unhandled error while running task: {e}"))?;
            manager.notify_task_change(Some(task), TaskAction::Completed);
        }
        Err(panic) => {
            let message = panic_message(&panic);
            task.record_error(&message);
            store.mark_failure(task, &format!("task panicked: {message}"))?;
            manager.notify_task_change(Some(task), TaskAction::Completed);
        }
    }

    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
