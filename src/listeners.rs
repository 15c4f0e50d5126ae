//! Change listeners and the callback executor seam.
//!
//! Listeners are held weakly: a subscriber that is dropped without
//! unregistering is discovered at the next notification and purged, so
//! forgotten subscriptions cannot leak in a long-running process.
//!
//! Callbacks are never invoked on a queue worker thread directly; they
//! are submitted to the embedder-provided [`CallbackExecutor`], which in
//! a UI host typically marshals onto the main thread.

use std::sync::{Arc, Mutex, Weak};

use crate::event::Event;
use crate::task::Task;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Task was submitted.
    Created,
    /// Task (or a batch of tasks) was deleted.
    Deleted,
    /// Task payload was saved.
    Updated,
    /// Task finished, successfully or not.
    Completed,
    /// Task started running.
    Running,
    /// Task was requeued and is waiting for its retry time.
    Waiting,
}

/// What happened to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Event was recorded.
    Created,
    /// Event (or a batch of events) was deleted.
    Deleted,
    /// Event was rewritten.
    Updated,
}

/// Receives task change notifications.
///
/// The task is `None` for bulk operations (deletes, cleanups) where no
/// single task identifies the change.
pub trait TaskChangeListener: Send + Sync {
    /// Called on the callback executor after a task changes.
    fn on_task_change(&self, task: Option<&Task>, action: TaskAction);
}

/// Receives event change notifications.
pub trait EventChangeListener: Send + Sync {
    /// Called on the callback executor after an event changes.
    fn on_event_change(&self, event: Option<&Event>, action: EventAction);
}

/// Runs observer callbacks on the embedder's preferred thread.
pub trait CallbackExecutor: Send + Sync {
    /// Submit a callback for execution.
    fn execute(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Executor that runs callbacks immediately on the calling thread.
///
/// Suitable for headless embedders and tests; UI hosts should supply an
/// executor that posts to their main thread instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn execute(&self, callback: Box<dyn FnOnce() + Send>) {
        callback();
    }
}

/// Weakly-held listener list.
pub(crate) struct ListenerRegistry<L: ?Sized> {
    entries: Mutex<Vec<Weak<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Weak<L>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a listener. Registering the same listener twice is a no-op.
    pub(crate) fn register(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener);
        let mut entries = self.lock();
        if entries.iter().any(|existing| existing.ptr_eq(&weak)) {
            return;
        }
        entries.push(weak);
    }

    /// Remove a listener.
    pub(crate) fn unregister(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener);
        self.lock().retain(|existing| !existing.ptr_eq(&weak));
    }

    /// Number of registered entries, dead or alive.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Dispatch to every live listener; dead entries are pruned.
    ///
    /// The list is snapshotted first so `dispatch` runs without the
    /// registry mutex held.
    pub(crate) fn notify(&self, dispatch: impl Fn(Arc<L>)) {
        let snapshot: Vec<Weak<L>> = self.lock().clone();
        for weak in snapshot {
            match weak.upgrade() {
                Some(listener) => dispatch(listener),
                None => {
                    self.lock().retain(|existing| !existing.ptr_eq(&weak));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        calls: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<dyn TaskChangeListener> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl TaskChangeListener for CountingListener {
        fn on_task_change(&self, _task: Option<&Task>, _action: TaskAction) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn notify_all(registry: &ListenerRegistry<dyn TaskChangeListener>) {
        registry.notify(|listener| listener.on_task_change(None, TaskAction::Updated));
    }

    #[test]
    fn register_is_deduplicated() {
        let registry: ListenerRegistry<dyn TaskChangeListener> = ListenerRegistry::new();
        let listener = CountingListener::new();
        registry.register(&listener);
        registry.register(&listener);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_entry() {
        let registry: ListenerRegistry<dyn TaskChangeListener> = ListenerRegistry::new();
        let listener = CountingListener::new();
        registry.register(&listener);
        registry.unregister(&listener);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn dropped_listener_is_pruned_on_notify() {
        let registry: ListenerRegistry<dyn TaskChangeListener> = ListenerRegistry::new();
        let keep = CountingListener::new();
        registry.register(&keep);
        {
            let transient = CountingListener::new();
            registry.register(&transient);
            assert_eq!(registry.len(), 2);
        }

        notify_all(&registry);
        assert_eq!(registry.len(), 1, "dead entry must be purged");
    }

    #[test]
    fn notify_reaches_live_listeners() {
        let registry: ListenerRegistry<dyn TaskChangeListener> = ListenerRegistry::new();
        let listener = Arc::new(CountingListener {
            calls: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn TaskChangeListener> = listener.clone();
        registry.register(&as_dyn);

        notify_all(&registry);
        notify_all(&registry);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn inline_executor_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        InlineExecutor.execute(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
