//! Error types for the task queue.

/// Top-level error type for the scheduling and persistence engine.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Database access error.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Enqueue against a queue name that has not been created.
    #[error("queue '{0}' does not exist; unable to queue request")]
    UnknownQueue(String),

    /// The default dispatcher cannot run a task with no registered runner.
    #[error("no runner registered for task kind '{0}'")]
    UnsupportedTask(String),

    /// Payload encoding error.
    #[error("codec error: {0}")]
    Codec(String),

    /// A second live manager was constructed.
    #[error("only one QueueManager can be present")]
    ManagerExists,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation (poisoned lock, dead worker handle).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, QueueError>;
