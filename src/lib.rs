//! Taskwell: persistent, multi-queue task scheduler for background work.
//!
//! Clients submit serialized task descriptors into named queues; the
//! engine durably stores them in SQLite, dispatches them to one worker
//! thread per queue in priority/eligibility order, applies exponential
//! retry backoff on failure, records per-task event logs, and notifies
//! subscribers of task and event lifecycle changes.
//!
//! # Architecture
//!
//! - **Store**: durable persistence of queues, tasks, and events, and
//!   the next-task selection query
//! - **Queue workers**: one thread per active queue, running tasks
//!   strictly sequentially within the queue
//! - **Manager**: process-wide coordinator that serializes cross-queue
//!   mutations and dispatches execution through a runner registry
//! - **Listeners**: weakly-held change subscriptions, delivered on an
//!   embedder-provided callback executor
//! - **Cursors**: read-only snapshot projections for list UIs
//!
//! Collaborators are injected: a [`Clock`] for timestamps, a [`Codec`]
//! for opaque payload blobs, and a [`CallbackExecutor`] for marshaling
//! observer callbacks onto the embedder's preferred thread.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod listeners;
pub mod manager;
pub mod store;
pub mod task;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Codec, DecodeError, JsonCodec};
pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use event::{Event, EventEnvelope};
pub use listeners::{
    CallbackExecutor, EventAction, EventChangeListener, InlineExecutor, TaskAction,
    TaskChangeListener,
};
pub use manager::{QueueManager, QueueManagerBuilder, TaskRunner};
pub use store::{ScheduledTask, Store, TaskSelection};
pub use task::{Task, TaskEnvelope, TaskState};
