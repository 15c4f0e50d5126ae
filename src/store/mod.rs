//! Durable persistence of queues, tasks, and events.
//!
//! - `schema`: DDL and schema versioning
//! - `sqlite`: the [`Store`] itself — lifecycle transitions, next-task
//!   selection, cleanup
//! - `cursors`: read-only snapshot projections for list UIs

pub mod cursors;
pub(crate) mod schema;
pub mod sqlite;

pub use cursors::{EventRow, EventsCursor, TaskRow, TaskSelection, TasksCursor};
pub use sqlite::{ScheduledTask, Store};
