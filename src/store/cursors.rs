//! Read-only projections over the store, for list UIs.
//!
//! Each fetch returns a forward-iterable snapshot taken at call time;
//! rows are plain values and stay valid after the store moves on.
//! Cursors also carry ephemeral per-row selection flags for multi-select
//! list views; selection is never persisted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use rusqlite::Connection;

use crate::clock::parse_date;
use crate::codec::{Codec, DecodeError};
use crate::event::Event;
use crate::task::Task;
use crate::Result;

/// Which tasks a [`TasksCursor`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSelection {
    /// Every task row.
    All,
    /// Terminally failed tasks (`status = 'F'`).
    Failed,
    /// Everything that has not succeeded (`status <> 'S'`).
    Active,
    /// Tasks waiting to run (`status = 'Q'`).
    Queued,
}

/// One task row with its computed event count.
#[derive(Clone)]
pub struct TaskRow {
    id: i64,
    queue_id: i64,
    queued_at: DateTime<Local>,
    retry_at: DateTime<Local>,
    retry_count: u32,
    status_code: String,
    failure_reason: Option<String>,
    exception: Option<Vec<u8>>,
    blob: Vec<u8>,
    event_count: i64,
    codec: Arc<dyn Codec>,
}

impl TaskRow {
    /// Row id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Owning queue id.
    pub fn queue_id(&self) -> i64 {
        self.queue_id
    }

    /// When the task was first enqueued.
    pub fn queued_at(&self) -> DateTime<Local> {
        self.queued_at
    }

    /// Earliest eligible run time.
    pub fn retry_at(&self) -> DateTime<Local> {
        self.retry_at
    }

    /// Retries consumed in the current cycle.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Raw status code: `Q`, `S`, or `F`.
    pub fn status_code(&self) -> &str {
        &self.status_code
    }

    /// Failure reason, present on failed tasks.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Number of events recorded against this task.
    pub fn event_count(&self) -> i64 {
        self.event_count
    }

    /// Decode the stored error, if any.
    pub fn error(&self) -> std::result::Result<Option<String>, DecodeError> {
        match &self.exception {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| DecodeError {
                bytes: bytes.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Decode the stored task, substituting a legacy placeholder when
    /// the blob cannot be decoded.
    pub fn task(&self) -> Task {
        let mut task = Task::from_blob(&self.blob, self.codec.as_ref());
        task.set_id(self.id);
        task
    }
}

/// Snapshot of task rows, newest first.
pub struct TasksCursor {
    rows: Vec<TaskRow>,
    selections: HashMap<i64, bool>,
}

impl TasksCursor {
    /// Number of rows in the snapshot.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate the rows in snapshot order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskRow> {
        self.rows.iter()
    }

    /// Row at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&TaskRow> {
        self.rows.get(index)
    }

    /// Ephemeral multi-select flag for a row.
    pub fn is_selected(&self, id: i64) -> bool {
        self.selections.get(&id).copied().unwrap_or(false)
    }

    /// Set the ephemeral multi-select flag for a row.
    pub fn set_selected(&mut self, id: i64, selected: bool) {
        self.selections.insert(id, selected);
    }
}

/// One event row.
#[derive(Clone)]
pub struct EventRow {
    id: i64,
    task_id: Option<i64>,
    event_at: DateTime<Local>,
    blob: Vec<u8>,
    codec: Arc<dyn Codec>,
}

impl EventRow {
    /// Row id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Owning task id; `None` for free-standing events.
    pub fn task_id(&self) -> Option<i64> {
        self.task_id
    }

    /// When the event was recorded.
    pub fn event_at(&self) -> DateTime<Local> {
        self.event_at
    }

    /// Decode the stored event, substituting a legacy placeholder when
    /// the blob cannot be decoded.
    pub fn event(&self) -> Event {
        let mut event = Event::from_blob(&self.blob, self.codec.as_ref());
        event.set_id(self.id);
        event.set_event_at(self.event_at);
        event
    }
}

/// Snapshot of event rows, oldest first.
pub struct EventsCursor {
    rows: Vec<EventRow>,
    selections: HashMap<i64, bool>,
}

impl EventsCursor {
    /// Number of rows in the snapshot.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate the rows in snapshot order.
    pub fn iter(&self) -> impl Iterator<Item = &EventRow> {
        self.rows.iter()
    }

    /// Row at `index`, if in range.
    pub fn get(&self, index: usize) -> Option<&EventRow> {
        self.rows.get(index)
    }

    /// Ephemeral multi-select flag for a row.
    pub fn is_selected(&self, id: i64) -> bool {
        self.selections.get(&id).copied().unwrap_or(false)
    }

    /// Set the ephemeral multi-select flag for a row.
    pub fn set_selected(&mut self, id: i64, selected: bool) {
        self.selections.insert(id, selected);
    }
}

const TASK_COLUMNS: &str = "t.id, t.queue_id, t.queued_date, t.retry_date, t.retry_count, \
     t.status_code, t.failure_reason, t.exception, t.task, \
     (SELECT COUNT(*) FROM event e WHERE e.task_id = t.id) AS event_count";

pub(crate) fn fetch_tasks(
    conn: &Connection,
    selection: TaskSelection,
    codec: Arc<dyn Codec>,
    now: DateTime<Local>,
) -> Result<TasksCursor> {
    let filter = match selection {
        TaskSelection::All => "",
        TaskSelection::Failed => "WHERE t.status_code = 'F'",
        TaskSelection::Active => "WHERE t.status_code <> 'S'",
        TaskSelection::Queued => "WHERE t.status_code = 'Q'",
    };
    let sql = format!("SELECT {TASK_COLUMNS} FROM task t {filter} ORDER BY t.id DESC");

    let mut stmt = conn.prepare(&sql)?;
    let mapped = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, u32>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<Vec<u8>>>(7)?,
            row.get::<_, Vec<u8>>(8)?,
            row.get::<_, i64>(9)?,
        ))
    })?;

    let mut rows = Vec::new();
    for mapped_row in mapped {
        let (id, queue_id, queued, retry, retry_count, status, reason, exception, blob, events) =
            mapped_row?;
        rows.push(TaskRow {
            id,
            queue_id,
            queued_at: parse_date(&queued, now),
            retry_at: parse_date(&retry, now),
            retry_count,
            status_code: status,
            failure_reason: reason,
            exception,
            blob,
            event_count: events,
            codec: Arc::clone(&codec),
        });
    }

    Ok(TasksCursor {
        rows,
        selections: HashMap::new(),
    })
}

pub(crate) fn fetch_task_events(
    conn: &Connection,
    task_id: i64,
    codec: Arc<dyn Codec>,
    now: DateTime<Local>,
) -> Result<EventsCursor> {
    fetch_events(
        conn,
        "SELECT id, task_id, event_date, event FROM event WHERE task_id = ?1 ORDER BY id ASC",
        rusqlite::params![task_id],
        codec,
        now,
    )
}

pub(crate) fn fetch_all_events(
    conn: &Connection,
    codec: Arc<dyn Codec>,
    now: DateTime<Local>,
) -> Result<EventsCursor> {
    fetch_events(
        conn,
        "SELECT id, task_id, event_date, event FROM event ORDER BY id ASC",
        rusqlite::params![],
        codec,
        now,
    )
}

fn fetch_events(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    codec: Arc<dyn Codec>,
    now: DateTime<Local>,
) -> Result<EventsCursor> {
    let mut stmt = conn.prepare(sql)?;
    let mapped = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<i64>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
        ))
    })?;

    let mut rows = Vec::new();
    for mapped_row in mapped {
        let (id, task_id, date, blob) = mapped_row?;
        rows.push(EventRow {
            id,
            task_id,
            event_at: parse_date(&date, now),
            blob,
            codec: Arc::clone(&codec),
        });
    }

    Ok(EventsCursor {
        rows,
        selections: HashMap::new(),
    })
}
