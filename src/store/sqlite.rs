//! SQLite-backed queue store.
//!
//! One [`Store`] wraps one database connection behind a `Mutex`; the
//! manager and each queue worker hold their own `Store` against the same
//! database file. All multi-statement mutations run in a transaction.
//!
//! Every write method tolerates the target row having been deleted by
//! the manager between selection and write: the affected statement
//! simply updates zero rows.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::cursors::{self, EventsCursor, TaskSelection, TasksCursor};
use super::schema::apply_schema;
use crate::clock::{format_date, parse_date, Clock};
use crate::codec::Codec;
use crate::config::QueueConfig;
use crate::event::Event;
use crate::task::{Task, TaskState};
use crate::{QueueError, Result};

/// Reason recorded when a requeue runs out of retries.
pub(crate) const RETRY_LIMIT_REASON: &str = "Retry limit exceeded";

/// Details of the next task that should be run from a queue.
///
/// The payload blob is kept raw; deserialization is deferred until the
/// task is actually going to run.
#[derive(Debug)]
pub struct ScheduledTask {
    id: i64,
    retries: u32,
    blob: Vec<u8>,
    wait: Duration,
}

impl ScheduledTask {
    /// Row id of the scheduled task.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Time until the task becomes eligible; zero when runnable now.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Whether the task can run immediately.
    pub fn is_ready(&self) -> bool {
        self.wait.is_zero()
    }
}

/// Durable persistence of queues, tasks, and events.
pub struct Store {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn Codec>,
    config: QueueConfig,
}

impl Store {
    /// Open (or create) the database at the configured path and apply
    /// the schema.
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        codec: Arc<dyn Codec>,
        config: QueueConfig,
    ) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            codec,
            config,
        })
    }

    /// Open an in-memory database. Each in-memory store is private to
    /// its connection; use a file path when workers need to share.
    pub fn open_in_memory(
        clock: Arc<dyn Clock>,
        codec: Arc<dyn Codec>,
        config: QueueConfig,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            codec,
            config,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Internal("store connection mutex poisoned".to_owned()))
    }

    /// The codec used for payload blobs.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Current time from the injected clock.
    pub(crate) fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }

    // -----------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------

    /// Look up the id of a queue by name.
    pub fn queue_id(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let id = conn
            .query_row("SELECT id FROM queue WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(id)
    }

    /// Create the named queue if it does not exist. Idempotent.
    pub fn create_queue(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.queue_id(name)? {
            return Ok(id);
        }
        let conn = self.lock()?;
        conn.execute("INSERT OR IGNORE INTO queue (name) VALUES (?1)", [name])?;
        drop(conn);
        self.queue_id(name)?
            .ok_or_else(|| QueueError::Internal(format!("queue '{name}' vanished after insert")))
    }

    /// All queue names, used for startup recovery.
    pub fn queue_names(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT name FROM queue ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    // -----------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------

    /// Persist a task on the named queue.
    ///
    /// The queue must already exist; this is the non-creating variant
    /// and fails with [`QueueError::UnknownQueue`] otherwise. Tasks
    /// that did not choose a retry limit get the configured default
    /// here, before the payload is encoded. The new row id is written
    /// back into the task.
    pub fn enqueue(&self, task: &mut Task, queue_name: &str, priority: i64) -> Result<i64> {
        let queue_id = self
            .queue_id(queue_name)?
            .ok_or_else(|| QueueError::UnknownQueue(queue_name.to_owned()))?;

        task.apply_default_retry_limit(self.config.default_retry_limit);
        let now = format_date(self.now());
        let blob = task.encode(self.codec.as_ref())?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task (queue_id, queued_date, priority, status_code, retry_date, retry_count, task)
             VALUES (?1, ?2, ?3, 'Q', ?2, 0, ?4)",
            params![queue_id, now, priority, blob],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        task.set_id(id);
        debug!(task = id, queue = queue_name, priority, "task enqueued");
        Ok(id)
    }

    /// Find the next task that should be run from the named queue.
    ///
    /// Two-phase selection under one lock: first the highest-priority
    /// task that is eligible now (`retry_date <= now`, ordered by
    /// priority, then retry date, then id), failing that the soonest
    /// future task (ordered by retry date, then priority, then id).
    /// Returns `None` only when the queue holds no queued tasks at all.
    pub fn next_task(&self, queue_name: &str) -> Result<Option<ScheduledTask>> {
        let now = self.now();
        let now_str = format_date(now);
        let conn = self.lock()?;

        let ready = conn
            .prepare_cached(
                "SELECT t.id, t.retry_count, t.retry_date, t.task
                 FROM task t JOIN queue q ON t.queue_id = q.id
                 WHERE t.status_code = 'Q' AND q.name = ?1 AND t.retry_date <= ?2
                 ORDER BY t.priority ASC, t.retry_date ASC, t.id ASC
                 LIMIT 1",
            )?
            .query_row(params![queue_name, now_str], Self::map_scheduled_row)
            .optional()?;

        let row = match ready {
            Some(row) => Some(row),
            None => conn
                .prepare_cached(
                    "SELECT t.id, t.retry_count, t.retry_date, t.task
                     FROM task t JOIN queue q ON t.queue_id = q.id
                     WHERE t.status_code = 'Q' AND q.name = ?1 AND t.retry_date > ?2
                     ORDER BY t.retry_date ASC, t.priority ASC, t.id ASC
                     LIMIT 1",
                )?
                .query_row(params![queue_name, now_str], Self::map_scheduled_row)
                .optional()?,
        };

        Ok(row.map(|(id, retries, retry_date, blob)| {
            let retry_at = parse_date(&retry_date, now);
            let wait = if retry_at > now {
                Duration::from_millis((retry_at - now).num_milliseconds().max(0) as u64)
            } else {
                Duration::ZERO
            };
            ScheduledTask {
                id,
                retries,
                blob,
                wait,
            }
        }))
    }

    fn map_scheduled_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, u32, String, Vec<u8>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    /// Decode a scheduled task, substituting a legacy placeholder when
    /// the blob fails to decode.
    ///
    /// The persisted retry count overrides whatever the blob carried,
    /// and the default exponential delay for the next cycle is seeded
    /// from it.
    pub fn decode_scheduled(&self, scheduled: ScheduledTask) -> Task {
        let mut task = Task::from_blob(&scheduled.blob, self.codec.as_ref());
        task.set_id(scheduled.id);
        task.set_retries(scheduled.retries);
        task.reset_retry_delay(self.config.max_retry_delay_secs);
        task
    }

    /// Mark a task successfully completed.
    ///
    /// A task with no recorded events leaves no trail: its row is
    /// deleted. A task with events is kept with `status='S'` for
    /// inspection.
    pub fn mark_success(&self, task: &Task) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let events: i64 = tx.query_row(
            "SELECT COUNT(*) FROM event WHERE task_id = ?1",
            [task.id()],
            |row| row.get(0),
        )?;
        if events == 0 {
            tx.execute("DELETE FROM task WHERE id = ?1", [task.id()])?;
        } else {
            tx.execute(
                "UPDATE task SET status_code = 'S' WHERE id = ?1",
                [task.id()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Save and requeue a task after a run that asked to be retried.
    ///
    /// When the retry limit is exhausted the task is failed with
    /// "Retry limit exceeded" instead. Otherwise the retry date moves to
    /// `now + retry_delay`, the retry count is bumped, and the payload
    /// is re-persisted.
    pub fn mark_requeue(&self, task: &mut Task) -> Result<()> {
        if !task.can_retry() {
            return self.mark_failure(task, RETRY_LIMIT_REASON);
        }

        task.set_state(TaskState::Waiting);
        let retry_at = self.now() + chrono::Duration::seconds(i64::from(task.retry_delay_secs()));
        let blob = task.encode(self.codec.as_ref())?;
        let next_count = task.retries() + 1;

        let conn = self.lock()?;
        conn.execute(
            "UPDATE task SET retry_date = ?1, retry_count = ?2, task = ?3 WHERE id = ?4",
            params![format_date(retry_at), next_count, blob, task.id()],
        )?;
        drop(conn);

        task.set_retries(next_count);
        debug!(
            task = task.id(),
            retries = next_count,
            retry_at = %format_date(retry_at),
            "task requeued"
        );
        Ok(())
    }

    /// Save and mark a task as terminally failed.
    pub fn mark_failure(&self, task: &mut Task, reason: &str) -> Result<()> {
        task.set_failure(reason);
        let exception = serde_json::to_vec(&task.last_error())
            .map_err(|e| QueueError::Codec(e.to_string()))?;
        let blob = task.encode(self.codec.as_ref())?;

        let conn = self.lock()?;
        conn.execute(
            "UPDATE task SET failure_reason = ?1, status_code = 'F', exception = ?2, task = ?3
             WHERE id = ?4",
            params![reason, exception, blob, task.id()],
        )?;
        debug!(task = task.id(), reason, "task failed");
        Ok(())
    }

    /// Rewrite the payload blob of an existing task.
    ///
    /// A no-op when the row has been deleted concurrently.
    pub fn update(&self, task: &Task) -> Result<()> {
        let blob = task.encode(self.codec.as_ref())?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE task SET task = ?1 WHERE id = ?2",
            params![blob, task.id()],
        )?;
        Ok(())
    }

    /// Delete a task and all its events. Idempotent.
    pub fn delete_task(&self, id: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM event WHERE task_id = ?1", [id])?;
        tx.execute("DELETE FROM task WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    /// Store an event attached to a task, verifying the task still
    /// exists in the same transaction.
    ///
    /// Returns the new event id, or 0 without inserting when the task
    /// row is already gone.
    pub fn store_task_event(&self, task: &Task, event: &mut Event) -> Result<i64> {
        let blob = event.encode(self.codec.as_ref())?;
        let now = self.now();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let exists: i64 = tx
            .prepare_cached("SELECT COUNT(*) FROM task WHERE id = ?1")?
            .query_row([task.id()], |row| row.get(0))?;
        if exists == 0 {
            return Ok(0);
        }
        tx.execute(
            "INSERT INTO event (task_id, event, event_date) VALUES (?1, ?2, ?3)",
            params![task.id(), blob, format_date(now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        drop(conn);

        event.set_id(id);
        event.set_event_at(now);
        Ok(id)
    }

    /// Store a free-standing event.
    pub fn store_event(&self, event: &mut Event) -> Result<i64> {
        let blob = event.encode(self.codec.as_ref())?;
        let now = self.now();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO event (task_id, event, event_date) VALUES (NULL, ?1, ?2)",
            params![blob, format_date(now)],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        event.set_id(id);
        event.set_event_at(now);
        Ok(id)
    }

    /// Delete an event, then sweep any orphans the deletion produced.
    pub fn delete_event(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM event WHERE id = ?1", [id])?;
        drop(conn);
        self.cleanup_orphans()?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------

    /// Delete tasks older than `days` (and their events), then sweep
    /// orphans. Returns the number of rows removed.
    ///
    /// Age is measured on `retry_date`, so a task that keeps retrying
    /// keeps refreshing its cleanup eligibility.
    pub fn cleanup_old_tasks(&self, days: u32) -> Result<usize> {
        let cutoff = format_date(self.now() - chrono::Duration::days(i64::from(days)));

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let n_events = tx.execute(
            "DELETE FROM event WHERE task_id IN (SELECT id FROM task WHERE retry_date < ?1)",
            [&cutoff],
        )?;
        let n_tasks = tx.execute("DELETE FROM task WHERE retry_date < ?1", [&cutoff])?;
        tx.commit()?;
        drop(conn);

        let n_orphans = self.cleanup_orphans()?;
        debug!(n_tasks, n_events, n_orphans, "old task cleanup");
        Ok(n_tasks + n_events + n_orphans)
    }

    /// Delete events older than `days`, then sweep orphans. Returns the
    /// number of rows removed.
    pub fn cleanup_old_events(&self, days: u32) -> Result<usize> {
        let cutoff = format_date(self.now() - chrono::Duration::days(i64::from(days)));

        let conn = self.lock()?;
        let n_events = conn.execute("DELETE FROM event WHERE event_date < ?1", [&cutoff])?;
        drop(conn);

        let n_orphans = self.cleanup_orphans()?;
        debug!(n_events, n_orphans, "old event cleanup");
        Ok(n_events + n_orphans)
    }

    /// Remove events whose task is gone, then succeeded tasks left with
    /// no events. Returns the number of rows removed.
    pub fn cleanup_orphans(&self) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let n_events = tx.execute(
            "DELETE FROM event
             WHERE task_id IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM task t WHERE t.id = event.task_id)",
            [],
        )?;
        let n_tasks = tx.execute(
            "DELETE FROM task
             WHERE status_code = 'S'
               AND NOT EXISTS (SELECT 1 FROM event e WHERE e.task_id = task.id)",
            [],
        )?;
        tx.commit()?;
        Ok(n_events + n_tasks)
    }

    // -----------------------------------------------------------------
    // Priority
    // -----------------------------------------------------------------

    /// Move a task ahead of everything currently queued.
    ///
    /// Compound read-then-write; callers serialize via the manager lock
    /// so concurrent moves produce a total order.
    pub fn bring_task_to_front(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        let min: i64 = conn
            .prepare_cached("SELECT COALESCE(MIN(priority), 0) FROM task WHERE status_code = 'Q'")?
            .query_row([], |row| row.get(0))?;
        conn.prepare_cached("UPDATE task SET priority = ?1 WHERE id = ?2")?
            .execute(params![min - 1, id])?;
        Ok(())
    }

    /// Move a task behind everything currently queued.
    pub fn send_task_to_back(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        let max: i64 = conn
            .prepare_cached("SELECT COALESCE(MAX(priority), 0) FROM task WHERE status_code = 'Q'")?
            .query_row([], |row| row.get(0))?;
        conn.prepare_cached("UPDATE task SET priority = ?1 WHERE id = ?2")?
            .execute(params![max + 1, id])?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Projections
    // -----------------------------------------------------------------

    /// Snapshot of tasks matching the selection, newest first.
    pub fn tasks(&self, selection: TaskSelection) -> Result<TasksCursor> {
        let conn = self.lock()?;
        cursors::fetch_tasks(&conn, selection, Arc::clone(&self.codec), self.clock.now())
    }

    /// Snapshot of the events recorded for one task, oldest first.
    pub fn events_for_task(&self, task_id: i64) -> Result<EventsCursor> {
        let conn = self.lock()?;
        cursors::fetch_task_events(&conn, task_id, Arc::clone(&self.codec), self.clock.now())
    }

    /// Snapshot of all events, oldest first.
    pub fn all_events(&self) -> Result<EventsCursor> {
        let conn = self.lock()?;
        cursors::fetch_all_events(&conn, Arc::clone(&self.codec), self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::JsonCodec;

    fn test_store() -> (Store, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_system_now());
        let store = Store::open_in_memory(
            clock.clone(),
            Arc::new(JsonCodec),
            QueueConfig::default(),
        )
        .expect("open store");
        (store, clock)
    }

    fn enqueue(store: &Store, queue: &str, kind: &str, priority: i64) -> Task {
        let mut task = Task::new(kind, kind, serde_json::json!({}));
        store.enqueue(&mut task, queue, priority).expect("enqueue");
        task
    }

    #[test]
    fn create_queue_is_idempotent() {
        let (store, _clock) = test_store();
        let a = store.create_queue("net").expect("create");
        let b = store.create_queue("net").expect("create again");
        assert_eq!(a, b);
        assert_eq!(store.queue_names().expect("names"), vec!["net"]);
    }

    #[test]
    fn enqueue_unknown_queue_is_an_error() {
        let (store, _clock) = test_store();
        let mut task = Task::new("t", "T", serde_json::json!({}));
        let err = store.enqueue(&mut task, "missing", 0).expect_err("error");
        assert!(matches!(err, QueueError::UnknownQueue(name) if name == "missing"));
    }

    #[test]
    fn enqueue_applies_configured_default_retry_limit() {
        let clock = Arc::new(ManualClock::at_system_now());
        let config = QueueConfig {
            default_retry_limit: 3,
            ..QueueConfig::default()
        };
        let store = Store::open_in_memory(clock.clone(), Arc::new(JsonCodec), config)
            .expect("open store");
        store.create_queue("net").expect("queue");

        let mut task = Task::new("t", "T", serde_json::json!({}));
        store.enqueue(&mut task, "net", 0).expect("enqueue");
        assert_eq!(task.retry_limit(), 3);

        // The limit travels with the persisted envelope.
        let scheduled = store.next_task("net").expect("next").expect("some");
        let decoded = store.decode_scheduled(scheduled);
        assert_eq!(decoded.retry_limit(), 3);

        // A task that chose its own limit keeps it.
        let mut custom = Task::new("t", "T", serde_json::json!({}));
        custom.set_retry_limit(5);
        store.enqueue(&mut custom, "net", 0).expect("enqueue");
        assert_eq!(custom.retry_limit(), 5);
    }

    #[test]
    fn next_task_returns_none_for_empty_queue() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        assert!(store.next_task("net").expect("next").is_none());
    }

    #[test]
    fn next_task_prefers_lower_priority_value() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let _low = enqueue(&store, "net", "low", 5);
        let urgent = enqueue(&store, "net", "urgent", -1);

        let next = store.next_task("net").expect("next").expect("some");
        assert_eq!(next.id(), urgent.id());
        assert!(next.is_ready());
    }

    #[test]
    fn equal_priority_and_date_breaks_tie_by_smallest_id() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let first = enqueue(&store, "net", "a", 0);
        let _second = enqueue(&store, "net", "b", 0);

        let next = store.next_task("net").expect("next").expect("some");
        assert_eq!(next.id(), first.id());
    }

    #[test]
    fn retry_date_equal_to_now_is_eligible() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let task = enqueue(&store, "net", "t", 0);

        // The frozen clock stamped the row with the same instant the
        // selection query compares against, so the boundary is exact.
        let next = store.next_task("net").expect("next").expect("some");
        assert_eq!(next.id(), task.id());
        assert!(next.is_ready(), "retry_date == now must count as ready");
    }

    #[test]
    fn future_task_reports_positive_wait() {
        let (store, clock) = test_store();
        store.create_queue("net").expect("queue");
        let mut task = enqueue(&store, "net", "t", 0);
        task.set_retry_delay_secs(30);
        store.mark_requeue(&mut task).expect("requeue");

        let next = store.next_task("net").expect("next").expect("some");
        assert_eq!(next.id(), task.id());
        assert!(!next.is_ready());
        assert!(next.wait() > Duration::from_secs(25));
        assert!(next.wait() <= Duration::from_secs(30));

        // Once the clock reaches the retry date the task is ready.
        clock.advance_secs(31);
        let next = store.next_task("net").expect("next").expect("some");
        assert!(next.is_ready());
    }

    #[test]
    fn ready_task_wins_over_sooner_future_task() {
        let (store, clock) = test_store();
        store.create_queue("net").expect("queue");

        let mut waiting = enqueue(&store, "net", "waiting", -10);
        waiting.set_retry_delay_secs(5);
        store.mark_requeue(&mut waiting).expect("requeue");

        clock.advance_secs(1);
        let ready = enqueue(&store, "net", "ready", 10);

        // The waiting task has better priority but is not eligible yet.
        let next = store.next_task("net").expect("next").expect("some");
        assert_eq!(next.id(), ready.id());
        assert!(next.is_ready());
    }

    #[test]
    fn decode_scheduled_restores_id_retries_and_payload() {
        let (store, clock) = test_store();
        store.create_queue("net").expect("queue");
        let mut task = Task::new("sync", "Sync", serde_json::json!({"shelf": 7}));
        store.enqueue(&mut task, "net", 0).expect("enqueue");
        task.set_retry_delay_secs(0);
        store.mark_requeue(&mut task).expect("requeue");
        clock.advance_secs(1);

        let scheduled = store.next_task("net").expect("next").expect("some");
        let decoded = store.decode_scheduled(scheduled);
        assert_eq!(decoded.id(), task.id());
        assert_eq!(decoded.retries(), 1);
        assert_eq!(decoded.envelope().payload["shelf"], 7);
        // Default exponential delay seeded from the persisted count.
        assert_eq!(decoded.retry_delay_secs(), 4);
    }

    #[test]
    fn decode_scheduled_falls_back_to_legacy() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        {
            let conn = store.lock().expect("lock");
            conn.execute(
                "INSERT INTO task (queue_id, task) VALUES (1, x'DEADBEEF')",
                [],
            )
            .expect("insert raw");
        }

        let scheduled = store.next_task("net").expect("next").expect("some");
        let decoded = store.decode_scheduled(scheduled);
        assert!(decoded.is_legacy());
        // The original bytes survive re-encoding.
        assert_eq!(
            decoded.encode(store.codec().as_ref()).expect("encode"),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn mark_success_deletes_task_without_events() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let task = enqueue(&store, "net", "t", 0);

        store.mark_success(&task).expect("success");
        assert!(store.next_task("net").expect("next").is_none());
        assert_eq!(store.tasks(TaskSelection::All).expect("cursor").len(), 0);
    }

    #[test]
    fn mark_success_retains_task_with_events() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let task = enqueue(&store, "net", "t", 0);
        let mut event = Event::new("log", "did a thing", serde_json::json!({}));
        let event_id = store.store_task_event(&task, &mut event).expect("event");
        assert!(event_id > 0);

        store.mark_success(&task).expect("success");
        let cursor = store.tasks(TaskSelection::All).expect("cursor");
        assert_eq!(cursor.len(), 1);
        let row = cursor.iter().next().expect("row");
        assert_eq!(row.status_code(), "S");
        assert_eq!(row.event_count(), 1);
    }

    #[test]
    fn mark_requeue_bumps_count_and_moves_retry_date() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let mut task = enqueue(&store, "net", "t", 0);
        task.set_retry_delay_secs(60);

        store.mark_requeue(&mut task).expect("requeue");
        assert_eq!(task.retries(), 1);

        let next = store.next_task("net").expect("next").expect("some");
        assert!(!next.is_ready());
    }

    #[test]
    fn mark_requeue_past_limit_fails_task() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let mut task = enqueue(&store, "net", "t", 0);
        task.set_retry_limit(2);
        task.set_retries(2);

        store.mark_requeue(&mut task).expect("requeue");

        let cursor = store.tasks(TaskSelection::Failed).expect("cursor");
        assert_eq!(cursor.len(), 1);
        let row = cursor.iter().next().expect("row");
        assert_eq!(row.status_code(), "F");
        assert_eq!(row.failure_reason(), Some(RETRY_LIMIT_REASON));
    }

    #[test]
    fn mark_failure_persists_reason_and_error() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let mut task = enqueue(&store, "net", "t", 0);
        task.record_error("connection reset");

        store.mark_failure(&mut task, "network down").expect("fail");

        let cursor = store.tasks(TaskSelection::Failed).expect("cursor");
        let row = cursor.iter().next().expect("row");
        assert_eq!(row.failure_reason(), Some("network down"));
        assert_eq!(row.error().expect("decode"), Some("connection reset".to_owned()));
        assert_eq!(row.task().state(), TaskState::Failed);
    }

    #[test]
    fn writes_after_delete_are_no_ops() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let mut task = enqueue(&store, "net", "t", 0);
        store.delete_task(task.id()).expect("delete");

        // None of these may error once the row is gone.
        store.update(&task).expect("update");
        store.mark_success(&task).expect("success");
        task.set_retry_delay_secs(1);
        store.mark_requeue(&mut task).expect("requeue");
        store.mark_failure(&mut task, "too late").expect("failure");
        store.delete_task(task.id()).expect("delete again");

        assert_eq!(store.tasks(TaskSelection::All).expect("cursor").len(), 0);
    }

    #[test]
    fn store_task_event_returns_zero_when_task_gone() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let task = enqueue(&store, "net", "t", 0);
        store.delete_task(task.id()).expect("delete");

        let mut event = Event::new("log", "late", serde_json::json!({}));
        let id = store.store_task_event(&task, &mut event).expect("store");
        assert_eq!(id, 0);
        assert_eq!(store.all_events().expect("events").len(), 0);
    }

    #[test]
    fn delete_task_cascades_to_events() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let task = enqueue(&store, "net", "t", 0);
        let mut event = Event::new("log", "one", serde_json::json!({}));
        store.store_task_event(&task, &mut event).expect("event");

        store.delete_task(task.id()).expect("delete");
        assert_eq!(store.all_events().expect("events").len(), 0);
    }

    #[test]
    fn cleanup_orphans_restores_invariants() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let task = enqueue(&store, "net", "t", 0);
        let mut event = Event::new("log", "one", serde_json::json!({}));
        store.store_task_event(&task, &mut event).expect("event");
        store.mark_success(&task).expect("success");

        // Remove the event behind the store's back; the succeeded task
        // is now an orphan.
        store.delete_event(event.id()).expect("delete event");

        assert_eq!(store.tasks(TaskSelection::All).expect("cursor").len(), 0);
        assert_eq!(store.all_events().expect("events").len(), 0);
    }

    #[test]
    fn cleanup_old_tasks_ages_by_retry_date() {
        let (store, clock) = test_store();
        store.create_queue("net").expect("queue");
        let _old = enqueue(&store, "net", "old", 0);

        clock.advance_secs(10 * 86_400);
        let fresh = enqueue(&store, "net", "fresh", 0);

        let removed = store.cleanup_old_tasks(7).expect("cleanup");
        assert_eq!(removed, 1);

        let cursor = store.tasks(TaskSelection::All).expect("cursor");
        assert_eq!(cursor.len(), 1);
        assert_eq!(cursor.iter().next().expect("row").id(), fresh.id());
    }

    #[test]
    fn cleanup_old_events_ages_by_event_date() {
        let (store, clock) = test_store();
        store.create_queue("net").expect("queue");
        let task = enqueue(&store, "net", "t", 0);
        let mut old_event = Event::new("log", "old", serde_json::json!({}));
        store.store_task_event(&task, &mut old_event).expect("event");

        clock.advance_secs(10 * 86_400);
        let mut fresh_event = Event::new("log", "fresh", serde_json::json!({}));
        store
            .store_task_event(&task, &mut fresh_event)
            .expect("event");

        store.cleanup_old_events(7).expect("cleanup");
        let events = store.all_events().expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events.iter().next().expect("row").id(), fresh_event.id());
    }

    #[test]
    fn bring_to_front_and_send_to_back_reshuffle() {
        let (store, _clock) = test_store();
        store.create_queue("net").expect("queue");
        let a = enqueue(&store, "net", "a", 0);
        let b = enqueue(&store, "net", "b", 0);

        store.bring_task_to_front(b.id()).expect("front");
        let next = store.next_task("net").expect("next").expect("some");
        assert_eq!(next.id(), b.id());

        store.send_task_to_back(b.id()).expect("back");
        let next = store.next_task("net").expect("next").expect("some");
        assert_eq!(next.id(), a.id());
    }

    #[test]
    fn free_standing_events_have_no_task() {
        let (store, _clock) = test_store();
        let mut event = Event::new("audit", "queue cleared", serde_json::json!({}));
        let id = store.store_event(&mut event).expect("store");
        assert!(id > 0);

        let events = store.all_events().expect("events");
        let row = events.iter().next().expect("row");
        assert_eq!(row.task_id(), None);
    }
}
