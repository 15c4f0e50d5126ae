//! Task envelope and runtime task wrapper.
//!
//! A task is persisted as an opaque blob (the [`TaskEnvelope`], run
//! through the configured codec) plus scheduling columns owned by the
//! store. The [`Task`] wrapper pairs a decoded envelope with its row id
//! and the runtime-only pieces: the cooperative abort flag and the last
//! error captured while running.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::Codec;
use crate::Result;

/// Envelope kind used for stored blobs that can no longer be decoded.
pub const LEGACY_TASK_KIND: &str = "legacy";

/// Retry limit for tasks that never override it and are enqueued
/// without a configured default.
pub const DEFAULT_RETRY_LIMIT: u32 = 17;

/// Lifecycle state carried inside the serialized envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Constructed but not yet run.
    Created,
    /// Currently being executed by a queue worker.
    Running,
    /// Requeued and waiting for its retry time.
    Waiting,
    /// Terminally failed.
    Failed,
    /// Completed successfully.
    Succeeded,
}

/// The serialized form of a task.
///
/// Everything here rides inside the payload blob; the scheduling columns
/// (status, retry date, priority) are separate and authoritative. In
/// particular `retries` is overwritten from the `retry_count` column when
/// a stored task is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Registry tag used to find the runner for this task.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Lifecycle state at the time the envelope was last persisted.
    pub state: TaskState,
    /// Retries consumed in the current cycle.
    pub retries: u32,
    /// Retries consumed across all cycles (see [`Task::reset_retry_counter`]).
    pub total_retries: u32,
    /// Maximum retries before the task is failed.
    pub retry_limit: u32,
    /// Seconds to wait before the next attempt.
    pub retry_delay_secs: u32,
    /// Failure message recorded when the task last failed, if any.
    pub failure: Option<String>,
    /// Opaque embedder payload.
    pub payload: serde_json::Value,
}

impl TaskEnvelope {
    /// New envelope in the `Created` state with default retry policy.
    pub fn new(
        kind: impl Into<String>,
        description: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            state: TaskState::Created,
            retries: 0,
            total_retries: 0,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay_secs: 0,
            failure: None,
            payload,
        }
    }
}

/// A schedulable unit of work.
///
/// Clones share the abort flag, so a clone handed to an observer can
/// still see an abort requested against the running copy.
#[derive(Debug, Clone)]
pub struct Task {
    id: i64,
    envelope: TaskEnvelope,
    /// Original bytes of an undecodable stored blob, if this is a
    /// legacy placeholder.
    legacy: Option<Vec<u8>>,
    /// Whether the retry limit was chosen explicitly (by task code or a
    /// persisted envelope) rather than left at the built-in default.
    custom_retry_limit: bool,
    abort: Arc<AtomicBool>,
    last_error: Option<String>,
}

impl Task {
    /// Create a new task from a kind tag, description, and payload.
    ///
    /// The retry limit starts at the built-in default; the configured
    /// default is applied when the task is enqueued, unless
    /// [`Task::set_retry_limit`] was called first.
    pub fn new(
        kind: impl Into<String>,
        description: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: 0,
            envelope: TaskEnvelope::new(kind, description, payload),
            legacy: None,
            custom_retry_limit: false,
            abort: Arc::new(AtomicBool::new(false)),
            last_error: None,
        }
    }

    /// Wrap an existing envelope. The envelope's retry limit is kept
    /// as-is.
    pub fn from_envelope(envelope: TaskEnvelope) -> Self {
        Self {
            id: 0,
            envelope,
            legacy: None,
            custom_retry_limit: true,
            abort: Arc::new(AtomicBool::new(false)),
            last_error: None,
        }
    }

    /// Placeholder for a stored blob that can no longer be decoded.
    ///
    /// The original bytes are preserved and re-persisted verbatim; a
    /// legacy task is never executed.
    pub fn legacy(original: Vec<u8>) -> Self {
        let mut envelope = TaskEnvelope::new(
            LEGACY_TASK_KIND,
            "Legacy task placeholder; the stored record is obsolete and can not be recovered",
            serde_json::Value::Null,
        );
        envelope.state = TaskState::Created;
        Self {
            id: 0,
            envelope,
            legacy: Some(original),
            custom_retry_limit: true,
            abort: Arc::new(AtomicBool::new(false)),
            last_error: None,
        }
    }

    /// Decode a stored blob, falling back to a legacy placeholder.
    pub fn from_blob(blob: &[u8], codec: &dyn Codec) -> Self {
        match codec.decode_task(blob) {
            Ok(envelope) => Self::from_envelope(envelope),
            Err(err) => Task::legacy(err.bytes),
        }
    }

    /// Serialize this task for storage.
    ///
    /// Legacy placeholders return their original bytes unchanged.
    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        match &self.legacy {
            Some(original) => Ok(original.clone()),
            None => codec.encode_task(&self.envelope),
        }
    }

    /// Row id, 0 until persisted.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    /// Whether this is a placeholder for an undecodable blob.
    pub fn is_legacy(&self) -> bool {
        self.legacy.is_some()
    }

    /// The serialized envelope.
    pub fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    /// Registry tag used to dispatch this task.
    pub fn kind(&self) -> &str {
        &self.envelope.kind
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.envelope.description
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.envelope.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.envelope.state = state;
    }

    /// Retries consumed in the current cycle.
    pub fn retries(&self) -> u32 {
        self.envelope.retries
    }

    pub(crate) fn set_retries(&mut self, retries: u32) {
        self.envelope.retries = retries;
    }

    /// Retries consumed across all cycles.
    pub fn total_retries(&self) -> u32 {
        self.envelope.total_retries
    }

    /// Maximum retries before the task is failed.
    pub fn retry_limit(&self) -> u32 {
        self.envelope.retry_limit
    }

    /// Override the retry limit for this task. An explicit limit is
    /// kept even when the store applies its configured default at
    /// enqueue time.
    pub fn set_retry_limit(&mut self, limit: u32) {
        self.envelope.retry_limit = limit;
        self.custom_retry_limit = true;
    }

    /// Apply the configured default retry limit, unless the task chose
    /// its own. Called by the store when the task is enqueued.
    pub(crate) fn apply_default_retry_limit(&mut self, limit: u32) {
        if !self.custom_retry_limit {
            self.envelope.retry_limit = limit;
        }
    }

    /// Whether another requeue is allowed.
    pub fn can_retry(&self) -> bool {
        self.envelope.retries < self.envelope.retry_limit
    }

    /// Seconds until the next attempt after a requeue.
    pub fn retry_delay_secs(&self) -> u32 {
        self.envelope.retry_delay_secs
    }

    /// Set an explicit delay before the next attempt.
    ///
    /// Task code may call this while running to control its own backoff;
    /// the default exponential schedule is re-applied when the stored
    /// task is next decoded.
    pub fn set_retry_delay_secs(&mut self, secs: u32) {
        self.envelope.retry_delay_secs = secs;
    }

    /// Apply the default exponential backoff: `2^(retries+1)` seconds,
    /// clamped to `cap`.
    pub(crate) fn reset_retry_delay(&mut self, cap_secs: u32) {
        let delay = 1u64
            .checked_shl(self.envelope.retries.saturating_add(1))
            .unwrap_or(u64::MAX);
        self.envelope.retry_delay_secs = delay.min(u64::from(cap_secs)) as u32;
    }

    /// Fold the current retry cycle into the running total and start a
    /// fresh cycle. Long tasks call this when they reach a new phase so
    /// earlier retries do not count against the limit.
    pub fn reset_retry_counter(&mut self) {
        self.envelope.total_retries += self.envelope.retries;
        self.envelope.retries = 0;
    }

    /// Handle shared with clones; used by the manager to signal abort.
    pub(crate) fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Ask the task to stop. Task code is trusted to poll
    /// [`Task::abort_requested`] periodically; nothing is interrupted
    /// forcibly.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Whether an abort has been requested.
    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Error recorded while running, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Record an error. An error already present is not overwritten, so
    /// a message set by task code survives the worker's own capture.
    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.last_error.is_none() {
            self.last_error = Some(message.into());
        }
    }

    pub(crate) fn set_failure(&mut self, reason: &str) {
        self.envelope.state = TaskState::Failed;
        self.envelope.failure = Some(reason.to_owned());
    }
}
