//! RocksDB-backed persistent store.
//!
//! Contract: CRUD for [`Task`], task events, [`SessionMemory`] and
//! [`Checkpoint`], plus specialized atomic upserts for orchestration state
//! and subtask status, and narrow queries (tasks-by-status, child-tasks-of,
//! parent-of, recent events since a cursor, completed child diffs ordered
//! by subtask index).
//!
//! Every read-modify-write sequence that must be atomic against concurrent
//! observers (`mutate_session`, `update_subtask_status`) is serialized
//! under `write_lock`, standing in for the row-level transaction the spec
//! asks for — RocksDB itself has no cross-key transactions in the feature
//! set this crate uses.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::{de::DeserializeOwned, Serialize};

use super::schema::{self, keys, ALL_CFS};
use super::types::{
    Checkpoint, ModelConfigAuditEntry, OrchestrationState, Position, SessionMemory, Status,
    SubtaskStatus, Task,
};
use crate::events::types::TaskEventKind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("column family not found: {0}")]
    ColumnFamilyNotFound(String),
    #[error("storage-fatal: {0}")]
    StorageFatal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type SharedStateStore = Arc<StateStore>;

/// Exponential backoff policy for transient store I/O: base 1s, multiplier
/// 2, max 30s (jitter is applied by the caller, which owns the
/// source of randomness).
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

pub struct StateStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(name.to_string()))
    }

    fn put<T: Serialize>(&self, cf: &str, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(self.cf(cf)?, key, bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &str) -> StoreResult<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- Task CRUD --------------------------------------------------

    pub fn put_task(&self, task: &Task) -> StoreResult<()> {
        self.put(schema::CF_TASKS, &keys::task(&task.id), task)
    }

    pub fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        self.get(schema::CF_TASKS, &keys::task(task_id))
    }

    pub fn require_task(&self, task_id: &str) -> StoreResult<Task> {
        self.get_task(task_id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))
    }

    /// Tasks whose `status` matches, in key order.
    pub fn tasks_by_status(&self, status: Status) -> StoreResult<Vec<Task>> {
        let cf = self.cf(schema::CF_TASKS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let task: Task = serde_json::from_slice(&value)?;
            if task.status == status {
                out.push(task);
            }
        }
        Ok(out)
    }

    /// Child tasks of `parent_task_id`, ordered by `subtask_index`.
    pub fn child_tasks_of(&self, parent_task_id: &str) -> StoreResult<Vec<Task>> {
        let cf = self.cf(schema::CF_TASKS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let task: Task = serde_json::from_slice(&value)?;
            if task.parent_task_id.as_deref() == Some(parent_task_id) {
                out.push(task);
            }
        }
        out.sort_by_key(|t| t.subtask_index.unwrap_or(usize::MAX));
        Ok(out)
    }

    pub fn parent_of(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let task = self.require_task(task_id)?;
        match task.parent_task_id {
            Some(parent_id) => self.get_task(&parent_id),
            None => Ok(None),
        }
    }

    // -- Session Memory -----------------------------------------------

    pub fn put_session(&self, session: &SessionMemory) -> StoreResult<()> {
        self.put(
            schema::CF_SESSION_MEMORY,
            &keys::session(&session.task_id),
            session,
        )
    }

    pub fn get_session(&self, task_id: &str) -> StoreResult<Option<SessionMemory>> {
        self.get(schema::CF_SESSION_MEMORY, &keys::session(task_id))
    }

    pub fn require_session(&self, task_id: &str) -> StoreResult<SessionMemory> {
        self.get_session(task_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {task_id}")))
    }

    /// Atomic read-modify-write over a task's session memory.
    pub fn mutate_session<F>(&self, task_id: &str, f: F) -> StoreResult<SessionMemory>
    where
        F: FnOnce(&mut SessionMemory) -> StoreResult<()>,
    {
        let _guard = self.write_lock.lock().unwrap();
        let mut session = self.require_session(task_id)?;
        f(&mut session)?;
        self.put_session(&session)?;
        Ok(session)
    }

    /// Atomic upsert of a single subtask's status within a parent's
    /// orchestration state.
    pub fn update_subtask_status(
        &self,
        parent_task_id: &str,
        subtask_id: &str,
        status: SubtaskStatus,
        diff: Option<String>,
    ) -> StoreResult<OrchestrationState> {
        let _guard = self.write_lock.lock().unwrap();
        let mut session = self.require_session(parent_task_id)?;
        let orch = session
            .orchestration
            .as_mut()
            .ok_or_else(|| StoreError::NotFound("orchestration state".into()))?;
        let subtask = orch
            .subtask_mut(subtask_id)
            .ok_or_else(|| StoreError::NotFound(format!("subtask {subtask_id}")))?;
        subtask
            .transition(status)
            .map_err(StoreError::StorageFatal)?;
        if status == SubtaskStatus::Completed {
            if let Some(d) = diff {
                subtask.diff = Some(d);
            }
            if !orch.completed_subtasks.iter().any(|s| s == subtask_id) {
                orch.completed_subtasks.push(subtask_id.to_string());
            }
        }
        let orch_snapshot = orch.clone();
        self.put_session(&session)?;
        Ok(orch_snapshot)
    }

    pub fn upsert_orchestration_state(
        &self,
        task_id: &str,
        orchestration: OrchestrationState,
    ) -> StoreResult<()> {
        self.mutate_session(task_id, |session| {
            session.orchestration = Some(orchestration);
            Ok(())
        })
        .map(|_| ())
    }

    // -- Checkpoints -----------------------------------------------------

    pub fn put_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        self.put(
            schema::CF_SESSION_CHECKPOINTS,
            &keys::checkpoint(&checkpoint.id),
            checkpoint,
        )
    }

    pub fn get_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<Checkpoint>> {
        self.get(
            schema::CF_SESSION_CHECKPOINTS,
            &keys::checkpoint(checkpoint_id),
        )
    }

    // -- Task events ------------------------------------------------------

    pub fn put_event(&self, event_id: &str, event: &TaskEventKind) -> StoreResult<()> {
        let nanos = event.timestamp().timestamp_nanos_opt().unwrap_or(0);
        self.put(
            schema::CF_TASK_EVENTS,
            &keys::event(nanos, event_id),
            event,
        )
    }

    /// Events with a key-order cursor strictly greater than `(created_at,
    /// id)`; `None` returns from the beginning.
    pub fn recent_events_since(
        &self,
        cursor: Option<(i64, &str)>,
        limit: usize,
    ) -> StoreResult<Vec<TaskEventKind>> {
        let cf = self.cf(schema::CF_TASK_EVENTS)?;
        let start_key = cursor.map(|(ts, id)| keys::event(ts, id));
        let mode = match &start_key {
            None => IteratorMode::Start,
            Some(k) => IteratorMode::From(k.as_bytes(), rocksdb::Direction::Forward),
        };
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            if Some(&key_str) == start_key.as_ref() {
                continue;
            }
            out.push(serde_json::from_slice::<TaskEventKind>(&value)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// All events with timestamp in `[start, end]`, oldest first.
    pub fn get_events_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TaskEventKind>> {
        let cf = self.cf(schema::CF_TASK_EVENTS)?;
        let start_nanos = start.timestamp_nanos_opt().unwrap_or(i64::MIN);
        let end_nanos = end.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let start_key = format!("evt:{start_nanos:020}:");
        let mut out = Vec::new();
        for item in self.db.iterator_cf(
            cf,
            IteratorMode::From(start_key.as_bytes(), rocksdb::Direction::Forward),
        ) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let Some(nanos) = keys::parse_event_timestamp(&key_str) else {
                continue;
            };
            if nanos > end_nanos {
                break;
            }
            out.push(serde_json::from_slice::<TaskEventKind>(&value)?);
        }
        Ok(out)
    }

    /// Deletes every event with a timestamp strictly before `cutoff`.
    /// Returns the number of events removed.
    pub fn prune_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let cf = self.cf(schema::CF_TASK_EVENTS)?;
        let cutoff_nanos = cutoff.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut to_delete = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let Some(nanos) = keys::parse_event_timestamp(&key_str) else {
                continue;
            };
            if nanos >= cutoff_nanos {
                break;
            }
            to_delete.push(key.to_vec());
        }
        let count = to_delete.len();
        for key in to_delete {
            self.db.delete_cf(cf, key)?;
        }
        Ok(count)
    }

    /// Completed child diffs, ordered by subtask index, for the Aggregator.
    pub fn completed_child_diffs(
        &self,
        parent_task_id: &str,
    ) -> StoreResult<Vec<(usize, String)>> {
        let children = self.child_tasks_of(parent_task_id)?;
        let mut out = Vec::new();
        for child in children {
            if child.status == Status::Completed {
                if let Some(diff) = child.current_diff {
                    out.push((child.subtask_index.unwrap_or(0), diff));
                }
            }
        }
        out.sort_by_key(|(idx, _)| *idx);
        Ok(out)
    }

    // -- Model config + audit ---------------------------------------------

    pub fn get_model_config(&self, position: Position) -> StoreResult<Option<String>> {
        self.get(
            schema::CF_MODEL_CONFIG,
            &keys::model_config(&position.to_string()),
        )
    }

    /// Sets a position's model, appending an audit entry. Only called for
    /// operator-driven config changes, never for ordinary escalation
    /// lookups.
    pub fn set_model_config(
        &self,
        position: Position,
        new_model: &str,
        reason: Option<String>,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let key = keys::model_config(&position.to_string());
        let old_model: Option<String> = self.get(schema::CF_MODEL_CONFIG, &key)?;
        self.put(schema::CF_MODEL_CONFIG, &key, &new_model.to_string())?;
        let entry = ModelConfigAuditEntry {
            position: position.to_string(),
            old_model,
            new_model: new_model.to_string(),
            changed_at: chrono::Utc::now(),
            reason,
        };
        let audit_key = keys::model_config_audit(
            &position.to_string(),
            entry.changed_at.timestamp_nanos_opt().unwrap_or(0),
        );
        self.put(schema::CF_MODEL_CONFIG_AUDIT, &audit_key, &entry)
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.db.path())
    }
}
