//! Event history queries: time-range lookups, replay, retention pruning.
//!
//! Built over [`StateStore`]'s chronologically-keyed task-event column
//! family; no session concept survives here, only per-task event streams.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use super::types::TaskEventKind;
use crate::state::{SharedStateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

pub struct EventHistory {
    store: SharedStateStore,
}

impl EventHistory {
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    pub fn get_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HistoryResult<Vec<TaskEventKind>> {
        Ok(self.store.get_events_range(start, end)?)
    }

    pub fn get_recent_events(&self, minutes: i64) -> HistoryResult<Vec<TaskEventKind>> {
        let end = Utc::now();
        let start = end - ChronoDuration::minutes(minutes);
        self.get_events(start, end)
    }

    pub fn get_task_events(&self, task_id: &str) -> HistoryResult<Vec<TaskEventKind>> {
        let all = self.get_events(DateTime::<Utc>::MIN_UTC, Utc::now())?;
        Ok(all.into_iter().filter(|e| e.task_id() == task_id).collect())
    }

    /// Streams events in `[start, end]` through `callback` in chronological
    /// order, accumulating [`ReplayStats`].
    pub async fn replay<F>(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mut callback: F,
    ) -> HistoryResult<ReplayStats>
    where
        F: FnMut(&TaskEventKind),
    {
        let events = self.get_events(start, end)?;
        let mut stats = ReplayStats::default();
        for event in &events {
            stats.record_event(event);
            callback(event);
        }
        Ok(stats)
    }

    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> HistoryResult<usize> {
        Ok(self.store.prune_events_before(cutoff)?)
    }

    pub fn get_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HistoryResult<EventStats> {
        let events = self.get_events(start, end)?;
        Ok(EventStats::from_events(&events))
    }
}

#[derive(Debug, Default)]
pub struct ReplayStats {
    pub total_events: usize,
    pub tasks_seen: std::collections::HashSet<String>,
    pub errors_seen: usize,
}

impl ReplayStats {
    pub fn record_event(&mut self, event: &TaskEventKind) {
        self.total_events += 1;
        self.tasks_seen.insert(event.task_id().to_string());
        if matches!(event, TaskEventKind::Error { .. }) {
            self.errors_seen += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct EventStats {
    pub total_events: usize,
    pub events_by_type: HashMap<String, usize>,
    pub unique_tasks: usize,
    pub errors: usize,
    pub escalations: usize,
    pub aggregation_conflicts: usize,
    pub prs_created: usize,
}

impl EventStats {
    pub fn from_events(events: &[TaskEventKind]) -> Self {
        let mut events_by_type = HashMap::new();
        let mut tasks = std::collections::HashSet::new();
        let mut errors = 0;
        let mut escalations = 0;
        let mut aggregation_conflicts = 0;
        let mut prs_created = 0;

        for event in events {
            *events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            tasks.insert(event.task_id().to_string());
            match event {
                TaskEventKind::Error { .. } => errors += 1,
                TaskEventKind::Escalated { .. } => escalations += 1,
                TaskEventKind::AggregationConflict { .. } => aggregation_conflicts += 1,
                TaskEventKind::PrCreated { .. } => prs_created += 1,
                _ => {}
            }
        }

        Self {
            total_events: events.len(),
            events_by_type,
            unique_tasks: tasks.len(),
            errors,
            escalations,
            aggregation_conflicts,
            prs_created,
        }
    }
}

/// Fluent builder over [`EventHistory::get_events`] plus post-hoc filters.
pub struct ReplayBuilder<'a> {
    history: &'a EventHistory,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    task: Option<String>,
    event_types: Option<Vec<String>>,
}

impl<'a> ReplayBuilder<'a> {
    pub fn new(history: &'a EventHistory) -> Self {
        Self {
            history,
            start: DateTime::<Utc>::MIN_UTC,
            end: Utc::now(),
            task: None,
            event_types: None,
        }
    }

    pub fn time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task = Some(task_id.to_string());
        self
    }

    pub fn event_types(mut self, types: Vec<&str>) -> Self {
        self.event_types = Some(types.into_iter().map(String::from).collect());
        self
    }

    pub fn collect(self) -> HistoryResult<Vec<TaskEventKind>> {
        let mut events = self.history.get_events(self.start, self.end)?;
        if let Some(ref task_id) = self.task {
            events.retain(|e| e.task_id() == task_id);
        }
        if let Some(ref types) = self.event_types {
            events.retain(|e| types.iter().any(|t| t == e.event_type()));
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use tempfile::tempdir;

    fn sample(task_id: &str, ts: DateTime<Utc>) -> TaskEventKind {
        TaskEventKind::TaskCreated {
            task_id: task_id.to_string(),
            timestamp: ts,
        }
    }

    #[test]
    fn get_task_events_filters_by_task() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().shared();
        let now = Utc::now();
        store.put_event("e1", &sample("t1", now)).unwrap();
        store.put_event("e2", &sample("t2", now)).unwrap();

        let history = EventHistory::new(store);
        let events = history.get_task_events("t1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id(), "t1");
    }

    #[test]
    fn stats_count_by_type() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().shared();
        let now = Utc::now();
        store.put_event("e1", &sample("t1", now)).unwrap();
        store
            .put_event(
                "e2",
                &TaskEventKind::Error {
                    task_id: "t1".into(),
                    agent: None,
                    message: "boom".into(),
                    timestamp: now,
                },
            )
            .unwrap();

        let history = EventHistory::new(store);
        let stats = history
            .get_stats(now - ChronoDuration::minutes(1), now + ChronoDuration::minutes(1))
            .unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.unique_tasks, 1);
    }

    #[test]
    fn prune_before_removes_old_events() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().shared();
        let old = Utc::now() - ChronoDuration::days(1);
        store.put_event("old", &sample("t1", old)).unwrap();
        store.put_event("new", &sample("t1", Utc::now())).unwrap();

        let history = EventHistory::new(store);
        let pruned = history.prune_before(Utc::now() - ChronoDuration::hours(1)).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(history.get_task_events("t1").unwrap().len(), 1);
    }
}
