//! Task event types.
//!
//! A closed tagged union — one variant per kind, carrying only the fields
//! that kind actually needs — replacing the "any"-typed event metadata the
//! design notes call out. The WS/dashboard projection (level, a flattened
//! `message` string) is a separate step performed by `to_ws_message`, not
//! baked into the variant shape itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::TaskId;

pub type EventId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Event kinds the core emits while driving a task through `Status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskCreated {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    Planned {
        task_id: TaskId,
        estimated_complexity: String,
        timestamp: DateTime<Utc>,
    },
    SubtaskDispatched {
        task_id: TaskId,
        subtask_id: String,
        child_task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    Coded {
        task_id: TaskId,
        agent: String,
        tokens_used: Option<u64>,
        duration_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    Tested {
        task_id: TaskId,
        success: bool,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Reviewed {
        task_id: TaskId,
        verdict: String,
        timestamp: DateTime<Utc>,
    },
    Escalated {
        task_id: TaskId,
        from_model: String,
        to_model: String,
        timestamp: DateTime<Utc>,
    },
    AggregationConflict {
        task_id: TaskId,
        files: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    PrCreated {
        task_id: TaskId,
        pr_reference: String,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        task_id: TaskId,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        task_id: TaskId,
        agent: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEventKind {
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TaskEventKind::TaskCreated { timestamp, .. }
            | TaskEventKind::Planned { timestamp, .. }
            | TaskEventKind::SubtaskDispatched { timestamp, .. }
            | TaskEventKind::Coded { timestamp, .. }
            | TaskEventKind::Tested { timestamp, .. }
            | TaskEventKind::Reviewed { timestamp, .. }
            | TaskEventKind::Escalated { timestamp, .. }
            | TaskEventKind::AggregationConflict { timestamp, .. }
            | TaskEventKind::PrCreated { timestamp, .. }
            | TaskEventKind::StatusChanged { timestamp, .. }
            | TaskEventKind::Error { timestamp, .. }
            | TaskEventKind::Cancelled { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            TaskEventKind::TaskCreated { .. } => "task_created",
            TaskEventKind::Planned { .. } => "planned",
            TaskEventKind::SubtaskDispatched { .. } => "subtask_dispatched",
            TaskEventKind::Coded { .. } => "coded",
            TaskEventKind::Tested { .. } => "tested",
            TaskEventKind::Reviewed { .. } => "reviewed",
            TaskEventKind::Escalated { .. } => "escalated",
            TaskEventKind::AggregationConflict { .. } => "aggregation_conflict",
            TaskEventKind::PrCreated { .. } => "pr_created",
            TaskEventKind::StatusChanged { .. } => "status_changed",
            TaskEventKind::Error { .. } => "error",
            TaskEventKind::Cancelled { .. } => "cancelled",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEventKind::TaskCreated { task_id, .. }
            | TaskEventKind::Planned { task_id, .. }
            | TaskEventKind::SubtaskDispatched { task_id, .. }
            | TaskEventKind::Coded { task_id, .. }
            | TaskEventKind::Tested { task_id, .. }
            | TaskEventKind::Reviewed { task_id, .. }
            | TaskEventKind::Escalated { task_id, .. }
            | TaskEventKind::AggregationConflict { task_id, .. }
            | TaskEventKind::PrCreated { task_id, .. }
            | TaskEventKind::StatusChanged { task_id, .. }
            | TaskEventKind::Error { task_id, .. }
            | TaskEventKind::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn level(&self) -> EventLevel {
        match self {
            TaskEventKind::Error { .. } => EventLevel::Error,
            TaskEventKind::Tested { success: false, .. }
            | TaskEventKind::AggregationConflict { .. }
            | TaskEventKind::Cancelled { .. } => EventLevel::Warn,
            _ => EventLevel::Info,
        }
    }

    /// Flattens the event into the WS message shape:
    /// `{type,taskId,eventType,agent?,message?,timestamp,level,tokensUsed?,durationMs?}`.
    pub fn to_ws_message(&self) -> serde_json::Value {
        let (agent, message, tokens_used, duration_ms) = match self {
            TaskEventKind::Coded {
                agent,
                tokens_used,
                duration_ms,
                ..
            } => (Some(agent.clone()), None, *tokens_used, *duration_ms),
            TaskEventKind::Tested { message, .. } => (None, message.clone(), None, None),
            TaskEventKind::Error { agent, message, .. } => {
                (agent.clone(), Some(message.clone()), None, None)
            }
            _ => (None, None, None, None),
        };
        serde_json::json!({
            "type": "task_event",
            "taskId": self.task_id(),
            "eventType": self.event_type(),
            "agent": agent,
            "message": message,
            "timestamp": self.timestamp().to_rfc3339(),
            "level": self.level(),
            "tokensUsed": tokens_used,
            "durationMs": duration_ms,
        })
    }
}
