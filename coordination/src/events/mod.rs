//! Task-event pub/sub and history.
//!
//! Three pieces:
//!
//! 1. **Event Types** (`types.rs`): the closed `TaskEventKind` union driving
//!    task-lifecycle observers.
//! 2. **Event Bus** (`bus.rs`): tokio broadcast pub/sub with optional
//!    persistence to RocksDB.
//! 3. **Event History** (`history.rs`): time-range queries, replay and
//!    retention pruning over persisted events.
//!
//! ```ignore
//! use coordination::events::{EventBus, TaskEventKind};
//! use chrono::Utc;
//!
//! let bus = EventBus::with_persistence(store.clone()).shared();
//! let mut receiver = bus.subscribe();
//! bus.publish(TaskEventKind::TaskCreated {
//!     task_id: "task-1".to_string(),
//!     timestamp: Utc::now(),
//! })?;
//! let event = receiver.recv().await?;
//! ```

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{
    EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter, FilteredReceiver,
    SharedEventBus,
};
pub use history::{
    EventHistory, EventStats, HistoryError, HistoryResult, ReplayBuilder, ReplayStats,
};
pub use types::{EventId, EventLevel, TaskEventKind};
