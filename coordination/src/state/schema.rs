//! Column family definitions for the RocksDB-backed store.
//!
//! Each column family provides logical separation of data types while
//! sharing the same RocksDB instance, mirroring the persisted layout's
//! logical table list.

pub const CF_TASKS: &str = "tasks";
pub const CF_TASK_EVENTS: &str = "task_events";
pub const CF_SESSION_MEMORY: &str = "session_memory";
pub const CF_SESSION_CHECKPOINTS: &str = "session_checkpoints";
pub const CF_MODEL_CONFIG: &str = "model_config";
pub const CF_MODEL_CONFIG_AUDIT: &str = "model_config_audit";
pub const CF_REPOSITORIES: &str = "repositories";

pub const ALL_CFS: &[&str] = &[
    CF_TASKS,
    CF_TASK_EVENTS,
    CF_SESSION_MEMORY,
    CF_SESSION_CHECKPOINTS,
    CF_MODEL_CONFIG,
    CF_MODEL_CONFIG_AUDIT,
    CF_REPOSITORIES,
];

/// Key prefixes for compound keys.
pub mod keys {
    pub fn task(task_id: &str) -> String {
        format!("task:{task_id}")
    }

    pub fn session(task_id: &str) -> String {
        format!("sess:{task_id}")
    }

    pub fn checkpoint(checkpoint_id: &str) -> String {
        format!("ckpt:{checkpoint_id}")
    }

    /// Timestamp-prefixed so a column-family range scan yields chronological
    /// order for "recent events since cursor" queries.
    pub fn event(timestamp_nanos: i64, event_id: &str) -> String {
        format!("evt:{timestamp_nanos:020}:{event_id}")
    }

    pub fn parse_event_timestamp(key: &str) -> Option<i64> {
        let mut parts = key.splitn(3, ':');
        if parts.next() != Some("evt") {
            return None;
        }
        parts.next()?.parse().ok()
    }

    pub fn model_config(position: &str) -> String {
        format!("cfg:{position}")
    }

    pub fn model_config_audit(position: &str, changed_at_nanos: i64) -> String {
        format!("audit:{position}:{changed_at_nanos:020}")
    }

    pub fn repository(owner: &str, name: &str) -> String {
        format!("repo:{owner}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_keys_order_chronologically() {
        let k1 = keys::event(1_000, "a");
        let k2 = keys::event(2_000, "b");
        assert!(k1 < k2);
        assert_eq!(keys::parse_event_timestamp(&k1), Some(1_000));
    }

    #[test]
    fn task_and_session_keys_are_namespaced() {
        assert_eq!(keys::task("t1"), "task:t1");
        assert_eq!(keys::session("t1"), "sess:t1");
    }
}
