use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one replication instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Distinguishes multiple replications over the same collection pair
    /// (e.g. per account). Part of the persisted checkpoint key.
    pub identifier: String,
    pub local_collection: String,
    pub remote_collection: String,
    #[serde(default = "default_pull_batch_size")]
    pub pull_batch_size: u32,
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Consecutive remote rejections before a document is quarantined.
    #[serde(default = "default_quarantine_after")]
    pub quarantine_after: u32,
}

fn default_pull_batch_size() -> u32 {
    100
}

fn default_push_batch_size() -> u32 {
    50
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_quarantine_after() -> u32 {
    5
}

impl ReplicationConfig {
    /// Same-named local and remote collection, default tuning.
    pub fn for_collection(identifier: impl Into<String>, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        Self {
            identifier: identifier.into(),
            local_collection: collection.clone(),
            remote_collection: collection,
            pull_batch_size: default_pull_batch_size(),
            push_batch_size: default_push_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            quarantine_after: default_quarantine_after(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Exponential backoff for a failed cycle: 1s doubling per attempt,
    /// capped at `max_backoff_secs`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = 1u64 << attempt.min(30);
        Duration::from_secs(secs.min(self.max_backoff_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = ReplicationConfig::for_collection("test", "messages");
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
        assert_eq!(config.backoff(20), Duration::from_secs(60));
    }

    #[test]
    fn defaults_fill_in_from_partial_config() {
        let config: ReplicationConfig = serde_json::from_str(
            r#"{"identifier": "acct-1", "local_collection": "a", "remote_collection": "b"}"#,
        )
        .unwrap();
        assert_eq!(config.pull_batch_size, 100);
        assert_eq!(config.quarantine_after, 5);
    }
}
