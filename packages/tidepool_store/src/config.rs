use serde::{Deserialize, Serialize};

/// Store tunables. Deserializable so an application shell can load it from
/// whatever config source it uses; every field has a working default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file, or `:memory:` for a transient store.
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "tidepool.db".to_string(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

impl StoreConfig {
    pub fn at_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Transient store for tests. A single connection keeps the in-memory
    /// database alive for the lifetime of the pool.
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_connections: 1,
        }
    }

    pub(crate) fn db_url(&self) -> String {
        if self.path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_url_forms() {
        assert_eq!(StoreConfig::in_memory().db_url(), "sqlite::memory:");
        assert_eq!(
            StoreConfig::at_path("/tmp/t.db").db_url(),
            "sqlite:///tmp/t.db?mode=rwc"
        );
    }
}
