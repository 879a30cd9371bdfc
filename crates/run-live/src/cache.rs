//! Query invalidation shared between channels and the poller.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Cached query that channels may mark stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Run(String),
    RunList,
    Timeline(String),
    Tasks(String),
}

impl QueryKey {
    /// Everything that can change when a run ends or its live connection drops.
    #[must_use]
    pub fn run_state(run_id: &str) -> [QueryKey; 4] {
        [
            QueryKey::Run(run_id.to_string()),
            QueryKey::RunList,
            QueryKey::Timeline(run_id.to_string()),
            QueryKey::Tasks(run_id.to_string()),
        ]
    }
}

pub trait QueryInvalidator: Send + Sync {
    fn invalidate(&self, key: &QueryKey);

    fn invalidate_all(&self, keys: &[QueryKey]) {
        for key in keys {
            self.invalidate(key);
        }
    }
}

/// Generation counters per query key plus a global change signal.
#[derive(Debug)]
pub struct QueryCache {
    generations: Mutex<HashMap<QueryKey, u64>>,
    changed: watch::Sender<u64>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            generations: Mutex::new(HashMap::new()),
            changed,
        }
    }

    /// How many times `key` has been invalidated.
    #[must_use]
    pub fn generation(&self, key: &QueryKey) -> u64 {
        let generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        generations.get(key).copied().unwrap_or(0)
    }

    /// Receiver that observes every invalidation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

impl QueryInvalidator for QueryCache {
    fn invalidate(&self, key: &QueryKey) {
        {
            let mut generations = self
                .generations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *generations.entry(key.clone()).or_insert(0) += 1;
        }
        debug!("invalidated query {:?}", key);
        self.changed.send_modify(|version| *version += 1);
    }
}
