//! Status-driven polling of the run and timeline queries.

use crate::cache::{QueryCache, QueryKey};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use run_query::{RunApiClient, RunRecord, RunRef};
use run_timeline::{
    ActiveSelection, BlockStatusTracker, RunStatus, TimelineItem, count_actions, poll_interval,
    resolve,
};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait RunSource: Send + Sync {
    async fn fetch_run(&self, run: &RunRef) -> Result<RunRecord>;
    async fn fetch_timeline(&self, run: &RunRef) -> Result<Vec<TimelineItem>>;
}

#[async_trait]
impl RunSource for RunApiClient {
    async fn fetch_run(&self, run: &RunRef) -> Result<RunRecord> {
        Ok(self.get_run(run).await?)
    }

    async fn fetch_timeline(&self, run: &RunRef) -> Result<Vec<TimelineItem>> {
        Ok(self.get_timeline(run).await?)
    }
}

/// One consistent view of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub timeline: Vec<TimelineItem>,
    pub fetched_at: DateTime<Utc>,
}

impl RunSnapshot {
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.run.status.is_finalized()
    }

    #[must_use]
    pub fn action_count(&self) -> usize {
        count_actions(&self.timeline)
    }

    /// Active item for the persisted `target`, recomputed against this tree.
    #[must_use]
    pub fn active_selection(&self, target: Option<&str>) -> Option<ActiveSelection<'_>> {
        resolve(&self.timeline, target, self.is_finalized())
    }
}

pub struct RunPoller {
    source: Arc<dyn RunSource>,
    run: RunRef,
    interval: Duration,
    cache: Option<Arc<QueryCache>>,
    tracker: BlockStatusTracker,
    snapshots: watch::Sender<Option<Arc<RunSnapshot>>>,
}

impl RunPoller {
    #[must_use]
    pub fn new(source: Arc<dyn RunSource>, run: RunRef, interval: Duration) -> Self {
        let (snapshots, _) = watch::channel(None);
        Self {
            source,
            run,
            interval,
            cache: None,
            tracker: BlockStatusTracker::new(),
            snapshots,
        }
    }

    /// Refetch early whenever this run's queries are invalidated.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<RunSnapshot>>> {
        self.snapshots.subscribe()
    }

    /// Fetch both queries and publish the result.
    pub async fn poll_once(&mut self) -> Result<Arc<RunSnapshot>> {
        let run = self.source.fetch_run(&self.run).await?;
        let timeline = self.source.fetch_timeline(&self.run).await?;

        for regression in self.tracker.observe_tree(&timeline) {
            warn!("run {}: {}", self.run, regression);
        }

        let snapshot = Arc::new(RunSnapshot {
            run,
            timeline,
            fetched_at: Utc::now(),
        });
        debug!(
            "run {} is {} with {} actions",
            self.run,
            snapshot.status(),
            snapshot.action_count()
        );
        self.snapshots.send_replace(Some(Arc::clone(&snapshot)));
        Ok(snapshot)
    }

    /// Poll until the run is finalized or every subscriber is gone.
    ///
    /// A failed poll keeps the last snapshot and retries at the base interval.
    pub async fn run(mut self) {
        let cache = self.cache.clone();
        let key = QueryKey::Run(self.run.id.clone());
        let mut changes = cache.as_ref().map(|cache| cache.subscribe());
        let mut seen = cache.as_ref().map_or(0, |cache| cache.generation(&key));
        let mut status: Option<RunStatus> = None;

        loop {
            match self.poll_once().await {
                Ok(snapshot) => status = Some(snapshot.status()),
                Err(error) => warn!("polling run {} failed: {}", self.run, error),
            }

            let Some(delay) = poll_interval(status, self.interval) else {
                info!("run {} finalized, polling stopped", self.run);
                break;
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.snapshots.closed() => {
                    debug!("no subscribers left for run {}", self.run);
                    break;
                }
                () = invalidated(cache.as_deref(), changes.as_mut(), &key, &mut seen) => {
                    debug!("run {} invalidated, refetching", self.run);
                }
            }
        }
    }

    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn invalidated(
    cache: Option<&QueryCache>,
    changes: Option<&mut watch::Receiver<u64>>,
    key: &QueryKey,
    seen: &mut u64,
) {
    let (Some(cache), Some(changes)) = (cache, changes) else {
        return future::pending().await;
    };
    loop {
        if changes.changed().await.is_err() {
            return future::pending().await;
        }
        let generation = cache.generation(key);
        if generation != *seen {
            *seen = generation;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryInvalidator;
    use crate::error::ChannelError;
    use run_timeline::{Block, BlockKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSource {
        statuses: Mutex<VecDeque<RunStatus>>,
        fetches: Mutex<usize>,
    }

    impl ScriptedSource {
        fn new(statuses: &[RunStatus]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                fetches: Mutex::new(0),
            }
        }

        fn fetches(&self) -> usize {
            *self.fetches.lock().expect("lock")
        }
    }

    #[async_trait]
    impl RunSource for ScriptedSource {
        async fn fetch_run(&self, run: &RunRef) -> Result<RunRecord> {
            *self.fetches.lock().expect("lock") += 1;
            let status = self
                .statuses
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or(ChannelError::NotConnected)?;
            Ok(RunRecord {
                run_id: run.id.clone(),
                status,
                failure_reason: None,
                extra: serde_json::Map::new(),
            })
        }

        async fn fetch_timeline(&self, _run: &RunRef) -> Result<Vec<TimelineItem>> {
            Ok(vec![TimelineItem::block(
                Block::new("b1", BlockKind::Navigation),
                vec![],
            )])
        }
    }

    #[tokio::test]
    async fn stops_after_first_finalized_snapshot() {
        let source = Arc::new(ScriptedSource::new(&[
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Completed,
        ]));
        let poller = RunPoller::new(
            Arc::clone(&source) as Arc<dyn RunSource>,
            RunRef::workflow_run("wr_1"),
            Duration::from_millis(5),
        );
        let snapshots = poller.subscribe();

        tokio::time::timeout(Duration::from_secs(5), poller.run())
            .await
            .expect("poller finished");

        assert_eq!(source.fetches(), 3);
        let last = snapshots.borrow().clone().expect("snapshot");
        assert_eq!(last.status(), RunStatus::Completed);
        assert!(last.active_selection(None).is_some());
    }

    #[tokio::test]
    async fn invalidation_wakes_before_interval() {
        let source = Arc::new(ScriptedSource::new(&[RunStatus::Running, RunStatus::Failed]));
        let cache = Arc::new(QueryCache::new());
        let poller = RunPoller::new(
            Arc::clone(&source) as Arc<dyn RunSource>,
            RunRef::workflow_run("wr_1"),
            Duration::from_secs(3600),
        )
        .with_cache(Arc::clone(&cache));
        let mut snapshots = poller.subscribe();
        let handle = poller.spawn();

        snapshots.changed().await.expect("first snapshot");
        cache.invalidate(&QueryKey::RunList);
        cache.invalidate_all(&QueryKey::run_state("wr_1"));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller finished")
            .expect("poller task");
        assert_eq!(source.fetches(), 2);
        let last = snapshots.borrow().clone().expect("snapshot");
        assert_eq!(last.status(), RunStatus::Failed);
    }

    #[tokio::test]
    async fn failed_poll_publishes_nothing() {
        let source = Arc::new(ScriptedSource::new(&[]));
        let mut poller = RunPoller::new(
            Arc::clone(&source) as Arc<dyn RunSource>,
            RunRef::task("tsk_1"),
            Duration::from_millis(5),
        );
        assert!(poller.poll_once().await.is_err());
        assert!(poller.subscribe().borrow().is_none());
    }
}
