//! The sync loop: cursor, scheduler, fetchers and store wired together.
//!
//! # Cycle
//! 1. Derive the [`SyncPosition`] from the store and the source head.
//! 2. Ask the [`CatchUpScheduler`] for a window; sleep if there is none.
//! 3. FETCHING: one task per height on a [`JoinSet`], each holding a pooled
//!    source handle. The cycle waits for every task before moving on.
//! 4. PERSISTING: write heights in ascending order and stop at the first
//!    height that failed, so the persisted range never has holes.
//!
//! Failed cycles back off exponentially. An integrity error halts cycling
//! until the cancellation token fires.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::{CoordinatorState, SyncConfig};
use crate::cursor::{SyncCursor, SyncPosition};
use crate::error::SyncError;
use crate::fetcher::BlockFetcher;
use crate::pool::SourcePool;
use crate::scheduler::{CatchUpScheduler, Plan, SyncWindow};
use crate::store::Store;
use crate::types::{FetchedBlock, UpsertOutcome};

/// Outcome of one successful cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReport {
    /// Nothing to fetch; the coordinator sleeps before polling again.
    Idle(SyncPosition),
    /// Heights `from..=to` are now persisted.
    Advanced {
        from: u64,
        to: u64,
        transactions: usize,
        skipped: usize,
    },
}

/// Drives the engine until cancelled.
pub struct Coordinator {
    store: Arc<dyn Store>,
    pool: Arc<SourcePool>,
    fetcher: Arc<BlockFetcher>,
    cursor: SyncCursor,
    scheduler: CatchUpScheduler,
    backoff: Backoff,
    idle_interval: Duration,
    state: CoordinatorState,
    failures: u32,
}

impl Coordinator {
    pub fn new(config: &SyncConfig, pool: Arc<SourcePool>, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            pool,
            fetcher: Arc::new(BlockFetcher::new(
                config.decode_policy,
                config.receipt_concurrency,
            )),
            cursor: SyncCursor::new(config.confirmation_depth, config.start_height),
            scheduler: CatchUpScheduler::new(config.max_window),
            backoff: Backoff::from(&config.backoff),
            idle_interval: config.idle_poll_interval(),
            state: CoordinatorState::Idle,
            failures: 0,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Consecutive failed cycles since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Current cursor position. Reads only.
    pub async fn position(&self) -> Result<SyncPosition, SyncError> {
        let source = self.pool.checkout().await?;
        self.cursor.position(&*source, self.store.as_ref()).await
    }

    /// Run until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation. An integrity error stops cycling;
    /// the coordinator stays [`CoordinatorState::Halted`] until cancelled and
    /// then returns that error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        tracing::info!(
            max_window = self.scheduler.max_window(),
            confirmation_depth = self.cursor.confirmation_depth(),
            decode_policy = ?self.fetcher.policy(),
            "sync coordinator starting"
        );

        loop {
            let pause = match self.run_cycle(cancel).await {
                Ok(SyncReport::Idle(position)) => {
                    self.failures = 0;
                    tracing::debug!(
                        last_persisted = position.last_persisted,
                        safe = position.safe_height,
                        "caught up"
                    );
                    self.idle_interval
                }
                Ok(SyncReport::Advanced {
                    from,
                    to,
                    transactions,
                    skipped,
                }) => {
                    self.failures = 0;
                    tracing::info!(from, to, transactions, skipped, "window persisted");
                    continue;
                }
                Err(SyncError::Cancelled) => break,
                Err(e) if e.is_integrity() => {
                    self.state = CoordinatorState::Halted;
                    tracing::error!(
                        error = %e,
                        "stored chain diverges from source; sync halted until shutdown"
                    );
                    cancel.cancelled().await;
                    return Err(e);
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    self.state = CoordinatorState::Backoff;
                    let delay = self.backoff.delay(self.failures);
                    tracing::warn!(
                        error = %e,
                        attempt = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        "sync cycle failed; backing off"
                    );
                    delay
                }
            };

            if !sleep_or_cancel(pause, cancel).await {
                break;
            }
        }

        self.state = CoordinatorState::Stopped;
        tracing::info!("sync coordinator stopped");
        Ok(())
    }

    /// One pass of position → plan → fetch → persist.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let position = self.position().await?;
        let window = match self.scheduler.plan_for(&position) {
            Plan::Idle => {
                self.state = CoordinatorState::Idle;
                return Ok(SyncReport::Idle(position));
            }
            Plan::Fetch(window) => window,
        };

        self.state = CoordinatorState::Fetching;
        tracing::debug!(
            %window,
            heights = window.len(),
            head = position.head_height,
            "fetching window"
        );
        let fetched = self.fetch_window(window, cancel).await;

        let report = match fetched {
            Ok(results) => {
                self.state = CoordinatorState::Persisting;
                self.persist_window(window, results, cancel).await
            }
            Err(e) => Err(e),
        };
        self.state = CoordinatorState::Idle;
        report
    }

    /// Fetch every height in `window` concurrently and wait for all of them.
    async fn fetch_window(
        &self,
        window: SyncWindow,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<u64, Result<FetchedBlock, SyncError>>, SyncError> {
        let mut tasks = JoinSet::new();
        for height in window.heights() {
            let pool = self.pool.clone();
            let fetcher = self.fetcher.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = match pool.checkout().await {
                    Ok(source) => fetcher.fetch(&*source, height, &cancel).await,
                    Err(e) => Err(e),
                };
                (height, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((height, result)) => {
                    results.insert(height, result);
                }
                // The height stays absent and is treated as failed.
                Err(e) => tracing::error!(error = %e, "fetch task did not complete"),
            }
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(results)
    }

    async fn persist_window(
        &self,
        window: SyncWindow,
        mut results: BTreeMap<u64, Result<FetchedBlock, SyncError>>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let mut transactions = 0;
        let mut skipped = 0;

        for height in window.heights() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let fetched = match results.remove(&height) {
                Some(Ok(fetched)) => fetched,
                Some(Err(e)) => {
                    self.log_partial(window, height);
                    return Err(e);
                }
                None => {
                    self.log_partial(window, height);
                    return Err(SyncError::TransientSource(format!(
                        "fetch for height {height} was lost"
                    )));
                }
            };

            match self.store.upsert(&fetched.block, &fetched.transactions).await {
                Ok(UpsertOutcome::Inserted) => {}
                Ok(UpsertOutcome::AlreadyPresent) => {
                    tracing::debug!(height, "height already stored");
                }
                Err(e) => {
                    self.log_partial(window, height);
                    return Err(e);
                }
            }
            transactions += fetched.transactions.len();
            skipped += fetched.skipped.len();
        }

        Ok(SyncReport::Advanced {
            from: window.start,
            to: window.end,
            transactions,
            skipped,
        })
    }

    fn log_partial(&self, window: SyncWindow, failed_at: u64) {
        if failed_at > window.start {
            tracing::info!(
                from = window.start,
                to = failed_at - 1,
                failed_at,
                "window partially persisted"
            );
        }
    }
}

/// Returns `false` if cancelled before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::{BackoffConfig, DecodePolicy};
    use crate::store::{BlockReader, MemoryStore};
    use crate::testing::ScriptedSource;
    use crate::types::{Block, Transaction};

    fn config(start_height: u64) -> SyncConfig {
        SyncConfig {
            rpc_url: "scripted://".into(),
            start_height,
            idle_poll_interval_ms: 10,
            source_pool_size: 32,
            backoff: BackoffConfig {
                initial_ms: 1,
                max_ms: 5,
                multiplier: 2.0,
            },
            ..SyncConfig::default()
        }
    }

    fn coordinator(
        cfg: &SyncConfig,
        source: &Arc<ScriptedSource>,
        store: Arc<dyn Store>,
    ) -> Coordinator {
        let pool = Arc::new(SourcePool::shared(source.clone(), cfg.source_pool_size));
        Coordinator::new(cfg, pool, store)
    }

    async fn wait_for_height(store: &MemoryStore, height: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.heights().last().copied() != Some(height) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("store never reached the expected height");
    }

    /// Store that never reports progress, forcing already-stored heights to
    /// be fetched again.
    struct ForgetfulStore(MemoryStore);

    #[async_trait]
    impl Store for ForgetfulStore {
        async fn last_persisted_height(&self) -> Result<Option<u64>, SyncError> {
            Ok(None)
        }

        async fn upsert(
            &self,
            block: &Block,
            transactions: &[Transaction],
        ) -> Result<UpsertOutcome, SyncError> {
            self.0.upsert(block, transactions).await
        }
    }

    #[tokio::test]
    async fn first_window_from_start_height() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());

        let report = c.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report,
            SyncReport::Advanced {
                from: 51,
                to: 70,
                transactions: 40,
                skipped: 0
            }
        );
        assert_eq!(store.heights(), (51..=70).collect::<Vec<_>>());
        assert_eq!(store.last_persisted_height().await.unwrap(), Some(70));
        assert_eq!(c.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn idle_when_caught_up() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(88), &source, store.clone());

        match c.run_cycle(&CancellationToken::new()).await.unwrap() {
            SyncReport::Idle(pos) => {
                assert_eq!(pos.last_persisted, 88);
                assert_eq!(pos.safe_height, 88);
            }
            other => panic!("expected idle, got {other:?}"),
        }
        assert!(source.requested().is_empty());
        assert!(store.heights().is_empty());
    }

    #[tokio::test]
    async fn syncs_contiguously_to_safe_height() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());
        let cancel = CancellationToken::new();

        while let SyncReport::Advanced { .. } = c.run_cycle(&cancel).await.unwrap() {}

        assert_eq!(store.heights(), (51..=88).collect::<Vec<_>>());
        for (height, head) in source.requested() {
            assert!(height + 12 <= head, "fetched unconfirmed height {height} at head {head}");
        }
    }

    #[tokio::test]
    async fn in_flight_bounded_by_window() {
        let source = Arc::new(ScriptedSource::new(1, 500));
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(0);
        cfg.max_window = 5;
        cfg.source_pool_size = 64;
        let mut c = coordinator(&cfg, &source, store.clone());
        let cancel = CancellationToken::new();

        for _ in 0..4 {
            c.run_cycle(&cancel).await.unwrap();
        }
        assert_eq!(store.heights(), (1..=20).collect::<Vec<_>>());
        assert!(source.max_in_flight() <= 5);
    }

    #[tokio::test]
    async fn pool_size_bounds_concurrency() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(0);
        cfg.source_pool_size = 3;
        let mut c = coordinator(&cfg, &source, store.clone());

        c.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(store.heights().len(), 20);
        assert!(source.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn failed_height_keeps_persistence_contiguous() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        source.fail_block(60, 1);
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());
        let cancel = CancellationToken::new();

        let err = c.run_cycle(&cancel).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.heights(), (51..=59).collect::<Vec<_>>());

        // The failed height leads the next window.
        let report = c.run_cycle(&cancel).await.unwrap();
        assert!(matches!(report, SyncReport::Advanced { from: 60, to: 79, .. }));
        assert_eq!(store.heights(), (51..=79).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn abort_policy_stops_before_undecodable_height() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        source.make_undecodable("0xt55_1");
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(50);
        cfg.decode_policy = DecodePolicy::AbortHeight;
        let mut c = coordinator(&cfg, &source, store.clone());

        let err = c.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Decode { .. }));
        assert_eq!(store.heights(), (51..=54).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn skip_policy_reports_skipped_transactions() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        source.make_undecodable("0xt55_1");
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());

        let report = c.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report,
            SyncReport::Advanced {
                from: 51,
                to: 70,
                transactions: 39,
                skipped: 1
            }
        );
        assert_eq!(store.transaction_count(), 39);
    }

    #[tokio::test]
    async fn resumes_from_store_not_start_height() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        coordinator(&config(50), &source, store.clone())
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.last_persisted_height().await.unwrap(), Some(70));

        // A fresh process with the fallback start height.
        let mut restarted = coordinator(&config(0), &source, store.clone());
        let pos = restarted.position().await.unwrap();
        assert!(pos.resumed);
        assert_eq!(pos.last_persisted, 70);

        let report = restarted.run_cycle(&CancellationToken::new()).await.unwrap();
        assert!(matches!(report, SyncReport::Advanced { from: 71, to: 88, .. }));
    }

    #[tokio::test]
    async fn progress_is_monotonic_as_head_advances() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());
        let cancel = CancellationToken::new();

        let mut last = 50;
        for head in [100, 104, 130, 131, 160] {
            source.set_head(head);
            while let SyncReport::Advanced { to, .. } = c.run_cycle(&cancel).await.unwrap() {
                assert!(to > last);
                last = to;
            }
            assert_eq!(last, head - 12);
        }
        assert_eq!(store.heights(), (51..=148).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn diverging_hash_is_integrity_error() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(ForgetfulStore(MemoryStore::new()));
        let mut c = coordinator(&config(50), &source, store.clone());
        let cancel = CancellationToken::new();

        c.run_cycle(&cancel).await.unwrap();
        source.override_hash(55, "0xdead");

        let err = c.run_cycle(&cancel).await.unwrap_err();
        match err {
            SyncError::Integrity { height, stored, incoming } => {
                assert_eq!(height, 55);
                assert_eq!(stored, "0xb55");
                assert_eq!(incoming, "0xdead");
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
        assert_eq!(store.0.heights(), (51..=70).collect::<Vec<_>>());
        let kept = store.0.block(55).await.unwrap().unwrap();
        assert_eq!(kept.hash, "0xb55");
    }

    #[tokio::test]
    async fn integrity_error_halts_until_cancelled() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(ForgetfulStore(MemoryStore::new()));
        let mut c = coordinator(&config(50), &source, store.clone());
        c.run_cycle(&CancellationToken::new()).await.unwrap();
        source.override_hash(51, "0xdead");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = c.run(&token).await;
            (result, c.state())
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished(), "halted coordinator must wait for shutdown");
        let requests = source.requested().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.requested().len(), requests, "halted coordinator kept fetching");

        cancel.cancel();
        let (result, state) = handle.await.unwrap();
        assert!(result.unwrap_err().is_integrity());
        assert_eq!(state, CoordinatorState::Halted);
    }

    #[tokio::test]
    async fn cancelled_before_start_writes_nothing() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        c.run(&cancel).await.unwrap();
        assert!(store.heights().is_empty());
        assert!(source.requested().is_empty());
        assert_eq!(c.state(), CoordinatorState::Stopped);
    }

    #[tokio::test]
    async fn cancel_during_fetch_writes_nothing_from_window() {
        let source = Arc::new(
            ScriptedSource::new(1, 100).with_latency(Duration::from_secs(30)),
        );
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = c.run(&token).await;
            (result, c.state())
        });

        // Wait until the whole window is in flight.
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.requested().len() < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("window was never dispatched");
        cancel.cancel();

        let (result, state) = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run did not observe cancellation")
            .unwrap();
        result.unwrap();
        assert_eq!(state, CoordinatorState::Stopped);
        assert!(store.heights().is_empty());
    }

    #[tokio::test]
    async fn cancelled_cycle_reports_cancelled() {
        let source = Arc::new(
            ScriptedSource::new(1, 100).with_latency(Duration::from_millis(200)),
        );
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = c.run_cycle(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.heights().is_empty());
    }

    #[tokio::test]
    async fn idle_sleep_is_cancellable() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(88);
        cfg.idle_poll_interval_ms = 60_000;
        let mut c = coordinator(&cfg, &source, store);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { c.run(&token).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run did not observe cancellation")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn head_failures_recover_after_backoff() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        source.fail_head(3);
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = c.run(&token).await;
            (result, c.consecutive_failures())
        });

        wait_for_height(&store, 88).await;
        cancel.cancel();
        let (result, failures) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(failures, 0);
        assert_eq!(store.heights(), (51..=88).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn run_follows_the_head() {
        let source = Arc::new(ScriptedSource::new(1, 100));
        let store = Arc::new(MemoryStore::new());
        let mut c = coordinator(&config(50), &source, store.clone());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { c.run(&token).await });

        wait_for_height(&store, 88).await;
        source.set_head(150);
        wait_for_height(&store, 138).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(store.heights(), (51..=138).collect::<Vec<_>>());
    }
}
