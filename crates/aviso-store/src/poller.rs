// ABOUTME: Emulates watches by polling each key on its own task, with date-range replay and cursor resume.
// ABOUTME: Tasks live in a shared registry with per-key stop channels so any key can be stopped promptly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aviso_core::{AvisoConfig, KeyValueRecord, Revision};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, watch};

use crate::adapter::{Pull, StoreAdapter, StoreError, StoreResult};
use crate::cursor::CursorFile;
use crate::resolver::{RevisionWindow, resolve};

/// Timing and resume behaviour of the poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub polling_interval: Duration,
    pub retry_delay: Duration,
    pub catchup: bool,
}

impl From<&AvisoConfig> for PollerConfig {
    fn from(config: &AvisoConfig) -> Self {
        Self {
            polling_interval: config.polling_interval,
            retry_delay: config.retry_delay,
            catchup: config.catchup,
        }
    }
}

/// Receives every record seen on a watched key.
#[async_trait]
pub trait WatchCallback: Send + Sync {
    async fn notify(&self, record: KeyValueRecord);
}

/// A key to poll and the base key whose status records should not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchKey {
    pub key: String,
    pub base_key: String,
    pub prefix: bool,
}

/// Lifecycle of a polling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Initializing,
    CatchingUp,
    Live,
    ReplayingRange,
    Stopped,
}

struct ActiveKey {
    key: String,
    stop: watch::Sender<bool>,
    state: watch::Receiver<PollState>,
}

type Registry = Arc<Mutex<HashMap<u64, ActiveKey>>>;

/// Runs one polling task per watched key.
pub struct PollingScheduler {
    store: Arc<dyn StoreAdapter>,
    config: PollerConfig,
    cursor: Option<CursorFile>,
    registry: Registry,
    next_id: AtomicU64,
    idle: Arc<Notify>,
}

impl PollingScheduler {
    /// A scheduler persisting progress in `cursor`, if given.
    pub fn new(store: Arc<dyn StoreAdapter>, config: PollerConfig, cursor: Option<CursorFile>) -> Self {
        Self {
            store,
            config,
            cursor,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    /// Start one task per key. Returns the task ids.
    ///
    /// Every key's starting point is settled before any task is spawned, so a key
    /// the store refuses fails the whole call and nothing is left running.
    /// With `from`, each key first replays the matching revisions. With `to` as
    /// well, the task ends after the replay; otherwise it keeps following.
    pub async fn listen(
        &self,
        keys: Vec<WatchKey>,
        callback: Arc<dyn WatchCallback>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<u64>> {
        if from.is_none() && to.is_some() {
            return Err(StoreError::Rejected(
                "an end date needs a start date".to_string(),
            ));
        }

        if from.is_none() && !self.config.catchup && let Some(cursor) = self.cursor.clone() {
            let cleared = tokio::task::spawn_blocking(move || cursor.clear()).await;
            match cleared {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("failed to discard cursor file: {}", e),
                Err(e) => tracing::warn!("cursor clear task failed: {}", e),
            }
        }

        let mut planned: Vec<(KeyTask, StartPlan)> = Vec::with_capacity(keys.len());
        for watch_key in keys {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (stop_tx, stop_rx) = watch::channel(false);
            let (state_tx, state_rx) = watch::channel(PollState::Initializing);

            self.registry.lock().await.insert(
                id,
                ActiveKey {
                    key: watch_key.key.clone(),
                    stop: stop_tx,
                    state: state_rx,
                },
            );

            let mut task = KeyTask {
                id,
                watch: watch_key,
                store: Arc::clone(&self.store),
                config: self.config.clone(),
                cursor: self.cursor.clone(),
                callback: Arc::clone(&callback),
                stop: stop_rx,
                state: state_tx,
                registry: Arc::clone(&self.registry),
                idle: Arc::clone(&self.idle),
            };
            match task.plan(from, to).await {
                Ok(plan) => planned.push((task, plan)),
                Err(e) => {
                    tracing::error!("cannot start watching {}: {}", task.watch.key, e);
                    let mut abandoned: Vec<u64> = planned.iter().map(|(t, _)| t.id).collect();
                    abandoned.push(id);
                    self.deregister(&abandoned).await;
                    return Err(e);
                }
            }
        }

        let mut ids = Vec::with_capacity(planned.len());
        for (task, plan) in planned {
            ids.push(task.id);
            tokio::spawn(task.run(plan));
        }
        Ok(ids)
    }

    async fn deregister(&self, ids: &[u64]) {
        let mut registry = self.registry.lock().await;
        for id in ids {
            registry.remove(id);
        }
        if registry.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Signal every task polling `key` to stop. Returns how many were signalled.
    pub async fn stop(&self, key: &str) -> usize {
        let registry = self.registry.lock().await;
        let mut stopped = 0;
        for active in registry.values().filter(|a| a.key == key) {
            let _ = active.stop.send(true);
            stopped += 1;
        }
        stopped
    }

    /// Signal one task to stop.
    pub async fn stop_task(&self, id: u64) -> bool {
        match self.registry.lock().await.get(&id) {
            Some(active) => {
                let _ = active.stop.send(true);
                true
            }
            None => false,
        }
    }

    /// Signal every task to stop.
    pub async fn stop_all(&self) {
        for active in self.registry.lock().await.values() {
            let _ = active.stop.send(true);
        }
    }

    /// Keys with a running task.
    pub async fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .registry
            .lock()
            .await
            .values()
            .map(|a| a.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Current state of a task, or `None` once it has deregistered.
    pub async fn state(&self, id: u64) -> Option<PollState> {
        self.registry
            .lock()
            .await
            .get(&id)
            .map(|a| *a.state.borrow())
    }

    /// Resolve once no task is registered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.registry.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Where a key task begins, settled before it is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPlan {
    Follow { from: Revision, catching_up: bool },
    Replay { from: Revision, to: Revision },
    Nothing,
}

struct KeyTask {
    id: u64,
    watch: WatchKey,
    store: Arc<dyn StoreAdapter>,
    config: PollerConfig,
    cursor: Option<CursorFile>,
    callback: Arc<dyn WatchCallback>,
    stop: watch::Receiver<bool>,
    state: watch::Sender<PollState>,
    registry: Registry,
    idle: Arc<Notify>,
}

impl KeyTask {
    async fn run(mut self, plan: StartPlan) {
        let result = match plan {
            StartPlan::Follow { from, catching_up } => self.follow(from, catching_up).await,
            StartPlan::Replay { from, to } => self.replay(from, to).await,
            StartPlan::Nothing => Ok(()),
        };
        match result {
            Ok(()) => tracing::info!("stopped watching {}", self.watch.key),
            Err(StoreError::HistoryNotAvailable(reason)) => {
                tracing::warn!("history not available for {}: {}", self.watch.key, reason)
            }
            Err(e) => tracing::error!("watch on {} failed: {}", self.watch.key, e),
        }
        self.state.send_replace(PollState::Stopped);

        let mut registry = self.registry.lock().await;
        registry.remove(&self.id);
        if registry.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Settle the starting revision, or the replay window, against the store.
    async fn plan(&mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> StoreResult<StartPlan> {
        let store = Arc::clone(&self.store);
        let delay = self.config.retry_delay;
        let key = self.watch.key.clone();

        let Some(from) = from else {
            let Some(latest) = retrying(&mut self.stop, delay, &key, || store.latest_revision()).await?
            else {
                return Ok(StartPlan::Nothing);
            };
            let resumed = if self.config.catchup {
                self.cursor_revision().await
            } else {
                None
            };
            return Ok(match resumed {
                Some(rev) => {
                    tracing::info!("resuming {} from revision {} (store at {})", key, rev, latest);
                    StartPlan::Follow { from: rev, catching_up: true }
                }
                None => StartPlan::Follow { from: latest + 1, catching_up: false },
            });
        };

        self.state.send_replace(PollState::ReplayingRange);
        let base_key = self.watch.base_key.clone();
        let Some(resolution) = retrying(&mut self.stop, delay, &key, || {
            resolve(store.as_ref(), &base_key, from, to)
        })
        .await?
        else {
            return Ok(StartPlan::Nothing);
        };

        match resolution.window {
            RevisionWindow::NoHistory => {
                tracing::info!("no history at {}, nothing to replay for {}", base_key, key);
                Ok(StartPlan::Nothing)
            }
            RevisionWindow::Empty => {
                tracing::info!("no notifications for {} in the requested window", key);
                Ok(StartPlan::Nothing)
            }
            RevisionWindow::Range { from, to: Some(to) } => {
                let Some(latest) = retrying(&mut self.stop, delay, &key, || store.latest_revision()).await?
                else {
                    return Ok(StartPlan::Nothing);
                };
                // A window reaching past the store's head cannot be read as of its end.
                let to = to.min(latest);
                if from > to {
                    tracing::info!("nothing to replay for {} (revisions {}..={})", key, from, to);
                    return Ok(StartPlan::Nothing);
                }
                Ok(StartPlan::Replay { from, to })
            }
            RevisionWindow::Range { from, to: None } => Ok(StartPlan::Follow {
                from,
                catching_up: true,
            }),
        }
    }

    async fn replay(&mut self, from: Revision, to: Revision) -> StoreResult<()> {
        let store = Arc::clone(&self.store);
        let key = self.watch.key.clone();
        let query = Pull::key(&key)
            .prefix(self.watch.prefix)
            .at_revision(to)
            .min_mod_revision(from)
            .max_mod_revision(to);

        let Some(records) =
            retrying(&mut self.stop, self.config.retry_delay, &key, || store.pull(&query)).await?
        else {
            return Ok(());
        };
        let delivered = self.deliver(records).await;
        tracing::info!(
            "replayed revisions {}..={} of {}: {} notifications",
            from,
            to,
            key,
            delivered.map_or(0, |(count, _)| count)
        );
        Ok(())
    }

    async fn follow(&mut self, mut next: Revision, catching_up: bool) -> StoreResult<()> {
        let store = Arc::clone(&self.store);
        let key = self.watch.key.clone();
        // Every followed key gets an entry, even one that never sees traffic.
        self.persist(next).await;
        let initial = if catching_up {
            PollState::CatchingUp
        } else {
            PollState::Live
        };
        self.state.send_replace(initial);
        tracing::info!("watching {} from revision {}", key, next);

        loop {
            let query = Pull::key(&key).prefix(self.watch.prefix).min_mod_revision(next);
            let Some(records) =
                retrying(&mut self.stop, self.config.retry_delay, &key, || store.pull(&query))
                    .await?
            else {
                return Ok(());
            };

            if let Some((_, advanced)) = self.deliver(records).await {
                next = next.max(advanced);
                self.persist(next).await;
            }
            self.state.send_replace(PollState::Live);

            if wait_or_stop(&mut self.stop, self.config.polling_interval).await {
                return Ok(());
            }
        }
    }

    /// Deliver records in revision order, skipping status records.
    /// Returns the number delivered and the next revision to read, if anything was returned.
    async fn deliver(&self, mut records: Vec<KeyValueRecord>) -> Option<(usize, Revision)> {
        let next = records.iter().map(|r| r.mod_revision).max()? + 1;
        records.retain(|r| r.key != self.watch.base_key);
        records.sort_by(|a, b| a.mod_revision.cmp(&b.mod_revision).then_with(|| a.key.cmp(&b.key)));

        let count = records.len();
        for record in records {
            tracing::debug!("{} changed at revision {}", record.key, record.mod_revision);
            self.callback.notify(record).await;
        }
        Some((count, next))
    }

    async fn cursor_revision(&self) -> Option<Revision> {
        let cursor = self.cursor.clone()?;
        let key = self.watch.key.clone();
        match tokio::task::spawn_blocking(move || cursor.revision_for(&key)).await {
            Ok(Ok(rev)) => rev,
            Ok(Err(e)) => {
                tracing::warn!("failed to read cursor file, starting from latest: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("cursor read task failed: {}", e);
                None
            }
        }
    }

    async fn persist(&self, next: Revision) {
        let Some(cursor) = self.cursor.clone() else {
            return;
        };
        let key = self.watch.key.clone();
        match tokio::task::spawn_blocking(move || cursor.record(&key, next)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("failed to persist cursor for {}: {}", self.watch.key, e),
            Err(e) => tracing::warn!("cursor write task failed: {}", e),
        }
    }
}

/// Sleep for `delay` unless stopped first. Returns true when the task should stop.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *stop.borrow() {
        return true;
    }
    let still_connected = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = stop.changed() => changed.is_ok(),
    };
    !still_connected || *stop.borrow()
}

/// Run `op` until it succeeds, retrying transient errors with a constant delay.
/// Returns `Ok(None)` if stopped while waiting.
async fn retrying<T, F, Fut>(
    stop: &mut watch::Receiver<bool>,
    delay: Duration,
    key: &str,
    mut op: F,
) -> StoreResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    loop {
        if *stop.borrow() {
            return Ok(None);
        }
        match op().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_transient() => {
                tracing::warn!("store request for {} failed, retrying in {:?}: {}", key, delay, e);
                if wait_or_stop(stop, delay).await {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
