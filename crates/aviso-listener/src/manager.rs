// ABOUTME: Owns the active listeners and the polling tasks started for them.
// ABOUTME: A listener that fails to start is dropped; only a batch where none start is an error.

use std::sync::Arc;

use aviso_store::{PollingScheduler, StoreError, WatchCallback};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, watch};

use crate::listener::EventListener;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no listener could be started: {0}")]
    NoneStarted(String),

    #[error("no listeners given")]
    Empty,
}

struct Running {
    listener: Arc<EventListener>,
    tasks: Vec<u64>,
}

/// Starts listeners on a shared scheduler and stops them on request.
pub struct ListenerManager {
    scheduler: Arc<PollingScheduler>,
    running: Mutex<Vec<Running>>,
}

impl ListenerManager {
    pub fn new(scheduler: Arc<PollingScheduler>) -> Self {
        Self {
            scheduler,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<PollingScheduler> {
        &self.scheduler
    }

    /// Start every listener. Returns how many started.
    pub async fn listen(
        &self,
        listeners: Vec<EventListener>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize, ManagerError> {
        if listeners.is_empty() {
            return Err(ManagerError::Empty);
        }
        let total = listeners.len();
        let mut started = 0;
        let mut last_error: Option<StoreError> = None;

        for listener in listeners {
            let listener = Arc::new(listener);
            let callback: Arc<dyn WatchCallback> = listener.clone();
            match self
                .scheduler
                .listen(listener.keys().to_vec(), callback, from, to)
                .await
            {
                Ok(tasks) => {
                    tracing::info!(
                        "listening to '{}' on {} keys",
                        listener.event(),
                        tasks.len()
                    );
                    self.running.lock().await.push(Running { listener, tasks });
                    started += 1;
                }
                Err(e) => {
                    tracing::error!("listener for '{}' failed to start: {}", listener.event(), e);
                    last_error = Some(e);
                }
            }
        }

        if started == 0 {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(ManagerError::NoneStarted(reason));
        }
        if started < total {
            tracing::warn!("only {} of {} listeners started", started, total);
        }
        Ok(started)
    }

    /// Stop every task started by this manager and forget the listeners.
    pub async fn cancel_listeners(&self) {
        let running = std::mem::take(&mut *self.running.lock().await);
        if running.is_empty() {
            return;
        }
        let stops = running
            .iter()
            .flat_map(|entry| entry.tasks.iter())
            .map(|id| self.scheduler.stop_task(*id));
        join_all(stops).await;
        tracing::info!("cancelled {} listeners", running.len());
    }

    /// Number of listeners currently held.
    pub async fn len(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.running.lock().await.is_empty()
    }

    /// Events of the running listeners, in start order.
    pub async fn events(&self) -> Vec<String> {
        self.running
            .lock()
            .await
            .iter()
            .map(|r| r.listener.event().to_string())
            .collect()
    }

    pub async fn active_keys(&self) -> Vec<String> {
        self.scheduler.active_keys().await
    }

    /// Block until `shutdown` turns true or every task has finished, then cancel.
    pub async fn wait(&self, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = self.scheduler.wait_idle() => {
                tracing::info!("all watches finished");
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                tracing::info!("shutdown requested");
            }
        }
        self.cancel_listeners().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerDef;
    use crate::trigger::{FunctionRegistry, TriggerSpec};
    use async_trait::async_trait;
    use aviso_core::{KeyValueRecord, Revision, Schema};
    use aviso_store::{
        Endpoint, KeyValue, MemoryStore, PollerConfig, Pull, StatusPush, StoreAdapter, StoreResult,
        push_with_status,
    };
    use serde_json::json;
    use std::time::Duration;

    const SCHEMA: &str = r#"
flight:
  payload: location
  endpoint:
    - base: /x/{stream}/
      stem: "{date}"
  request:
    stream:
      - type: enum
        values: [enfo, oper]
    date:
      - type: date
"#;

    /// Refuses reads under `denied`, or every read when `everything` is set.
    struct DenyingStore {
        inner: MemoryStore,
        denied: &'static str,
        everything: bool,
    }

    impl DenyingStore {
        fn refuse() -> StoreError {
            StoreError::Auth("user lacks permission".to_string())
        }
    }

    #[async_trait]
    impl StoreAdapter for DenyingStore {
        async fn pull(&self, query: &Pull) -> StoreResult<Vec<KeyValueRecord>> {
            if self.everything || query.key.starts_with(self.denied) {
                return Err(Self::refuse());
            }
            self.inner.pull(query).await
        }

        async fn push(
            &self,
            kvs: &[KeyValue],
            keys_to_delete: &[String],
            ttl: Option<Duration>,
        ) -> StoreResult<Revision> {
            self.inner.push(kvs, keys_to_delete, ttl).await
        }

        async fn delete(&self, key: &str, prefix: bool) -> StoreResult<Vec<KeyValueRecord>> {
            self.inner.delete(key, prefix).await
        }

        async fn latest_revision(&self) -> StoreResult<Revision> {
            if self.everything {
                return Err(Self::refuse());
            }
            self.inner.latest_revision().await
        }

        fn engine_name(&self) -> &str {
            "denying"
        }

        fn endpoint(&self) -> Endpoint {
            self.inner.endpoint()
        }
    }

    fn scheduler() -> Arc<PollingScheduler> {
        scheduler_on(Arc::new(MemoryStore::new()))
    }

    fn scheduler_on(store: Arc<dyn StoreAdapter>) -> Arc<PollingScheduler> {
        Arc::new(PollingScheduler::new(
            store,
            PollerConfig {
                polling_interval: Duration::from_millis(20),
                retry_delay: Duration::from_millis(20),
                catchup: false,
            },
            None,
        ))
    }

    fn listener(stream: &str) -> EventListener {
        let schema = Schema::from_yaml(SCHEMA, "in_memory").unwrap();
        let def = ListenerDef {
            event: "flight".to_string(),
            request: serde_json::from_value(json!({"stream": stream, "date": "20190810"})).unwrap(),
            triggers: vec![TriggerSpec::Echo],
        };
        EventListener::new(&def, &schema, &FunctionRegistry::new()).unwrap()
    }

    #[tokio::test]
    async fn listen_and_cancel() {
        let manager = ListenerManager::new(scheduler());
        let started = manager
            .listen(vec![listener("enfo"), listener("oper")], None, None)
            .await
            .unwrap();
        assert_eq!(started, 2);
        assert_eq!(manager.len().await, 2);
        assert_eq!(
            manager.active_keys().await,
            vec!["/x/enfo/20190810", "/x/oper/20190810"]
        );

        manager.cancel_listeners().await;
        assert!(manager.is_empty().await);
        tokio::time::timeout(Duration::from_secs(5), manager.scheduler().wait_idle())
            .await
            .unwrap();
        assert!(manager.active_keys().await.is_empty());

        // A second cancel is a no-op.
        manager.cancel_listeners().await;
    }

    #[tokio::test]
    async fn batch_where_none_start_is_an_error() {
        let manager = ListenerManager::new(scheduler());
        let to = Some(Utc::now());
        let err = manager
            .listen(vec![listener("enfo")], None, to)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NoneStarted(_)));
        assert!(manager.is_empty().await);

        let err = manager.listen(Vec::new(), None, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::Empty));
    }

    #[tokio::test]
    async fn listener_refused_by_the_store_is_dropped() {
        let inner = MemoryStore::new();
        push_with_status(
            &inner,
            StatusPush::new(
                vec![KeyValue::new("/x/enfo/20190810", "s3://bucket/file")],
                "/x/enfo/",
                "test",
            ),
        )
        .await
        .unwrap();
        let store = Arc::new(DenyingStore {
            inner,
            denied: "/x/oper/",
            everything: false,
        });
        let manager = ListenerManager::new(scheduler_on(store));

        let from = Some(Utc::now() - chrono::Duration::hours(1));
        let started = manager
            .listen(vec![listener("enfo"), listener("oper")], from, None)
            .await
            .unwrap();
        assert_eq!(started, 1);
        assert_eq!(manager.len().await, 1);
        assert_eq!(manager.active_keys().await, vec!["/x/enfo/20190810"]);

        manager.cancel_listeners().await;
        tokio::time::timeout(Duration::from_secs(5), manager.scheduler().wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn store_refusing_everything_starts_nothing() {
        let store = Arc::new(DenyingStore {
            inner: MemoryStore::new(),
            denied: "",
            everything: true,
        });
        let manager = ListenerManager::new(scheduler_on(store));
        let err = manager
            .listen(vec![listener("enfo"), listener("oper")], None, None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ManagerError::NoneStarted(ref reason) if reason.contains("authentication")),
            "got {:?}",
            err
        );
        assert!(manager.is_empty().await);
        assert!(manager.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn wait_returns_on_shutdown() {
        let manager = ListenerManager::new(scheduler());
        manager.listen(vec![listener("enfo")], None, None).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let waiting = manager.wait(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap();
        assert!(manager.is_empty().await);
    }
}
