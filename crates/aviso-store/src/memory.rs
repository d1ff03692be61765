// ABOUTME: In-process revisioned key-value store implementing the StoreAdapter contract.
// ABOUTME: Keeps every version of every key so historical reads, compaction and leases behave like etcd.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aviso_core::{KeyValueRecord, Revision};
use tokio::sync::Mutex;

use crate::adapter::{Endpoint, KeyValue, Pull, StoreAdapter, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Version {
    value: Vec<u8>,
    version: i64,
    create_revision: Revision,
    mod_revision: Revision,
    deleted: bool,
    lease: Option<i64>,
}

impl Version {
    fn record(&self, key: &str, keys_only: bool) -> KeyValueRecord {
        KeyValueRecord {
            key: key.to_string(),
            value: if keys_only { Vec::new() } else { self.value.clone() },
            version: self.version,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
        }
    }
}

#[derive(Debug)]
struct Inner {
    revision: Revision,
    compacted: Revision,
    keys: BTreeMap<String, Vec<Version>>,
    leases: HashMap<i64, Instant>,
    next_lease: i64,
    failures: u32,
}

impl Inner {
    fn live(&self, key: &str) -> Option<&Version> {
        self.keys
            .get(key)
            .and_then(|versions| versions.last())
            .filter(|v| !v.deleted)
    }

    fn take_failure(&mut self) -> StoreResult<()> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    /// Tombstone every key whose lease ran out, one revision per expired lease.
    fn expire_leases(&mut self, now: Instant) {
        let mut expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for lease in expired {
            self.leases.remove(&lease);
            let doomed: Vec<String> = self
                .keys
                .iter()
                .filter(|(_, versions)| {
                    versions
                        .last()
                        .is_some_and(|v| !v.deleted && v.lease == Some(lease))
                })
                .map(|(key, _)| key.clone())
                .collect();
            if doomed.is_empty() {
                continue;
            }
            self.revision += 1;
            let rev = self.revision;
            for key in doomed {
                self.tombstone(&key, rev);
            }
        }
    }

    fn tombstone(&mut self, key: &str, rev: Revision) -> Option<KeyValueRecord> {
        let prev = self.live(key)?.record(key, false);
        self.keys.entry(key.to_string()).or_default().push(Version {
            value: Vec::new(),
            version: 0,
            create_revision: 0,
            mod_revision: rev,
            deleted: true,
            lease: None,
        });
        Some(prev)
    }

    fn put(&mut self, key: &str, value: &[u8], rev: Revision, lease: Option<i64>) {
        let (version, create_revision) = match self.live(key) {
            Some(current) => (current.version + 1, current.create_revision),
            None => (1, rev),
        };
        self.keys.entry(key.to_string()).or_default().push(Version {
            value: value.to_vec(),
            version,
            create_revision,
            mod_revision: rev,
            deleted: false,
            lease,
        });
    }

    fn matching_keys(&self, key: &str, prefix: bool) -> Vec<String> {
        if !prefix {
            return self.keys.contains_key(key).then(|| key.to_string()).into_iter().collect();
        }
        self.keys
            .range::<str, _>((Bound::Included(key), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(key))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// A revisioned store living entirely in memory.
///
/// Every write transaction bumps a store-wide revision once. Reads can target any
/// revision above the compaction point.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    endpoint: Endpoint,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_endpoint("localhost", 0)
    }

    /// A store reporting the given endpoint, which names its cursor file.
    pub fn with_endpoint(host: impl Into<String>, port: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                revision: 1,
                compacted: 0,
                keys: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 1,
                failures: 0,
            }),
            endpoint: Endpoint {
                host: host.into(),
                port,
            },
        }
    }

    /// Discard history below `revision`; reads at older revisions then fail.
    pub async fn compact(&self, revision: Revision) {
        let mut inner = self.inner.lock().await;
        let floor = revision.min(inner.revision);
        inner.compacted = floor;
        for versions in inner.keys.values_mut() {
            // Keep the newest version at or below the floor so reads at `floor` still work.
            let keep_from = versions
                .iter()
                .rposition(|v| v.mod_revision <= floor)
                .unwrap_or(0);
            versions.drain(..keep_from);
        }
        tracing::debug!("memory store compacted at revision {}", floor);
    }

    /// Make the next `count` operations fail with a transient error.
    pub async fn fail_next(&self, count: u32) {
        self.inner.lock().await.failures = count;
    }

    /// Number of leases still alive.
    pub async fn active_leases(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now());
        inner.leases.len()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn pull(&self, query: &Pull) -> StoreResult<Vec<KeyValueRecord>> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;
        inner.expire_leases(Instant::now());

        let at = match query.revision {
            Some(rev) if rev > 0 && rev < inner.compacted => {
                return Err(StoreError::HistoryNotAvailable(format!(
                    "required revision {} has been compacted (compact revision {})",
                    rev, inner.compacted
                )));
            }
            Some(rev) if rev > inner.revision => {
                return Err(StoreError::Rejected(format!(
                    "required revision {} is a future revision",
                    rev
                )));
            }
            Some(rev) if rev > 0 => rev,
            _ => inner.revision,
        };

        let mut records: Vec<KeyValueRecord> = inner
            .matching_keys(&query.key, query.prefix)
            .into_iter()
            .filter_map(|key| {
                let versions = inner.keys.get(&key)?;
                let version = versions.iter().rev().find(|v| v.mod_revision <= at)?;
                if version.deleted || !query.admits(version.mod_revision) {
                    return None;
                }
                Some(version.record(&key, query.keys_only))
            })
            .collect();
        records.sort_by(|a, b| b.key.cmp(&a.key));
        Ok(records)
    }

    async fn push(
        &self,
        kvs: &[KeyValue],
        keys_to_delete: &[String],
        ttl: Option<Duration>,
    ) -> StoreResult<Revision> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;
        let now = Instant::now();
        inner.expire_leases(now);

        let has_deletions = keys_to_delete.iter().any(|k| inner.live(k).is_some());
        if kvs.is_empty() && !has_deletions {
            return Ok(inner.revision);
        }

        let lease = match ttl {
            Some(ttl) if !kvs.is_empty() => {
                let id = inner.next_lease;
                inner.next_lease += 1;
                inner.leases.insert(id, now + ttl);
                Some(id)
            }
            _ => None,
        };

        inner.revision += 1;
        let rev = inner.revision;
        for key in keys_to_delete {
            inner.tombstone(key, rev);
        }
        for kv in kvs {
            inner.put(&kv.key, &kv.value, rev, lease);
        }
        Ok(rev)
    }

    async fn delete(&self, key: &str, prefix: bool) -> StoreResult<Vec<KeyValueRecord>> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;
        inner.expire_leases(Instant::now());

        let targets: Vec<String> = inner
            .matching_keys(key, prefix)
            .into_iter()
            .filter(|k| inner.live(k).is_some())
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        inner.revision += 1;
        let rev = inner.revision;
        Ok(targets
            .iter()
            .filter_map(|k| inner.tombstone(k, rev))
            .collect())
    }

    async fn latest_revision(&self) -> StoreResult<Revision> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;
        inner.expire_leases(Instant::now());
        Ok(inner.revision)
    }

    fn engine_name(&self) -> &str {
        "in_memory"
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }
}
