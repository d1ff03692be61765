// ABOUTME: Defines the StoreAdapter trait every backing store implements, plus its query and error types.
// ABOUTME: Errors are classified so callers can retry transient failures and stop on the rest.

use std::time::Duration;

use async_trait::async_trait;
use aviso_core::{KeyValueRecord, Revision};
use thiserror::Error;

/// Errors that can occur when talking to the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested revision was compacted away on the server.
    #[error("history not available: {0}")]
    HistoryNotAvailable(String),

    /// Timeout, connection failure, 5xx or 429. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A range query against the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pull {
    pub key: String,
    pub keys_only: bool,
    /// Read the store as of this revision instead of the latest.
    pub revision: Option<Revision>,
    /// Treat `key` as a prefix.
    pub prefix: bool,
    pub min_mod_revision: Option<Revision>,
    pub max_mod_revision: Option<Revision>,
}

impl Pull {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    pub fn at_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn min_mod_revision(mut self, revision: Revision) -> Self {
        self.min_mod_revision = Some(revision);
        self
    }

    pub fn max_mod_revision(mut self, revision: Revision) -> Self {
        self.max_mod_revision = Some(revision);
        self
    }

    /// Whether a record's mod revision falls inside the requested window.
    pub fn admits(&self, mod_revision: Revision) -> bool {
        self.min_mod_revision.is_none_or(|min| mod_revision >= min)
            && self.max_mod_revision.is_none_or(|max| mod_revision <= max)
    }
}

/// A key/value pair to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Host and port naming a store endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Operations aviso needs from a revisioned key-value store.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Range read. Results are sorted by key, descending.
    async fn pull(&self, query: &Pull) -> StoreResult<Vec<KeyValueRecord>>;

    /// One transaction: delete `keys_to_delete`, then put every pair in `kvs`.
    /// With `ttl`, the puts are attached to a fresh lease. Returns the commit revision.
    async fn push(
        &self,
        kvs: &[KeyValue],
        keys_to_delete: &[String],
        ttl: Option<Duration>,
    ) -> StoreResult<Revision>;

    /// Delete a key (or every key under a prefix), returning what was removed.
    async fn delete(&self, key: &str, prefix: bool) -> StoreResult<Vec<KeyValueRecord>>;

    /// The store's current revision.
    async fn latest_revision(&self) -> StoreResult<Revision>;

    /// Engine name recorded in status records (e.g. "etcd_rest").
    fn engine_name(&self) -> &str;

    fn endpoint(&self) -> Endpoint;

    /// Whether the store reports itself healthy.
    async fn health(&self) -> StoreResult<bool> {
        self.latest_revision().await.map(|_| true)
    }

    /// Cluster members, for diagnostics.
    async fn members(&self) -> StoreResult<Vec<Member>> {
        let ep = self.endpoint();
        Ok(vec![Member {
            name: self.engine_name().to_string(),
            client_urls: vec![format!("{}:{}", ep.host, ep.port)],
        }])
    }
}

/// One member of the store cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub client_urls: Vec<String>,
}

/// End of the key range covering every key that starts with `prefix`.
///
/// Increments the last byte below 0xff; an all-0xff or empty prefix covers
/// the whole keyspace, which the store spells as `"\0"`.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}
