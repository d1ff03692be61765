// ABOUTME: Writes data keys together with a linked StatusRecord at the base key in one transaction.
// ABOUTME: The status chain is what the revision resolver walks to turn dates into revisions.

use std::time::Duration;

use aviso_core::record::{local_actor, local_hostname};
use aviso_core::{Revision, StatusRecord};
use chrono::{DateTime, Utc};

use crate::adapter::{KeyValue, Pull, StoreAdapter, StoreResult};

/// One publish: data keys plus the status bookkeeping that goes with them.
#[derive(Debug, Clone)]
pub struct StatusPush {
    pub kvs: Vec<KeyValue>,
    pub base_key: String,
    pub message: String,
    pub admin_key: Option<String>,
    pub keys_to_delete: Vec<String>,
    pub ttl: Option<Duration>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StatusPush {
    pub fn new(kvs: Vec<KeyValue>, base_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kvs,
            base_key: base_key.into(),
            message: message.into(),
            admin_key: None,
            keys_to_delete: Vec::new(),
            ttl: None,
            timestamp: None,
        }
    }

    pub fn admin_key(mut self, key: Option<String>) -> Self {
        self.admin_key = key;
        self
    }

    pub fn delete_keys(mut self, keys: Vec<String>) -> Self {
        self.keys_to_delete = keys;
        self
    }

    pub fn ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Stamp the status record with `timestamp` instead of the current time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Read the status record currently stored at `base_key`, with its revision.
pub async fn current_status(
    store: &dyn StoreAdapter,
    base_key: &str,
) -> StoreResult<Option<(StatusRecord, Revision)>> {
    status_at(store, base_key, None).await
}

/// Read the status record at `base_key` as of `revision` (latest when `None`).
pub(crate) async fn status_at(
    store: &dyn StoreAdapter,
    base_key: &str,
    revision: Option<Revision>,
) -> StoreResult<Option<(StatusRecord, Revision)>> {
    let mut query = Pull::key(base_key);
    query.revision = revision;
    let records = store.pull(&query).await?;
    let Some(record) = records.into_iter().next() else {
        return Ok(None);
    };
    match StatusRecord::from_bytes(&record.value) {
        Ok(status) => Ok(Some((status, record.mod_revision))),
        Err(e) => {
            tracing::warn!(
                "ignoring unreadable status record at {} (revision {}): {}",
                base_key,
                record.mod_revision,
                e
            );
            Ok(None)
        }
    }
}

/// Write `push.kvs`, a new status record and the optional admin marker atomically.
///
/// The status record links to the one it replaces. Returns the commit revision,
/// which is also the revision every written key carries.
pub async fn push_with_status(store: &dyn StoreAdapter, push: StatusPush) -> StoreResult<Revision> {
    let previous = current_status(store, &push.base_key).await?;
    let timestamp = push.timestamp.unwrap_or_else(Utc::now);

    let status = StatusRecord::new(
        local_actor(),
        push.message,
        store.engine_name(),
        local_hostname(),
        timestamp,
    )
    .linked_after(previous.as_ref().map(|(rec, rev)| (rec, *rev)));

    let data_keys: Vec<&str> = push.kvs.iter().map(|kv| kv.key.as_str()).collect();
    let admin = match &push.admin_key {
        Some(key) => Some(KeyValue::new(key.clone(), serde_json::to_vec(&data_keys)?)),
        None => None,
    };

    let mut kvs = push.kvs;
    kvs.push(KeyValue::new(push.base_key.clone(), status.to_bytes()?));
    kvs.extend(admin);

    let revision = store.push(&kvs, &push.keys_to_delete, push.ttl).await?;
    tracing::debug!(
        "pushed {} keys with status at {} (revision {}, prev {:?})",
        kvs.len(),
        push.base_key,
        revision,
        status.prev_revision
    );
    Ok(revision)
}
