// ABOUTME: Immutable records exchanged with the revisioned store.
// ABOUTME: KeyValueRecord is a read snapshot; StatusRecord is the per-base-key history chain link.

use std::borrow::Cow;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Store-wide mutation counter stamped on every write.
pub type Revision = i64;

/// A single key as seen by a read at some revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueRecord {
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
    pub version: i64,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

impl KeyValueRecord {
    /// The value decoded as UTF-8, replacing invalid sequences.
    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// JSON marker written at a base key on every publish.
///
/// Successive records form a backward-linked list through `prev_revision`.
/// `last_prev_day_revision` points at the last record of the most recent
/// earlier UTC day, so a backward walk can skip a whole day in one hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub actor: String,
    pub message: String,
    pub engine: String,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prev_day_revision: Option<Revision>,
}

impl StatusRecord {
    /// Create an unlinked status record.
    pub fn new(
        actor: impl Into<String>,
        message: impl Into<String>,
        engine: impl Into<String>,
        hostname: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            actor: actor.into(),
            message: message.into(),
            engine: engine.into(),
            hostname: hostname.into(),
            timestamp,
            prev_revision: None,
            last_prev_day_revision: None,
        }
    }

    /// Link this record after `previous`, which was stored at `previous_revision`.
    ///
    /// Same UTC day as the previous record: the day shortcut is inherited.
    /// Different day: the previous record becomes the shortcut target.
    pub fn linked_after(mut self, previous: Option<(&StatusRecord, Revision)>) -> Self {
        match previous {
            None => {
                self.prev_revision = None;
                self.last_prev_day_revision = None;
            }
            Some((prev, prev_revision)) => {
                self.prev_revision = Some(prev_revision);
                self.last_prev_day_revision = if prev.day() == self.day() {
                    prev.last_prev_day_revision
                } else {
                    Some(prev_revision)
                };
            }
        }
        self
    }

    /// UTC calendar day of this record.
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Best-effort name of the local machine, used in status records.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Best-effort name of the publishing user.
pub fn local_actor() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
