// ABOUTME: Maps a date window onto a revision window by walking the status chain at a base key backwards.
// ABOUTME: Day shortcuts keep the walk proportional to the number of days, not the number of publishes.

use aviso_core::{Revision, StatusRecord};
use chrono::{DateTime, NaiveDate, Utc};

use crate::adapter::{StoreAdapter, StoreError, StoreResult};
use crate::status::{current_status, status_at};

/// Revisions to replay for a date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionWindow {
    /// Nothing was ever published at the base key.
    NoHistory,
    /// History exists but nothing falls on or before the end date.
    Empty,
    /// Replay from `from` (inclusive). With `to`, stop after `to`; without, keep following.
    Range { from: Revision, to: Option<Revision> },
}

/// Result of a resolve, with the number of status records read besides the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub window: RevisionWindow,
    pub hops: usize,
}

/// Resolve `[from, to]` to revisions using the status chain at `base_key`.
pub async fn resolve(
    store: &dyn StoreAdapter,
    base_key: &str,
    from: DateTime<Utc>,
    to: Option<DateTime<Utc>>,
) -> StoreResult<Resolution> {
    let Some((current, current_rev)) = current_status(store, base_key).await? else {
        return Ok(Resolution {
            window: RevisionWindow::NoHistory,
            hops: 0,
        });
    };

    if current.timestamp <= from {
        return Ok(Resolution {
            window: RevisionWindow::Range {
                from: current_rev + 1,
                to: to.map(|_| current_rev + 1),
            },
            hops: 0,
        });
    }

    if current.prev_revision.is_none() {
        let upper = to.map(|to| {
            if current.timestamp <= to {
                current_rev
            } else {
                current_rev - 1
            }
        });
        return Ok(Resolution {
            window: RevisionWindow::Range {
                from: current_rev,
                to: upper,
            },
            hops: 0,
        });
    }

    let mut walk = Walk {
        to,
        from_day: from.date_naive(),
        to_day: to.map(|t| t.date_naive()),
        to_rev: None,
        hops: 0,
    };
    walk.latch(&current, current_rev);

    let mut record = current;
    let mut revision = current_rev;
    let from_rev = loop {
        let Some(next) = walk.next_hop(&record) else {
            break revision;
        };
        let previous = match status_at(store, base_key, Some(next)).await {
            Ok(found) => found,
            Err(StoreError::HistoryNotAvailable(reason)) => {
                tracing::info!(
                    "status chain at {} compacted below revision {}: {}",
                    base_key,
                    revision,
                    reason
                );
                break revision;
            }
            Err(e) => return Err(e),
        };
        let Some((prev, prev_rev)) = previous else {
            break revision;
        };

        walk.hops += 1;
        walk.latch(&prev, prev_rev);
        if prev.timestamp <= from {
            break prev_rev + 1;
        }
        record = prev;
        revision = prev_rev;
    };

    let window = match (to, walk.to_rev) {
        (Some(_), None) => RevisionWindow::Empty,
        (_, to_rev) => RevisionWindow::Range {
            from: from_rev,
            to: to_rev,
        },
    };
    tracing::debug!(
        "resolved {} from {} to {:?}: {:?} after {} hops",
        base_key,
        from,
        to,
        window,
        walk.hops
    );
    Ok(Resolution {
        window,
        hops: walk.hops,
    })
}

struct Walk {
    to: Option<DateTime<Utc>>,
    from_day: NaiveDate,
    to_day: Option<NaiveDate>,
    to_rev: Option<Revision>,
    hops: usize,
}

impl Walk {
    /// Record the first visited revision whose timestamp is within the end date.
    fn latch(&mut self, record: &StatusRecord, revision: Revision) {
        if self.to_rev.is_none() && self.to.is_some_and(|to| record.timestamp <= to) {
            self.to_rev = Some(revision);
        }
    }

    /// Step one record back, or skip the rest of the day when neither bound lies in it.
    fn next_hop(&self, record: &StatusRecord) -> Option<Revision> {
        let day = record.day();
        let bound_in_day =
            day == self.from_day || (self.to_rev.is_none() && self.to_day == Some(day));
        if bound_in_day {
            record.prev_revision
        } else {
            record.last_prev_day_revision.or(record.prev_revision)
        }
    }
}
