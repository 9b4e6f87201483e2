//! Content fingerprints and the "does this page need syncing" rule.
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::model::{SourcePage, SyncRecord, SyncStatus};

/// Hex SHA-256 of downloaded media bytes; the dedup key for rehosted assets.
pub fn bytes_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint of a rendered page: title, markup, and the sorted distinct set
/// of referenced asset fingerprints.
pub fn content_fingerprint(title: &str, markup: &str, asset_fingerprints: &[String]) -> String {
    let mut assets: Vec<&str> = asset_fingerprints.iter().map(String::as_str).collect();
    assets.sort_unstable();
    assets.dedup();

    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(markup.as_bytes());
    hasher.update([0u8]);
    for fp in assets {
        hasher.update(fp.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    FirstSync,
    /// Edited after the last observed watermark, or too close to the last sync to tell.
    Edited,
    /// The previous run left the page `partial` or `failed`.
    Retry(SyncStatus),
    Unchanged,
}

impl SyncDecision {
    pub fn needs_sync(&self) -> bool {
        !matches!(self, SyncDecision::Unchanged)
    }
}

/// Decide whether `page` must be re-rendered given its previous record.
///
/// Source timestamps are coarse, so an edit that lands within `granularity`
/// of the last sync is treated as possibly unseen.
pub fn decide(page: &SourcePage, record: Option<&SyncRecord>, granularity: Duration) -> SyncDecision {
    let Some(record) = record else {
        return SyncDecision::FirstSync;
    };
    match record.status {
        SyncStatus::Partial | SyncStatus::Failed => return SyncDecision::Retry(record.status),
        SyncStatus::Complete => {}
    }
    if page.last_edited_at > record.source_edited_at {
        return SyncDecision::Edited;
    }
    if within_window(page.last_edited_at, record.last_synced_at, granularity) {
        return SyncDecision::Edited;
    }
    SyncDecision::Unchanged
}

fn within_window(edited: DateTime<Utc>, synced: DateTime<Utc>, granularity: Duration) -> bool {
    edited >= synced - granularity
}
