//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Deciding *what* to write lives in the engine.

use chrono::{DateTime, Utc};

use crate::model::SyncStatus;

/// Everything the engine persists for one page at the end of its state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCommit {
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub hero_image: Option<String>,
    pub fingerprint: String,
    pub source_edited_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub unrehosted_count: i64,
    /// Fingerprints of the rehosted assets the page references.
    pub asset_fingerprints: Vec<String>,
    /// When false and a document already exists, only the sync record is refreshed.
    pub write_document: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub document_id: String,
    pub document_written: bool,
}
