//! Database module: the destination store and the pipeline's own bookkeeping.
//!
//! - `model`: write/outcome structs passed to and from repositories.
//! - `repo`: SQL-only functions over a SQLite pool.
//!
//! The engine talks to [`ContentStore`]; [`SqliteStore`] is the production
//! implementation and simply delegates to `repo`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{DestinationDocument, RehostedAsset, SyncRecord};

pub mod model;
pub mod repo;

pub use model::{CommitOutcome, PageCommit};
pub use repo::{init_pool, run_migrations, Pool};

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn sync_record(&self, source_id: &str) -> Result<Option<SyncRecord>>;

    async fn document(&self, source_id: &str) -> Result<Option<DestinationDocument>>;

    /// Persist a page's terminal state atomically.
    async fn commit_page(&self, commit: &PageCommit) -> Result<CommitOutcome>;

    /// Returns false when there was no record to mark.
    async fn record_failure(&self, source_id: &str, error: &str) -> Result<bool>;

    async fn find_asset(&self, fingerprint: &str) -> Result<Option<RehostedAsset>>;

    /// First writer wins; returns the catalogued row.
    async fn insert_asset(&self, asset: &RehostedAsset) -> Result<RehostedAsset>;

    async fn list_assets(&self) -> Result<Vec<RehostedAsset>>;

    async fn is_asset_missing(&self, fingerprint: &str) -> Result<bool>;

    async fn clear_missing_asset(&self, fingerprint: &str) -> Result<()>;

    /// Returns how many pages were demoted to `partial`.
    async fn flag_missing_asset(&self, fingerprint: &str, detected_at: DateTime<Utc>) -> Result<u64>;

    async fn pages_referencing(&self, fingerprint: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn sync_record(&self, source_id: &str) -> Result<Option<SyncRecord>> {
        repo::get_sync_record(&self.pool, source_id).await
    }

    async fn document(&self, source_id: &str) -> Result<Option<DestinationDocument>> {
        repo::get_document(&self.pool, source_id).await
    }

    async fn commit_page(&self, commit: &PageCommit) -> Result<CommitOutcome> {
        repo::commit_page(&self.pool, commit).await
    }

    async fn record_failure(&self, source_id: &str, error: &str) -> Result<bool> {
        repo::record_failure(&self.pool, source_id, error).await
    }

    async fn find_asset(&self, fingerprint: &str) -> Result<Option<RehostedAsset>> {
        repo::find_asset(&self.pool, fingerprint).await
    }

    async fn insert_asset(&self, asset: &RehostedAsset) -> Result<RehostedAsset> {
        repo::insert_asset(&self.pool, asset).await
    }

    async fn list_assets(&self) -> Result<Vec<RehostedAsset>> {
        repo::list_assets(&self.pool).await
    }

    async fn is_asset_missing(&self, fingerprint: &str) -> Result<bool> {
        repo::is_asset_missing(&self.pool, fingerprint).await
    }

    async fn clear_missing_asset(&self, fingerprint: &str) -> Result<()> {
        repo::clear_missing_asset(&self.pool, fingerprint).await
    }

    async fn flag_missing_asset(&self, fingerprint: &str, detected_at: DateTime<Utc>) -> Result<u64> {
        repo::flag_missing_asset(&self.pool, fingerprint, detected_at).await
    }

    async fn pages_referencing(&self, fingerprint: &str) -> Result<Vec<String>> {
        repo::pages_referencing(&self.pool, fingerprint).await
    }
}
