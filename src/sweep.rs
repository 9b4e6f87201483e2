//! Periodic integrity check of rehosted objects.
//!
//! Sync runs never re-verify unchanged assets. The sweep checks every
//! catalogued object, flags the missing ones, and demotes the pages that
//! reference them to `partial` so the next sync re-uploads the bytes.
use std::fmt;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::db::ContentStore;
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    /// Fingerprints whose storage object is gone.
    pub missing: Vec<String>,
    /// Pages demoted to `partial` because of a missing object.
    pub pages_marked: u64,
    /// Fingerprints that could not be checked (storage errors).
    pub errors: Vec<(String, String)>,
}

impl SweepReport {
    pub fn exit_code(&self) -> u8 {
        if self.missing.is_empty() && self.errors.is_empty() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Asset sweep")?;
        writeln!(f, "  checked:      {}", self.checked)?;
        writeln!(f, "  missing:      {}", self.missing.len())?;
        writeln!(f, "  pages marked: {}", self.pages_marked)?;
        for fp in &self.missing {
            writeln!(f, "  missing {}", fp)?;
        }
        for (fp, err) in &self.errors {
            writeln!(f, "  unchecked {}: {}", fp, err)?;
        }
        Ok(())
    }
}

#[instrument(skip_all)]
pub async fn run_sweep(
    store: &dyn ContentStore,
    storage: &dyn ObjectStore,
    retry: RetryPolicy,
) -> Result<SweepReport> {
    let assets = store.list_assets().await.context("listing rehosted assets")?;
    let mut report = SweepReport::default();

    for asset in assets {
        report.checked += 1;
        let exists = retry
            .run("check storage", || storage.exists(&asset.storage_key))
            .await;
        match exists {
            Ok(true) => {}
            Ok(false) => {
                let marked = store
                    .flag_missing_asset(&asset.content_fingerprint, Utc::now())
                    .await
                    .with_context(|| format!("flagging {}", asset.content_fingerprint))?;
                let pages = store.pages_referencing(&asset.content_fingerprint).await?;
                warn!(
                    fingerprint = %asset.content_fingerprint,
                    key = %asset.storage_key,
                    referenced_by = pages.len(),
                    marked,
                    "storage object missing"
                );
                report.pages_marked += marked;
                report.missing.push(asset.content_fingerprint);
            }
            Err(err) => {
                warn!(fingerprint = %asset.content_fingerprint, error = %err, "could not check object");
                report.errors.push((asset.content_fingerprint, err.to_string()));
            }
        }
    }

    info!(
        checked = report.checked,
        missing = report.missing.len(),
        pages_marked = report.pages_marked,
        "sweep finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{run_migrations, PageCommit, SqliteStore};
    use crate::model::{MediaKind, RehostedAsset, SyncStatus};
    use crate::storage::LocalObjectStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn asset(fp: &str) -> RehostedAsset {
        let key = format!("media/{}/{}.png", &fp[..2], fp);
        RehostedAsset {
            content_fingerprint: fp.into(),
            public_url: format!("https://cdn.example.com/{}", key),
            storage_key: key,
            media_kind: MediaKind::Image,
            byte_size: 3,
        }
    }

    #[tokio::test]
    async fn flags_missing_objects_and_demotes_pages() {
        let td = tempdir().unwrap();
        let storage = LocalObjectStore::new(td.path(), "https://cdn.example.com");
        let store = store().await;

        let kept = asset("aa11");
        let lost = asset("bb22");
        storage.put(&kept.storage_key, b"abc", Some("image/png")).await.unwrap();
        store.insert_asset(&kept).await.unwrap();
        store.insert_asset(&lost).await.unwrap();
        store
            .commit_page(&PageCommit {
                source_id: "p1".into(),
                title: "One".into(),
                content: "<p>x</p>".into(),
                hero_image: Some(lost.public_url.clone()),
                fingerprint: "f1".into(),
                source_edited_at: Utc::now(),
                synced_at: Utc::now(),
                status: SyncStatus::Complete,
                unrehosted_count: 0,
                asset_fingerprints: vec!["aa11".into(), "bb22".into()],
                write_document: true,
            })
            .await
            .unwrap();

        let report = run_sweep(&store, &storage, RetryPolicy::none()).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.missing, vec!["bb22".to_string()]);
        assert_eq!(report.pages_marked, 1);
        assert_eq!(report.exit_code(), 1);
        assert!(store.is_asset_missing("bb22").await.unwrap());
        assert!(!store.is_asset_missing("aa11").await.unwrap());
        assert_eq!(
            store.sync_record("p1").await.unwrap().unwrap().status,
            SyncStatus::Partial
        );
    }

    #[tokio::test]
    async fn clean_store_reports_nothing() {
        let td = tempdir().unwrap();
        let storage = LocalObjectStore::new(td.path(), "https://cdn.example.com");
        let store = store().await;
        let report = run_sweep(&store, &storage, RetryPolicy::none()).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(report.exit_code(), 0);
        assert!(report.to_string().contains("checked:      0"));
    }
}
