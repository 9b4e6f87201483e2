//! Copies remote media into owned storage, once per distinct content fingerprint.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::db::ContentStore;
use crate::detect::bytes_fingerprint;
use crate::download::{infer_extension, infer_media_kind, storage_key, AssetDownloader, Download};
use crate::model::{MediaReference, RehostedAsset};
use crate::render::Resolution;
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;

/// Known assets plus one lock per fingerprint.
///
/// The per-fingerprint lock serializes "lookup -> upload -> persist", so two
/// pages racing on the same new bytes upload them once; the loser waits and
/// then finds the winner's row.
#[derive(Default)]
struct AssetIndex {
    known: Mutex<HashMap<String, RehostedAsset>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AssetIndex {
    fn lock_for(&self, fingerprint: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Hand back a lock taken with [`lock_for`](Self::lock_for); the entry
    /// goes away once nobody else holds or waits on it.
    fn release(&self, fingerprint: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks
            .get(fingerprint)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            locks.remove(fingerprint);
        }
    }

    fn get(&self, fingerprint: &str) -> Option<RehostedAsset> {
        let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.get(fingerprint).cloned()
    }

    fn remember(&self, asset: RehostedAsset) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.insert(asset.content_fingerprint.clone(), asset);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RehostStats {
    /// New objects written to storage.
    pub uploaded: usize,
    /// References satisfied by an already-catalogued asset.
    pub reused: usize,
    /// Objects re-uploaded after the sweep flagged them missing.
    pub restored: usize,
    pub fallbacks: usize,
}

impl RehostStats {
    /// Counts accumulated after `earlier` was taken.
    pub fn since(&self, earlier: &RehostStats) -> RehostStats {
        RehostStats {
            uploaded: self.uploaded.saturating_sub(earlier.uploaded),
            reused: self.reused.saturating_sub(earlier.reused),
            restored: self.restored.saturating_sub(earlier.restored),
            fallbacks: self.fallbacks.saturating_sub(earlier.fallbacks),
        }
    }
}

pub struct AssetRehoster {
    downloader: Arc<dyn AssetDownloader>,
    storage: Arc<dyn ObjectStore>,
    store: Arc<dyn ContentStore>,
    retry: RetryPolicy,
    index: AssetIndex,
    uploaded: AtomicUsize,
    reused: AtomicUsize,
    restored: AtomicUsize,
    fallbacks: AtomicUsize,
}

enum Outcome {
    Uploaded(RehostedAsset),
    Reused(RehostedAsset),
    Restored(RehostedAsset),
}

impl AssetRehoster {
    pub fn new(
        downloader: Arc<dyn AssetDownloader>,
        storage: Arc<dyn ObjectStore>,
        store: Arc<dyn ContentStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            downloader,
            storage,
            store,
            retry,
            index: AssetIndex::default(),
            uploaded: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            restored: AtomicUsize::new(0),
            fallbacks: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> RehostStats {
        RehostStats {
            uploaded: self.uploaded.load(Ordering::SeqCst),
            reused: self.reused.load(Ordering::SeqCst),
            restored: self.restored.load(Ordering::SeqCst),
            fallbacks: self.fallbacks.load(Ordering::SeqCst),
        }
    }

    /// Resolve one reference. Never fails: any error yields a fallback that
    /// keeps the source URL.
    #[instrument(skip_all, fields(kind = media.kind.as_str()))]
    pub async fn rehost(&self, media: &MediaReference) -> Resolution {
        match self.try_rehost(media).await {
            Ok(Outcome::Uploaded(asset)) => {
                self.uploaded.fetch_add(1, Ordering::SeqCst);
                info!(fingerprint = %asset.content_fingerprint, key = %asset.storage_key, "asset uploaded");
                Resolution::Rehosted(asset)
            }
            Ok(Outcome::Reused(asset)) => {
                self.reused.fetch_add(1, Ordering::SeqCst);
                debug!(fingerprint = %asset.content_fingerprint, "asset already rehosted");
                Resolution::Rehosted(asset)
            }
            Ok(Outcome::Restored(asset)) => {
                self.restored.fetch_add(1, Ordering::SeqCst);
                info!(fingerprint = %asset.content_fingerprint, key = %asset.storage_key, "missing asset restored");
                Resolution::Rehosted(asset)
            }
            Err(err) => {
                self.fallbacks.fetch_add(1, Ordering::SeqCst);
                let reason = format!("{:#}", err);
                warn!(url = %media.source_url, %reason, "asset left on source URL");
                Resolution::Fallback { reason }
            }
        }
    }

    async fn try_rehost(&self, media: &MediaReference) -> Result<Outcome> {
        let download = self
            .retry
            .run("download asset", || self.downloader.download(&media.source_url))
            .await
            .context("download failed")?;
        let fingerprint = bytes_fingerprint(&download.bytes);

        let lock = self.index.lock_for(&fingerprint);
        let outcome = {
            let _guard = lock.lock().await;
            self.rehost_locked(fingerprint.clone(), media, &download).await
        };
        self.index.release(&fingerprint, lock);
        outcome
    }

    async fn rehost_locked(
        &self,
        fingerprint: String,
        media: &MediaReference,
        download: &Download,
    ) -> Result<Outcome> {
        if let Some(asset) = self.index.get(&fingerprint) {
            return Ok(Outcome::Reused(asset));
        }

        if let Some(asset) = self.store.find_asset(&fingerprint).await? {
            let outcome = if self.store.is_asset_missing(&fingerprint).await? {
                self.upload(&asset.storage_key, download).await?;
                self.store.clear_missing_asset(&fingerprint).await?;
                Outcome::Restored(asset.clone())
            } else {
                Outcome::Reused(asset.clone())
            };
            self.index.remember(asset);
            return Ok(outcome);
        }

        let content_type = download.content_type.as_deref();
        let key = storage_key(&fingerprint, &infer_extension(content_type, &media.source_url));
        // An earlier run may have uploaded the object but not catalogued it.
        let present = self
            .retry
            .run("check storage", || self.storage.exists(&key))
            .await
            .context("storage existence check failed")?;
        if !present {
            self.upload(&key, download).await?;
        }

        let candidate = RehostedAsset {
            content_fingerprint: fingerprint,
            public_url: self.storage.public_url(&key),
            storage_key: key,
            media_kind: infer_media_kind(content_type, media.kind),
            byte_size: download.bytes.len() as i64,
        };
        let asset = self
            .store
            .insert_asset(&candidate)
            .await
            .context("failed to catalogue asset")?;
        self.index.remember(asset.clone());
        if present {
            Ok(Outcome::Reused(asset))
        } else {
            Ok(Outcome::Uploaded(asset))
        }
    }

    async fn upload(&self, key: &str, download: &Download) -> Result<()> {
        self.retry
            .run("upload asset", || {
                self.storage
                    .put(key, &download.bytes, download.content_type.as_deref())
            })
            .await
            .context("upload failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_count(index: &AssetIndex) -> usize {
        index.locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_their_holders() {
        let index = AssetIndex::default();
        let first = index.lock_for("aa");
        let second = index.lock_for("aa");
        let other = index.lock_for("bb");
        assert_eq!(lock_count(&index), 2);

        {
            let _guard = first.lock().await;
            assert!(second.try_lock().is_err());
        }
        index.release("aa", first);
        // Still shared with the second holder.
        assert_eq!(lock_count(&index), 2);
        index.release("aa", second);
        index.release("bb", other);
        assert_eq!(lock_count(&index), 0);
    }
}
