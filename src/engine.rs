//! Per-page state machine and the run loop that drives it.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::{ContentStore, PageCommit};
use crate::detect::{content_fingerprint, decide, SyncDecision};
use crate::error::TransferError;
use crate::model::{SourcePage, SyncStatus};
use crate::notion::NotionService;
use crate::rehost::{AssetRehoster, RehostStats};
use crate::render::{collect_media, render_blocks, Resolution, ResolvedAssets};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::walker::{self, EnumerationError};

#[derive(Debug, Error)]
pub enum SyncError {
    /// Not even the first collection listing succeeded; nothing was touched.
    #[error("cannot list source collection {database_id}: {source}")]
    Enumeration {
        database_id: String,
        #[source]
        source: TransferError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Pending,
    Rendering,
    RehostingAssets,
    Upserting,
    Complete,
    Partial,
    Failed,
}

impl PageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageState::Pending => "pending",
            PageState::Rendering => "rendering",
            PageState::RehostingAssets => "rehosting-assets",
            PageState::Upserting => "upserting",
            PageState::Complete => "complete",
            PageState::Partial => "partial",
            PageState::Failed => "failed",
        }
    }
}

fn enter(source_id: &str, state: PageState) {
    debug!(source_id, state = state.as_str(), "page state");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Unchanged,
    Complete { document_written: bool },
    Partial { unrehosted: usize, document_written: bool },
    Failed { error: String },
    /// Shutdown arrived before rehosting began; the page stays pending.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub page_concurrency: usize,
    pub asset_concurrency: usize,
    pub retry: RetryPolicy,
    pub edit_granularity: chrono::Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_concurrency: 4,
            asset_concurrency: 2,
            retry: RetryPolicy::default(),
            edit_granularity: chrono::Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pages_seen: usize,
    pub unchanged: usize,
    pub complete: usize,
    pub partial: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub abandoned: usize,
    pub documents_written: usize,
    pub assets: RehostStats,
    /// Set when a later listing request failed and scheduling stopped early.
    pub enumeration_error: Option<String>,
    pub cancelled: bool,
}

impl RunSummary {
    fn record(&mut self, source_id: String, outcome: PageOutcome) {
        self.pages_seen += 1;
        match outcome {
            PageOutcome::Unchanged => self.unchanged += 1,
            PageOutcome::Complete { document_written } => {
                self.complete += 1;
                self.documents_written += usize::from(document_written);
            }
            PageOutcome::Partial {
                document_written, ..
            } => {
                self.partial.push(source_id);
                self.documents_written += usize::from(document_written);
            }
            PageOutcome::Failed { error } => self.failed.push((source_id, error)),
            PageOutcome::Abandoned => self.abandoned += 1,
        }
    }

    /// 0 when every reached page ended complete, partial or unchanged and the
    /// whole collection was seen; 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.failed.is_empty() && self.enumeration_error.is_none() && !self.cancelled {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sync summary")?;
        writeln!(f, "  pages seen:        {}", self.pages_seen)?;
        writeln!(f, "  unchanged:         {}", self.unchanged)?;
        writeln!(f, "  complete:          {}", self.complete)?;
        writeln!(f, "  partial:           {}", self.partial.len())?;
        writeln!(f, "  failed:            {}", self.failed.len())?;
        if self.abandoned > 0 {
            writeln!(f, "  not reached:       {}", self.abandoned)?;
        }
        writeln!(f, "  documents written: {}", self.documents_written)?;
        writeln!(
            f,
            "  assets:            {} uploaded, {} reused, {} restored, {} fallbacks",
            self.assets.uploaded, self.assets.reused, self.assets.restored, self.assets.fallbacks
        )?;
        if !self.partial.is_empty() {
            writeln!(f, "Partial pages (media left on source URLs):")?;
            for id in &self.partial {
                writeln!(f, "  {}", id)?;
            }
        }
        if !self.failed.is_empty() {
            writeln!(f, "Failed pages:")?;
            for (id, error) in &self.failed {
                writeln!(f, "  {}: {}", id, error)?;
            }
        }
        if let Some(err) = &self.enumeration_error {
            writeln!(f, "Enumeration stopped early: {}", err)?;
        }
        if self.cancelled {
            writeln!(f, "Run cancelled by operator")?;
        }
        Ok(())
    }
}

enum Step {
    Page(String, PageOutcome),
    Enumeration(EnumerationError),
}

pub struct SyncEngine {
    notion: Arc<dyn NotionService>,
    store: Arc<dyn ContentStore>,
    rehoster: Arc<AssetRehoster>,
    options: EngineOptions,
}

impl SyncEngine {
    pub fn new(
        notion: Arc<dyn NotionService>,
        store: Arc<dyn ContentStore>,
        rehoster: Arc<AssetRehoster>,
        options: EngineOptions,
    ) -> Self {
        Self {
            notion,
            store,
            rehoster,
            options,
        }
    }

    /// Sync every page of `database_id`.
    ///
    /// Only an unreadable first listing is an error; everything else is
    /// reported per page in the summary.
    #[instrument(skip_all, fields(database_id = %database_id))]
    pub async fn run(&self, database_id: &str, shutdown: Shutdown) -> Result<RunSummary, SyncError> {
        let stats_before = self.rehoster.stats();
        let mut summary = RunSummary::default();

        let steps = walker::pages(self.notion.as_ref(), database_id, self.options.retry)
            .take_until(shutdown.clone().triggered())
            .map(|item| {
                let shutdown = &shutdown;
                async move {
                    match item {
                        Ok(page) => {
                            let id = page.source_id.clone();
                            let outcome = self.sync_page(page, shutdown).await;
                            Step::Page(id, outcome)
                        }
                        Err(err) => Step::Enumeration(err),
                    }
                }
            })
            .buffer_unordered(self.options.page_concurrency.max(1));
        let mut steps = Box::pin(steps);

        while let Some(step) = steps.next().await {
            match step {
                Step::Page(id, outcome) => summary.record(id, outcome),
                Step::Enumeration(err) if err.is_initial() => {
                    warn!(error = %err.source, "source collection is unreadable; aborting run");
                    return Err(SyncError::Enumeration {
                        database_id: database_id.to_string(),
                        source: err.source,
                    });
                }
                Step::Enumeration(err) => {
                    warn!(error = %err, "page listing failed; no further pages will be scheduled");
                    summary.enumeration_error = Some(err.to_string());
                }
            }
        }

        summary.cancelled = shutdown.is_triggered();
        summary.assets = self.rehoster.stats().since(&stats_before);
        info!(
            pages = summary.pages_seen,
            complete = summary.complete,
            partial = summary.partial.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }

    /// Drive one page through its state machine to a terminal outcome.
    #[instrument(skip_all, fields(source_id = %page.source_id))]
    pub async fn sync_page(&self, page: SourcePage, shutdown: &Shutdown) -> PageOutcome {
        let id = page.source_id.as_str();
        enter(id, PageState::Pending);

        let record = match self.store.sync_record(id).await {
            Ok(record) => record,
            Err(err) => return self.fail(id, format!("reading sync record: {:#}", err)).await,
        };
        let decision = decide(&page, record.as_ref(), self.options.edit_granularity);
        if !decision.needs_sync() {
            debug!(source_id = id, "unchanged since last sync");
            return PageOutcome::Unchanged;
        }
        if let SyncDecision::Retry(previous) = decision {
            debug!(source_id = id, %previous, "retrying page left incomplete");
        }

        enter(id, PageState::Rendering);
        let blocks = match walker::page_blocks(self.notion.as_ref(), self.options.retry, id).await {
            Ok(blocks) => blocks,
            Err(err) => return self.fail(id, format!("fetching blocks: {}", err)).await,
        };
        let media = collect_media(&blocks);

        if shutdown.is_triggered() {
            info!(source_id = id, "shutdown requested; leaving page for the next run");
            return PageOutcome::Abandoned;
        }

        // From here on the page always reaches a terminal state.
        enter(id, PageState::RehostingAssets);
        let rehoster = &self.rehoster;
        let resolved: ResolvedAssets = stream::iter(media.iter())
            .map(|m| async move { (m.source_url.clone(), rehoster.rehost(m).await) })
            .buffered(self.options.asset_concurrency.max(1))
            .collect::<HashMap<_, _>>()
            .await;

        enter(id, PageState::Upserting);
        let rendered = render_blocks(&blocks, &resolved);
        let mut asset_fingerprints = Vec::new();
        let mut unrehosted = 0usize;
        for m in &rendered.media {
            match resolved.get(&m.source_url) {
                Some(Resolution::Rehosted(asset)) => {
                    asset_fingerprints.push(asset.content_fingerprint.clone())
                }
                _ => unrehosted += 1,
            }
        }
        let fingerprint = content_fingerprint(&page.title, &rendered.markup, &asset_fingerprints);

        let write_document = match &record {
            Some(rec) if rec.last_synced_fingerprint == fingerprint => {
                match self.store.document(id).await {
                    Ok(doc) => doc.is_none(),
                    Err(err) => return self.fail(id, format!("reading document: {:#}", err)).await,
                }
            }
            _ => true,
        };

        let status = if unrehosted > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Complete
        };
        let commit = PageCommit {
            source_id: page.source_id.clone(),
            title: page.title.clone(),
            content: rendered.markup,
            hero_image: rendered.hero_image,
            fingerprint,
            source_edited_at: page.last_edited_at,
            synced_at: chrono::Utc::now(),
            status,
            unrehosted_count: unrehosted as i64,
            asset_fingerprints,
            write_document,
        };

        match self.store.commit_page(&commit).await {
            Ok(out) => {
                let (state, outcome) = match status {
                    SyncStatus::Partial => (
                        PageState::Partial,
                        PageOutcome::Partial {
                            unrehosted,
                            document_written: out.document_written,
                        },
                    ),
                    _ => (
                        PageState::Complete,
                        PageOutcome::Complete {
                            document_written: out.document_written,
                        },
                    ),
                };
                info!(
                    source_id = id,
                    state = state.as_str(),
                    document_written = out.document_written,
                    unrehosted,
                    "page synced"
                );
                outcome
            }
            Err(err) => self.fail(id, format!("destination write: {:#}", err)).await,
        }
    }

    async fn fail(&self, source_id: &str, error: String) -> PageOutcome {
        warn!(source_id, state = PageState::Failed.as_str(), %error, "page failed");
        match self.store.record_failure(source_id, &error).await {
            Ok(true) => {}
            Ok(false) => debug!(source_id, "no prior record; page stays unsynced"),
            Err(err) => warn!(source_id, error = %err, "could not record failure"),
        }
        PageOutcome::Failed { error }
    }
}
