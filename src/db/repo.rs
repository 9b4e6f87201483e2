use super::model::{CommitOutcome, PageCommit};
use crate::model::{DestinationDocument, MediaKind, RehostedAsset, SyncRecord, SyncStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus stricter durability; foreign keys are on by default.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open SQLite database")?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
pub(crate) fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = crate::config::expand_home(path_part);
    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn status_from_row(s: &str) -> Result<SyncStatus> {
    SyncStatus::parse_status(s).ok_or_else(|| anyhow!("unknown sync status '{}'", s))
}

fn record_from_row(row: &SqliteRow) -> Result<SyncRecord> {
    Ok(SyncRecord {
        source_id: row.try_get("source_id")?,
        destination_document_id: row.try_get("destination_document_id")?,
        last_synced_fingerprint: row.try_get("last_synced_fingerprint")?,
        last_synced_at: row.try_get("last_synced_at")?,
        source_edited_at: row.try_get("source_edited_at")?,
        status: status_from_row(row.try_get::<&str, _>("status")?)?,
        unrehosted_count: row.try_get("unrehosted_count")?,
        last_error: row.try_get("last_error")?,
    })
}

fn asset_from_row(row: &SqliteRow) -> Result<RehostedAsset> {
    let kind: &str = row.try_get("media_kind")?;
    Ok(RehostedAsset {
        content_fingerprint: row.try_get("content_fingerprint")?,
        storage_key: row.try_get("storage_key")?,
        public_url: row.try_get("public_url")?,
        media_kind: MediaKind::parse_kind(kind)
            .ok_or_else(|| anyhow!("unknown media kind '{}'", kind))?,
        byte_size: row.try_get("byte_size")?,
    })
}

#[instrument(skip_all)]
pub async fn get_sync_record(pool: &Pool, source_id: &str) -> Result<Option<SyncRecord>> {
    let row = sqlx::query(
        "SELECT source_id, destination_document_id, last_synced_fingerprint, last_synced_at, \
         source_edited_at, status, unrehosted_count, last_error \
         FROM sync_records WHERE source_id = ?",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_document(pool: &Pool, source_id: &str) -> Result<Option<DestinationDocument>> {
    let row = sqlx::query(
        "SELECT id, source_id, title, content, hero_image, updated_at FROM documents WHERE source_id = ?",
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(DestinationDocument {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        hero_image: row.try_get("hero_image")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

/// Write the document (when asked or absent), the sync record, and the page's
/// asset links in one transaction.
#[instrument(skip_all, fields(source_id = %commit.source_id))]
pub async fn commit_page(pool: &Pool, commit: &PageCommit) -> Result<CommitOutcome> {
    let mut tx = pool.begin().await?;

    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM documents WHERE source_id = ?")
            .bind(&commit.source_id)
            .fetch_optional(&mut *tx)
            .await?;

    let (document_id, document_written) = match existing {
        Some(id) if !commit.write_document => (id, false),
        _ => {
            let id: String = sqlx::query_scalar(
                "INSERT INTO documents (id, source_id, title, content, hero_image, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(source_id) DO UPDATE SET \
                   title = excluded.title, \
                   content = excluded.content, \
                   hero_image = excluded.hero_image, \
                   updated_at = excluded.updated_at \
                 RETURNING id",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&commit.source_id)
            .bind(&commit.title)
            .bind(&commit.content)
            .bind(&commit.hero_image)
            .bind(commit.synced_at)
            .fetch_one(&mut *tx)
            .await
            .context("document upsert failed")?;
            (id, true)
        }
    };

    sqlx::query(
        "INSERT INTO sync_records (source_id, destination_document_id, last_synced_fingerprint, \
           last_synced_at, source_edited_at, status, unrehosted_count, last_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, NULL) \
         ON CONFLICT(source_id) DO UPDATE SET \
           destination_document_id = excluded.destination_document_id, \
           last_synced_fingerprint = excluded.last_synced_fingerprint, \
           last_synced_at = excluded.last_synced_at, \
           source_edited_at = excluded.source_edited_at, \
           status = excluded.status, \
           unrehosted_count = excluded.unrehosted_count, \
           last_error = NULL",
    )
    .bind(&commit.source_id)
    .bind(&document_id)
    .bind(&commit.fingerprint)
    .bind(commit.synced_at)
    .bind(commit.source_edited_at)
    .bind(commit.status.as_str())
    .bind(commit.unrehosted_count)
    .execute(&mut *tx)
    .await
    .context("sync record upsert failed")?;

    sqlx::query("DELETE FROM page_assets WHERE source_id = ?")
        .bind(&commit.source_id)
        .execute(&mut *tx)
        .await?;
    for fp in &commit.asset_fingerprints {
        sqlx::query("INSERT OR IGNORE INTO page_assets (source_id, content_fingerprint) VALUES (?, ?)")
            .bind(&commit.source_id)
            .bind(fp)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    debug!(%document_id, document_written, status = %commit.status, "page committed");
    Ok(CommitOutcome {
        document_id,
        document_written,
    })
}

/// Mark an existing record failed. Returns false when the page has no record.
#[instrument(skip_all)]
pub async fn record_failure(pool: &Pool, source_id: &str, error: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE sync_records SET status = 'failed', last_error = ? WHERE source_id = ?")
        .bind(error)
        .bind(source_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn find_asset(pool: &Pool, fingerprint: &str) -> Result<Option<RehostedAsset>> {
    let row = sqlx::query(
        "SELECT content_fingerprint, storage_key, public_url, media_kind, byte_size \
         FROM rehosted_assets WHERE content_fingerprint = ?",
    )
    .bind(fingerprint)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(asset_from_row).transpose()
}

/// Insert unless the fingerprint is already catalogued; returns the stored row
/// either way, so the first writer always wins.
#[instrument(skip_all)]
pub async fn insert_asset(pool: &Pool, asset: &RehostedAsset) -> Result<RehostedAsset> {
    sqlx::query(
        "INSERT OR IGNORE INTO rehosted_assets \
         (content_fingerprint, storage_key, public_url, media_kind, byte_size, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&asset.content_fingerprint)
    .bind(&asset.storage_key)
    .bind(&asset.public_url)
    .bind(asset.media_kind.as_str())
    .bind(asset.byte_size)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    find_asset(pool, &asset.content_fingerprint)
        .await?
        .ok_or_else(|| anyhow!("asset {} vanished after insert", asset.content_fingerprint))
}

#[instrument(skip_all)]
pub async fn list_assets(pool: &Pool) -> Result<Vec<RehostedAsset>> {
    let rows = sqlx::query(
        "SELECT content_fingerprint, storage_key, public_url, media_kind, byte_size \
         FROM rehosted_assets ORDER BY created_at, content_fingerprint",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(asset_from_row).collect()
}

#[instrument(skip_all)]
pub async fn is_asset_missing(pool: &Pool, fingerprint: &str) -> Result<bool> {
    let hit: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM missing_assets WHERE content_fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(pool)
            .await?;
    Ok(hit.is_some())
}

#[instrument(skip_all)]
pub async fn clear_missing_asset(pool: &Pool, fingerprint: &str) -> Result<()> {
    sqlx::query("DELETE FROM missing_assets WHERE content_fingerprint = ?")
        .bind(fingerprint)
        .execute(pool)
        .await?;
    Ok(())
}

/// Flag an asset whose storage object is gone and demote every complete page
/// referencing it to `partial`. Returns the number of pages demoted.
#[instrument(skip_all)]
pub async fn flag_missing_asset(pool: &Pool, fingerprint: &str, detected_at: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT OR IGNORE INTO missing_assets (content_fingerprint, detected_at) VALUES (?, ?)")
        .bind(fingerprint)
        .bind(detected_at)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query(
        "UPDATE sync_records SET status = 'partial' \
         WHERE status = 'complete' AND source_id IN \
           (SELECT source_id FROM page_assets WHERE content_fingerprint = ?)",
    )
    .bind(fingerprint)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

/// Source ids of the pages that reference `fingerprint`.
#[instrument(skip_all)]
pub async fn pages_referencing(pool: &Pool, fingerprint: &str) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT source_id FROM page_assets WHERE content_fingerprint = ? ORDER BY source_id",
    )
    .bind(fingerprint)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_are_normalized_and_parent_created() {
        let td = tempfile::tempdir().unwrap();
        let db = td.path().join("nested/dir/mirror.db");
        let url = format!("sqlite:{}?mode=rwc", db.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(td.path().join("nested/dir").exists());
    }
}
