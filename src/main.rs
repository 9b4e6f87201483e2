use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use notion_mirror::config;
use notion_mirror::db::{self, SqliteStore};
use notion_mirror::download::HttpDownloader;
use notion_mirror::engine::{EngineOptions, SyncEngine};
use notion_mirror::notion::NotionClient;
use notion_mirror::rehost::AssetRehoster;
use notion_mirror::shutdown;
use notion_mirror::storage;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Mirror a Notion database into the destination store, rehosting its media"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Database to sync (defaults to notion.database_id)
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let timeout = cfg.app.http_timeout();
    let retry = cfg.app.retry_policy();
    let notion = NotionClient::new(cfg.notion.token.clone(), cfg.notion.version.clone(), timeout)?
        .with_page_size(cfg.notion.page_size);
    let downloader = HttpDownloader::new(timeout, cfg.app.max_download_bytes())?;
    let object_store = storage::from_config(&cfg.storage, timeout)?;
    let store = Arc::new(SqliteStore::new(pool));

    let rehoster = Arc::new(AssetRehoster::new(
        Arc::new(downloader),
        object_store,
        store.clone(),
        retry,
    ));
    let engine = SyncEngine::new(
        Arc::new(notion),
        store,
        rehoster,
        EngineOptions {
            page_concurrency: cfg.app.page_concurrency,
            asset_concurrency: cfg.app.asset_concurrency,
            retry,
            edit_granularity: chrono::Duration::seconds(cfg.app.edit_granularity_seconds),
        },
    );

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; finishing in-flight pages");
            trigger.trigger();
        }
    });

    let database_id = args.database.unwrap_or_else(|| cfg.notion.database_id.clone());
    info!(%database_id, "starting sync run");

    match engine.run(&database_id, shutdown).await {
        Ok(summary) => {
            print!("{}", summary);
            Ok(ExitCode::from(summary.exit_code()))
        }
        Err(err) => {
            error!(error = %err, "sync run aborted");
            eprintln!("{}", err);
            Ok(ExitCode::from(2))
        }
    }
}
