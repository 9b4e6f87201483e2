use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

use notion_mirror::config;
use notion_mirror::db::{self, SqliteStore};
use notion_mirror::storage;
use notion_mirror::sweep::run_sweep;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Verify that every rehosted asset still exists in storage; flag missing ones for re-upload on the next sync"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);
    let object_store = storage::from_config(&cfg.storage, cfg.app.http_timeout())?;

    info!("starting asset sweep");
    let report = run_sweep(&store, object_store.as_ref(), cfg.app.retry_policy()).await?;
    print!("{}", report);
    Ok(ExitCode::from(report.exit_code()))
}
