use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::warn;

use notion_mirror::config;
use notion_mirror::notion::NotionClient;
use notion_mirror::render::{html_escape, render_blocks, ResolvedAssets};
use notion_mirror::walker;

#[derive(Debug, Parser)]
#[command(
    about = "Render one Notion page to a standalone HTML preview. Media keeps its source URLs; nothing is uploaded or written to the destination."
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Notion page id to render
    #[arg(long)]
    page: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let notion = NotionClient::new(
        cfg.notion.token.clone(),
        cfg.notion.version.clone(),
        cfg.app.http_timeout(),
    )?
    .with_page_size(cfg.notion.page_size);
    let retry = cfg.app.retry_policy();

    let title = match notion.retrieve_page(&args.page).await {
        Ok(page) if !page.title.is_empty() => page.title,
        Ok(_) => args.page.clone(),
        Err(err) => {
            warn!(error = %err, "could not read page title; using the page id");
            args.page.clone()
        }
    };
    let blocks = walker::page_blocks(&notion, retry, &args.page)
        .await
        .with_context(|| format!("failed to fetch blocks of page {}", args.page))?;

    // No rehosting: every media reference renders with its source URL.
    let rendered = render_blocks(&blocks, &ResolvedAssets::new());

    let out_dir = Path::new(&cfg.app.resolved_data_dir()).join("html");
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let out_path = out_dir.join(format!("{}.html", sanitize_file_name(&args.page)));
    tokio::fs::write(&out_path, preview_document(&title, &rendered.markup))
        .await
        .with_context(|| format!("failed to write {}", out_path.display()))?;

    println!(
        "Wrote {} ({} blocks, {} media references)",
        out_path.display(),
        blocks.len(),
        rendered.media.len()
    );
    Ok(())
}

fn sanitize_file_name(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn preview_document(title: &str, markup: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <style>{style}</style>
  </head>
  <body>
    <header>
      <h1>{title}</h1>
    </header>
    <main>
{body}    </main>
  </body>
</html>
"#,
        title = html_escape(title),
        style = DEFAULT_STYLE,
        body = markup
    )
}

const DEFAULT_STYLE: &str = r#"
:root {
  color-scheme: light dark;
  --fg: #222;
  --bg: #fff;
  --muted: #666;
}

@media (prefers-color-scheme: dark) {
  :root {
    --fg: #eee;
    --bg: #121212;
    --muted: #aaa;
  }
}

html,
body {
  margin: 0;
  padding: 0;
  background: var(--bg);
  color: var(--fg);
  font: 15px/1.6 -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto,
        'Helvetica Neue', Arial, 'Noto Sans', sans-serif;
}

header {
  padding: 16px;
  border-bottom: 1px solid #ddd4;
}

main {
  padding: 16px;
  max-width: 820px;
  margin: 0 auto;
}

blockquote {
  margin: 8px 0;
  padding-left: 12px;
  border-left: 3px solid var(--muted);
  color: var(--muted);
}

figure {
  margin: 12px 0;
}

figcaption {
  color: var(--muted);
  font-size: 13px;
}

img,
video,
iframe {
  max-width: 100%;
  display: block;
  margin: 8px 0;
}

.nested {
  margin-left: 20px;
}

code {
  padding: 0 3px;
  border-radius: 3px;
  background: #8882;
}
"#;
