//! Block tree -> HTML.
//!
//! Rendering is split in two passes. [`collect_media`] lists every media
//! reference in document order so the caller can resolve them (rehost or fall
//! back) before any tag is written; [`render_blocks`] then emits markup using
//! only the resolved table. Nothing here performs I/O.
use std::collections::{HashMap, HashSet};

use crate::model::{plain_text, Block, BlockKind, MediaKind, MediaReference, RehostedAsset, RichText};

/// Outcome of resolving one media reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Rehosted(RehostedAsset),
    /// The original source URL stays in the markup.
    Fallback { reason: String },
}

/// Resolutions keyed by `MediaReference::source_url`.
pub type ResolvedAssets = HashMap<String, Resolution>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub markup: String,
    /// Distinct media references in first-occurrence order.
    pub media: Vec<MediaReference>,
    /// Public URL of the first image that was rehosted.
    pub hero_image: Option<String>,
}

/// Every image/video reference in the tree, deduplicated by source URL, in
/// depth-first document order.
pub fn collect_media(blocks: &[Block]) -> Vec<MediaReference> {
    fn walk(blocks: &[Block], seen: &mut HashSet<String>, out: &mut Vec<MediaReference>) {
        for block in blocks {
            if let Some(media) = block.kind.media() {
                if seen.insert(media.source_url.clone()) {
                    out.push(media.clone());
                }
            }
            walk(&block.children, seen, out);
        }
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    walk(blocks, &mut seen, &mut out);
    out
}

/// Render `blocks` using `resolved` for every media URL. A reference missing
/// from the table renders with its source URL.
pub fn render_blocks(blocks: &[Block], resolved: &ResolvedAssets) -> Rendered {
    let media = collect_media(blocks);
    let hero_image = media
        .iter()
        .filter(|m| m.kind == MediaKind::Image)
        .find_map(|m| match resolved.get(&m.source_url) {
            Some(Resolution::Rehosted(asset)) => Some(asset.public_url.clone()),
            _ => None,
        });

    let mut markup = render_elements(blocks, resolved).join("\n");
    if !markup.is_empty() {
        markup.push('\n');
    }
    Rendered {
        markup,
        media,
        hero_image,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListTag {
    Ul,
    Ol,
}

impl ListTag {
    fn of(kind: &BlockKind) -> Option<Self> {
        match kind {
            BlockKind::BulletedItem { .. } => Some(ListTag::Ul),
            BlockKind::NumberedItem { .. } => Some(ListTag::Ol),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ListTag::Ul => "ul",
            ListTag::Ol => "ol",
        }
    }
}

/// One string per sibling-level element, in source order.
fn render_elements(blocks: &[Block], resolved: &ResolvedAssets) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < blocks.len() {
        if let Some(tag) = ListTag::of(&blocks[i].kind) {
            let start = i;
            while i < blocks.len() && ListTag::of(&blocks[i].kind) == Some(tag) {
                i += 1;
            }
            let mut list = format!("<{}>", tag.name());
            for item in &blocks[start..i] {
                list.push_str("<li>");
                list.push_str(&render_block(&item.kind, resolved));
                list.push_str(&render_elements(&item.children, resolved).concat());
                list.push_str("</li>");
            }
            list.push_str(&format!("</{}>", tag.name()));
            out.push(list);
            continue;
        }

        let block = &blocks[i];
        out.push(render_block(&block.kind, resolved));
        if !block.children.is_empty() {
            out.push(format!(
                "<div class=\"nested\">{}</div>",
                render_elements(&block.children, resolved).concat()
            ));
        }
        i += 1;
    }
    out
}

fn render_block(kind: &BlockKind, resolved: &ResolvedAssets) -> String {
    match kind {
        BlockKind::Heading { level, text } => {
            let level = (*level).clamp(1, 3);
            format!("<h{0}>{1}</h{0}>", level, render_inline(text))
        }
        BlockKind::Paragraph { text } => format!("<p>{}</p>", render_inline(text)),
        BlockKind::Quote { text } => format!("<blockquote>{}</blockquote>", render_inline(text)),
        BlockKind::Divider => "<hr />".to_string(),
        BlockKind::Image(media) => format!(
            "<figure><img src=\"{}\" alt=\"{}\" />{}</figure>",
            html_attr(media_url(media, resolved)),
            html_attr(&plain_text(&media.caption)),
            figcaption(&media.caption)
        ),
        BlockKind::Video(media) => format!(
            "<figure><video controls src=\"{}\"></video>{}</figure>",
            html_attr(media_url(media, resolved)),
            figcaption(&media.caption)
        ),
        BlockKind::Embed { url, caption } => {
            let frame = format!("<iframe src=\"{}\" loading=\"lazy\"></iframe>", html_attr(url));
            if caption.is_empty() {
                frame
            } else {
                format!("<figure>{}{}</figure>", frame, figcaption(caption))
            }
        }
        // The item body only; render_elements wraps runs of items in <li> and the list tag.
        BlockKind::BulletedItem { text } | BlockKind::NumberedItem { text } => render_inline(text),
        BlockKind::Unsupported { type_name } => {
            format!("<!-- unsupported block: {} -->", comment_safe(type_name))
        }
    }
}

fn media_url<'a>(media: &'a MediaReference, resolved: &'a ResolvedAssets) -> &'a str {
    match resolved.get(&media.source_url) {
        Some(Resolution::Rehosted(asset)) => &asset.public_url,
        _ => &media.source_url,
    }
}

fn figcaption(caption: &[RichText]) -> String {
    if caption.is_empty() {
        String::new()
    } else {
        format!("<figcaption>{}</figcaption>", render_inline(caption))
    }
}

pub fn render_inline(runs: &[RichText]) -> String {
    runs.iter().map(render_run).collect()
}

fn render_run(run: &RichText) -> String {
    let mut s = html_escape(&run.text).replace('\n', "<br />");
    if run.code {
        s = format!("<code>{}</code>", s);
    }
    if run.bold {
        s = format!("<strong>{}</strong>", s);
    }
    if run.italic {
        s = format!("<em>{}</em>", s);
    }
    if run.strikethrough {
        s = format!("<s>{}</s>", s);
    }
    if run.underline {
        s = format!("<u>{}</u>", s);
    }
    if let Some(href) = &run.href {
        s = format!("<a href=\"{}\">{}</a>", html_attr(href), s);
    }
    s
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn html_attr(s: &str) -> String {
    html_escape(s).replace('"', "&quot;")
}

fn comment_safe(s: &str) -> String {
    s.replace("--", "- -")
}
