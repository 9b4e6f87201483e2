use chrono::{DateTime, Utc};
use std::fmt;

/// One page of the source collection. Its blocks are fetched lazily by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePage {
    pub source_id: String,
    pub title: String,
    pub last_edited_at: DateTime<Utc>,
}

/// A node in the source content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    /// Reported by the source; children are attached by the walker.
    pub has_children: bool,
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        Self {
            id: id.into(),
            kind,
            has_children: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.has_children = !children.is_empty();
        self.children = children;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Heading { level: u8, text: Vec<RichText> },
    Paragraph { text: Vec<RichText> },
    BulletedItem { text: Vec<RichText> },
    NumberedItem { text: Vec<RichText> },
    Image(MediaReference),
    Video(MediaReference),
    Embed { url: String, caption: Vec<RichText> },
    Quote { text: Vec<RichText> },
    Divider,
    /// Any source type outside the supported set; rendered as a placeholder.
    Unsupported { type_name: String },
}

impl BlockKind {
    pub fn media(&self) -> Option<&MediaReference> {
        match self {
            BlockKind::Image(media) | BlockKind::Video(media) => Some(media),
            _ => None,
        }
    }
}

/// A run of text sharing one set of inline annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichText {
    pub text: String,
    pub href: Option<String>,
    pub bold: bool,
    pub italic: bool,
    pub strikethrough: bool,
    pub underline: bool,
    pub code: bool,
}

impl RichText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

pub fn plain_text(runs: &[RichText]) -> String {
    runs.iter().map(|r| r.text.as_str()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// An embedded image or video as found in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaReference {
    /// May be a time-limited signed URL.
    pub source_url: String,
    pub kind: MediaKind,
    pub caption: Vec<RichText>,
}

/// Durable record of a mirrored binary, keyed by content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehostedAsset {
    pub content_fingerprint: String,
    pub storage_key: String,
    pub public_url: String,
    pub media_kind: MediaKind,
    pub byte_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Complete,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Complete => "complete",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(SyncStatus::Complete),
            "partial" => Some(SyncStatus::Partial),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-page synchronization state, unique on `source_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub source_id: String,
    pub destination_document_id: String,
    pub last_synced_fingerprint: String,
    pub last_synced_at: DateTime<Utc>,
    /// The page's `last_edited_at` as observed by the run that wrote this record.
    pub source_edited_at: DateTime<Utc>,
    pub status: SyncStatus,
    pub unrehosted_count: i64,
    pub last_error: Option<String>,
}

/// The row consumers read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationDocument {
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub hero_image: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for status in [SyncStatus::Complete, SyncStatus::Partial, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse_status(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse_status("pending"), None);
    }

    #[test]
    fn with_children_sets_flag() {
        let parent = Block::new("p", BlockKind::BulletedItem { text: vec![] })
            .with_children(vec![Block::new("c", BlockKind::Divider)]);
        assert!(parent.has_children);
        assert_eq!(parent.children.len(), 1);
    }
}
