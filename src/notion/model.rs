use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::TransferError;
use crate::model::{Block, BlockKind, MediaKind, MediaReference, RichText, SourcePage};

/// Envelope shared by `databases/{id}/query` and `blocks/{id}/children`.
#[derive(Deserialize, Debug)]
pub struct ListResponse {
    pub results: Vec<Value>,
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl ListResponse {
    /// Cursor for the next request, or `None` when the listing is exhausted.
    pub fn continuation(&self) -> Option<String> {
        if self.has_more {
            self.next_cursor.clone().filter(|c| !c.is_empty())
        } else {
            None
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct Annotations {
    #[serde(default)]
    bold: bool,
    #[serde(default)]
    italic: bool,
    #[serde(default)]
    strikethrough: bool,
    #[serde(default)]
    underline: bool,
    #[serde(default)]
    code: bool,
}

#[derive(Deserialize, Debug)]
struct RichTextItem {
    #[serde(default)]
    plain_text: String,
    href: Option<String>,
    #[serde(default)]
    annotations: Annotations,
}

fn decode_err(message: impl Into<String>) -> TransferError {
    TransferError::Decode {
        service: "notion",
        message: message.into(),
    }
}

pub fn parse_rich_text(v: Option<&Value>) -> Vec<RichText> {
    let Some(arr) = v.and_then(|x| x.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|item| serde_json::from_value::<RichTextItem>(item.clone()).ok())
        .map(|item| RichText {
            text: item.plain_text,
            href: item.href.filter(|h| !h.is_empty()),
            bold: item.annotations.bold,
            italic: item.annotations.italic,
            strikethrough: item.annotations.strikethrough,
            underline: item.annotations.underline,
            code: item.annotations.code,
        })
        .collect()
}

/// Map a database query result into a [`SourcePage`].
pub fn parse_page(v: &Value) -> Result<SourcePage, TransferError> {
    let id = v
        .get("id")
        .and_then(|s| s.as_str())
        .ok_or_else(|| decode_err("page missing id"))?;
    let edited = v
        .get("last_edited_time")
        .and_then(|s| s.as_str())
        .ok_or_else(|| decode_err(format!("page {} missing last_edited_time", id)))?;
    let last_edited_at = DateTime::parse_from_rfc3339(edited)
        .map_err(|e| decode_err(format!("page {} has bad last_edited_time: {}", id, e)))?
        .with_timezone(&Utc);

    Ok(SourcePage {
        source_id: id.to_string(),
        title: extract_title(v.get("properties")),
        last_edited_at,
    })
}

/// The plain text of the single `title`-typed property.
fn extract_title(props: Option<&Value>) -> String {
    let Some(props) = props.and_then(|p| p.as_object()) else {
        return String::new();
    };
    props
        .values()
        .find(|p| p.get("type").and_then(|t| t.as_str()) == Some("title"))
        .map(|p| {
            parse_rich_text(p.get("title"))
                .iter()
                .map(|r| r.text.as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Map one block object into a childless [`Block`]; children are fetched separately.
pub fn parse_block(v: &Value) -> Result<Block, TransferError> {
    let id = v
        .get("id")
        .and_then(|s| s.as_str())
        .ok_or_else(|| decode_err("block missing id"))?;
    // Without a type the block still holds its place (and its children).
    let typ = v.get("type").and_then(|s| s.as_str()).unwrap_or("unknown");
    let has_children = v
        .get("has_children")
        .and_then(|b| b.as_bool())
        .unwrap_or(false);
    let payload = v.get(typ);
    let text = || parse_rich_text(payload.and_then(|p| p.get("rich_text")));

    let kind = match typ {
        "heading_1" => BlockKind::Heading { level: 1, text: text() },
        "heading_2" => BlockKind::Heading { level: 2, text: text() },
        "heading_3" => BlockKind::Heading { level: 3, text: text() },
        "paragraph" => BlockKind::Paragraph { text: text() },
        "bulleted_list_item" => BlockKind::BulletedItem { text: text() },
        "numbered_list_item" => BlockKind::NumberedItem { text: text() },
        "quote" => BlockKind::Quote { text: text() },
        "divider" => BlockKind::Divider,
        "image" | "video" => {
            let kind = if typ == "image" {
                MediaKind::Image
            } else {
                MediaKind::Video
            };
            match payload.and_then(file_url) {
                Some(url) => {
                    let media = MediaReference {
                        source_url: url,
                        kind,
                        caption: parse_rich_text(payload.and_then(|p| p.get("caption"))),
                    };
                    match kind {
                        MediaKind::Image => BlockKind::Image(media),
                        MediaKind::Video => BlockKind::Video(media),
                    }
                }
                // A media block without a resolvable URL has nothing to mirror.
                None => BlockKind::Unsupported {
                    type_name: typ.to_string(),
                },
            }
        }
        "embed" => match payload
            .and_then(|p| p.get("url"))
            .and_then(|u| u.as_str())
            .filter(|u| !u.is_empty())
        {
            Some(url) => BlockKind::Embed {
                url: url.to_string(),
                caption: parse_rich_text(payload.and_then(|p| p.get("caption"))),
            },
            None => BlockKind::Unsupported {
                type_name: typ.to_string(),
            },
        },
        other => BlockKind::Unsupported {
            type_name: other.to_string(),
        },
    };

    Ok(Block {
        id: id.to_string(),
        kind,
        has_children,
        children: Vec::new(),
    })
}

/// Decode a query listing, skipping entries that are not readable pages.
pub fn decode_pages(results: &[Value]) -> Vec<SourcePage> {
    results
        .iter()
        .filter_map(|v| match parse_page(v) {
            Ok(page) => Some(page),
            Err(err) => {
                warn!(id = entry_id(v), error = %err, "skipping undecodable page");
                None
            }
        })
        .collect()
}

/// Decode a children listing, skipping entries that cannot be addressed.
pub fn decode_blocks(results: &[Value]) -> Vec<Block> {
    results
        .iter()
        .filter_map(|v| match parse_block(v) {
            Ok(block) => Some(block),
            Err(err) => {
                warn!(id = entry_id(v), error = %err, "skipping undecodable block");
                None
            }
        })
        .collect()
}

fn entry_id(v: &Value) -> &str {
    v.get("id").and_then(|s| s.as_str()).unwrap_or("?")
}

/// URL of a Notion file object, whether Notion-hosted or external.
fn file_url(payload: &Value) -> Option<String> {
    let source = match payload.get("type").and_then(|s| s.as_str()) {
        Some("file") => payload.get("file"),
        Some("external") => payload.get("external"),
        _ => None,
    }?;
    source
        .get("url")
        .and_then(|u| u.as_str())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_page_title_and_timestamp() {
        let v = json!({
            "object": "page",
            "id": "page-1",
            "last_edited_time": "2024-03-01T10:15:00.000Z",
            "properties": {
                "Tags": { "id": "abc", "type": "multi_select", "multi_select": [] },
                "Name": {
                    "id": "title",
                    "type": "title",
                    "title": [
                        { "plain_text": "Hello ", "annotations": {} },
                        { "plain_text": "world", "annotations": { "bold": true } }
                    ]
                }
            }
        });
        let page = parse_page(&v).unwrap();
        assert_eq!(page.source_id, "page-1");
        assert_eq!(page.title, "Hello world");
        assert_eq!(page.last_edited_at.to_rfc3339(), "2024-03-01T10:15:00+00:00");
    }

    #[test]
    fn page_without_timestamp_is_rejected() {
        let err = parse_page(&json!({ "id": "p" })).unwrap_err();
        assert!(matches!(err, TransferError::Decode { .. }));
    }

    #[test]
    fn parses_rich_text_annotations_and_links() {
        let v = json!({
            "id": "b1",
            "type": "paragraph",
            "has_children": false,
            "paragraph": {
                "rich_text": [
                    { "plain_text": "see ", "href": null, "annotations": { "italic": true } },
                    { "plain_text": "docs", "href": "https://example.com", "annotations": { "code": true } }
                ]
            }
        });
        let block = parse_block(&v).unwrap();
        let BlockKind::Paragraph { text } = block.kind else {
            panic!("expected paragraph");
        };
        assert_eq!(text.len(), 2);
        assert!(text[0].italic);
        assert_eq!(text[1].href.as_deref(), Some("https://example.com"));
        assert!(text[1].code);
    }

    #[test]
    fn parses_signed_and_external_media() {
        let image = json!({
            "id": "img",
            "type": "image",
            "image": {
                "type": "file",
                "file": { "url": "https://s3.example/a.png?X-Amz-Signature=1", "expiry_time": "2024-03-01T11:15:00.000Z" },
                "caption": [ { "plain_text": "A cat" } ]
            }
        });
        let block = parse_block(&image).unwrap();
        let BlockKind::Image(media) = block.kind else {
            panic!("expected image");
        };
        assert_eq!(media.source_url, "https://s3.example/a.png?X-Amz-Signature=1");
        assert_eq!(media.kind, MediaKind::Image);
        assert_eq!(media.caption[0].text, "A cat");

        let video = json!({
            "id": "vid",
            "type": "video",
            "video": { "type": "external", "external": { "url": "https://cdn.example/v.mp4" } }
        });
        let block = parse_block(&video).unwrap();
        assert!(matches!(block.kind, BlockKind::Video(ref m) if m.source_url == "https://cdn.example/v.mp4"));
    }

    #[test]
    fn headings_keep_level_and_unknown_types_survive() {
        let h = parse_block(&json!({ "id": "h", "type": "heading_2", "heading_2": { "rich_text": [] } })).unwrap();
        assert!(matches!(h.kind, BlockKind::Heading { level: 2, .. }));

        let toggle = parse_block(&json!({
            "id": "t", "type": "toggle", "has_children": true, "toggle": { "rich_text": [] }
        }))
        .unwrap();
        assert!(toggle.has_children);
        assert_eq!(
            toggle.kind,
            BlockKind::Unsupported {
                type_name: "toggle".into()
            }
        );
    }

    #[test]
    fn bad_entries_do_not_sink_their_listing() {
        let results = vec![
            json!({ "id": "ok-1", "last_edited_time": "2024-03-01T10:15:00.000Z" }),
            json!({ "id": "broken", "properties": {} }),
            json!({ "id": "ok-2", "last_edited_time": "2024-03-02T10:15:00.000Z" }),
        ];
        let ids: Vec<String> = decode_pages(&results).into_iter().map(|p| p.source_id).collect();
        assert_eq!(ids, vec!["ok-1", "ok-2"]);

        let blocks = decode_blocks(&[
            json!({ "type": "paragraph", "paragraph": {} }),
            json!({ "id": "untyped", "has_children": true }),
            json!({ "id": "p", "type": "paragraph", "paragraph": { "rich_text": [] } }),
        ]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0].kind,
            BlockKind::Unsupported {
                type_name: "unknown".into()
            }
        );
        assert!(blocks[0].has_children);
        assert_eq!(blocks[1].id, "p");
    }

    #[test]
    fn continuation_requires_has_more() {
        let done: ListResponse =
            serde_json::from_value(json!({ "results": [], "next_cursor": "abc", "has_more": false })).unwrap();
        assert_eq!(done.continuation(), None);
        let more: ListResponse =
            serde_json::from_value(json!({ "results": [], "next_cursor": "abc", "has_more": true })).unwrap();
        assert_eq!(more.continuation().as_deref(), Some("abc"));
    }
}
