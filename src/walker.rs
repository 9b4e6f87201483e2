//! Lazy traversal of the source: the collection's pages, then each page's block tree.
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tracing::debug;

use crate::error::TransferError;
use crate::model::{Block, SourcePage};
use crate::notion::NotionService;
use crate::retry::RetryPolicy;

/// The collection listing failed after `listings` successful requests.
#[derive(Debug, Error)]
#[error("listing source pages failed after {listings} successful request(s): {source}")]
pub struct EnumerationError {
    pub listings: usize,
    #[source]
    pub source: TransferError,
}

impl EnumerationError {
    /// True when not even the first listing came back; nothing can be synced.
    pub fn is_initial(&self) -> bool {
        self.listings == 0
    }
}

struct Cursor {
    next: Option<String>,
    listings: usize,
}

/// Stream every page of `database_id`, following the cursor one request at a time.
///
/// A listing failure (after retries) is yielded once and ends the stream.
pub fn pages<'a>(
    notion: &'a dyn NotionService,
    database_id: &'a str,
    retry: RetryPolicy,
) -> impl Stream<Item = Result<SourcePage, EnumerationError>> + Send + 'a {
    let start = Some(Cursor {
        next: None,
        listings: 0,
    });
    stream::unfold(start, move |state| async move {
        let cursor = state?;
        let result = retry
            .run("query database", || {
                notion.query_database(database_id, cursor.next.as_deref())
            })
            .await;
        match result {
            Ok(listing) => {
                let listings = cursor.listings + 1;
                debug!(
                    listings,
                    pages = listing.items.len(),
                    more = listing.next_cursor.is_some(),
                    "listed source pages"
                );
                let next = listing.next_cursor.map(|next| Cursor {
                    next: Some(next),
                    listings,
                });
                let batch: Vec<Result<SourcePage, EnumerationError>> =
                    listing.items.into_iter().map(Ok).collect();
                Some((batch, next))
            }
            Err(source) => {
                let err = EnumerationError {
                    listings: cursor.listings,
                    source,
                };
                Some((vec![Err(err)], None))
            }
        }
    })
    .flat_map(stream::iter)
}

/// Fetch the full ordered block tree under `block_id`, following every cursor.
pub fn page_blocks<'a>(
    notion: &'a dyn NotionService,
    retry: RetryPolicy,
    block_id: &'a str,
) -> BoxFuture<'a, Result<Vec<Block>, TransferError>> {
    Box::pin(async move {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let listing = retry
                .run("list block children", || {
                    notion.list_children(block_id, cursor.as_deref())
                })
                .await?;
            blocks.extend(listing.items);
            match listing.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Containers the renderer does not know (toggles, columns, callouts)
        // still hold supported content, so every subtree is read.
        for block in blocks.iter_mut() {
            if block.has_children {
                block.children = page_blocks(notion, retry, &block.id).await?;
            }
        }
        Ok(blocks)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockKind;
    use crate::notion::Listing;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedNotion {
        /// cursor -> (page ids, next cursor); `None` cursor is keyed as "".
        listings: HashMap<String, Result<(Vec<&'static str>, Option<&'static str>), u16>>,
        children: HashMap<String, Vec<Listing<Block>>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotionService for ScriptedNotion {
        async fn query_database(
            &self,
            _database_id: &str,
            cursor: Option<&str>,
        ) -> Result<Listing<SourcePage>, TransferError> {
            let key = cursor.unwrap_or("").to_string();
            self.calls.lock().unwrap().push(format!("query:{}", key));
            match self.listings.get(&key) {
                Some(Ok((ids, next))) => Ok(Listing {
                    items: ids
                        .iter()
                        .map(|id| SourcePage {
                            source_id: id.to_string(),
                            title: id.to_uppercase(),
                            last_edited_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                        })
                        .collect(),
                    next_cursor: next.map(str::to_string),
                }),
                Some(Err(status)) => Err(TransferError::Status {
                    service: "notion",
                    status: *status,
                    body: String::new(),
                }),
                None => panic!("unexpected cursor {}", key),
            }
        }

        async fn list_children(
            &self,
            block_id: &str,
            cursor: Option<&str>,
        ) -> Result<Listing<Block>, TransferError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("children:{}:{}", block_id, cursor.unwrap_or("")));
            let pages = self.children.get(block_id).cloned().unwrap_or_default();
            let idx = cursor.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(pages.get(idx).cloned().unwrap_or(Listing {
                items: vec![],
                next_cursor: None,
            }))
        }
    }

    fn para(id: &str) -> Block {
        Block::new(id, BlockKind::Paragraph { text: vec![] })
    }

    #[tokio::test]
    async fn follows_cursor_across_listings() {
        let mut notion = ScriptedNotion::default();
        notion.listings.insert("".into(), Ok((vec!["a", "b"], Some("c1"))));
        notion.listings.insert("c1".into(), Ok((vec!["c"], None)));

        let ids: Vec<String> = pages(&notion, "db", RetryPolicy::none())
            .map(|p| p.unwrap().source_id)
            .collect()
            .await;
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(
            notion.calls.lock().unwrap().clone(),
            vec!["query:".to_string(), "query:c1".to_string()]
        );
    }

    #[tokio::test]
    async fn first_listing_failure_is_initial() {
        let mut notion = ScriptedNotion::default();
        notion.listings.insert("".into(), Err(404));

        let out: Vec<_> = pages(&notion, "db", RetryPolicy::none()).collect().await;
        assert_eq!(out.len(), 1);
        let err = out.into_iter().next().unwrap().unwrap_err();
        assert!(err.is_initial());
    }

    #[tokio::test]
    async fn later_listing_failure_ends_stream_after_pages() {
        let mut notion = ScriptedNotion::default();
        notion.listings.insert("".into(), Ok((vec!["a"], Some("c1"))));
        notion.listings.insert("c1".into(), Err(400));

        let out: Vec<_> = pages(&notion, "db", RetryPolicy::none()).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        let err = out.into_iter().nth(1).unwrap().unwrap_err();
        assert!(!err.is_initial());
        assert_eq!(err.listings, 1);
    }

    #[tokio::test]
    async fn materializes_nested_paginated_children() {
        let mut notion = ScriptedNotion::default();
        let mut item = Block::new("li", BlockKind::BulletedItem { text: vec![] });
        item.has_children = true;
        let mut toggle = Block::new("tg", BlockKind::Unsupported { type_name: "toggle".into() });
        toggle.has_children = true;
        notion.children.insert(
            "page".into(),
            vec![
                Listing {
                    items: vec![para("p1"), item],
                    next_cursor: Some("1".into()),
                },
                Listing {
                    items: vec![para("p2"), toggle],
                    next_cursor: None,
                },
            ],
        );
        notion.children.insert(
            "li".into(),
            vec![Listing {
                items: vec![para("nested")],
                next_cursor: None,
            }],
        );
        notion.children.insert(
            "tg".into(),
            vec![Listing {
                items: vec![para("inside-toggle")],
                next_cursor: None,
            }],
        );

        let blocks = page_blocks(&notion, RetryPolicy::none(), "page").await.unwrap();
        let ids: Vec<&str> = blocks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "li", "p2", "tg"]);
        assert_eq!(blocks[1].children[0].id, "nested");
        assert_eq!(blocks[3].children[0].id, "inside-toggle");
    }

    #[tokio::test]
    async fn content_inside_unknown_containers_is_rendered_and_collected() {
        let mut notion = ScriptedNotion::default();
        let mut toggle = Block::new("tg", BlockKind::Unsupported { type_name: "toggle".into() });
        toggle.has_children = true;
        notion.children.insert(
            "page".into(),
            vec![Listing {
                items: vec![toggle],
                next_cursor: None,
            }],
        );
        notion.children.insert(
            "tg".into(),
            vec![Listing {
                items: vec![
                    Block::new(
                        "inner",
                        BlockKind::Paragraph {
                            text: vec![crate::model::RichText::plain("inside toggle")],
                        },
                    ),
                    Block::new(
                        "img",
                        BlockKind::Image(crate::model::MediaReference {
                            source_url: "https://s3.example/x.png?sig=1".into(),
                            kind: crate::model::MediaKind::Image,
                            caption: vec![],
                        }),
                    ),
                ],
                next_cursor: None,
            }],
        );

        let blocks = page_blocks(&notion, RetryPolicy::none(), "page").await.unwrap();
        let rendered = crate::render::render_blocks(&blocks, &Default::default());
        assert_eq!(rendered.media.len(), 1);
        assert!(rendered
            .markup
            .starts_with("<!-- unsupported block: toggle -->\n<div class=\"nested\"><p>inside toggle</p>"));
        assert!(rendered.markup.contains("https://s3.example/x.png?sig=1"));
    }
}
