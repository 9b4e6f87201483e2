use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::TransferError;
use crate::model::{Block, SourcePage};
use crate::notion::model::{decode_blocks, decode_pages, parse_page, ListResponse};

pub mod model;

const NOTION_API_BASE: &str = "https://api.notion.com/";
const SERVICE: &str = "notion";

/// One page of a cursor-paginated Notion listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    /// Present only when the source reported more results.
    pub next_cursor: Option<String>,
}

/// Read-only view of the source workspace.
#[async_trait]
pub trait NotionService: Send + Sync {
    async fn query_database(
        &self,
        database_id: &str,
        cursor: Option<&str>,
    ) -> Result<Listing<SourcePage>, TransferError>;

    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<Listing<Block>, TransferError>;
}

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
    page_size: u32,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    pub fn new(token: String, version: String, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(NOTION_API_BASE).context("invalid default Notion URL")?;
        Self::with_base_url(token, version, timeout, base_url)
    }

    pub fn with_base_url(
        token: String,
        version: String,
        timeout: Duration,
        base_url: Url,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("notion-mirror/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build Notion HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            version,
            page_size: 100,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Build an authenticated request against `path` (relative to the API base).
    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid Notion base URL")?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version);
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", "application/json")
                .json(body);
        }
        builder.build().context("failed to build Notion request")
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T, TransferError> {
        debug!(method = %request.method(), url = %request.url(), "notion request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))?;
        if !res.status().is_success() {
            return Err(TransferError::from_response(SERVICE, res).await);
        }
        res.json::<T>()
            .await
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))
    }

    /// Fetch a single page's properties (title, edit time).
    pub async fn retrieve_page(&self, page_id: &str) -> Result<SourcePage, TransferError> {
        let request =
            self.request_or_decode_err(Method::GET, &format!("v1/pages/{}", page_id), None)?;
        let page: Value = self.execute(request).await?;
        parse_page(&page)
    }

    fn request_or_decode_err(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request, TransferError> {
        self.build_request(method, path, body)
            .map_err(|e| TransferError::Decode {
                service: SERVICE,
                message: format!("{:#}", e),
            })
    }
}

pub fn build_query_body(page_size: u32, cursor: Option<&str>) -> Value {
    let mut body = json!({ "page_size": page_size });
    if let Some(cursor) = cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

pub fn children_path(block_id: &str, page_size: u32, cursor: Option<&str>) -> String {
    match cursor {
        Some(cursor) => format!(
            "v1/blocks/{}/children?page_size={}&start_cursor={}",
            block_id, page_size, cursor
        ),
        None => format!("v1/blocks/{}/children?page_size={}", block_id, page_size),
    }
}

#[async_trait]
impl NotionService for NotionClient {
    async fn query_database(
        &self,
        database_id: &str,
        cursor: Option<&str>,
    ) -> Result<Listing<SourcePage>, TransferError> {
        let body = build_query_body(self.page_size, cursor);
        let request = self.request_or_decode_err(
            Method::POST,
            &format!("v1/databases/{}/query", database_id),
            Some(&body),
        )?;
        let list: ListResponse = self.execute(request).await?;
        let next_cursor = list.continuation();
        let items = decode_pages(&list.results);
        Ok(Listing { items, next_cursor })
    }

    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<Listing<Block>, TransferError> {
        let path = children_path(block_id, self.page_size, cursor);
        let request = self.request_or_decode_err(Method::GET, &path, None)?;
        let list: ListResponse = self.execute(request).await?;
        let next_cursor = list.continuation();
        let items = decode_blocks(&list.results);
        Ok(Listing { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> NotionClient {
        NotionClient::new("token".into(), "2022-06-28".into(), Duration::from_secs(5))
            .unwrap()
            .with_page_size(50)
    }

    #[test]
    fn build_request_sets_headers() {
        let client = client();
        let body = build_query_body(50, None);
        let request = client
            .build_request(Method::POST, "v1/databases/db-1/query", Some(&body))
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/v1/databases/db-1/query");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Notion-Version")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "2022-06-28"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn get_requests_carry_no_body_headers() {
        let client = client();
        let request = client
            .build_request(Method::GET, &children_path("blk", 50, Some("c2")), None)
            .unwrap();
        assert_eq!(request.url().path(), "/v1/blocks/blk/children");
        assert_eq!(request.url().query(), Some("page_size=50&start_cursor=c2"));
        assert!(request.headers().get("Content-Type").is_none());
    }

    #[test]
    fn query_body_includes_cursor_only_when_present() {
        let first = build_query_body(100, None);
        assert_eq!(first["page_size"], 100);
        assert!(first.get("start_cursor").is_none());

        let next = build_query_body(100, Some("abc"));
        assert_eq!(next["start_cursor"], "abc");
    }

    #[test]
    fn debug_hides_token() {
        let rendered = format!("{:?}", client());
        assert!(!rendered.contains("token\""));
        assert!(rendered.contains("api.notion.com"));
    }
}
