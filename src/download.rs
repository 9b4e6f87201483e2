use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::TransferError;
use crate::model::MediaKind;

const SERVICE: &str = "media";

static URL_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.([A-Za-z0-9]{2,5})$").expect("valid extension regex"));

/// Bytes fetched from a media URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait AssetDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Download, TransferError>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    http: Client,
    max_bytes: u64,
}

impl HttpDownloader {
    /// Bodies larger than `max_bytes` are abandoned mid-transfer.
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self> {
        let http = Client::builder()
            .user_agent("notion-mirror/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build media HTTP client")?;
        Ok(Self { http, max_bytes })
    }
}

/// Fail once `received` bytes would pass `limit`.
pub fn ensure_within(received: u64, limit: u64) -> Result<(), TransferError> {
    if received > limit {
        Err(TransferError::TooLarge { limit })
    } else {
        Ok(())
    }
}

#[async_trait]
impl AssetDownloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Download, TransferError> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))?;
        if !res.status().is_success() {
            return Err(TransferError::from_response(SERVICE, res).await);
        }
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        ensure_media(content_type.as_deref())?;
        if let Some(declared) = res.content_length() {
            ensure_within(declared, self.max_bytes)?;
        }
        let mut res = res;
        let mut bytes = Vec::new();
        while let Some(chunk) = res
            .chunk()
            .await
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))?
        {
            ensure_within((bytes.len() + chunk.len()) as u64, self.max_bytes)?;
            bytes.extend_from_slice(&chunk);
        }
        debug!(bytes = bytes.len(), content_type = ?content_type, "downloaded media");
        Ok(Download {
            bytes,
            content_type,
        })
    }
}

/// Strip parameters and lowercase: `Image/PNG; q=1` -> `image/png`.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Reject payloads that cannot be an image or video (an expired signed URL
/// typically answers with an HTML or XML error page).
pub fn ensure_media(content_type: Option<&str>) -> Result<(), TransferError> {
    let Some(ct) = content_type else {
        return Ok(());
    };
    let ct = essence(ct);
    let ok = ct.starts_with("image/")
        || ct.starts_with("video/")
        || ct == "application/octet-stream"
        || ct == "binary/octet-stream";
    if ok {
        Ok(())
    } else {
        Err(TransferError::UnsupportedMedia { content_type: ct })
    }
}

fn extension_for_type(content_type: &str) -> Option<&'static str> {
    let ext = match essence(content_type).as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/avif" => "avif",
        "image/heic" => "heic",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/x-msvideo" => "avi",
        _ => return None,
    };
    Some(ext)
}

fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(|c| c == '?' || c == '#').next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    URL_EXT
        .captures(last)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// File extension for a stored object: content type first, then the URL, then `bin`.
pub fn infer_extension(content_type: Option<&str>, url: &str) -> String {
    content_type
        .and_then(extension_for_type)
        .map(str::to_string)
        .or_else(|| extension_from_url(url))
        .unwrap_or_else(|| "bin".to_string())
}

/// Prefer what the bytes were served as; fall back to the block type.
pub fn infer_media_kind(content_type: Option<&str>, declared: MediaKind) -> MediaKind {
    match content_type.map(essence) {
        Some(ct) if ct.starts_with("image/") => MediaKind::Image,
        Some(ct) if ct.starts_with("video/") => MediaKind::Video,
        _ => declared,
    }
}

/// `media/{fp[0..2]}/{fp}.{ext}`
pub fn storage_key(fingerprint: &str, ext: &str) -> String {
    let shard = fingerprint.get(..2).unwrap_or(fingerprint);
    format!("media/{}/{}.{}", shard, fingerprint, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_error_pages_are_not_media() {
        assert!(ensure_media(Some("image/png")).is_ok());
        assert!(ensure_media(Some("Video/MP4; codecs=avc1")).is_ok());
        assert!(ensure_media(None).is_ok());
        let err = ensure_media(Some("text/html; charset=utf-8")).unwrap_err();
        assert!(matches!(err, TransferError::UnsupportedMedia { ref content_type } if content_type == "text/html"));
        assert!(!err.is_transient());
    }

    #[test]
    fn oversized_bodies_are_refused_for_good() {
        assert!(ensure_within(10, 10).is_ok());
        let err = ensure_within(11, 10).unwrap_err();
        assert!(matches!(err, TransferError::TooLarge { limit: 10 }));
        assert!(!err.is_transient());
    }

    #[test]
    fn extension_prefers_content_type_then_url() {
        assert_eq!(infer_extension(Some("image/jpeg"), "https://x/a.png"), "jpg");
        assert_eq!(
            infer_extension(Some("application/octet-stream"), "https://s3.x/p/Photo.PNG?X-Amz-Signature=abc"),
            "png"
        );
        assert_eq!(infer_extension(None, "https://x/download?id=7"), "bin");
    }

    #[test]
    fn media_kind_follows_served_type() {
        assert_eq!(infer_media_kind(Some("video/mp4"), MediaKind::Image), MediaKind::Video);
        assert_eq!(infer_media_kind(Some("application/octet-stream"), MediaKind::Image), MediaKind::Image);
    }

    #[test]
    fn storage_key_is_sharded_by_prefix() {
        assert_eq!(storage_key("abcdef", "png"), "media/ab/abcdef.png");
    }
}
