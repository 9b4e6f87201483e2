//! Durable object storage for rehosted media.
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use crate::config::{self, Storage};
use crate::error::TransferError;

const SERVICE: &str = "storage";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, TransferError>;

    /// Write `bytes` under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<(), TransferError>;

    /// Stable public URL for `key`; does not touch the backend.
    fn public_url(&self, key: &str) -> String;
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

/// Files under a root directory, served from `public_base_url`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, TransferError> {
        let rel = Path::new(key);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(TransferError::Io {
                path: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid object key"),
            });
        }
        Ok(self.root.join(rel))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, TransferError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8], _content_type: Option<&str>) -> Result<(), TransferError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        // Sibling tmp file so the rename stays on one filesystem.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes).await.map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(&path, e));
        }
        debug!(key, bytes = bytes.len(), "stored object locally");
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}

/// A storage REST endpoint addressing objects as `object/{bucket}/{key}`.
#[derive(Clone)]
pub struct HttpObjectStore {
    http: Client,
    endpoint: String,
    bucket: String,
    token: String,
    public_base_url: String,
}

impl std::fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl HttpObjectStore {
    pub fn new(
        endpoint: String,
        bucket: String,
        token: String,
        public_base_url: String,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("notion-mirror/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build storage HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            bucket,
            token,
            public_base_url,
        })
    }

    fn object_url(&self, key: &str) -> String {
        join_url(&self.endpoint, &format!("object/{}/{}", self.bucket, key))
    }

    pub fn build_request(
        &self,
        method: Method,
        key: &str,
        body: Option<(&[u8], Option<&str>)>,
    ) -> Result<reqwest::Request, TransferError> {
        let mut builder = self
            .http
            .request(method, self.object_url(key))
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some((bytes, content_type)) = body {
            builder = builder
                .header("x-upsert", "true")
                .header(
                    "Content-Type",
                    content_type.unwrap_or("application/octet-stream"),
                )
                .body(bytes.to_vec());
        }
        builder
            .build()
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))
    }
}

impl HttpObjectStore {
    async fn exists_by_get(&self, key: &str) -> Result<bool, TransferError> {
        let request = self.build_request(Method::GET, key, None)?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))?;
        if res.status().is_success() {
            return Ok(true);
        }
        match TransferError::from_response(SERVICE, res).await {
            TransferError::Status { status, body, .. } if missing_object(status, &body) => {
                debug!(key, status, "object reported missing");
                Ok(false)
            }
            err => Err(err),
        }
    }
}

/// Whether an error response means the object is absent. Some storage
/// gateways answer 400 with a not-found payload instead of a 404.
pub fn missing_object(status: u16, body: &str) -> bool {
    match status {
        404 => true,
        400 => {
            let body = body.to_ascii_lowercase();
            body.contains("not found") || body.contains("not_found") || body.contains("\"404\"")
        }
        _ => false,
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, TransferError> {
        let request = self.build_request(Method::HEAD, key, None)?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))?;
        match res.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            // HEAD carries no body, so ask again with GET to see why.
            StatusCode::BAD_REQUEST => self.exists_by_get(key).await,
            _ => Err(TransferError::from_response(SERVICE, res).await),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: Option<&str>) -> Result<(), TransferError> {
        let request = self.build_request(Method::POST, key, Some((bytes, content_type)))?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| TransferError::from_reqwest(SERVICE, e))?;
        if !res.status().is_success() {
            return Err(TransferError::from_response(SERVICE, res).await);
        }
        debug!(key, bytes = bytes.len(), "uploaded object");
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}

/// Build the configured backend.
pub fn from_config(storage: &Storage, timeout: Duration) -> Result<Arc<dyn ObjectStore>> {
    match storage {
        Storage::Local {
            root,
            public_base_url,
        } => Ok(Arc::new(LocalObjectStore::new(
            config::expand_home(root),
            public_base_url.clone(),
        ))),
        Storage::Http {
            endpoint,
            bucket,
            token,
            public_base_url,
        } => Ok(Arc::new(HttpObjectStore::new(
            endpoint.clone(),
            bucket.clone(),
            token.clone(),
            public_base_url.clone(),
            timeout,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_put_then_exists_and_url() {
        let td = tempdir().unwrap();
        let store = LocalObjectStore::new(td.path(), "https://cdn.example.com/media/");
        let key = "media/ab/abcdef.png";

        assert!(!store.exists(key).await.unwrap());
        store.put(key, b"png-bytes", Some("image/png")).await.unwrap();
        assert!(store.exists(key).await.unwrap());
        assert_eq!(
            std::fs::read(td.path().join(key)).unwrap(),
            b"png-bytes".to_vec()
        );
        assert_eq!(
            store.public_url(key),
            "https://cdn.example.com/media/media/ab/abcdef.png"
        );

        let leftovers: Vec<_> = std::fs::read_dir(td.path().join("media/ab"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn local_rejects_escaping_keys() {
        let td = tempdir().unwrap();
        let store = LocalObjectStore::new(td.path(), "https://cdn.example.com");
        let err = store.put("../outside.png", b"x", None).await.unwrap_err();
        assert!(matches!(err, TransferError::Io { .. }));
    }

    #[test]
    fn only_not_found_payloads_count_as_missing() {
        assert!(missing_object(404, ""));
        assert!(missing_object(
            400,
            r#"{"statusCode":"404","error":"not_found","message":"Object not found"}"#
        ));
        assert!(missing_object(400, "Not Found"));
        assert!(!missing_object(400, r#"{"error":"InvalidJWT","message":"jwt malformed"}"#));
        assert!(!missing_object(400, ""));
        assert!(!missing_object(403, "not found"));
    }

    #[test]
    fn http_upload_request_sets_headers() {
        let store = HttpObjectStore::new(
            "https://store.example.com/storage/v1/".into(),
            "media".into(),
            "secret".into(),
            "https://store.example.com/storage/v1/object/public/media".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = store
            .build_request(Method::POST, "media/ab/abc.png", Some((b"x", Some("image/png"))))
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://store.example.com/storage/v1/object/media/media/ab/abc.png"
        );
        let headers = request.headers();
        assert_eq!(headers.get("Authorization").and_then(|h| h.to_str().ok()), Some("Bearer secret"));
        assert_eq!(headers.get("x-upsert").and_then(|h| h.to_str().ok()), Some("true"));
        assert_eq!(headers.get("Content-Type").and_then(|h| h.to_str().ok()), Some("image/png"));

        assert_eq!(
            store.public_url("media/ab/abc.png"),
            "https://store.example.com/storage/v1/object/public/media/media/ab/abc.png"
        );
    }
}
