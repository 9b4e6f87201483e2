//! Failure taxonomy shared by every remote call the pipeline makes.
use std::time::Duration;
use thiserror::Error;

/// A failed call to Notion, a media host, or object storage.
///
/// Callers branch on [`TransferError::is_transient`]: transient failures are
/// retried with backoff, everything else is final for that call.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{service} request timed out")]
    Timeout { service: &'static str },

    #[error("{service} connection failed: {message}")]
    Connection {
        service: &'static str,
        message: String,
    },

    #[error("rate limited by {service}")]
    RateLimited {
        service: &'static str,
        retry_after: Option<Duration>,
    },

    #[error("{service} error {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("unsupported media type: {content_type}")]
    UnsupportedMedia { content_type: String },

    #[error("media exceeds the {limit}-byte download limit")]
    TooLarge { limit: u64 },

    #[error("invalid {service} response: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },

    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Timeout { .. }
            | TransferError::Connection { .. }
            | TransferError::RateLimited { .. } => true,
            TransferError::Status { status, .. } => *status >= 500,
            TransferError::UnsupportedMedia { .. }
            | TransferError::TooLarge { .. }
            | TransferError::Decode { .. }
            | TransferError::Io { .. } => false,
        }
    }

    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransferError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout { service }
        } else if err.is_decode() {
            TransferError::Decode {
                service,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            TransferError::Status {
                service,
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            TransferError::Connection {
                service,
                message: err.to_string(),
            }
        }
    }

    /// Classify a non-success HTTP response; reads the body for the message.
    pub async fn from_response(service: &'static str, res: reqwest::Response) -> Self {
        let status = res.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = res
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return TransferError::RateLimited {
                service,
                retry_after,
            };
        }
        let body = res.text().await.unwrap_or_default();
        TransferError::Status {
            service,
            status: status.as_u16(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransferError::Timeout { service: "notion" }.is_transient());
        assert!(TransferError::RateLimited {
            service: "notion",
            retry_after: None
        }
        .is_transient());
        assert!(TransferError::Status {
            service: "storage",
            status: 503,
            body: String::new()
        }
        .is_transient());

        assert!(!TransferError::Status {
            service: "media",
            status: 404,
            body: String::new()
        }
        .is_transient());
        assert!(!TransferError::UnsupportedMedia {
            content_type: "text/html".into()
        }
        .is_transient());
        assert!(!TransferError::TooLarge { limit: 1024 }.is_transient());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let err = TransferError::RateLimited {
            service: "notion",
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(TransferError::Timeout { service: "notion" }.retry_after(), None);
    }
}
