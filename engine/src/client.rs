//! Client for the remote segmentation service.
//!
//! A single `POST {base_url}/segment` carries the stored file as one
//! multipart part named `file`. The response body is returned verbatim.
//! Every failure is mapped onto `SegmentationError`; nothing is retried.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::SegmentationError;

/// Anything that can turn an uploaded point cloud into a processed artifact.
#[async_trait]
pub trait SegmentationService: Send + Sync {
    /// Submit `file_bytes` under `filename` and return the processed bytes.
    async fn submit(&self, file_bytes: Bytes, filename: &str) -> Result<Bytes, SegmentationError>;
}

/// HTTP implementation of `SegmentationService`.
#[derive(Debug, Clone)]
pub struct SegmentationClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    error_body_limit: usize,
}

impl SegmentationClient {
    pub fn new(config: &EngineConfig) -> Result<Self, SegmentationError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SegmentationError::Unexpected {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(SegmentationClient {
            http,
            endpoint: config.segment_url(),
            timeout: config.request_timeout(),
            error_body_limit: config.error_body_limit,
        })
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, file_bytes: Bytes, filename: &str) -> Result<Bytes, SegmentationError> {
        let length = file_bytes.len() as u64;
        let part = Part::stream_with_length(reqwest::Body::from(file_bytes), length)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| self.classify(e))?;
        let form = Form::new().part("file", part);

        debug!(endpoint = %self.endpoint, filename, bytes = length, "Submitting to segmentation service");

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SegmentationError::ServiceError {
                status_code: status.as_u16(),
                body: truncate_chars(&body, self.error_body_limit),
            });
        }

        let payload = response.bytes().await.map_err(|e| self.classify(e))?;
        debug!(status = status.as_u16(), bytes = payload.len(), "Segmentation service responded");
        Ok(payload)
    }

    fn classify(&self, err: reqwest::Error) -> SegmentationError {
        if err.is_timeout() {
            SegmentationError::TimedOut { after: self.timeout }
        } else if err.is_connect() {
            SegmentationError::Unreachable {
                endpoint: self.endpoint.clone(),
            }
        } else {
            SegmentationError::Unexpected {
                message: error_chain(&err),
            }
        }
    }
}

#[async_trait]
impl SegmentationService for SegmentationClient {
    /// Dropping the returned future aborts the request, and so does the
    /// timeout: the whole exchange runs inside `tokio::time::timeout`.
    async fn submit(&self, file_bytes: Bytes, filename: &str) -> Result<Bytes, SegmentationError> {
        match tokio::time::timeout(self.timeout, self.send(file_bytes, filename)).await {
            Ok(result) => result,
            Err(_) => Err(SegmentationError::TimedOut { after: self.timeout }),
        }
    }
}

fn truncate_chars(body: &str, limit: usize) -> String {
    body.chars().take(limit).collect()
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
