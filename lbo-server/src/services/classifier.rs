//! Logo classification collaborator
//!
//! The dispatcher only sees the [`Classifier`] trait. [`HttpClassifier`] talks to
//! the YOLO detection service: `POST {base_url}/detect` with a multipart `file`
//! part for uploads or an `image_path` form field for URLs.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::{BoundingBox, Classification, ItemSource};

const USER_AGENT: &str = concat!("lbo-server/", env!("CARGO_PKG_VERSION"));

/// Classification call failures
///
/// Every variant is treated as a failed attempt by the dispatcher.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Classification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Classification service unavailable: {0}")]
    Unavailable(String),

    #[error("Classification service returned {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Malformed classification response: {0}")]
    Malformed(String),
}

/// Anything that can judge whether an image contains a logo
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, source: &ItemSource) -> Result<Classification, ClassifyError>;
}

/// `/detect` response body
#[derive(Debug, Deserialize)]
struct DetectionResponse {
    #[serde(rename = "Is_Valid")]
    is_valid: String,
    #[serde(rename = "Confidence", default)]
    confidence: Option<f64>,
    #[serde(rename = "Detected_By", default)]
    detected_by: Option<String>,
    #[serde(rename = "Bounding_Box", default)]
    bounding_box: Option<BoundingBox>,
    #[serde(rename = "Error", default)]
    error: Option<String>,
}

impl From<DetectionResponse> for Classification {
    fn from(response: DetectionResponse) -> Self {
        Classification {
            valid: response.is_valid.eq_ignore_ascii_case("valid"),
            confidence: response.confidence,
            model_used: response.detected_by,
            bounding_box: response.bounding_box,
            detail: response.error,
        }
    }
}

/// HTTP client for the detection service
pub struct HttpClassifier {
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClassifyError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifyError::Unavailable(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn detect_url(&self) -> String {
        format!("{}/detect", self.base_url)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ClassifyError {
        if err.is_timeout() {
            ClassifyError::Timeout(self.timeout)
        } else if err.is_decode() {
            ClassifyError::Malformed(err.to_string())
        } else {
            ClassifyError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, source: &ItemSource) -> Result<Classification, ClassifyError> {
        let request = match source {
            ItemSource::Upload { filename, data } => {
                let part = reqwest::multipart::Part::bytes(data.clone()).file_name(filename.clone());
                let form = reqwest::multipart::Form::new().part("file", part);
                self.http_client.post(self.detect_url()).multipart(form)
            }
            ItemSource::Url(url) => self
                .http_client
                .post(self.detect_url())
                .form(&[("image_path", url.as_str())]),
        };

        tracing::debug!(source = %source.reference(), kind = source.kind().as_str(), "Calling detection service");

        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let detection: DetectionResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::Malformed(e.to_string()))?;

        Ok(detection.into())
    }
}
