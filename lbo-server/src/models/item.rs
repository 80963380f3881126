//! Work items and their classification outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where an item's image comes from
#[derive(Clone, PartialEq, Eq)]
pub enum ItemSource {
    /// Remote image, classified by URL
    Url(String),
    /// Uploaded image bytes; only the file name is ever persisted
    Upload { filename: String, data: Vec<u8> },
}

impl ItemSource {
    /// Source reference recorded with the result (file name or URL)
    pub fn reference(&self) -> &str {
        match self {
            ItemSource::Url(url) => url,
            ItemSource::Upload { filename, .. } => filename,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            ItemSource::Url(_) => SourceKind::Url,
            ItemSource::Upload { .. } => SourceKind::Upload,
        }
    }
}

// Upload payloads can be megabytes; keep them out of logs
impl fmt::Debug for ItemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ItemSource::Upload { filename, data } => f
                .debug_struct("Upload")
                .field("filename", filename)
                .field("bytes", &data.len())
                .finish(),
        }
    }
}

/// Persisted discriminator of [`ItemSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Url,
    Upload,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Url => "url",
            SourceKind::Upload => "upload",
        }
    }
}

impl FromStr for SourceKind {
    type Err = lbo_common::Error;

    fn from_str(s: &str) -> lbo_common::Result<Self> {
        match s {
            "url" => Ok(SourceKind::Url),
            "upload" => Ok(SourceKind::Upload),
            other => Err(lbo_common::Error::Internal(format!(
                "Unknown item source kind: {}",
                other
            ))),
        }
    }
}

/// One item of a batch, with its reserved position
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub position: u64,
    pub source: ItemSource,
}

/// An item that was submitted but has no result yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    pub position: u64,
    pub kind: SourceKind,
    pub source_ref: String,
}

/// Detected logo region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// Verdict returned by the classification collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub valid: bool,
    pub confidence: Option<f64>,
    pub model_used: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    /// Explanation attached to the verdict by the classifier (e.g. unreadable image)
    pub detail: Option<String>,
}

impl Classification {
    pub fn valid(confidence: f64, model_used: impl Into<String>) -> Self {
        Self {
            valid: true,
            confidence: Some(confidence),
            model_used: Some(model_used.into()),
            bounding_box: None,
            detail: None,
        }
    }

    pub fn invalid() -> Self {
        Self {
            valid: false,
            confidence: None,
            model_used: None,
            bounding_box: None,
            detail: None,
        }
    }
}

/// Immutable outcome record for one classified item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub position: u64,
    #[serde(rename = "ref")]
    pub source_ref: String,
    pub valid: bool,
    pub confidence: Option<f64>,
    pub model_used: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn classified(
        position: u64,
        source_ref: impl Into<String>,
        classification: Classification,
        duration_ms: u64,
    ) -> Self {
        Self {
            position,
            source_ref: source_ref.into(),
            valid: classification.valid,
            confidence: classification.confidence,
            model_used: classification.model_used,
            bounding_box: classification.bounding_box,
            duration_ms,
            error: classification.detail,
        }
    }

    /// Item that could not be classified; always counted invalid
    pub fn failed(
        position: u64,
        source_ref: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            position,
            source_ref: source_ref.into(),
            valid: false,
            confidence: None,
            model_used: None,
            bounding_box: None,
            duration_ms,
            error: Some(error.into()),
        }
    }
}
