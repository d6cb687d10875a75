use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Ok,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Fetch,
    Parse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Where an image sits on the product page. Only used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageKind {
    Main,
    Measurement,
    Unknown,
}

/// Result of one extraction. Failures are carried in `status`/`error`
/// rather than returned as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductRecord {
    pub source_url: String,
    pub images: Vec<String>,
    pub measurements: Vec<String>,
    pub materials: String,
    pub status: ExtractionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtractionFailure>,
}

impl ProductRecord {
    pub fn failed(source_url: &str, kind: FailureKind, message: String) -> Self {
        Self {
            source_url: source_url.to_string(),
            images: Vec::new(),
            measurements: Vec::new(),
            materials: String::new(),
            status: ExtractionStatus::Failed,
            error: Some(ExtractionFailure { kind, message }),
        }
    }
}
