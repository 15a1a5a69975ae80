//! Contract with the external header-mapping service and its HTTP client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fedao_core::{OperationCategory, RawTable, TargetSchema};
use fedao_storage::RetryDisposition;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleFieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleRequest {
    pub category: OperationCategory,
    pub headers: Vec<String>,
    pub samples: BTreeMap<String, Vec<String>>,
    pub target_schema: Vec<OracleFieldSpec>,
}

impl OracleRequest {
    /// Only fields filled from raw columns are offered as targets.
    pub fn for_table(table: &RawTable, schema: &TargetSchema, sample_rows: usize) -> Self {
        Self {
            category: table.category,
            headers: table.headers.clone(),
            samples: table.sample_values(sample_rows),
            target_schema: schema
                .mapped_fields()
                .map(|f| OracleFieldSpec {
                    name: f.name.to_string(),
                    field_type: f.field_type.as_str().to_string(),
                    required: f.required,
                    description: f.description.to_string(),
                })
                .collect(),
        }
    }
}

/// Untrusted: headers and field names are re-checked by the mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleResponse {
    pub mapping: BTreeMap<String, String>,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("no mapping oracle configured")]
    NotConfigured,
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle transport error: {message}")]
    Transport {
        message: String,
        disposition: RetryDisposition,
    },
    #[error("oracle returned http {status}")]
    Status { status: u16, disposition: RetryDisposition },
    #[error("oracle returned malformed output: {0}")]
    Malformed(String),
}

impl OracleError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout(_) => RetryDisposition::Retryable,
            Self::Transport { disposition, .. } | Self::Status { disposition, .. } => *disposition,
            Self::NotConfigured | Self::Malformed(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait MappingOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn map(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;
}

/// Stand-in used when no oracle endpoint is configured; every batch takes the
/// alias fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledOracle;

#[async_trait]
impl MappingOracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn map(&self, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        Err(OracleError::NotConfigured)
    }
}

/// POSTs the request as JSON and expects `{"mapping": {...}, "confidence": f}`.
#[derive(Debug, Clone)]
pub struct HttpMappingOracle {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpMappingOracle {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            token,
        }
    }
}

#[async_trait]
impl MappingOracle for HttpMappingOracle {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn map(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|err| OracleError::Transport {
            disposition: RetryDisposition::for_transport(&err),
            message: err.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status {
                status: status.as_u16(),
                disposition: RetryDisposition::for_status(status),
            });
        }

        let body = response.bytes().await.map_err(|err| OracleError::Transport {
            disposition: RetryDisposition::for_transport(&err),
            message: err.to_string(),
        })?;
        parse_response(&body)
    }
}

pub fn parse_response(body: &[u8]) -> Result<OracleResponse, OracleError> {
    let parsed: OracleResponse =
        serde_json::from_slice(body).map_err(|e| OracleError::Malformed(e.to_string()))?;
    if !parsed.confidence.is_finite() || !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(OracleError::Malformed(format!(
            "confidence {} outside [0, 1]",
            parsed.confidence
        )));
    }
    Ok(parsed)
}
