//! Audit logger configuration

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AuditError;

pub const AUDITLOG_S3_BUCKET: &str = "AUDITLOG_S3_BUCKET";
pub const AUDITLOG_S3_DIRECTORY: &str = "AUDITLOG_S3_DIRECTORY";
pub const AUDITLOG_S3_REGION: &str = "AUDITLOG_S3_REGION";
pub const AUDITLOG_S3_ENDPOINT: &str = "AUDITLOG_S3_ENDPOINT";
pub const AUDITLOG_GENERATE_CORRELATION_ID: &str = "AUDITLOG_GENERATE_CORRELATION_ID";

pub const DEFAULT_BUCKET: &str = "wcf-audit-local";
pub const DEFAULT_DIRECTORY: &str = "todo-api/";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Destination of persisted audit records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOptions {
    pub bucket: String,
    /// Key prefix under which records are bucketed by hour
    pub directory: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Synthesize a correlation id when a request carries none
    #[serde(default)]
    pub generate_correlation_id: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            directory: DEFAULT_DIRECTORY.to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            generate_correlation_id: false,
        }
    }
}

impl AuditOptions {
    pub fn new(
        bucket: impl Into<String>,
        directory: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            directory: directory.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_generated_correlation_id(mut self, enabled: bool) -> Self {
        self.generate_correlation_id = enabled;
        self
    }

    /// Read options from the `AUDITLOG_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket: std::env::var(AUDITLOG_S3_BUCKET).unwrap_or(defaults.bucket),
            directory: std::env::var(AUDITLOG_S3_DIRECTORY).unwrap_or(defaults.directory),
            region: std::env::var(AUDITLOG_S3_REGION).unwrap_or(defaults.region),
            endpoint: std::env::var(AUDITLOG_S3_ENDPOINT)
                .ok()
                .filter(|s| !s.trim().is_empty()),
            generate_correlation_id: std::env::var(AUDITLOG_GENERATE_CORRELATION_ID)
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.generate_correlation_id),
        }
    }

    /// Bucket, directory and region are required; an endpoint, when set, must
    /// be an absolute http(s) URL with a host
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.bucket.trim().is_empty() {
            return Err(AuditError::Config("s3 bucket not informed".to_string()));
        }
        if self.directory.trim().is_empty() {
            return Err(AuditError::Config("s3 directory not informed".to_string()));
        }
        if let Some(endpoint) = &self.endpoint {
            validate_endpoint(endpoint)?;
        }
        if self.region.trim().is_empty() {
            return Err(AuditError::Config("s3 region not informed".to_string()));
        }
        Ok(())
    }

    /// Directory with any trailing `/` removed, used as the key prefix
    pub fn key_prefix(&self) -> &str {
        self.directory.trim_end_matches('/')
    }
}

fn validate_endpoint(endpoint: &str) -> Result<Url, AuditError> {
    let parsed = Url::parse(endpoint)
        .map_err(|e| AuditError::Config(format!("s3 endpoint invalid: {}", e)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AuditError::Config(format!(
            "s3 endpoint invalid: unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(AuditError::Config(
            "s3 endpoint invalid: missing host".to_string(),
        ));
    }

    Ok(parsed)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
