//! Object storage backends for audit records

mod memory;
mod s3;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use s3::S3ObjectStore;

/// A single durable PUT of one audit record
#[derive(Debug, Clone, PartialEq)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    /// Always set explicitly to the body length
    pub content_length: u64,
    /// Request AES256 server-side encryption
    pub server_side_encryption: bool,
    /// User metadata; empty but never absent
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectResponse {
    /// HTTP status reported by the store; anything other than 200 is a failed write
    pub status_code: u16,
    pub e_tag: Option<String>,
}

impl PutObjectResponse {
    pub fn ok() -> Self {
        Self {
            status_code: 200,
            e_tag: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Destination for audit records. Owned exclusively by the logger's worker task.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectResponse, StoreError>;
}
