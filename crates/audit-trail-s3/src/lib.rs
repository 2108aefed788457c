//! audit-trail-s3: durable HTTP audit logging to S3-compatible object storage
//!
//! Request handlers enqueue serialized audit records without waiting on the
//! network; a single background worker writes them to the bucket one at a time.

pub mod config;
pub mod error;
pub mod logger;
pub mod middleware;
pub mod store;

pub use config::AuditOptions;
pub use error::{AuditError, StoreError};
pub use logger::{AuditLogger, LoggerState, QueuedRecord};
pub use middleware::{audit_inbound, InboundAudit, LogInbound, DEFAULT_MAX_BODY_BYTES};
pub use store::{MemoryStore, ObjectStore, PutObjectRequest, PutObjectResponse, S3ObjectStore};
