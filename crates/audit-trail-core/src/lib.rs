//! Request context propagation and audit record builders shared by the audit pipeline

pub mod constants;
pub mod context;
pub mod error;
pub mod middleware;
pub mod record;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use context::{ContextHandle, RequestContext};
pub use error::ContextError;
pub use middleware::{request_context, ContextLayer};
pub use record::{
    audit_id, body_value, request_metadata, response_metadata, CapturedBody, CapturedRequest,
    CapturedResponse,
};
pub use types::*;

// Re-export external dependencies
pub use chrono;
pub use serde_json;
