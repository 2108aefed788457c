use http::HeaderName;

/// Correlation identifier propagated across a request's lifecycle (`K-Correlation-Id`)
pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("k-correlation-id");

/// Opaque caller-supplied directive (`K-Instruction-Set`)
pub const INSTRUCTION_SET_HEADER: HeaderName = HeaderName::from_static("k-instruction-set");

/// JSON object of structured fields to attach to logs (`K-Logged-Fields`)
pub const LOGGED_FIELDS_HEADER: HeaderName = HeaderName::from_static("k-logged-fields");

/// Top level field names under which the identity headers are logged
pub const CORRELATION_ID_FIELD: &str = "correlationId";
pub const INSTRUCTION_SET_FIELD: &str = "instructionSet";

/// Sentinel stored in place of a body that could not be read or decoded
pub const BODY_READ_ERROR: &str = "bodyReadError";

/// Sentinel stored in place of a body larger than the capture limit
pub const BODY_TOO_LARGE: &str = "bodyTooLarge";

/// Content type of persisted audit records
pub const AUDIT_RECORD_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Record field names owned by the audit pipeline.
///
/// Context fields with one of these names are never copied into a record.
pub const RESERVED_FIELD_NAMES: &[&str] = &[
    "identifier",
    "eventTimestamp",
    "host",
    "hostname",
    "method",
    "path",
    "query",
    "protocol",
    "headers",
    "body",
    "requestBody",
    "requestTimestamp",
    "requestHost",
    "requestHostname",
    "requestMethod",
    "requestPath",
    "requestProtocol",
    "status",
    "statusCode",
];

pub fn is_reserved_field(name: &str) -> bool {
    RESERVED_FIELD_NAMES.contains(&name)
}
