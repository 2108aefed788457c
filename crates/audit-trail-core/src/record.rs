//! Audit record builders
//!
//! Pure transforms from a captured request/response snapshot into the flat
//! metadata map persisted for each audit event.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use http::header::HOST;
use http::{request, response, HeaderMap, Method, StatusCode, Version};
use serde_json::{Map, Value};

use crate::constants::{BODY_READ_ERROR, BODY_TOO_LARGE};

/// A body as seen by the audit pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedBody {
    Bytes(Bytes),
    /// The body stream failed before it could be buffered
    Unreadable,
    /// The body exceeded the capture limit and was forwarded without a copy
    TooLarge,
}

impl CapturedBody {
    pub fn empty() -> Self {
        CapturedBody::Bytes(Bytes::new())
    }
}

impl From<Bytes> for CapturedBody {
    fn from(bytes: Bytes) -> Self {
        CapturedBody::Bytes(bytes)
    }
}

/// Snapshot of an inbound request
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub host: String,
    pub scheme: String,
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub query: String,
    pub headers: HeaderMap,
    pub body: CapturedBody,
}

impl CapturedRequest {
    pub fn from_parts(parts: &request::Parts, body: CapturedBody) -> Self {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());

        let scheme = match parts
            .headers
            .get("x-forwarded-proto")
            .and_then(|h| h.to_str().ok())
        {
            Some(proto @ ("http" | "https")) => proto.to_string(),
            _ => parts.uri.scheme_str().unwrap_or("http").to_string(),
        };

        Self {
            host,
            scheme,
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            version: parts.version,
            query: parts.uri.query().unwrap_or_default().to_string(),
            headers: parts.headers.clone(),
            body,
        }
    }

    /// Effective root URL, e.g. `http://localhost:8000/`
    pub fn root_url(&self) -> String {
        format!("{}://{}/", self.scheme, self.host)
    }

    pub fn protocol(&self) -> String {
        protocol_name(self.version)
    }
}

/// Snapshot of an outbound response
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: CapturedBody,
}

impl CapturedResponse {
    pub fn from_parts(parts: &response::Parts, body: CapturedBody) -> Self {
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers.clone(),
            body,
        }
    }
}

fn protocol_name(version: Version) -> String {
    // Debug renders the canonical token, e.g. "HTTP/1.1"
    format!("{:?}", version)
}

fn header_list(headers: &HeaderMap) -> Value {
    Value::Array(
        headers
            .iter()
            .map(|(name, value)| {
                Value::Array(vec![
                    Value::String(name.as_str().to_string()),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                ])
            })
            .collect(),
    )
}

/// Renders a body for an audit record: `None` when empty, parsed JSON when
/// possible, UTF-8 text otherwise, and [`BODY_READ_ERROR`] when neither works.
/// Bodies over the capture limit render as [`BODY_TOO_LARGE`].
pub fn body_value(body: &CapturedBody) -> Option<Value> {
    let bytes = match body {
        CapturedBody::Bytes(bytes) if bytes.is_empty() => return None,
        CapturedBody::Bytes(bytes) => bytes,
        CapturedBody::Unreadable => return Some(Value::String(BODY_READ_ERROR.to_string())),
        CapturedBody::TooLarge => return Some(Value::String(BODY_TOO_LARGE.to_string())),
    };

    let Ok(text) = std::str::from_utf8(bytes) else {
        return Some(Value::String(BODY_READ_ERROR.to_string()));
    };

    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}

pub fn request_metadata(request: &CapturedRequest) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("host".into(), Value::String(request.host.clone()));
    metadata.insert("hostname".into(), Value::String(request.root_url()));
    metadata.insert("method".into(), Value::String(request.method.to_string()));
    metadata.insert("path".into(), Value::String(request.path.clone()));
    metadata.insert("protocol".into(), Value::String(request.protocol()));
    metadata.insert("query".into(), Value::String(request.query.clone()));
    metadata.insert("headers".into(), header_list(&request.headers));

    if let Some(body) = body_value(&request.body) {
        metadata.insert("body".into(), body);
    }

    metadata
}

pub fn response_metadata(
    request: &CapturedRequest,
    response: &CapturedResponse,
    include_request_in_response: bool,
    request_timestamp: Option<&str>,
) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("requestHost".into(), Value::String(request.host.clone()));
    metadata.insert("requestHostname".into(), Value::String(request.root_url()));
    metadata.insert(
        "requestMethod".into(),
        Value::String(request.method.to_string()),
    );
    metadata.insert("requestPath".into(), Value::String(request.path.clone()));
    metadata.insert("requestProtocol".into(), Value::String(request.protocol()));
    metadata.insert(
        "protocol".into(),
        Value::String(protocol_name(response.version)),
    );
    metadata.insert("status".into(), Value::String(response.status.to_string()));
    metadata.insert("statusCode".into(), Value::from(response.status.as_u16()));
    metadata.insert("headers".into(), header_list(&response.headers));

    if let Some(body) = body_value(&response.body) {
        metadata.insert("body".into(), body);
    }

    if include_request_in_response {
        if let Some(body) = body_value(&request.body) {
            metadata.insert("requestBody".into(), body);
        }
        if let Some(timestamp) = request_timestamp {
            metadata.insert(
                "requestTimestamp".into(),
                Value::String(timestamp.to_string()),
            );
        }
    }

    metadata
}

static LAST_AUDIT_NANOS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock nanoseconds, forced strictly increasing within the process
fn unique_nanos() -> u64 {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or_default();

    let previous = LAST_AUDIT_NANOS
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);

    now.max(previous + 1)
}

/// Audit identifier for a request or response event, e.g.
/// `in/users/POST/request_1714564800123456789`.
///
/// Unique within a process but not reproducible across retries.
pub fn audit_id(request: &CapturedRequest, is_response: bool) -> String {
    let separator = if request.path.ends_with('/') { "" } else { "/" };
    let direction = if is_response { "response" } else { "request" };
    format!(
        "in{}{}{}/{}_{}",
        request.path,
        separator,
        request.method,
        direction,
        unique_nanos()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn captured(method: &str, uri: &str, body: CapturedBody) -> CapturedRequest {
        let (parts, _) = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "localhost:8000")
            .header("content-type", "application/json")
            .body(())
            .unwrap()
            .into_parts();
        CapturedRequest::from_parts(&parts, body)
    }

    fn captured_response(status: StatusCode, body: &'static [u8]) -> CapturedResponse {
        let (parts, _) = http::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(())
            .unwrap()
            .into_parts();
        CapturedResponse::from_parts(&parts, CapturedBody::from(Bytes::from_static(body)))
    }

    #[test]
    fn test_request_metadata_with_json_body() {
        let body = Bytes::from_static(br#"{"name":"Name 1","username":"username1"}"#);
        let req = captured("POST", "/users?page=2", body.into());
        let metadata = request_metadata(&req);

        assert_eq!(metadata["host"], json!("localhost:8000"));
        assert_eq!(metadata["hostname"], json!("http://localhost:8000/"));
        assert_eq!(metadata["method"], json!("POST"));
        assert_eq!(metadata["path"], json!("/users"));
        assert_eq!(metadata["protocol"], json!("HTTP/1.1"));
        assert_eq!(metadata["query"], json!("page=2"));
        assert_eq!(
            metadata["headers"],
            json!([["host", "localhost:8000"], ["content-type", "application/json"]])
        );
        assert_eq!(
            metadata["body"],
            json!({"name": "Name 1", "username": "username1"})
        );
    }

    #[test]
    fn test_request_metadata_omits_empty_body() {
        let metadata = request_metadata(&captured("GET", "/users", CapturedBody::empty()));
        assert!(!metadata.contains_key("body"));
        assert_eq!(metadata["query"], json!(""));
    }

    #[test]
    fn test_body_fallbacks() {
        assert_eq!(
            body_value(&Bytes::from_static(b"plain text").into()),
            Some(json!("plain text"))
        );
        assert_eq!(
            body_value(&Bytes::from_static(&[0xff, 0xfe, 0x00]).into()),
            Some(json!(BODY_READ_ERROR))
        );
        assert_eq!(
            body_value(&CapturedBody::Unreadable),
            Some(json!(BODY_READ_ERROR))
        );
        assert_eq!(
            body_value(&CapturedBody::TooLarge),
            Some(json!(BODY_TOO_LARGE))
        );
        assert_eq!(body_value(&Bytes::from_static(b"[1,2]").into()), Some(json!([1, 2])));
    }

    #[test]
    fn test_forwarded_proto_sets_root_url_scheme() {
        let (parts, _) = http::Request::builder()
            .uri("/users")
            .header("host", "api.example.com")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap()
            .into_parts();
        let req = CapturedRequest::from_parts(&parts, CapturedBody::empty());
        assert_eq!(req.root_url(), "https://api.example.com/");
    }

    #[test]
    fn test_response_metadata_without_request_body() {
        let req = captured("POST", "/users", Bytes::from_static(b"{\"a\":1}").into());
        let resp = captured_response(StatusCode::OK, br#"{"Result":{"id":1}}"#);
        let metadata = response_metadata(&req, &resp, false, Some("2024-05-01T12:00:00.000000Z"));

        assert_eq!(metadata["requestHost"], json!("localhost:8000"));
        assert_eq!(metadata["requestHostname"], json!("http://localhost:8000/"));
        assert_eq!(metadata["requestMethod"], json!("POST"));
        assert_eq!(metadata["requestPath"], json!("/users"));
        assert_eq!(metadata["requestProtocol"], json!("HTTP/1.1"));
        assert_eq!(metadata["protocol"], json!("HTTP/1.1"));
        assert_eq!(metadata["status"], json!("200 OK"));
        assert_eq!(metadata["statusCode"], json!(200));
        assert_eq!(metadata["body"], json!({"Result": {"id": 1}}));
        assert!(!metadata.contains_key("requestBody"));
        assert!(!metadata.contains_key("requestTimestamp"));
    }

    #[test]
    fn test_response_metadata_includes_request_when_asked() {
        let req = captured("POST", "/users", Bytes::from_static(b"{\"a\":1}").into());
        let resp = captured_response(StatusCode::CREATED, b"");
        let metadata = response_metadata(&req, &resp, true, Some("2024-05-01T12:00:00.000000Z"));

        assert_eq!(metadata["status"], json!("201 Created"));
        assert!(!metadata.contains_key("body"));
        assert_eq!(metadata["requestBody"], json!({"a": 1}));
        assert_eq!(
            metadata["requestTimestamp"],
            json!("2024-05-01T12:00:00.000000Z")
        );
    }

    #[test]
    fn test_audit_id_format() {
        let id = audit_id(&captured("POST", "/users", CapturedBody::empty()), false);
        let (prefix, nanos) = id.rsplit_once('_').unwrap();
        assert_eq!(prefix, "in/users/POST/request");
        assert!(nanos.parse::<u64>().is_ok());

        let id = audit_id(&captured("GET", "/users/", CapturedBody::empty()), true);
        assert!(id.starts_with("in/users/GET/response_"));
    }

    #[test]
    fn test_audit_id_unique_across_rapid_calls() {
        let req = captured("GET", "/users", CapturedBody::empty());
        let ids: HashSet<String> = (0..10_000).map(|_| audit_id(&req, false)).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
