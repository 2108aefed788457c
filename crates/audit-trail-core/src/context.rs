//! Request-scoped correlation context
//!
//! A [`RequestContext`] is extracted from the inbound headers once per request,
//! bound to the request through a [`ContextHandle`] stored in the request
//! extensions, and written back onto the response headers when the request
//! completes. There is no ambient or thread-local state: code that wants the
//! context extracts the handle from the request it is processing.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use http::request::Parts;
use http::{Extensions, HeaderMap, HeaderName, HeaderValue, Request};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::constants::{
    CORRELATION_ID_FIELD, CORRELATION_ID_HEADER, INSTRUCTION_SET_FIELD, INSTRUCTION_SET_HEADER,
    LOGGED_FIELDS_HEADER,
};
use crate::error::ContextError;

/// Correlation metadata and extra fields carried by a single request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    correlation_id: Option<String>,
    instruction_set: Option<String>,
    logged_fields: Map<String, Value>,
    raw_logged_fields: Option<String>,
    audit_only_fields: Map<String, Value>,
}

impl RequestContext {
    /// Build a context from inbound headers.
    ///
    /// Missing headers yield `None`/empty. Values are trimmed, and a header that
    /// is empty after trimming counts as missing, so it is not stamped back onto
    /// the response. A `K-Logged-Fields` value that is not a JSON object is
    /// discarded with a warning; the request is never rejected.
    pub fn extract(headers: &HeaderMap) -> Self {
        let raw_logged_fields = header_value(headers, &LOGGED_FIELDS_HEADER);
        let logged_fields = raw_logged_fields
            .as_deref()
            .map(parse_logged_fields)
            .unwrap_or_default();

        Self {
            correlation_id: header_value(headers, &CORRELATION_ID_HEADER),
            instruction_set: header_value(headers, &INSTRUCTION_SET_HEADER),
            logged_fields,
            raw_logged_fields,
            audit_only_fields: Map::new(),
        }
    }

    /// Fill in a random correlation id when the inbound request carried none
    pub fn with_generated_correlation_id(mut self) -> Self {
        if self.correlation_id.is_none() {
            self.correlation_id = Some(Uuid::new_v4().to_string());
        }
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn instruction_set(&self) -> Option<&str> {
        self.instruction_set.as_deref()
    }

    pub fn logged_fields(&self) -> &Map<String, Value> {
        &self.logged_fields
    }

    pub fn audit_only_fields(&self) -> &Map<String, Value> {
        &self.audit_only_fields
    }

    /// Raw `K-Logged-Fields` header value, exactly as received (trimmed)
    pub fn raw_logged_fields(&self) -> Option<&str> {
        self.raw_logged_fields.as_deref()
    }

    /// Upsert a logged field. Arrays and objects are stored as their JSON string
    /// so every field renders in both header and log-line form.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let value = match value.into() {
            nested @ (Value::Array(_) | Value::Object(_)) => Value::String(nested.to_string()),
            scalar => scalar,
        };
        self.logged_fields.insert(key.into(), value);
    }

    /// Upsert a field that only appears on the audit trail
    pub fn add_audit_only_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.audit_only_fields.insert(key.into(), value.into());
    }

    /// Identity fields merged with the logged fields, for application logging.
    /// Identity fields win over logged fields of the same name.
    pub fn top_level_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(correlation_id) = &self.correlation_id {
            fields.insert(
                CORRELATION_ID_FIELD.to_string(),
                Value::String(correlation_id.clone()),
            );
        }
        if let Some(instruction_set) = &self.instruction_set {
            fields.insert(
                INSTRUCTION_SET_FIELD.to_string(),
                Value::String(instruction_set.clone()),
            );
        }
        for (key, value) in &self.logged_fields {
            fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
        fields
    }

    /// [`Self::top_level_fields`] plus the audit-only fields
    pub fn audit_top_level_fields(&self) -> Map<String, Value> {
        let mut fields = self.top_level_fields();
        for (key, value) in &self.audit_only_fields {
            fields.insert(key.clone(), value.clone());
        }
        fields
    }

    /// Mirror the identity headers and the raw logged-fields header onto a
    /// response. Absent values produce no header at all.
    pub fn stamp_response_headers(&self, headers: &mut HeaderMap) {
        let stamped = [
            (&CORRELATION_ID_HEADER, &self.correlation_id),
            (&INSTRUCTION_SET_HEADER, &self.instruction_set),
            (&LOGGED_FIELDS_HEADER, &self.raw_logged_fields),
        ];

        for (name, value) in stamped {
            let Some(value) = value else { continue };
            match HeaderValue::from_str(value) {
                Ok(header_value) => {
                    headers.insert(name.clone(), header_value);
                }
                Err(e) => warn!("Skipping invalid {} response header value: {}", name, e),
            }
        }
    }
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let value = headers.get(name)?;
    match value.to_str() {
        Ok(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(_) => {
            warn!("Ignoring non-text {} header value", name);
            None
        }
    }
}

fn parse_logged_fields(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            warn!(
                "Invalid {} header value: type {}",
                LOGGED_FIELDS_HEADER,
                json_type_name(&other)
            );
            Map::new()
        }
        Err(e) => {
            warn!("Invalid {} header value: {}", LOGGED_FIELDS_HEADER, e);
            Map::new()
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Binding between one in-flight request and its [`RequestContext`].
///
/// Clones share the same binding. Once [`ContextHandle::teardown`] runs, every
/// clone observes the context as out of scope: lenient accessors return `None`
/// and strict accessors return [`ContextError::NotInScope`].
#[derive(Debug, Clone)]
pub struct ContextHandle {
    inner: Arc<Mutex<Option<RequestContext>>>,
}

impl ContextHandle {
    pub fn attach(context: RequestContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(context))),
        }
    }

    /// Handle bound to `request`, if the context middleware ran for it
    pub fn lookup<B>(request: &Request<B>) -> Option<Self> {
        Self::from_extensions(request.extensions())
    }

    pub fn from_extensions(extensions: &Extensions) -> Option<Self> {
        extensions.get::<Self>().cloned()
    }

    pub fn is_in_scope(&self) -> bool {
        self.lock().is_some()
    }

    /// Lenient access: `None` once the request has completed
    pub fn with<R>(&self, f: impl FnOnce(&mut RequestContext) -> R) -> Option<R> {
        self.lock().as_mut().map(f)
    }

    /// Strict access: fails loudly once the request has completed
    pub fn try_with<R>(&self, f: impl FnOnce(&mut RequestContext) -> R) -> Result<R, ContextError> {
        self.with(f).ok_or(ContextError::NotInScope)
    }

    pub fn add_field(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ContextError> {
        self.try_with(|ctx| ctx.add_field(key, value))
    }

    pub fn add_audit_only_field(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ContextError> {
        self.try_with(|ctx| ctx.add_audit_only_field(key, value))
    }

    /// Snapshot of the audit fields, empty once out of scope
    pub fn audit_top_level_fields(&self) -> Map<String, Value> {
        self.with(|ctx| ctx.audit_top_level_fields())
            .unwrap_or_default()
    }

    /// Release the binding and hand back the context
    pub fn teardown(&self) -> Option<RequestContext> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RequestContext>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> FromRequestParts<S> for ContextHandle
where
    S: Send + Sync,
{
    type Rejection = ContextError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_extensions(&parts.extensions)
            .filter(Self::is_in_scope)
            .ok_or(ContextError::NotInScope)
    }
}

impl<S> OptionalFromRequestParts<S> for ContextHandle
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(Self::from_extensions(&parts.extensions).filter(Self::is_in_scope))
    }
}
