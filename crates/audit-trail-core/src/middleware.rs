//! Request context middleware
//!
//! Install with `axum::middleware::from_fn_with_state(ContextLayer::default(), request_context)`
//! as the outermost audit-related layer so that every inner layer and handler
//! can reach the [`ContextHandle`] through the request extensions.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, info_span, Instrument};

use crate::context::{ContextHandle, RequestContext};

/// Settings for [`request_context`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextLayer {
    /// Synthesize a correlation id when the inbound request carries none
    pub generate_correlation_id: bool,
}

pub async fn request_context(
    State(layer): State<ContextLayer>,
    mut req: Request,
    next: Next,
) -> Response {
    let mut context = RequestContext::extract(req.headers());
    if layer.generate_correlation_id {
        context = context.with_generated_correlation_id();
    }

    // `info_span!` shadows serde_json's `Value` with tracing's trait
    let fields = serde_json::Value::Object(context.top_level_fields()).to_string();
    let span = info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        correlation_id = context.correlation_id().unwrap_or_default(),
        instruction_set = context.instruction_set().unwrap_or_default(),
        fields = %fields,
    );

    let handle = ContextHandle::attach(context);
    req.extensions_mut().insert(handle.clone());

    let mut response = next.run(req).instrument(span).await;

    match handle.teardown() {
        Some(context) => context.stamp_response_headers(response.headers_mut()),
        None => debug!("Request context already torn down"),
    }

    response
}
