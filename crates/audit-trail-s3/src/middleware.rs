//! Inbound audit middleware.
//!
//! Applied per route with `route_layer`, inside the request-context layer:
//!
//! ```ignore
//! Router::new()
//!     .route("/users", post(create_user))
//!     .route_layer(from_fn_with_state(logger.log_inbound(LogInbound::default()), audit_inbound))
//!     .layer(from_fn_with_state(ContextLayer::default(), request_context))
//! ```

use std::sync::Arc;

use audit_trail_core::{
    utc_now_string, CapturedBody, CapturedRequest, CapturedResponse, ContextHandle,
};
use axum::{
    body::{Body, BodyDataStream, Bytes, HttpBody},
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use bytes::BytesMut;
use futures::{stream, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::logger::AuditLogger;

/// Bodies larger than this are forwarded without being captured
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Which records the inbound middleware queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogInbound {
    pub log_request: bool,
    pub log_response: bool,
    /// Repeat the request body and timestamp on the response record
    pub include_request_in_response: bool,
    /// Largest body copied into a record; larger ones are recorded as `bodyTooLarge`
    pub max_body_bytes: usize,
}

impl Default for LogInbound {
    fn default() -> Self {
        Self {
            log_request: true,
            log_response: true,
            include_request_in_response: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl LogInbound {
    pub fn log_request(mut self, enabled: bool) -> Self {
        self.log_request = enabled;
        self
    }

    pub fn log_response(mut self, enabled: bool) -> Self {
        self.log_response = enabled;
        self
    }

    pub fn include_request_in_response(mut self, enabled: bool) -> Self {
        self.include_request_in_response = enabled;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    fn needs_request_body(&self) -> bool {
        self.log_request || (self.log_response && self.include_request_in_response)
    }
}

/// State for [`audit_inbound`]
#[derive(Debug, Clone)]
pub struct InboundAudit {
    logger: Arc<AuditLogger>,
    options: LogInbound,
}

impl InboundAudit {
    pub fn new(logger: Arc<AuditLogger>, options: LogInbound) -> Self {
        Self { logger, options }
    }

    pub fn options(&self) -> LogInbound {
        self.options
    }
}

impl AuditLogger {
    /// Middleware state auditing the routes it is layered on
    pub fn log_inbound(self: &Arc<Self>, options: LogInbound) -> InboundAudit {
        InboundAudit::new(Arc::clone(self), options)
    }
}

/// Queue request and response records around the wrapped handler.
///
/// Audit failures are logged and never change the handler's response. Bodies
/// reach the handler and the client exactly as the stream produced them,
/// including a stream error.
pub async fn audit_inbound(
    State(audit): State<InboundAudit>,
    req: Request,
    next: Next,
) -> Response {
    let options = audit.options;
    let request_timestamp = options.include_request_in_response.then(utc_now_string);

    let (parts, body) = req.into_parts();
    let (captured_body, forwarded) = if options.needs_request_body() {
        capture_body(body, options.max_body_bytes, "request").await
    } else {
        (CapturedBody::empty(), body)
    };

    let captured = CapturedRequest::from_parts(&parts, captured_body);
    let context = ContextHandle::from_extensions(&parts.extensions);
    let context_fields = || {
        context
            .as_ref()
            .map(ContextHandle::audit_top_level_fields)
            .unwrap_or_else(Map::new)
    };

    if options.log_request {
        if let Err(e) = audit.logger.log_request(&captured, &context_fields()) {
            error!("Failed to queue audit record for request {}: {}", captured.path, e);
        }
    }

    let response = next.run(Request::from_parts(parts, forwarded)).await;

    if !options.log_response {
        return response;
    }

    let (parts, body) = response.into_parts();
    let pending = PendingResponse {
        logger: Arc::clone(&audit.logger),
        response: CapturedResponse::from_parts(&parts, CapturedBody::empty()),
        request: captured,
        include_request_in_response: options.include_request_in_response,
        request_timestamp,
        context_fields: context_fields(),
    };

    // Sized bodies are buffered now; streams are recorded once the client drains them
    let body = if body.size_hint().exact().is_some() {
        let (captured_body, body) = capture_body(body, options.max_body_bytes, "response").await;
        pending.queue(captured_body);
        body
    } else {
        record_stream(body, ResponseRecorder::new(pending, options.max_body_bytes))
    };

    Response::from_parts(parts, body)
}

/// Buffer up to `limit` bytes of `body` for the record.
///
/// The returned body replays everything read so far followed by the rest of
/// the stream, or by the stream's error.
async fn capture_body(body: Body, limit: usize, side: &str) -> (CapturedBody, Body) {
    if body.size_hint().lower() > limit as u64 {
        return (CapturedBody::TooLarge, body);
    }

    let mut data = body.into_data_stream();
    let mut buffered = BytesMut::new();

    while let Some(frame) = data.next().await {
        match frame {
            Ok(chunk) => {
                buffered.extend_from_slice(&chunk);
                if buffered.len() > limit {
                    let prefix = buffered.freeze();
                    let replay = stream::once(async move { Ok(prefix) }).chain(data);
                    return (CapturedBody::TooLarge, Body::from_stream(replay));
                }
            }
            Err(e) => {
                warn!("Failed to read {} body for audit: {}", side, e);
                let replay = stream::iter([Ok(buffered.freeze()), Err(e)]);
                return (CapturedBody::Unreadable, Body::from_stream(replay));
            }
        }
    }

    let bytes = buffered.freeze();
    (CapturedBody::Bytes(bytes.clone()), Body::from(bytes))
}

/// A response record waiting for its body
struct PendingResponse {
    logger: Arc<AuditLogger>,
    request: CapturedRequest,
    response: CapturedResponse,
    include_request_in_response: bool,
    request_timestamp: Option<String>,
    context_fields: Map<String, Value>,
}

impl PendingResponse {
    fn queue(mut self, body: CapturedBody) {
        self.response.body = body;
        if let Err(e) = self.logger.log_response(
            &self.request,
            &self.response,
            self.include_request_in_response,
            self.request_timestamp.as_deref(),
            &self.context_fields,
        ) {
            error!(
                "Failed to queue audit record for response {}: {}",
                self.request.path, e
            );
        }
    }
}

/// Copies a streamed response body as it passes to the client
struct ResponseRecorder {
    pending: Option<PendingResponse>,
    captured: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl ResponseRecorder {
    fn new(pending: PendingResponse, limit: usize) -> Self {
        Self {
            pending: Some(pending),
            captured: BytesMut::new(),
            limit,
            overflowed: false,
        }
    }

    fn observe(&mut self, chunk: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.captured.len() + chunk.len() > self.limit {
            self.overflowed = true;
            self.captured = BytesMut::new();
        } else {
            self.captured.extend_from_slice(chunk);
        }
    }

    fn finish(&mut self, body: CapturedBody) {
        if let Some(pending) = self.pending.take() {
            pending.queue(body);
        }
    }

    fn complete(&mut self) {
        let body = if self.overflowed {
            CapturedBody::TooLarge
        } else {
            CapturedBody::Bytes(self.captured.split().freeze())
        };
        self.finish(body);
    }
}

impl Drop for ResponseRecorder {
    fn drop(&mut self) {
        if self.pending.is_some() {
            debug!("Response body dropped before completion, recording what was sent");
            self.complete();
        }
    }
}

fn record_stream(body: Body, recorder: ResponseRecorder) -> Body {
    let state: (BodyDataStream, ResponseRecorder) = (body.into_data_stream(), recorder);
    let tee = stream::unfold(state, |(mut data, mut recorder)| async move {
        match data.next().await {
            Some(Ok(chunk)) => {
                recorder.observe(&chunk);
                Some((Ok(chunk), (data, recorder)))
            }
            Some(Err(e)) => {
                warn!("Failed to read response body for audit: {}", e);
                recorder.finish(CapturedBody::Unreadable);
                Some((Err(e), (data, recorder)))
            }
            None => {
                recorder.complete();
                None
            }
        }
    });
    Body::from_stream(tee)
}
