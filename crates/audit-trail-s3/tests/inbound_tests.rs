use std::sync::Arc;

use audit_trail_core::{request_context, ContextHandle, ContextLayer};
use audit_trail_s3::{audit_inbound, AuditLogger, AuditOptions, LogInbound, MemoryStore};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use tracing::debug;

async fn create_user(context: Option<ContextHandle>, Json(user): Json<Value>) -> Json<Value> {
    if let Some(context) = context {
        if let Err(e) = context.add_audit_only_field("userName", user["username"].clone()) {
            debug!("Could not record userName on the audit context: {}", e);
        }
    }
    Json(json!({ "Result": user }))
}

async fn health() -> &'static str {
    "ok"
}

fn app(logger: &Arc<AuditLogger>, options: LogInbound) -> Router {
    let audited = Router::new()
        .route("/users", post(create_user))
        .route_layer(from_fn_with_state(logger.log_inbound(options), audit_inbound));

    Router::new()
        .route("/health", get(health))
        .merge(audited)
        .layer(from_fn_with_state(ContextLayer::default(), request_context))
}

fn running_logger(store: &MemoryStore) -> Arc<AuditLogger> {
    let logger = AuditLogger::new(AuditOptions::default(), Box::new(store.clone())).unwrap();
    logger.start().unwrap();
    Arc::new(logger)
}

fn records(store: &MemoryStore) -> Vec<Value> {
    store
        .objects()
        .iter()
        .map(|o| serde_json::from_slice(&o.body).unwrap())
        .collect()
}

fn create_user_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/users")
        .header("host", "localhost:8000")
        .header("content-type", "application/json")
        .header("k-correlation-id", "corr-123")
        .header("k-logged-fields", r#"{"tenant":"acme"}"#)
        .body(Body::from(r#"{"name":"Name 1","username":"username1"}"#))
        .unwrap()
}

#[tokio::test]
async fn test_post_users_writes_request_and_response_records() {
    let store = MemoryStore::new();
    let logger = running_logger(&store);
    let options = LogInbound::default().include_request_in_response(true);

    let response = app(&logger, options)
        .oneshot(create_user_request())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["k-correlation-id"], "corr-123");
    assert_eq!(response.headers()["k-logged-fields"], r#"{"tenant":"acme"}"#);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["Result"]["username"], json!("username1"));

    logger.stop().await;
    let records = records(&store);
    assert_eq!(records.len(), 2);

    let request = &records[0];
    assert_eq!(request["method"], json!("POST"));
    assert_eq!(request["path"], json!("/users"));
    assert_eq!(request["host"], json!("localhost:8000"));
    assert_eq!(request["hostname"], json!("http://localhost:8000/"));
    assert_eq!(
        request["body"],
        json!({"name": "Name 1", "username": "username1"})
    );
    assert_eq!(request["correlationId"], json!("corr-123"));
    assert_eq!(request["tenant"], json!("acme"));
    assert!(request.get("userName").is_none());
    assert!(request["identifier"]
        .as_str()
        .unwrap()
        .starts_with("in/users/POST/request_"));

    let response = &records[1];
    assert_eq!(response["statusCode"], json!(200));
    assert_eq!(response["status"], json!("200 OK"));
    assert_eq!(response["requestMethod"], json!("POST"));
    assert_eq!(response["requestPath"], json!("/users"));
    assert_eq!(
        response["requestBody"],
        json!({"name": "Name 1", "username": "username1"})
    );
    assert!(response["requestTimestamp"].is_string());
    assert_eq!(response["body"]["Result"]["name"], json!("Name 1"));
    assert_eq!(response["correlationId"], json!("corr-123"));
    // fields added by the handler only reach the response record
    assert_eq!(response["userName"], json!("username1"));
    assert!(response["identifier"]
        .as_str()
        .unwrap()
        .starts_with("in/users/POST/response_"));
}

#[tokio::test]
async fn test_missing_correlation_header_is_not_invented() {
    let store = MemoryStore::new();
    let logger = running_logger(&store);

    let response = app(&logger, LogInbound::default())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/users")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"Name 2","username":"username2"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("k-correlation-id").is_none());
    assert!(response.headers().get("k-instruction-set").is_none());
    assert!(response.headers().get("k-logged-fields").is_none());

    logger.stop().await;
    for record in records(&store) {
        assert!(record.get("correlationId").is_none());
    }
}

#[tokio::test]
async fn test_unaudited_route_writes_nothing() {
    let store = MemoryStore::new();
    let logger = running_logger(&store);

    let response = app(&logger, LogInbound::default())
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("k-correlation-id", "corr-health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["k-correlation-id"], "corr-health");

    logger.stop().await;
    assert_eq!(store.attempts(), 0);
}

#[tokio::test]
async fn test_request_only_logging() {
    let store = MemoryStore::new();
    let logger = running_logger(&store);
    let options = LogInbound::default().log_response(false);

    app(&logger, options)
        .oneshot(create_user_request())
        .await
        .unwrap();

    logger.stop().await;
    let records = records(&store);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["method"], json!("POST"));
}
