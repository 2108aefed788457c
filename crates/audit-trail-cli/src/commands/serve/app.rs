//! Demo routes. `/users` is audited, `/health` is not.

use std::sync::{Arc, PoisonError, RwLock};

use audit_trail_core::{request_context, ContextHandle, ContextLayer};
use audit_trail_s3::{audit_inbound, AuditLogger, LogInbound};
use axum::{
    extract::State,
    middleware::from_fn_with_state,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub username: String,
}

#[derive(Clone, Default)]
struct UsersState {
    users: Arc<RwLock<Vec<User>>>,
}

pub fn build_router(logger: Arc<AuditLogger>, generate_correlation_id: bool) -> Router {
    let users = Router::new()
        .route("/users", get(list_users).post(create_user))
        .route_layer(from_fn_with_state(
            logger.log_inbound(LogInbound::default()),
            audit_inbound,
        ))
        .with_state(UsersState::default());

    Router::new()
        .route("/health", get(health))
        .merge(users)
        .layer(from_fn_with_state(
            ContextLayer {
                generate_correlation_id,
            },
            request_context,
        ))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_users(State(state): State<UsersState>) -> Json<Value> {
    let users = state
        .users
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    debug!("Listing {} users", users.len());
    Json(json!({ "Result": users }))
}

async fn create_user(
    State(state): State<UsersState>,
    context: Option<ContextHandle>,
    Json(new_user): Json<NewUser>,
) -> Json<Value> {
    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        name: new_user.name,
        username: new_user.username,
    };

    if let Some(context) = context {
        if let Err(e) = context.add_audit_only_field("userId", user.id.clone()) {
            debug!("Could not record userId on the audit context: {}", e);
        }
    }

    state
        .users
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(user.clone());
    debug!("Created user {}", user.id);

    Json(json!({ "Result": user }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_trail_s3::{AuditOptions, MemoryStore};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn running_logger(store: &MemoryStore) -> Arc<AuditLogger> {
        let logger = AuditLogger::new(AuditOptions::default(), Box::new(store.clone())).unwrap();
        logger.start().unwrap();
        Arc::new(logger)
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_list_users() {
        let store = MemoryStore::new();
        let logger = running_logger(&store);
        let app = build_router(Arc::clone(&logger), false);

        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/users")
                    .header("content-type", "application/json")
                    .header("k-correlation-id", "corr-1")
                    .body(Body::from(r#"{"name":"Name 1","username":"username1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        assert_eq!(created.headers()["k-correlation-id"], "corr-1");
        let created = json_body(created).await;
        let id = created["Result"]["id"].as_str().unwrap().to_string();

        let listed = app
            .oneshot(Request::builder().uri("/users").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = json_body(listed).await;
        assert_eq!(listed["Result"][0]["username"], json!("username1"));

        logger.stop().await;
        let records: Vec<Value> = store
            .objects()
            .iter()
            .map(|o| serde_json::from_slice(&o.body).unwrap())
            .collect();
        assert_eq!(records.len(), 4);
        assert_eq!(records[1]["userId"], json!(id));
        assert_eq!(records[1]["correlationId"], json!("corr-1"));
        assert_eq!(records[3]["requestMethod"], json!("GET"));
    }

    #[tokio::test]
    async fn test_health_is_not_audited() {
        let store = MemoryStore::new();
        let logger = running_logger(&store);

        let response = build_router(Arc::clone(&logger), true)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("k-correlation-id").is_some());

        logger.stop().await;
        assert_eq!(store.attempts(), 0);
    }
}
