//! Shared fixtures

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use meshlink_core::test_utils::MockBroker;
use meshlink_ingest::{create_router, AppState, IngestConfig};
use std::sync::Arc;
use tower::ServiceExt;

pub const SECRET: &str = "hunter2";

pub struct Harness {
    pub broker: MockBroker,
    pub state: Arc<AppState>,
    pub config: IngestConfig,
}

impl Harness {
    pub fn new(secret: Option<&str>) -> Self {
        let mut config = IngestConfig::default();
        config.link.client_id = "meshlink-ingest-test".to_string();
        config.webhook_secret = secret.map(str::to_string);
        config.topics.chat_updates = "chat/updates".to_string();
        config.topics.status = "meshlink/status".to_string();

        let broker = MockBroker::new();
        let state = AppState::new(&config, broker.connector());
        Self {
            broker,
            state,
            config,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub async fn call(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }
}

pub fn webhook(body: &str, secret: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header("X-Telegram-Bot-Api-Secret-Token", secret);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
