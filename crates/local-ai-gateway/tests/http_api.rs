mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{harness, provider, service, Harness};
use local_ai_gateway::{build_router, AppState};

const BASE: &str = "/gateway/v0.1";

fn router(h: &Harness) -> axum::Router {
    build_router(AppState::new(h.dispatcher.clone()), BASE).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

// ===== Flavor routes =====

#[tokio::test]
async fn test_raw_ollama_route_returns_single_response() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"model":"m","message":{"role":"assistant","content":"pong"},"done":true}"#)
        .create_async()
        .await;
    let h = harness(
        vec![service("chat", "always_local", "local_chat", "")],
        vec![provider("local_chat", "chat", "local", "ollama", format!("{}/api/chat", server.url()))],
    );

    let response = router(&h)
        .oneshot(post("/api/chat", json!({"model": "m", "stream": false})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("pong"));
}

#[tokio::test]
async fn test_prefixed_openai_route_streams_sse() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(200)
        .with_header("content-type", "application/x-ndjson")
        .with_body(
            "{\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\"he\"},\"done\":false}\n\
             {\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\"llo\"},\"done\":true}\n",
        )
        .create_async()
        .await;
    let h = harness(
        vec![service("chat", "always_local", "local_chat", "")],
        vec![provider("local_chat", "chat", "local", "ollama", format!("{}/api/chat", server.url()))],
    );

    let response = router(&h)
        .oneshot(post(
            &format!("{}/api_flavors/openai/v1/chat/completions", BASE),
            json!({"model": "m", "stream": true, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let text = body_text(response).await;
    assert_eq!(text.matches("data: ").count(), 3);
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_upstream_error_status_is_forwarded() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/chat")
        .with_status(500)
        .with_body("engine exploded")
        .create_async()
        .await;
    let h = harness(
        vec![service("chat", "always_local", "local_chat", "")],
        vec![provider("local_chat", "chat", "local", "ollama", format!("{}/api/chat", server.url()))],
    );

    let response = router(&h)
        .oneshot(post(&format!("{}/services/chat", BASE), json!({"model": "m"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "engine exploded");
}

#[tokio::test]
async fn test_unconfigured_service_is_404() {
    let h = harness(vec![], vec![]);
    let response = router(&h)
        .oneshot(post("/api/chat", json!({"model": "m"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let v: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(v["error"].as_str().unwrap().contains("chat"));
}

// ===== Admin routes =====

#[tokio::test]
async fn test_health_and_model_states() {
    let h = harness(vec![], vec![]);
    let app = router(&h);

    let response = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let v: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(v["status"], "healthy");
    assert!(v["flavors"].as_array().unwrap().iter().any(|f| f == "gateway"));

    let response = app
        .oneshot(
            Request::get(format!("{}/models/states", BASE))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let v: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(v["queue"]["started"], true);
}

#[tokio::test]
async fn test_reload_builtin_and_unknown_flavor() {
    let h = harness(vec![], vec![]);
    let app = router(&h);

    let response = app
        .clone()
        .oneshot(post(&format!("{}/flavors/openai/reload", BASE), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(post(&format!("{}/flavors/klingon/reload", BASE), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unload_unknown_model_fails() {
    let h = harness(vec![], vec![]);
    let response = router(&h)
        .oneshot(post(&format!("{}/models/unload", BASE), json!({"model": "ghost"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unload_model_in_use_conflicts() {
    let local = provider("local_chat", "chat", "local", "ollama", "http://127.0.0.1:9/api/chat".to_string());
    let h = harness(vec![service("chat", "always_local", "local_chat", "")], vec![local.clone()]);
    let lease = h.manager.acquire(1, "m1", &local).await.unwrap();

    let response = router(&h)
        .oneshot(post(&format!("{}/models/unload", BASE), json!({"model": "m1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(h.engine.events(), vec!["load:m1"]);
    drop(lease);
}
