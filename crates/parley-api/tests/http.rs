mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use parley_api::router;

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn sign_up(app: &Router, name: &str) -> (String, String) {
    let (status, body) = call(
        app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({
            "email": format!("{}@example.com", name.to_lowercase()),
            "password": "secret-pw",
            "name": name,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (
        body["token"].as_str().unwrap().to_string(),
        body["user"]["id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn health_is_public() {
    let app = router(common::app());
    let (status, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn protected_routes_need_a_live_token() {
    let app = router(common::app());

    let (status, body) = call(&app, Method::GET, "/chats", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthenticated");

    let (status, _) = call(&app, Method::GET, "/chats", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (token, _) = sign_up(&app, "Ann").await;
    let (status, body) = call(&app, Method::GET, "/users/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Ann");
    assert_eq!(body["status"], "online");

    let (status, _) = call(&app, Method::POST, "/auth/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::GET, "/users/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_errors_map_to_statuses() {
    let app = router(common::app());
    sign_up(&app, "Ann").await;

    let dup = json!({ "email": "ANN@example.com", "password": "secret-pw", "name": "Ann" });
    let (status, body) = call(&app, Method::POST, "/auth/register", None, Some(dup)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate_email");

    let bad = json!({ "email": "ann@example.com", "password": "nope-nope" });
    let (status, body) = call(&app, Method::POST, "/auth/login", None, Some(bad)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_credentials");

    let short = json!({ "email": "zed@example.com", "password": "123", "name": "Zed" });
    let (status, body) = call(&app, Method::POST, "/auth/register", None, Some(short)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");

    let good = json!({ "email": "ann@example.com", "password": "secret-pw" });
    let (status, body) = call(&app, Method::POST, "/auth/login", None, Some(good)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].is_string());
}

#[tokio::test]
async fn chat_and_message_flow() {
    let app = router(common::app());
    let (ann, _) = sign_up(&app, "Ann").await;
    let (bob, bob_id) = sign_up(&app, "Bob").await;
    let (eve, _) = sign_up(&app, "Eve").await;

    let create = json!({ "participant_id": bob_id });
    let (status, chat) = call(&app, Method::POST, "/chats", Some(&ann), Some(create.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let chat_id = chat["id"].as_str().unwrap().to_string();

    let (status, again) = call(&app, Method::POST, "/chats", Some(&ann), Some(create)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], chat["id"]);

    let messages = format!("/chats/{}/messages", chat_id);
    let (status, sent) = call(&app, Method::POST, &messages, Some(&ann), Some(json!({ "text": "hello" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["seq"], 1);
    assert_eq!(sent["is_edited"], false);

    let (status, body) = call(&app, Method::POST, &messages, Some(&eve), Some(json!({ "text": "hi" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let one = format!("/chats/{}/messages/{}", chat_id, sent["id"].as_str().unwrap());
    let (status, _) = call(&app, Method::PATCH, &one, Some(&bob), Some(json!({ "text": "nope" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, edited) = call(&app, Method::PATCH, &one, Some(&ann), Some(json!({ "text": "hello!" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["is_edited"], true);

    call(&app, Method::POST, &messages, Some(&bob), Some(json!({ "text": "hi back" }))).await;

    let (status, list) = call(&app, Method::GET, &format!("{}?after=1", messages), Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["text"], "hi back");

    let (_, chats) = call(&app, Method::GET, "/chats", Some(&bob), None).await;
    assert_eq!(chats[0]["last_message"], "hi back");

    let (status, _) = call(&app, Method::DELETE, &one, Some(&ann), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, &one, Some(&ann), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let chat_uri = format!("/chats/{}", chat_id);
    let (status, _) = call(&app, Method::DELETE, &chat_uri, Some(&eve), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, Method::DELETE, &chat_uri, Some(&bob), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::GET, &chat_uri, Some(&ann), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn users_search_and_lookup() {
    let app = router(common::app());
    let (ann, ann_id) = sign_up(&app, "Ann").await;
    sign_up(&app, "Bob").await;

    let (status, found) = call(&app, Method::GET, "/users/search?q=bo", Some(&ann), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["name"], "Bob");
    assert!(found[0].get("password").is_none());

    let (_, empty) = call(&app, Method::GET, "/users/search?q=", Some(&ann), None).await;
    assert_eq!(empty, json!([]));

    let (status, me) = call(&app, Method::GET, &format!("/users/{}", ann_id), Some(&ann), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], "ann@example.com");

    let (status, _) = call(
        &app,
        Method::GET,
        &format!("/users/{}", uuid::Uuid::new_v4()),
        Some(&ann),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, updated) = call(
        &app,
        Method::PATCH,
        "/users/me",
        Some(&ann),
        Some(json!({ "name": "Annabel", "avatar": "https://img.example/a.png" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "Annabel");
    assert_eq!(updated["avatar"], "https://img.example/a.png");
}

#[tokio::test]
async fn malformed_requests_use_the_error_envelope() {
    let app = router(common::app());

    let (status, body) = call(&app, Method::POST, "/auth/register", None, Some(json!({ "email": "a@b.io" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");
    assert!(body["message"].as_str().unwrap().contains("password"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/login")
        .body(Body::from(r#"{"email":"a@b.io","password":"x"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "invalid_argument");

    let (token, _) = sign_up(&app, "Ann").await;
    let (status, body) = call(&app, Method::GET, "/chats/not-a-uuid", Some(&token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");

    let uri = format!("/chats/{}/messages?limit=abc", uuid::Uuid::new_v4());
    let (status, body) = call(&app, Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");
}
