use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use gchat_api::mailer::{Mail, MailError, Mailer};
use gchat_api::rate_limit::{RateLimitConfig, RateLimiter};
use gchat_api::{AppState, AppStateInner, router};
use gchat_db::{Database, Store};

#[derive(Default)]
struct CapturingMailer {
    sent: Mutex<Vec<Mail>>,
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

struct TestApp {
    app: Router,
    state: AppState,
    mailer: Arc<CapturingMailer>,
    _dir: tempfile::TempDir,
}

struct Reply {
    status: StatusCode,
    headers: axum::http::HeaderMap,
    body: Value,
}

impl TestApp {
    fn new() -> Self {
        Self::with_limiter(RateLimiter::disabled())
    }

    fn with_limiter(limiter: RateLimiter) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("gchat.db")).unwrap();
        let mailer = Arc::new(CapturingMailer::default());
        let state = Arc::new(AppStateInner {
            store: Store::new(db, Store::DEFAULT_TIMEOUT),
            mailer: mailer.clone(),
            limiter,
            tasks: TaskTracker::new(),
        });

        Self {
            app: router(state.clone()),
            state,
            mailer,
            _dir: dir,
        }
    }

    async fn send(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        Reply { status, headers, body }
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> Reply {
        self.send(Method::GET, uri, token, None).await
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> Reply {
        self.send(Method::POST, uri, token, Some(body)).await
    }

    /// Wait for background mail and return the last activation token sent.
    async fn activation_token(&self) -> String {
        self.state.tasks.close();
        self.state.tasks.wait().await;
        self.state.tasks.reopen();

        let sent = self.mailer.sent.lock().unwrap();
        let body = &sent.last().expect("no mail sent").body;
        let start = body.find("{\"token\": \"").expect("token in mail") + "{\"token\": \"".len();
        body[start..start + 26].to_string()
    }

    async fn register(&self, name: &str) -> (String, String) {
        let reply = self
            .post(
                "/api/v1/users",
                None,
                json!({
                    "username": name,
                    "email": format!("{name}@example.com"),
                    "password": "pa55word-long",
                }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);
        let id = reply.body["user"]["id"].as_str().unwrap().to_string();
        (id, self.activation_token().await)
    }

    async fn login(&self, name: &str) -> String {
        let reply = self
            .post(
                "/api/v1/auth/token",
                None,
                json!({ "email": format!("{name}@example.com"), "password": "pa55word-long" }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);
        reply.body["token"].as_str().unwrap().to_string()
    }

    /// Register, activate and log in. Returns (user id, access token).
    async fn activated_user(&self, name: &str) -> (String, String) {
        let (id, activation) = self.register(name).await;
        let reply = self
            .post("/api/v1/users/account/activate", None, json!({ "token": activation }))
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{:?}", reply.body);
        (id, self.login(name).await)
    }
}

#[tokio::test]
async fn healthcheck_is_public() {
    let app = TestApp::new();
    let reply = app.get("/api/v1/healthcheck", None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, Value::String("OK".into()));
}

#[tokio::test]
async fn registration_and_activation() {
    let app = TestApp::new();
    let (id, activation) = app.register("alice").await;
    assert_eq!(activation.len(), 26);

    let reply = app
        .post("/api/v1/users/account/activate", None, json!({ "token": activation }))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["user"]["id"], id.as_str());
    assert_eq!(reply.body["user"]["is_active"], true);

    // Activation tokens are single use.
    let reply = app
        .post("/api/v1/users/account/activate", None, json!({ "token": activation }))
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["error"]["token"].is_string());
}

#[tokio::test]
async fn registration_reports_field_errors() {
    let app = TestApp::new();
    app.register("alice").await;

    let reply = app
        .post(
            "/api/v1/users",
            None,
            json!({ "username": "alice2", "email": "alice@example.com", "password": "pa55word-long" }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        reply.body["error"]["email"],
        "a user with this email address already exists"
    );

    let reply = app
        .post(
            "/api/v1/users",
            None,
            json!({ "username": "x", "email": "nope", "password": "short" }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    for field in ["username", "email", "password"] {
        assert!(reply.body["error"][field].is_string(), "missing error for {field}");
    }

    let reply = app
        .post("/api/v1/users", None, json!({ "username": "bob", "unexpected": 1 }))
        .await;
    assert!(reply.status.is_client_error());
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let app = TestApp::new();
    app.register("alice").await;

    let reply = app
        .post(
            "/api/v1/auth/token",
            None,
            json!({ "email": "alice@example.com", "password": "not-the-password" }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = app
        .post(
            "/api/v1/auth/token",
            None,
            json!({ "email": "nobody@example.com", "password": "pa55word-long" }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_routes_gate_on_identity() {
    let app = TestApp::new();

    let reply = app.get("/api/v1/conversations", None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let reply = app.get("/api/v1/conversations", Some("ABCDEFGHIJKLMNOPQRSTUVWXYZ")).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.headers[header::WWW_AUTHENTICATE], "Bearer");

    let reply = app.get("/api/v1/conversations", Some("too-short")).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    // Registered but never activated.
    app.register("idle").await;
    let token = app.login("idle").await;
    let reply = app.get("/api/v1/conversations", Some(&token)).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn private_messaging_flow() {
    let app = TestApp::new();
    let (alice_id, alice) = app.activated_user("alice").await;
    let (bob_id, bob) = app.activated_user("bob").await;

    let to_bob = format!("/api/v1/conversations/private/{bob_id}/messages");
    let to_alice = format!("/api/v1/conversations/private/{alice_id}/messages");

    // No history yet reads as an empty page.
    let reply = app.get(&to_bob, Some(&alice)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["messages"], json!([]));
    assert_eq!(reply.body["metadata"]["last_page"], 1);

    let reply = app
        .post(&to_bob, Some(&alice), json!({ "type": "text", "content": "hi bob" }))
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);
    let first_id = reply.body["message"]["id"].as_str().unwrap().to_string();

    let reply = app
        .post(
            &to_alice,
            Some(&bob),
            json!({ "type": "text", "content": "hi alice", "replied_message_id": first_id }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);

    let reply = app.get(&to_bob, Some(&alice)).await;
    assert_eq!(reply.body["metadata"]["total_records"], 2);
    assert_eq!(reply.body["messages"][0]["content"], "hi alice");
    assert_eq!(reply.body["messages"][0]["replied_message"]["id"], first_id.as_str());

    let reply = app
        .post(&to_bob, Some(&alice), json!({ "type": "text", "content": "a".repeat(501) }))
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["error"]["content"].is_string());

    let reply = app
        .post(&to_bob, Some(&alice), json!({ "type": "sticker", "content": "hi" }))
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["error"]["type"].is_string());

    let reply = app
        .post(
            &format!("/api/v1/conversations/private/{alice_id}/messages"),
            Some(&alice),
            json!({ "type": "text", "content": "me" }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);

    // Both sides list the same single conversation.
    let reply = app.get("/api/v1/conversations", Some(&bob)).await;
    assert_eq!(reply.body["metadata"]["total_records"], 1);
    assert_eq!(reply.body["conversations"][0]["peer_id"], alice_id.as_str());
    assert_eq!(reply.body["conversations"][0]["last_message"]["content"], "hi alice");
}

#[tokio::test]
async fn rejected_first_message_opens_no_conversation() {
    let app = TestApp::new();
    let (alice_id, alice) = app.activated_user("alice").await;
    let (bob_id, bob) = app.activated_user("bob").await;
    let to_bob = format!("/api/v1/conversations/private/{bob_id}/messages");

    let reply = app
        .post(&to_bob, Some(&alice), json!({ "type": "sticker", "content": "hi" }))
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);

    let reply = app
        .post(&to_bob, Some(&alice), json!({ "type": "text", "content": "a".repeat(501) }))
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);

    // A reply with no history to point into.
    let reply = app
        .post(
            &to_bob,
            Some(&alice),
            json!({ "type": "text", "content": "re", "replied_message_id": alice_id }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["error"]["replied_message_id"].is_string());

    for token in [&alice, &bob] {
        let reply = app.get("/api/v1/conversations", Some(token.as_str())).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["conversations"], json!([]));
        assert_eq!(reply.body["metadata"]["total_records"], 0);
    }
}

#[tokio::test]
async fn sent_message_reads_back_unchanged() {
    let app = TestApp::new();
    let (_, alice) = app.activated_user("alice").await;
    let (bob_id, _) = app.activated_user("bob").await;
    let to_bob = format!("/api/v1/conversations/private/{bob_id}/messages");

    let sent = app
        .post(&to_bob, Some(&alice), json!({ "type": "text", "content": "hello" }))
        .await;
    assert_eq!(sent.status, StatusCode::CREATED);

    let listed = app.get(&to_bob, Some(&alice)).await;
    assert_eq!(listed.body["messages"][0]["id"], sent.body["message"]["id"]);
    assert_eq!(listed.body["messages"][0]["created_at"], sent.body["message"]["created_at"]);
}

#[tokio::test]
async fn group_flow_and_access_control() {
    let app = TestApp::new();
    let (_, alice) = app.activated_user("alice").await;
    let (bob_id, bob) = app.activated_user("bob").await;
    let (carol_id, carol) = app.activated_user("carol").await;

    let reply = app
        .post("/api/v1/conversations/group", Some(&alice), json!({ "name": "climbing" }))
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);
    let group_id = reply.body["conversation"]["id"].as_str().unwrap().to_string();
    let participants = format!("/api/v1/conversations/group/{group_id}/participants");
    let messages = format!("/api/v1/conversations/group/{group_id}/messages");

    // Outsiders cannot tell the group exists.
    let reply = app.get(&messages, Some(&bob)).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    let reply = app.post(&participants, Some(&bob), json!({ "user_id": bob_id })).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let reply = app.post(&participants, Some(&alice), json!({ "user_id": bob_id })).await;
    assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);

    let reply = app.post(&participants, Some(&alice), json!({ "user_id": bob_id })).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(reply.body["error"]["user_id"], "user is already a participant");

    // Members who do not own the group may not add others.
    let reply = app.post(&participants, Some(&bob), json!({ "user_id": carol_id })).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);

    let reply = app
        .post(&messages, Some(&bob), json!({ "type": "text", "content": "hello group" }))
        .await;
    assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.body);

    let reply = app
        .post(&messages, Some(&carol), json!({ "type": "text", "content": "let me in" }))
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    let reply = app.get(&messages, Some(&alice)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["messages"][0]["sender"]["username"], "bob");
    assert_eq!(reply.body["metadata"]["total_records"], 1);

    let reply = app.get(&format!("{messages}?sort=-id"), Some(&alice)).await;
    assert_eq!(reply.status, StatusCode::OK);
    let reply = app.get(&format!("{messages}?sort=content"), Some(&alice)).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["error"]["sort"].is_string());
}

#[tokio::test]
async fn reply_must_stay_in_its_conversation() {
    let app = TestApp::new();
    let (_, alice) = app.activated_user("alice").await;
    let (bob_id, _) = app.activated_user("bob").await;

    let reply = app
        .post("/api/v1/conversations/group", Some(&alice), json!({ "name": "notes" }))
        .await;
    let group_id = reply.body["conversation"]["id"].as_str().unwrap().to_string();
    let reply = app
        .post(
            &format!("/api/v1/conversations/group/{group_id}/messages"),
            Some(&alice),
            json!({ "type": "text", "content": "group only" }),
        )
        .await;
    let group_message = reply.body["message"]["id"].as_str().unwrap().to_string();

    let reply = app
        .post(
            &format!("/api/v1/conversations/private/{bob_id}/messages"),
            Some(&alice),
            json!({ "type": "text", "content": "cross", "replied_message_id": group_message }),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["error"]["replied_message_id"].is_string());
}

#[tokio::test]
async fn pagination_bounds_are_validated() {
    let app = TestApp::new();
    let (_, alice) = app.activated_user("alice").await;

    let reply = app.get("/api/v1/conversations?page=0&page_size=101", Some(&alice)).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(reply.body["error"]["page"].is_string());
    assert!(reply.body["error"]["page_size"].is_string());

    let reply = app.get("/api/v1/conversations?page=2", Some(&alice)).await;
    assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);

    let reply = app.get("/api/v1/conversations", Some(&alice)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["metadata"]["total_records"], 0);
}

#[tokio::test]
async fn rate_limiter_refuses_bursts() {
    let app = TestApp::with_limiter(RateLimiter::new(RateLimitConfig {
        enabled: true,
        rps: 0.001,
        burst: 1,
    }));

    let request = || {
        Request::builder()
            .uri("/api/v1/healthcheck")
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::empty())
            .unwrap()
    };

    let first = app.app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let second = app.app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}
