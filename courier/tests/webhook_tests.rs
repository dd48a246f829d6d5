use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};

use courier::events::DispatchEventKind;
use courier::{
    ChannelConfig, ChannelContext, EntityRecord, Error, Notifiable, Notification, NotificationManager,
};

#[derive(Clone)]
struct Hook {
    status: StatusCode,
    received: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    agents: Arc<Mutex<Vec<Option<String>>>>,
}

async fn receive(State(hook): State<Hook>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let authorization = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let agent = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    hook.agents.lock().push(agent);
    hook.received.lock().push((authorization, body));
    (hook.status, Json(json!({"accepted": hook.status.is_success()})))
}

/// Start a receiver answering with `status`; returns its URL.
async fn start_receiver(status: StatusCode) -> (String, Hook) {
    let hook = Hook {
        status,
        received: Arc::new(Mutex::new(Vec::new())),
        agents: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(hook.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/hook", addr), hook)
}

struct Deployed;

impl Notification for Deployed {
    fn via(&self, _notifiable: &Notifiable) -> Vec<String> {
        vec!["webhook".to_string()]
    }

    fn to_channel(&self, _notifiable: &Notifiable, channel: &str) -> Option<Value> {
        (channel == "webhook").then(|| json!({"version": "1.4.2"}))
    }
}

fn manager_for(url: &str, token: &str) -> NotificationManager {
    let manager = NotificationManager::default();
    manager
        .set_config(
            "webhook",
            ChannelConfig::new()
                .class("webhook")
                .setting("url", url)
                .setting("auth", json!({"type": "Bearer", "token": token})),
        )
        .unwrap();
    manager
}

#[tokio::test]
async fn test_webhook_posts_payload() {
    let (url, hook) = start_receiver(StatusCode::OK).await;
    let manager = manager_for(&url, "secret");

    let responses = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&responses);
    manager.events().listen(DispatchEventKind::Sent, move |event| {
        seen.lock().push(event.response().cloned());
    });

    manager
        .send_now(EntityRecord::new("Projects", "12"), Deployed)
        .await
        .unwrap();

    let received = hook.received.lock().clone();
    assert_eq!(received.len(), 1);
    let (authorization, body) = &received[0];
    assert_eq!(authorization.as_deref(), Some("Bearer secret"));
    assert_eq!(body["data"], json!({"version": "1.4.2"}));
    assert_eq!(body["notifiable"], json!({"model": "Projects", "key": "12"}));
    assert_eq!(body["locale"], "en");
    assert!(body["id"].is_string());

    let responses = responses.lock().clone();
    assert_eq!(
        responses,
        vec![Some(json!({"status": 200, "body": {"accepted": true}}))]
    );
}

#[tokio::test]
async fn test_webhook_error_response() {
    let (url, _hook) = start_receiver(StatusCode::BAD_GATEWAY).await;
    let manager = manager_for(&url, "secret");

    let err = manager
        .send_now(EntityRecord::new("Projects", "12"), Deployed)
        .await
        .unwrap_err();

    match err {
        Error::ServiceRespondedWithError { channel, response, .. } => {
            assert_eq!(channel, "webhook");
            assert_eq!(response["status"], 502);
            assert_eq!(response["body"], json!({"accepted": false}));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_webhook_route_wins_over_configured_url() {
    let (url, hook) = start_receiver(StatusCode::OK).await;
    let manager = manager_for("http://127.0.0.1:9/unused", "secret");

    let target = manager.route("webhook", url.as_str()).unwrap();
    manager.send_now(target, Deployed).await.unwrap();

    let received = hook.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1["notifiable"]["model"], "Anonymous");
    assert!(received[0].1["notifiable"]["key"].is_null());
}

#[tokio::test]
async fn test_webhook_missing_credential_and_route() {
    let manager = manager_for("", " ");
    let err = manager
        .send_now(EntityRecord::new("Projects", "1"), Deployed)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingRoutingInformation { .. }));

    let manager = manager_for("http://127.0.0.1:9/unused", " ");
    let err = manager
        .send_now(EntityRecord::new("Projects", "1"), Deployed)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingCredential { ref credential, .. } if credential == "token"));
}

#[tokio::test]
async fn test_webhook_uses_context_client() {
    let (url, hook) = start_receiver(StatusCode::OK).await;
    let client = reqwest::Client::builder()
        .user_agent("courier-tests/1.0")
        .build()
        .unwrap();
    let manager = NotificationManager::new(ChannelContext::default().with_http(client));
    manager
        .set_config(
            "webhook",
            ChannelConfig::new().class("webhook").setting("url", url.as_str()),
        )
        .unwrap();

    manager
        .send_now(EntityRecord::new("Projects", "3"), Deployed)
        .await
        .unwrap();

    assert_eq!(
        hook.agents.lock().clone(),
        vec![Some("courier-tests/1.0".to_string())]
    );
}

#[tokio::test]
async fn test_webhook_rejects_unknown_method() {
    let manager = NotificationManager::default();
    manager
        .set_config(
            "webhook",
            ChannelConfig::new()
                .class("webhook")
                .setting("url", "http://127.0.0.1:9/unused")
                .setting("method", "DELETE"),
        )
        .unwrap();

    let err = manager
        .send_now(EntityRecord::new("Projects", "3"), Deployed)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}
