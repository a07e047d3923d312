use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use guildhall_api::auth::create_token;
use guildhall_api::{AppStateInner, router};
use guildhall_db::Database;
use guildhall_engine::clock::SystemClock;
use guildhall_engine::matchmaking::MatchmakingPolicy;
use guildhall_engine::sink::MemorySink;
use guildhall_engine::{EngineConfig, Engines};

const SECRET: &str = "test-secret";

struct TestApp {
    app: Router,
    engines: Arc<Engines>,
    sink: MemorySink,
}

fn app() -> TestApp {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let sink = MemorySink::new();
    let config = EngineConfig {
        matchmaking: MatchmakingPolicy {
            award_chance: 0,
            ..MatchmakingPolicy::default()
        },
        ..EngineConfig::default()
    };
    let engines = Arc::new(Engines::new(
        db.clone(),
        Arc::new(SystemClock),
        Arc::new(sink.clone()),
        config,
    ));
    let state = Arc::new(AppStateInner {
        db,
        engines: engines.clone(),
        jwt_secret: SECRET.into(),
        contact_interface: "gateway".into(),
    });
    TestApp {
        app: router(state),
        engines,
        sink,
    }
}

struct Caller {
    id: Uuid,
    token: String,
}

fn caller(name: &str, roles: &[&str]) -> Caller {
    let id = Uuid::new_v4();
    let token = create_token(SECRET, id, name, roles, Duration::hours(1)).unwrap();
    Caller { id, token }
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    who: &Caller,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", who.token));
    let body = match body {
        Some(v) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn requests_without_a_valid_token_are_rejected() {
    let t = app();
    let req = Request::builder().uri("/wallet").body(Body::empty()).unwrap();
    let response = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = Caller {
        id: Uuid::new_v4(),
        token: create_token("wrong", Uuid::new_v4(), "eve", &[], Duration::hours(1)).unwrap(),
    };
    let (status, _) = call(&t.app, "GET", "/wallet", &forged, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn grant_and_transfer_move_tokens() {
    let t = app();
    let banker = caller("bank", &["banker"]);
    let alice = caller("alice", &[]);
    let bob = caller("bob", &[]);
    // register bob
    call(&t.app, "GET", "/wallet", &bob, None).await;

    let (status, body) = call(
        &t.app,
        "POST",
        "/wallet/grant",
        &alice,
        Some(json!({ "user_id": alice.id, "delta": 10, "reason": "self" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "unauthorised");

    call(&t.app, "GET", "/wallet", &alice, None).await;
    let (status, _) = call(
        &t.app,
        "POST",
        "/wallet/grant",
        &banker,
        Some(json!({ "user_id": alice.id, "delta": 10, "reason": "welcome" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(
        &t.app,
        "POST",
        "/wallet/transfer",
        &alice,
        Some(json!({ "to": bob.id, "amount": 4, "note": "lunch" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 6);
    assert_eq!(body["debit"]["reason"], "ceded to @bob: lunch");

    let (status, body) = call(
        &t.app,
        "POST",
        "/wallet/transfer",
        &alice,
        Some(json!({ "to": bob.id, "amount": 100 })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["kind"], "insufficient_funds");

    let (_, body) = call(&t.app, "GET", "/wallet/history?limit=5", &bob, None).await;
    assert_eq!(body["balance"], 4);
    assert_eq!(body["transactions"][0]["reason"], "received from @alice: lunch");
    t.engines.notifications_settled().await;
    assert!(
        t.sink
            .sent_to(&format!("user:{}", bob.id))
            .await
            .iter()
            .any(|m| m.contains("+4"))
    );
}

#[tokio::test]
async fn treasure_is_redeemed_once() {
    let t = app();
    let banker = caller("bank", &["banker"]);
    let alice = caller("alice", &[]);
    let bob = caller("bob", &[]);

    let (status, body) = call(
        &t.app,
        "POST",
        "/treasures",
        &banker,
        Some(json!({ "code": "gold-1", "value": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["code"], "GOLD-1");

    let (status, body) = call(&t.app, "POST", "/treasures/GOLD-1/redeem", &alice, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 7);

    let (status, body) = call(&t.app, "POST", "/treasures/gold-1/redeem", &bob, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "already_redeemed");

    let (status, _) = call(&t.app, "GET", "/treasures/NOPE", &bob, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = call(&t.app, "GET", "/treasures", &banker, None).await;
    assert_eq!(body["treasures"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn poll_lifecycle() {
    let t = app();
    let host = caller("host", &[]);
    let voter = caller("voter", &[]);

    let (status, poll) = call(
        &t.app,
        "POST",
        "/polls",
        &host,
        Some(json!({ "question": "Pizza?", "expires_at": Utc::now() + Duration::hours(1) })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = poll["id"].as_str().unwrap().to_string();

    let vote_uri = format!("/polls/{}/vote", id);
    let (_, body) = call(&t.app, "POST", &vote_uri, &voter, Some(json!({ "choice": "yes" }))).await;
    assert_eq!(body["changed"], true);
    let (_, body) = call(&t.app, "POST", &vote_uri, &voter, Some(json!({ "choice": "yes" }))).await;
    assert_eq!(body["changed"], false);

    let (status, _) = call(&t.app, "POST", &format!("/polls/{}/close", id), &voter, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = call(&t.app, "POST", &format!("/polls/{}/close", id), &host, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tally"]["yes"], 1);

    let (status, body) =
        call(&t.app, "POST", &vote_uri, &voter, Some(json!({ "choice": "no" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "poll_closed");

    let (status, _) = call(
        &t.app,
        "POST",
        &format!("/polls/{}/comments", id),
        &voter,
        Some(json!({ "mood": "positive", "text": "good call" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, body) = call(&t.app, "GET", &format!("/polls/{}", id), &voter, None).await;
    assert_eq!(body["state"], "closed");
    assert_eq!(body["comments"].as_array().unwrap().len(), 1);

    let (status, _) =
        call(&t.app, "POST", "/polls", &host, Some(json!({ "question": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lobby_can_be_cancelled_by_its_creator() {
    let t = app();
    let host = caller("host", &[]);
    let guest = caller("guest", &[]);

    let (status, event) = call(
        &t.app,
        "POST",
        "/events",
        &host,
        Some(json!({ "title": "Raid", "when": Utc::now() + Duration::hours(2) })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = event["id"].as_i64().unwrap();

    let respond_uri = format!("/events/{}/respond", id);
    let late = json!({ "choice": "late_short" });
    let (_, body) = call(&t.app, "POST", &respond_uri, &guest, Some(late)).await;
    assert_eq!(body["changed"], true);
    let (_, body) = call(&t.app, "GET", &format!("/events/{}", id), &guest, None).await;
    assert_eq!(body["responses"][0]["choice"], "late_short");

    let (status, _) = call(&t.app, "POST", &format!("/events/{}/cancel", id), &guest, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = call(&t.app, "POST", &format!("/events/{}/cancel", id), &host, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["phase"], "cancelled");

    let (status, body) =
        call(&t.app, "POST", &respond_uri, &guest, Some(json!({ "choice": "yes" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "event_closed");
    let (_, body) = call(&t.app, "GET", "/events", &guest, None).await;
    assert!(body.as_array().unwrap().is_empty());
    assert!(t.sink.sent_to("general").await[0].contains("has been cancelled"));

    let (status, body) = call(
        &t.app,
        "POST",
        "/events",
        &host,
        Some(json!({ "title": "Past", "when": Utc::now() - Duration::minutes(1) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}

#[tokio::test]
async fn reminders_are_listed_and_cancelled() {
    let t = app();
    let alice = caller("alice", &[]);
    let bob = caller("bob", &[]);

    let (status, body) = call(
        &t.app,
        "POST",
        "/reminders",
        &alice,
        Some(json!({
            "interface": "gateway",
            "target": "general",
            "fire_at": Utc::now() + Duration::hours(1),
            "text": "stand-up",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["reminder"]["id"].as_i64().unwrap();

    let (status, _) = call(
        &t.app,
        "POST",
        "/reminders",
        &alice,
        Some(json!({
            "interface": "gateway",
            "target": "general",
            "fire_at": Utc::now() + Duration::days(800),
            "text": "much later",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = call(&t.app, "GET", "/reminders", &alice, None).await;
    assert_eq!(body["reminders"].as_array().unwrap().len(), 1);

    let (status, _) = call(&t.app, "DELETE", &format!("/reminders/{}", id), &bob, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&t.app, "DELETE", &format!("/reminders/{}", id), &alice, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = call(&t.app, "GET", "/reminders", &alice, None).await;
    assert!(body["reminders"].as_array().unwrap().is_empty());
}
