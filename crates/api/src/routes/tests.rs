//! In-process route tests against the in-memory store

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use hmac::{Hmac, Mac};
use iva_shared::store::memory::business_fixture;
use iva_shared::MemoryStore;
use serde_json::{json, Value};
use sha2::Sha256;
use time::OffsetDateTime;
use tower::ServiceExt;

use super::{create_router, ACTIVE_BUSINESS_HEADER, CLIENT_TIMEZONE_HEADER};
use crate::{config::Config, state::AppState};

const WEBHOOK_SECRET: &str = "whsec_route_tests";

fn test_config(webhook_secret: Option<&str>) -> Config {
    let mut vars: HashMap<&str, String> = HashMap::from([
        ("DATABASE_URL", "postgres://localhost/iva_test".to_string()),
        ("AUTH_JWT_SECRET", "route-test-jwt-secret-0123456789".to_string()),
    ]);
    if let Some(secret) = webhook_secret {
        vars.insert("STRIPE_WEBHOOK_SECRET", secret.to_string());
    }
    Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

struct TestApp {
    router: Router,
    state: AppState,
    store: MemoryStore,
}

impl TestApp {
    fn new(webhook_secret: Option<&str>) -> Self {
        let store = MemoryStore::new();
        let state = AppState::new(Arc::new(store.clone()), test_config(webhook_secret));
        Self {
            router: create_router(state.clone()),
            state,
            store,
        }
    }

    fn token(&self, user_id: &str) -> String {
        self.state
            .auth
            .jwt_manager
            .generate_access_token(user_id, None)
            .unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get_businesses(&self, user_id: &str, timezone: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .uri("/api/businesses")
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)));
        if let Some(tz) = timezone {
            request = request.header(CLIENT_TIMEZONE_HEADER, tz);
        }
        self.send(request.body(Body::empty()).unwrap()).await
    }

    async fn post_webhook(&self, payload: Vec<u8>, signature: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/stripe/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            request = request.header("stripe-signature", signature);
        }
        self.send(request.body(Body::from(payload)).unwrap()).await
    }
}

fn sign(payload: &[u8]) -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn event(event_id: &str, event_type: &str, object: Value) -> Vec<u8> {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": object }
    })
    .to_string()
    .into_bytes()
}

// =============================================================================
// Tenant listing
// =============================================================================

#[tokio::test]
async fn test_listing_requires_authentication() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let (status, _) = app
        .send(
            Request::builder()
                .uri("/api/businesses")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(app.store.businesses().is_empty());
}

#[tokio::test]
async fn test_listing_creates_once_then_returns_existing() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));

    let (status, first) = app.get_businesses("u1", Some("America/New_York")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["created"], true);
    assert_eq!(first["userId"], "u1");
    assert_eq!(first["businesses"][0]["timezone"], "America/New_York");
    assert_eq!(first["activeBusinessId"], first["businesses"][0]["id"]);

    let (_, second) = app.get_businesses("u1", None).await;
    assert_eq!(second["created"], false);
    assert_eq!(second["businesses"].as_array().unwrap().len(), 1);
    assert_eq!(second["businesses"][0]["id"], first["businesses"][0]["id"]);
}

#[tokio::test]
async fn test_listing_honours_remembered_active_business() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let older = business_fixture(Some("u1"), "First");
    let mut newer = business_fixture(Some("u1"), "Second");
    newer.created_at = older.created_at + time::Duration::seconds(5);
    app.store.seed_business(older.clone());
    app.store.seed_business(newer.clone());

    let (_, body) = app
        .send(
            Request::builder()
                .uri("/api/businesses")
                .header(header::AUTHORIZATION, format!("Bearer {}", app.token("u1")))
                .header(ACTIVE_BUSINESS_HEADER, newer.id.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(body["activeBusinessId"], newer.id.to_string());

    let (_, body) = app
        .send(
            Request::builder()
                .uri("/api/businesses?active=not-a-uuid")
                .header(header::AUTHORIZATION, format!("Bearer {}", app.token("u1")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(body["activeBusinessId"], older.id.to_string());
}

#[tokio::test]
async fn test_listing_fails_closed_when_store_is_down() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    app.store.set_unavailable(true);

    let (status, body) = app.get_businesses("u1", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "tenant_unavailable");

    app.store.set_unavailable(false);
    assert!(app.store.businesses().is_empty());
}

// =============================================================================
// Manual creation
// =============================================================================

#[tokio::test]
async fn test_manual_create_is_idempotent() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let create = |name: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/api/businesses")
            .header(header::AUTHORIZATION, format!("Bearer {}", app.token("u1")))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "name": name }).to_string()))
            .unwrap()
    };

    let (status, body) = app.send(create("Studio Nova")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["businesses"][0]["name"], "Studio Nova");

    let (status, body) = app.send(create("Another")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], false);
    assert_eq!(app.store.businesses().len(), 1);
}

#[tokio::test]
async fn test_manual_create_rejects_blank_name() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let (status, body) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/api/businesses")
                .header(header::AUTHORIZATION, format!("Bearer {}", app.token("u1")))
                .body(Body::from(r#"{"name": "   "}"#))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(app.store.businesses().is_empty());
}

#[tokio::test]
async fn test_manual_create_accepts_empty_body() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let (status, body) = app
        .send(
            Request::builder()
                .method("POST")
                .uri("/api/businesses")
                .header(header::AUTHORIZATION, format!("Bearer {}", app.token("u1")))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["businesses"][0]["name"], "Můj nový salon");
}

// =============================================================================
// Subscription status
// =============================================================================

#[tokio::test]
async fn test_subscription_status_aggregates_and_never_creates() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let request = || {
        Request::builder()
            .uri("/api/subscription")
            .header(header::AUTHORIZATION, format!("Bearer {}", app.token("u1")))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = app.send(request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isSubscribed"], false);
    assert!(body["businesses"].as_array().unwrap().is_empty());
    assert!(app.store.businesses().is_empty());

    let free = business_fixture(Some("u1"), "Free");
    let mut paid = business_fixture(Some("u1"), "Paid");
    paid.subscription_status = iva_shared::SubscriptionStatus::Active;
    paid.is_subscribed = true;
    app.store.seed_business(free);
    app.store.seed_business(paid);

    let (_, body) = app.send(request()).await;
    assert_eq!(body["isSubscribed"], true);
    assert_eq!(body["businesses"].as_array().unwrap().len(), 2);
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn test_webhook_without_secret_is_rejected() {
    let app = TestApp::new(None);
    let payload = event("evt_nosecret", "invoice.paid", json!({}));

    let (status, _) = app.post_webhook(payload.clone(), Some(sign(&payload))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.store.payment_event_count(), 0);
}

#[tokio::test]
async fn test_webhook_with_bad_signature_is_rejected() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let payload = event("evt_badsig", "invoice.paid", json!({}));
    let mut tampered = payload.clone();
    tampered.extend_from_slice(b" ");

    let (status, body) = app.post_webhook(tampered, Some(sign(&payload))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "webhook_rejected");

    let (status, _) = app.post_webhook(payload, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.store.payment_event_count(), 0);
}

#[tokio::test]
async fn test_webhook_redelivery_is_acknowledged() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    let payload = event("evt_twice", "customer.created", json!({ "id": "cus_9" }));

    let (first, _) = app.post_webhook(payload.clone(), Some(sign(&payload))).await;
    let (second, body) = app.post_webhook(payload.clone(), Some(sign(&payload))).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert_eq!(app.store.payment_event_count(), 1);
}

#[tokio::test]
async fn test_webhook_store_outage_asks_for_redelivery() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));
    app.store.set_unavailable(true);
    let payload = event("evt_outage", "invoice.paid", json!({}));

    let (status, body) = app.post_webhook(payload.clone(), Some(sign(&payload))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "webhook_retry");

    app.store.set_unavailable(false);
    let (status, _) = app.post_webhook(payload.clone(), Some(sign(&payload))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.store.payment_event("evt_outage").is_some());
}

#[tokio::test]
async fn test_health_reflects_store_availability() {
    let app = TestApp::new(None);
    let health = || Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, body) = app.send(health()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    app.store.set_unavailable(true);
    let (status, _) = app.send(health()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// =============================================================================
// End to end: first visit, checkout, cancellation
// =============================================================================

#[tokio::test]
async fn test_first_visit_checkout_and_cancellation() {
    let app = TestApp::new(Some(WEBHOOK_SECRET));

    // First visit provisions the tenant
    let (status, body) = app.get_businesses("u1", Some("Europe/Prague")).await;
    assert_eq!(status, StatusCode::OK);
    let businesses = body["businesses"].as_array().unwrap();
    assert_eq!(businesses.len(), 1);
    assert_eq!(businesses[0]["timezone"], "Europe/Prague");
    assert_eq!(businesses[0]["isSubscribed"], false);
    let business_id = businesses[0]["id"].as_str().unwrap().to_string();

    // Checkout links the customer and activates the subscription
    let checkout = event(
        "evt_checkout",
        "checkout.session.completed",
        json!({
            "id": "cs_1",
            "object": "checkout.session",
            "customer": "cus_1",
            "subscription": "sub_1",
            "metadata": { "business_id": business_id }
        }),
    );
    let (status, _) = app.post_webhook(checkout.clone(), Some(sign(&checkout))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.get_businesses("u1", None).await;
    let business = &body["businesses"][0];
    assert_eq!(body["created"], false);
    assert_eq!(business["customerRef"], "cus_1");
    assert_eq!(business["subscriptionStatus"], "active");
    assert_eq!(business["isSubscribed"], true);

    // Deletion wins even though the object still says active
    let deleted = event(
        "evt_deleted",
        "customer.subscription.deleted",
        json!({
            "id": "sub_1",
            "object": "subscription",
            "customer": "cus_1",
            "status": "active"
        }),
    );
    let (status, _) = app.post_webhook(deleted.clone(), Some(sign(&deleted))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.get_businesses("u1", None).await;
    let business = &body["businesses"][0];
    assert_eq!(business["id"], business_id.as_str());
    assert_eq!(business["subscriptionStatus"], "canceled");
    assert_eq!(business["isSubscribed"], false);
    assert_eq!(business["customerRef"], "cus_1");

    // Replaying the checkout changes nothing
    let (status, _) = app.post_webhook(checkout.clone(), Some(sign(&checkout))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = app.get_businesses("u1", None).await;
    assert_eq!(body["businesses"][0]["subscriptionStatus"], "canceled");
}
