use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use super::{ServiceChannels, ServiceError};
use crate::{models::users::Identity, repositories::identity::IdentityProvider, settings};

mod accounts;
mod payments;
mod withdrawals;

type ApiResponse = (StatusCode, Json<Value>);

/// Secrets needed to authenticate inbound provider notifications. A provider without
/// configuration has its webhook disabled.
#[derive(Clone, Debug, Default)]
pub struct WebhookConfig {
    pub stripe_secret: Option<String>,
    pub liqpay_private_key: Option<String>,
    pub monobank: bool,
    pub yookassa: bool,
}

impl WebhookConfig {
    pub fn from_settings(settings: &settings::Settings) -> Self {
        Self {
            stripe_secret: settings.stripe.as_ref().map(|s| s.webhook_secret.clone()),
            liqpay_private_key: settings.liqpay.as_ref().map(|l| l.private_key.clone()),
            monobank: settings.monobank.is_some(),
            yookassa: settings.yookassa.is_some(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<dyn IdentityProvider>,
    pub channels: ServiceChannels,
    pub webhooks: Arc<WebhookConfig>,
}

/// Identity of the caller behind the `Authorization: Bearer` header.
pub struct Caller(pub Identity);

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiResponse;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| error_response(ServiceError::Unauthorized))?;

        match state.identity.authenticate(token).await {
            Ok(Some(identity)) => Ok(Caller(identity)),
            Ok(None) => Err(error_response(ServiceError::Unauthorized)),
            Err(e) => Err(error_response(ServiceError::Upstream(
                "IdentityProvider".to_string(),
                e.to_string(),
            ))),
        }
    }
}

pub fn error_response(error: ServiceError) -> ApiResponse {
    let (status, kind) = match &error {
        ServiceError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        ServiceError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
        ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        ServiceError::ProviderDisabled(_) => (StatusCode::NOT_FOUND, "provider_disabled"),
        ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
        ServiceError::BelowMinimum { .. } => (StatusCode::BAD_REQUEST, "below_minimum"),
        ServiceError::InsufficientBalance { .. } => {
            (StatusCode::BAD_REQUEST, "insufficient_balance")
        }
        ServiceError::SignatureInvalid(_) => (StatusCode::BAD_REQUEST, "signature_invalid"),
        ServiceError::AlreadyProcessed(_) => (StatusCode::CONFLICT, "already_processed"),
        ServiceError::UpdateFailed(_)
        | ServiceError::Upstream(_, _)
        | ServiceError::Communication(_, _) => {
            log::error!("Request failed: {}", error);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "description": "Internal server error."
                })),
            );
        }
    };

    (
        status,
        Json(json!({
            "error": kind,
            "description": error.to_string()
        })),
    )
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, ServiceError>) -> ApiResponse {
    match result {
        Ok(body) => (status, Json(json!(body))),
        Err(e) => error_response(e),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(
            "/users/me",
            post(accounts::ensure_account).get(accounts::get_account),
        )
        .route("/referrals", get(accounts::get_referrals))
        .route(
            "/withdraw",
            post(withdrawals::request_withdrawal).get(withdrawals::list_withdrawals),
        )
        .route(
            "/admin/withdrawals",
            get(withdrawals::admin_list_withdrawals).patch(withdrawals::admin_decide_withdrawal),
        )
        .route("/checkout", post(payments::create_checkout))
        .route(
            "/payments/{provider}/{external_id}/status",
            get(payments::payment_status),
        )
        .route("/webhooks/stripe", post(payments::stripe_webhook))
        .route("/webhooks/liqpay", post(payments::liqpay_webhook))
        .route("/webhooks/monobank", post(payments::monobank_webhook))
        .route("/webhooks/yookassa", post(payments::yookassa_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(state: AppState, listen: &str) -> Result<(), anyhow::Error> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        models::{payments::PaymentProvider, users::Role},
        repositories::{
            identity::StaticIdentities,
            memory::MemoryLedgerStore,
            providers::{liqpay, stripe},
            LedgerStore,
        },
        services::{start_services, Policies},
    };

    const STRIPE_SECRET: &str = "whsec_test";
    const LIQPAY_KEY: &str = "liqpay_private_test";

    struct TestApp {
        app: Router,
        store: Arc<MemoryLedgerStore>,
    }

    fn test_app() -> TestApp {
        test_app_with(
            HashSet::new(),
            WebhookConfig {
                stripe_secret: Some(STRIPE_SECRET.to_string()),
                liqpay_private_key: Some(LIQPAY_KEY.to_string()),
                yookassa: true,
                ..Default::default()
            },
        )
    }

    fn test_app_with(log_only: HashSet<PaymentProvider>, webhooks: WebhookConfig) -> TestApp {
        let store = Arc::new(MemoryLedgerStore::new());
        let identities = StaticIdentities::new()
            .with("alice-token", "alice", "alice@example.com")
            .with("ops-token", "ops", "ops@example.com");

        let channels = start_services(
            store.clone(),
            HashMap::new(),
            Policies {
                withdrawals: settings::Withdrawals {
                    minimum_cents: 50_00,
                },
                referrals: settings::Referrals {
                    reward_cents: 10_00,
                },
                courses: settings::Courses {
                    catalog: vec![1, 2, 3, 4],
                    course_price_cents: 49_00,
                    all_courses_price_cents: 149_00,
                    success_url: "https://school.example/success".to_string(),
                    cancel_url: "https://school.example/cancel".to_string(),
                },
                log_only,
            },
        );

        let app = router(AppState {
            identity: Arc::new(identities),
            channels,
            webhooks: Arc::new(webhooks),
        });

        TestApp { app, store }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn authed(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn with_accounts(test: &TestApp) {
        for token in ["alice-token", "ops-token"] {
            let (status, _) = send(&test.app, authed("POST", "/users/me", token, json!({}))).await;
            assert_eq!(status, StatusCode::OK);
        }
        test.store
            .set_role("ops@example.com", Role::Admin)
            .await
            .unwrap();
        test.store.set_balance("alice", 100_00).unwrap();
    }

    #[tokio::test]
    async fn missing_or_unknown_token_is_unauthorized() {
        let test = test_app();

        let anonymous = Request::builder()
            .method("POST")
            .uri("/withdraw")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(&test.app, anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = send(&test.app, authed("GET", "/users/me", "stolen", json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn withdrawal_round_trip_over_http() {
        let test = test_app();
        with_accounts(&test).await;

        let (status, body) = send(
            &test.app,
            authed(
                "POST",
                "/withdraw",
                "alice-token",
                json!({
                    "amount": 60,
                    "paymentMethod": "paypal",
                    "paymentDetails": {"email": "alice@paypal.example"}
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "pending");
        let id = body["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &test.app,
            authed("GET", "/admin/withdrawals", "alice-token", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, listing) = send(
            &test.app,
            authed("GET", "/admin/withdrawals", "ops-token", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing[0]["user"]["balanceCents"], 40_00);

        let decision = json!({"id": id, "status": "rejected", "adminNotes": "wrong account"});
        let (status, body) = send(
            &test.app,
            authed("PATCH", "/admin/withdrawals", "ops-token", decision.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "rejected");

        let (status, body) = send(
            &test.app,
            authed("PATCH", "/admin/withdrawals", "ops-token", decision),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_processed");

        let (_, account) = send(&test.app, authed("GET", "/users/me", "alice-token", json!({}))).await;
        assert_eq!(account["balanceCents"], 100_00);
    }

    #[tokio::test]
    async fn withdrawal_errors_map_to_bad_request() {
        let test = test_app();
        with_accounts(&test).await;

        for (amount, kind) in [
            (json!(10), "below_minimum"),
            (json!("250.00"), "insufficient_balance"),
            (json!("abc"), "validation_error"),
        ] {
            let (status, body) = send(
                &test.app,
                authed(
                    "POST",
                    "/withdraw",
                    "alice-token",
                    json!({
                        "amount": amount,
                        "paymentMethod": "paypal",
                        "paymentDetails": {"email": "alice@paypal.example"}
                    }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], kind);
        }
    }

    fn stripe_completed(session_id: &str, reference: &str) -> Vec<u8> {
        let mut session = stripe::paid_session(session_id);
        session.client_reference_id = Some(reference.to_string());
        stripe::event_payload("checkout.session.completed", &session)
    }

    fn stripe_request(payload: Vec<u8>, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("Stripe-Signature", signature)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .unwrap()
    }

    #[tokio::test]
    async fn stripe_webhook_applies_once_and_rejects_bad_signatures() {
        let test = test_app();
        with_accounts(&test).await;
        let payload = stripe_completed("cs_test_1", "alice:2:n1");
        let now = chrono::Utc::now().timestamp();

        let forged = stripe_request(payload.clone(), &stripe::sign(&payload, "other", now));
        let (status, body) = send(&test.app, forged).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "signature_invalid");

        let signature = stripe::sign(&payload, STRIPE_SECRET, now);
        let (status, first) = send(&test.app, stripe_request(payload.clone(), &signature)).await;
        let (_, second) = send(&test.app, stripe_request(payload, &signature)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["result"], "granted");
        assert_eq!(second["result"], "duplicate");
        let alice = test.store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(alice.paid_courses, vec![2]);
        assert_eq!(test.store.payment_logs().len(), 1);
    }

    fn liqpay_request(data: &str, signature: &str) -> Request<Body> {
        let form = reqwest::Url::parse_with_params(
            "https://liqpay.example/callback",
            &[("data", data), ("signature", signature)],
        )
        .unwrap();

        Request::builder()
            .method("POST")
            .uri("/webhooks/liqpay")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.query().unwrap_or_default().to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn liqpay_form_callback_is_verified_then_applied() {
        let test = test_app();
        with_accounts(&test).await;
        let data = liqpay::encode_data(&json!({
            "status": "success",
            "order_id": "alice:3:n1",
            "amount": 49.0,
            "currency": "UAH"
        }));

        let forged = liqpay_request(&data, &liqpay::signature("other", &data));
        let (status, body) = send(&test.app, forged).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "signature_invalid");
        let alice = test.store.get_user("alice").await.unwrap().unwrap();
        assert!(alice.paid_courses.is_empty());

        let signed = liqpay_request(&data, &liqpay::signature(LIQPAY_KEY, &data));
        let (status, body) = send(&test.app, signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "granted");
        let alice = test.store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(alice.paid_courses, vec![3]);
        assert!(alice.has_paid);
    }

    #[tokio::test]
    async fn log_only_monobank_webhook_is_acknowledged_without_effect() {
        let test = test_app_with(
            HashSet::from([PaymentProvider::Monobank]),
            WebhookConfig {
                monobank: true,
                ..Default::default()
            },
        );
        with_accounts(&test).await;

        let notification = json!({
            "invoiceId": "p2_9ZgpZVsl3",
            "status": "success",
            "amount": 4900,
            "ccy": 980,
            "reference": "alice:1:n1"
        });
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/monobank")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(notification.to_string()))
            .unwrap();
        let (status, body) = send(&test.app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "ignored");
        let alice = test.store.get_user("alice").await.unwrap().unwrap();
        assert!(!alice.has_paid);
        assert!(alice.paid_courses.is_empty());
        assert!(test.store.payment_logs().is_empty());
    }

    #[tokio::test]
    async fn disabled_provider_webhook_is_not_found() {
        let test = test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/monobank")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(&test.app, request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "provider_disabled");
    }

    #[tokio::test]
    async fn yookassa_all_courses_makes_premium() {
        let test = test_app();
        with_accounts(&test).await;

        let notification = json!({
            "type": "notification",
            "event": "payment.succeeded",
            "object": {
                "id": "2c1d0f3a-000f-5000-8000-1a2b3c4d5e6f",
                "status": "succeeded",
                "amount": {"value": "149.00", "currency": "RUB"},
                "metadata": {"userId": "alice", "courseId": "all"}
            }
        });
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/yookassa")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(notification.to_string()))
            .unwrap();
        let (status, _) = send(&test.app, request).await;

        assert_eq!(status, StatusCode::OK);
        let alice = test.store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(alice.paid_courses, vec![1, 2, 3, 4]);
        assert_eq!(alice.subscription_status.as_deref(), Some("premium"));
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let test = test_app();

        let response = test
            .app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
