use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Form, Json,
};
use serde_json::json;

use super::{error_response, respond, ApiResponse, AppState, Caller};
use crate::{
    models::payments::{CheckoutBody, PaymentProvider, ReconciliationResult},
    repositories::providers::{liqpay, monobank, stripe, yookassa, WebhookError, WebhookEvent},
    services::{call, payments::PaymentRequest, ServiceError},
};

pub async fn create_checkout(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(body): Json<CheckoutBody>,
) -> impl IntoResponse {
    let result = call("PaymentService", &state.channels.payments, |response| {
        PaymentRequest::CreateCheckout {
            user_id: identity.user_id,
            provider: body.provider,
            course: body.course_id,
            response,
        }
    })
    .await;

    respond(StatusCode::CREATED, result)
}

pub async fn payment_status(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((provider, external_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let provider: PaymentProvider = match provider.parse() {
        Ok(provider) => provider,
        Err(e) => return error_response(ServiceError::Validation(e)),
    };

    let result = call("PaymentService", &state.channels.payments, |response| {
        PaymentRequest::PollStatus {
            user_id: identity.user_id,
            provider,
            external_id,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Bytes,
) -> impl IntoResponse {
    let Some(secret) = state.webhooks.stripe_secret.as_deref() else {
        return disabled(PaymentProvider::Stripe);
    };

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let event = stripe::construct_event(&payload, signature, secret);

    acknowledge(&state, PaymentProvider::Stripe, event).await
}

pub async fn liqpay_webhook(
    State(state): State<AppState>,
    Form(callback): Form<liqpay::LiqPayCallback>,
) -> impl IntoResponse {
    let Some(private_key) = state.webhooks.liqpay_private_key.as_deref() else {
        return disabled(PaymentProvider::LiqPay);
    };

    let event = liqpay::parse_callback(private_key, &callback);
    acknowledge(&state, PaymentProvider::LiqPay, event).await
}

pub async fn monobank_webhook(State(state): State<AppState>, payload: Bytes) -> impl IntoResponse {
    if !state.webhooks.monobank {
        return disabled(PaymentProvider::Monobank);
    }

    let event = monobank::parse_webhook(&payload);
    acknowledge(&state, PaymentProvider::Monobank, event).await
}

pub async fn yookassa_webhook(State(state): State<AppState>, payload: Bytes) -> impl IntoResponse {
    if !state.webhooks.yookassa {
        return disabled(PaymentProvider::YooKassa);
    }

    let event = yookassa::parse_notification(&payload);
    acknowledge(&state, PaymentProvider::YooKassa, event).await
}

fn disabled(provider: PaymentProvider) -> ApiResponse {
    error_response(ServiceError::ProviderDisabled(provider.to_string()))
}

/// Rejects notifications that fail authentication or decoding. Anything past that point is
/// acknowledged with 200 so the provider does not keep retrying, even when processing
/// fails.
async fn acknowledge(
    state: &AppState,
    provider: PaymentProvider,
    event: Result<WebhookEvent, WebhookError>,
) -> ApiResponse {
    let event = match event {
        Ok(WebhookEvent::Succeeded(event)) => event,
        Ok(WebhookEvent::Ignored(reason)) => {
            log::info!("Ignoring {} notification: {}", provider, reason);
            return (
                StatusCode::OK,
                Json(json!(ReconciliationResult::Ignored { reason })),
            );
        }
        Err(WebhookError::Signature(reason)) => {
            log::warn!("Rejected {} notification: {}", provider, reason);
            return error_response(ServiceError::SignatureInvalid(reason));
        }
        Err(WebhookError::Payload(reason)) => {
            log::warn!("Malformed {} notification: {}", provider, reason);
            return error_response(ServiceError::Validation(reason));
        }
    };

    let external_id = event.external_id.clone();
    let result = call("PaymentService", &state.channels.payments, |response| {
        PaymentRequest::Reconcile { event, response }
    })
    .await;

    match result {
        Ok(result) => (StatusCode::OK, Json(json!(result))),
        Err(e) => {
            log::error!(
                "Could not process {} notification {}: {}",
                provider,
                external_id,
                e
            );
            (StatusCode::OK, Json(json!({"received": true})))
        }
    }
}
