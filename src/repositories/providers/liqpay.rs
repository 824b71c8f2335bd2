use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use serde_json::json;
use sha1::{Digest, Sha1};

use super::{read_json, PaymentGateway, WebhookError, WebhookEvent};
use crate::{
    models::payments::{
        Checkout, CheckoutOrder, CourseSelection, CustomerRef, OrderReference, PaymentProvider,
        PaymentState, PaymentSucceeded, ProviderPaymentStatus,
    },
    settings,
};

const API_VERSION: u8 = 3;

/// Form body LiqPay posts to `server_url`.
#[derive(Clone, Debug, Deserialize)]
pub struct LiqPayCallback {
    pub data: String,
    pub signature: String,
}

#[derive(Deserialize)]
struct LiqPayPayment {
    status: String,
    order_id: Option<String>,
    amount: Option<f64>,
    currency: Option<String>,
    customer: Option<String>,
    info: Option<String>,
}

impl LiqPayPayment {
    fn reference(&self) -> Option<OrderReference> {
        self.order_id.as_deref().and_then(|o| o.parse().ok())
    }

    fn amount_cents(&self) -> Option<i64> {
        self.amount.map(|a| (a * 100.0).round() as i64)
    }
}

/// `base64(sha1(private_key + data + private_key))`
pub fn signature(private_key: &str, data: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(private_key.as_bytes());
    hasher.update(data.as_bytes());
    hasher.update(private_key.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub fn encode_data(payload: &serde_json::Value) -> String {
    STANDARD.encode(payload.to_string())
}

pub fn verify_signature(private_key: &str, callback: &LiqPayCallback) -> Result<(), WebhookError> {
    if signature(private_key, &callback.data) != callback.signature {
        return Err(WebhookError::Signature(
            "LiqPay signature mismatch".to_string(),
        ));
    }
    Ok(())
}

/// Verifies and decodes a callback.
pub fn parse_callback(
    private_key: &str,
    callback: &LiqPayCallback,
) -> Result<WebhookEvent, WebhookError> {
    verify_signature(private_key, callback)?;

    let decoded = STANDARD
        .decode(callback.data.as_bytes())
        .map_err(|e| WebhookError::Payload(e.to_string()))?;
    let payment: LiqPayPayment =
        serde_json::from_slice(&decoded).map_err(|e| WebhookError::Payload(e.to_string()))?;

    if payment.status != "success" && payment.status != "sandbox" {
        return Ok(WebhookEvent::Ignored(format!(
            "payment status {}",
            payment.status
        )));
    }

    let Some(order_id) = payment.order_id.clone() else {
        return Ok(WebhookEvent::Ignored("callback without order_id".to_string()));
    };
    let reference = payment.reference();
    let (customer, course) = match (&reference, &payment.customer) {
        (Some(reference), _) => (
            CustomerRef::UserId(reference.user_id.clone()),
            reference.course,
        ),
        (None, Some(customer)) => (
            CustomerRef::UserId(customer.clone()),
            payment
                .info
                .as_deref()
                .and_then(|i| i.parse().ok())
                .unwrap_or(CourseSelection::All),
        ),
        (None, None) => {
            return Ok(WebhookEvent::Ignored(
                "callback carries no customer".to_string(),
            ))
        }
    };

    Ok(WebhookEvent::Succeeded(PaymentSucceeded {
        provider: PaymentProvider::LiqPay,
        external_id: order_id,
        customer,
        course,
        amount_cents: payment.amount_cents().unwrap_or_default(),
        currency: payment.currency.unwrap_or_default(),
    }))
}

pub struct LiqPayApi {
    config: settings::LiqPay,
    client: reqwest::Client,
}

impl LiqPayApi {
    pub fn new(config: settings::LiqPay) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn checkout_payload(&self, order: &CheckoutOrder) -> serde_json::Value {
        json!({
            "version": API_VERSION,
            "public_key": self.config.public_key,
            "action": "pay",
            "amount": order.amount_cents as f64 / 100.0,
            "currency": self.config.currency,
            "description": order.description,
            "order_id": order.reference.to_string(),
            "customer": order.reference.user_id,
            "info": order.reference.course.to_string(),
            "result_url": order.success_url,
            "server_url": self.config.server_url,
        })
    }
}

#[async_trait]
impl PaymentGateway for LiqPayApi {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::LiqPay
    }

    fn currency(&self) -> &str {
        &self.config.currency
    }

    /// LiqPay checkouts are a signed redirect; nothing is sent until the payer opens it.
    async fn create_checkout(&self, order: &CheckoutOrder) -> Result<Checkout, anyhow::Error> {
        let data = encode_data(&self.checkout_payload(order));
        let signature = signature(&self.config.private_key, &data);

        let redirect_url = reqwest::Url::parse_with_params(
            &format!("{}/api/3/checkout", self.config.api_url),
            &[("data", data.as_str()), ("signature", signature.as_str())],
        )?;

        Ok(Checkout {
            provider: PaymentProvider::LiqPay,
            external_id: order.reference.to_string(),
            redirect_url: redirect_url.to_string(),
        })
    }

    async fn payment_status(
        &self,
        external_id: &str,
    ) -> Result<ProviderPaymentStatus, anyhow::Error> {
        let data = encode_data(&json!({
            "version": API_VERSION,
            "public_key": self.config.public_key,
            "action": "status",
            "order_id": external_id,
        }));
        let signature = signature(&self.config.private_key, &data);

        let response = self
            .client
            .post(format!("{}/api/request", self.config.api_url))
            .form(&[("data", data), ("signature", signature)])
            .send()
            .await?;
        let payment: LiqPayPayment = read_json(PaymentProvider::LiqPay, response).await?;

        let state = match payment.status.as_str() {
            "success" | "sandbox" => PaymentState::Succeeded,
            "failure" | "error" | "reversed" => PaymentState::Failed,
            _ => PaymentState::Pending,
        };

        Ok(ProviderPaymentStatus {
            state,
            reference: payment.reference(),
            amount_cents: payment.amount_cents(),
            currency: payment.currency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_KEY: &str = "sandbox_private";

    fn callback(payload: serde_json::Value, private_key: &str) -> LiqPayCallback {
        let data = encode_data(&payload);
        LiqPayCallback {
            signature: signature(private_key, &data),
            data,
        }
    }

    #[test]
    fn signature_matches_reference_construction() {
        assert_eq!(signature("a", "b"), "TV7M+Tc5xjBar4lppoLMV+H9c5U=");
    }

    #[test]
    fn successful_callback_is_reconciled_by_order_reference() {
        let callback = callback(
            json!({
                "status": "success",
                "order_id": "user-7:3:abc",
                "amount": 49.0,
                "currency": "UAH"
            }),
            PRIVATE_KEY,
        );

        let WebhookEvent::Succeeded(event) = parse_callback(PRIVATE_KEY, &callback).unwrap()
        else {
            panic!("expected a payment");
        };
        assert_eq!(event.external_id, "user-7:3:abc");
        assert_eq!(event.customer, CustomerRef::UserId("user-7".to_string()));
        assert_eq!(event.course, CourseSelection::Course(3));
        assert_eq!(event.amount_cents, 4900);
    }

    #[test]
    fn forged_callback_is_rejected() {
        let forged = callback(json!({"status": "success"}), "someone-else");

        assert!(matches!(
            parse_callback(PRIVATE_KEY, &forged),
            Err(WebhookError::Signature(_))
        ));
    }

    #[test]
    fn failed_payments_are_ignored() {
        let callback = callback(
            json!({"status": "failure", "order_id": "user-7:3:abc"}),
            PRIVATE_KEY,
        );

        assert!(matches!(
            parse_callback(PRIVATE_KEY, &callback).unwrap(),
            WebhookEvent::Ignored(_)
        ));
    }
}
