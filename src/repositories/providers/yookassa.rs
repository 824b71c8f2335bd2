use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{read_json, PaymentGateway, WebhookError, WebhookEvent};
use crate::{
    models::payments::{
        cents_to_decimal_str, decimal_str_to_cents, Checkout, CheckoutOrder, CourseSelection,
        CustomerRef, OrderReference, PaymentProvider, PaymentState, PaymentSucceeded,
        ProviderPaymentStatus,
    },
    settings,
};

#[derive(Deserialize)]
struct Notification {
    event: String,
    object: Payment,
}

#[derive(Deserialize)]
struct Amount {
    value: String,
    currency: String,
}

#[derive(Deserialize)]
struct Confirmation {
    confirmation_url: Option<String>,
}

#[derive(Deserialize)]
struct Payment {
    id: String,
    status: String,
    amount: Option<Amount>,
    confirmation: Option<Confirmation>,
    metadata: Option<HashMap<String, serde_json::Value>>,
}

impl Payment {
    fn metadata_str(&self, key: &str) -> Option<String> {
        match self.metadata.as_ref()?.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn reference(&self) -> Option<OrderReference> {
        self.metadata_str("reference").and_then(|r| r.parse().ok())
    }
}

/// Decodes a payment notification. YooKassa notifications are not signed here; the body
/// is trusted as delivered.
pub fn parse_notification(payload: &[u8]) -> Result<WebhookEvent, WebhookError> {
    let notification: Notification =
        serde_json::from_slice(payload).map_err(|e| WebhookError::Payload(e.to_string()))?;

    if notification.event != "payment.succeeded" {
        return Ok(WebhookEvent::Ignored(format!(
            "unhandled event {}",
            notification.event
        )));
    }

    let payment = notification.object;
    let (user_id, course) = match payment.reference() {
        Some(reference) => (Some(reference.user_id), Some(reference.course)),
        None => (
            payment.metadata_str("userId"),
            payment
                .metadata_str("courseId")
                .and_then(|c| c.parse::<CourseSelection>().ok()),
        ),
    };

    let (Some(user_id), Some(course)) = (user_id, course) else {
        return Ok(WebhookEvent::Ignored(format!(
            "payment {} has no user or course metadata",
            payment.id
        )));
    };

    let (amount_cents, currency) = payment
        .amount
        .as_ref()
        .map(|a| {
            (
                decimal_str_to_cents(&a.value).unwrap_or_default(),
                a.currency.clone(),
            )
        })
        .unwrap_or_default();

    Ok(WebhookEvent::Succeeded(PaymentSucceeded {
        provider: PaymentProvider::YooKassa,
        external_id: payment.id,
        customer: CustomerRef::UserId(user_id),
        course,
        amount_cents,
        currency,
    }))
}

pub struct YooKassaApi {
    config: settings::YooKassa,
    client: reqwest::Client,
}

impl YooKassaApi {
    pub fn new(config: settings::YooKassa) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PaymentGateway for YooKassaApi {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::YooKassa
    }

    fn currency(&self) -> &str {
        &self.config.currency
    }

    async fn create_checkout(&self, order: &CheckoutOrder) -> Result<Checkout, anyhow::Error> {
        let body = json!({
            "amount": {
                "value": cents_to_decimal_str(order.amount_cents),
                "currency": self.config.currency,
            },
            "capture": true,
            "confirmation": {
                "type": "redirect",
                "return_url": order.success_url,
            },
            "description": order.description,
            "metadata": {
                "reference": order.reference.to_string(),
                "userId": order.reference.user_id,
                "courseId": order.reference.course.to_string(),
            },
        });

        let response = self
            .client
            .post(format!("{}/v3/payments", self.config.api_url))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            .header("Idempotence-Key", &order.reference.nonce)
            .json(&body)
            .send()
            .await?;
        let payment: Payment = read_json(PaymentProvider::YooKassa, response).await?;

        let redirect_url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| anyhow::anyhow!("YooKassa: payment without confirmation url."))?;

        Ok(Checkout {
            provider: PaymentProvider::YooKassa,
            external_id: payment.id,
            redirect_url,
        })
    }

    async fn payment_status(
        &self,
        external_id: &str,
    ) -> Result<ProviderPaymentStatus, anyhow::Error> {
        let response = self
            .client
            .get(format!("{}/v3/payments/{}", self.config.api_url, external_id))
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key))
            .send()
            .await?;
        let payment: Payment = read_json(PaymentProvider::YooKassa, response).await?;

        let state = match payment.status.as_str() {
            "succeeded" => PaymentState::Succeeded,
            "canceled" => PaymentState::Failed,
            _ => PaymentState::Pending,
        };

        Ok(ProviderPaymentStatus {
            state,
            reference: payment.reference(),
            amount_cents: payment
                .amount
                .as_ref()
                .and_then(|a| decimal_str_to_cents(&a.value)),
            currency: payment.amount.as_ref().map(|a| a.currency.clone()),
        })
    }
}
