use std::collections::HashMap;

use ::stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus,
    CheckoutSessionStatus, Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    Currency, Event, EventObject, EventType, Webhook,
};
use async_trait::async_trait;

use super::{PaymentGateway, WebhookError, WebhookEvent};
use crate::{
    models::payments::{
        Checkout, CheckoutOrder, CourseSelection, CustomerRef, OrderReference, PaymentProvider,
        PaymentState, PaymentSucceeded, ProviderPaymentStatus,
    },
    settings,
};

/// Verifies the `Stripe-Signature` header against the raw body and decodes the event.
pub fn construct_event(
    payload: &[u8],
    signature: &str,
    secret: &str,
) -> Result<WebhookEvent, WebhookError> {
    let payload =
        std::str::from_utf8(payload).map_err(|e| WebhookError::Payload(e.to_string()))?;

    let event = Webhook::construct_event(payload, signature, secret).map_err(|e| match e {
        ::stripe::WebhookError::BadParse(e) => WebhookError::Payload(e.to_string()),
        other => WebhookError::Signature(other.to_string()),
    })?;

    Ok(from_event(event))
}

fn from_event(event: Event) -> WebhookEvent {
    match event.type_ {
        EventType::CheckoutSessionCompleted | EventType::CheckoutSessionAsyncPaymentSucceeded => {}
        other => return WebhookEvent::Ignored(format!("unhandled event {:?}", other)),
    }

    let EventObject::CheckoutSession(session) = event.data.object else {
        return WebhookEvent::Ignored("event without a checkout session".to_string());
    };

    match session.payment_status {
        CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired => {}
        other => return WebhookEvent::Ignored(format!("payment status {:?}", other)),
    }

    let reference = reference(&session);
    let email = session
        .customer_details
        .as_ref()
        .and_then(|d| d.email.clone())
        .or_else(|| session.customer_email.clone());
    let customer = match (&reference, email) {
        (Some(reference), _) => CustomerRef::UserId(reference.user_id.clone()),
        (None, Some(email)) => CustomerRef::Email(email),
        (None, None) => return WebhookEvent::Ignored("session carries no customer".to_string()),
    };
    let course = match &reference {
        Some(reference) => reference.course,
        None => session
            .metadata
            .as_ref()
            .and_then(|m| m.get("courseId"))
            .and_then(|c| c.parse().ok())
            .unwrap_or(CourseSelection::All),
    };

    WebhookEvent::Succeeded(PaymentSucceeded {
        provider: PaymentProvider::Stripe,
        external_id: session.id.to_string(),
        customer,
        course,
        amount_cents: session.amount_total.unwrap_or_default(),
        currency: session
            .currency
            .map(|c| c.to_string().to_uppercase())
            .unwrap_or_default(),
    })
}

fn reference(session: &CheckoutSession) -> Option<OrderReference> {
    session
        .client_reference_id
        .as_deref()
        .and_then(|r| r.parse().ok())
}

pub struct StripeApi {
    client: Client,
    currency: Currency,
    currency_code: String,
}

impl StripeApi {
    pub fn new(config: settings::Stripe) -> Self {
        let currency = serde_json::from_value(serde_json::Value::String(
            config.currency.to_lowercase(),
        ))
        .unwrap_or_else(|_| {
            log::warn!(
                "Unknown Stripe currency {}, falling back to USD.",
                config.currency
            );
            Currency::USD
        });

        Self {
            client: Client::new(config.secret_key),
            currency_code: currency.to_string().to_uppercase(),
            currency,
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeApi {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    fn currency(&self) -> &str {
        &self.currency_code
    }

    async fn create_checkout(&self, order: &CheckoutOrder) -> Result<Checkout, anyhow::Error> {
        let reference = order.reference.to_string();
        let metadata = HashMap::from([
            ("courseId".to_string(), order.reference.course.to_string()),
            ("userId".to_string(), order.reference.user_id.clone()),
        ]);

        let session = CheckoutSession::create(
            &self.client,
            CreateCheckoutSession {
                mode: Some(CheckoutSessionMode::Payment),
                success_url: Some(&order.success_url),
                cancel_url: Some(&order.cancel_url),
                client_reference_id: Some(&reference),
                customer_email: Some(&order.email),
                metadata: Some(metadata),
                line_items: Some(vec![CreateCheckoutSessionLineItems {
                    quantity: Some(1),
                    price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                        currency: self.currency,
                        unit_amount: Some(order.amount_cents),
                        product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: order.description.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        )
        .await?;

        Ok(Checkout {
            provider: PaymentProvider::Stripe,
            redirect_url: session
                .url
                .ok_or_else(|| anyhow::anyhow!("Stripe: session without url."))?,
            external_id: session.id.to_string(),
        })
    }

    async fn payment_status(
        &self,
        external_id: &str,
    ) -> Result<ProviderPaymentStatus, anyhow::Error> {
        let id: CheckoutSessionId = external_id
            .parse()
            .map_err(|e| anyhow::anyhow!("Stripe: invalid session id {}: {}", external_id, e))?;
        let session = CheckoutSession::retrieve(&self.client, &id, &[]).await?;

        let state = match (session.payment_status, session.status) {
            (
                CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired,
                _,
            ) => PaymentState::Succeeded,
            (_, Some(CheckoutSessionStatus::Expired)) => PaymentState::Failed,
            _ => PaymentState::Pending,
        };

        Ok(ProviderPaymentStatus {
            state,
            reference: reference(&session),
            amount_cents: session.amount_total,
            currency: session.currency.map(|c| c.to_string().to_uppercase()),
        })
    }
}

/// Signs `payload` the way Stripe does for webhook deliveries.
#[cfg(test)]
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    use hmac::{Hmac, Mac};

    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
pub fn paid_session(id: &str) -> CheckoutSession {
    CheckoutSession {
        id: id.parse().unwrap(),
        payment_status: CheckoutSessionPaymentStatus::Paid,
        amount_total: Some(4900),
        currency: Some(Currency::USD),
        ..Default::default()
    }
}

/// Wraps a session in an event envelope as delivered to the webhook.
#[cfg(test)]
pub fn event_payload(event_type: &str, session: &CheckoutSession) -> Vec<u8> {
    let mut object = serde_json::to_value(session).unwrap();
    object["object"] = serde_json::json!("checkout.session");

    serde_json::json!({
        "id": "evt_test_webhook",
        "object": "event",
        "api_version": null,
        "created": 1_700_000_000,
        "livemode": false,
        "pending_webhooks": 1,
        "request": null,
        "type": event_type,
        "data": {"object": object}
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn signed(payload: &[u8]) -> String {
        sign(payload, SECRET, now())
    }

    #[test]
    fn rejects_tampered_or_stale_deliveries() {
        let payload = event_payload("checkout.session.completed", &paid_session("cs_test_1"));
        let header = signed(&payload);

        assert!(construct_event(&payload, &header, SECRET).is_ok());
        assert!(matches!(
            construct_event(b"{}", &header, SECRET),
            Err(WebhookError::Signature(_))
        ));
        assert!(matches!(
            construct_event(&payload, &header, "whsec_other"),
            Err(WebhookError::Signature(_))
        ));
        assert!(matches!(
            construct_event(&payload, &sign(&payload, SECRET, now() - 3_600), SECRET),
            Err(WebhookError::Signature(_))
        ));
        assert!(construct_event(&payload, "v1=deadbeef", SECRET).is_err());
    }

    #[test]
    fn completed_session_resolves_by_reference_first() {
        let mut session = paid_session("cs_test_1");
        session.client_reference_id = Some("user-1:all:n1".to_string());
        session.customer_email = Some("buyer@example.com".to_string());
        session.amount_total = Some(14900);
        let payload = event_payload("checkout.session.completed", &session);

        let WebhookEvent::Succeeded(event) =
            construct_event(&payload, &signed(&payload), SECRET).unwrap()
        else {
            panic!("expected a payment");
        };
        assert_eq!(event.external_id, "cs_test_1");
        assert_eq!(event.customer, CustomerRef::UserId("user-1".to_string()));
        assert_eq!(event.course, CourseSelection::All);
        assert_eq!(event.amount_cents, 14900);
        assert_eq!(event.currency, "USD");
    }

    #[test]
    fn completed_session_falls_back_to_email() {
        let mut session = paid_session("cs_test_2");
        session.customer_email = Some("buyer@example.com".to_string());
        let payload = event_payload("checkout.session.async_payment_succeeded", &session);

        let WebhookEvent::Succeeded(event) =
            construct_event(&payload, &signed(&payload), SECRET).unwrap()
        else {
            panic!("expected a payment");
        };
        assert_eq!(
            event.customer,
            CustomerRef::Email("buyer@example.com".to_string())
        );
        assert_eq!(event.course, CourseSelection::All);
    }

    #[test]
    fn unpaid_and_other_events_are_ignored() {
        let mut unpaid = paid_session("cs_test_3");
        unpaid.customer_email = Some("buyer@example.com".to_string());
        unpaid.payment_status = CheckoutSessionPaymentStatus::Unpaid;
        let unpaid = event_payload("checkout.session.completed", &unpaid);
        let expired = event_payload("checkout.session.expired", &paid_session("cs_test_4"));

        for payload in [unpaid, expired] {
            assert!(matches!(
                construct_event(&payload, &signed(&payload), SECRET).unwrap(),
                WebhookEvent::Ignored(_)
            ));
        }
    }
}
