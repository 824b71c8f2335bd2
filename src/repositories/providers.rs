use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    models::payments::{
        Checkout, CheckoutOrder, PaymentProvider, PaymentSucceeded, ProviderPaymentStatus,
    },
    settings::Settings,
};

pub mod liqpay;
pub mod monobank;
pub mod stripe;
pub mod yookassa;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Invalid signature: {0}")]
    Signature(String),
    #[error("Malformed payload: {0}")]
    Payload(String),
}

/// Authenticated provider notification, reduced to what reconciliation needs.
#[derive(Debug)]
pub enum WebhookEvent {
    Succeeded(PaymentSucceeded),
    Ignored(String),
}

/// Outbound half of a payment provider: starting a checkout and asking for its state.
#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    fn provider(&self) -> PaymentProvider;

    fn currency(&self) -> &str;

    async fn create_checkout(&self, order: &CheckoutOrder) -> Result<Checkout, anyhow::Error>;

    async fn payment_status(
        &self,
        external_id: &str,
    ) -> Result<ProviderPaymentStatus, anyhow::Error>;
}

pub type Gateways = HashMap<PaymentProvider, Arc<dyn PaymentGateway>>;

/// One gateway per provider that has a configuration section.
pub fn build_gateways(settings: &Settings) -> Gateways {
    let mut gateways: Gateways = HashMap::new();

    if let Some(config) = &settings.stripe {
        gateways.insert(
            PaymentProvider::Stripe,
            Arc::new(stripe::StripeApi::new(config.clone())),
        );
    }
    if let Some(config) = &settings.liqpay {
        gateways.insert(
            PaymentProvider::LiqPay,
            Arc::new(liqpay::LiqPayApi::new(config.clone())),
        );
    }
    if let Some(config) = &settings.monobank {
        gateways.insert(
            PaymentProvider::Monobank,
            Arc::new(monobank::MonobankApi::new(config.clone())),
        );
    }
    if let Some(config) = &settings.yookassa {
        gateways.insert(
            PaymentProvider::YooKassa,
            Arc::new(yookassa::YooKassaApi::new(config.clone())),
        );
    }

    gateways
}

/// Reads a response body as JSON, turning non-2xx answers into errors that carry the body.
async fn read_json<T: serde::de::DeserializeOwned>(
    provider: PaymentProvider,
    response: reqwest::Response,
) -> Result<T, anyhow::Error> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        anyhow::bail!("{}: {} => {}", provider, status, body);
    }

    serde_json::from_str(&body)
        .map_err(|e| anyhow::anyhow!("{}: bad response format: {}", provider, e))
}
