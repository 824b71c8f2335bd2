use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{read_json, PaymentGateway, WebhookError, WebhookEvent};
use crate::{
    models::payments::{
        Checkout, CheckoutOrder, CustomerRef, OrderReference, PaymentProvider, PaymentState,
        PaymentSucceeded, ProviderPaymentStatus,
    },
    settings,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceStatus {
    invoice_id: String,
    status: String,
    amount: Option<i64>,
    ccy: Option<u16>,
    reference: Option<String>,
}

impl InvoiceStatus {
    fn reference(&self) -> Option<OrderReference> {
        self.reference.as_deref().and_then(|r| r.parse().ok())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MerchantPaymInfo<'a> {
    reference: String,
    destination: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInvoice<'a> {
    amount: i64,
    ccy: u16,
    merchant_paym_info: MerchantPaymInfo<'a>,
    redirect_url: &'a str,
    web_hook_url: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedInvoice {
    invoice_id: String,
    page_url: String,
}

pub fn currency_code(ccy: u16) -> String {
    match ccy {
        980 => "UAH".to_string(),
        840 => "USD".to_string(),
        978 => "EUR".to_string(),
        other => other.to_string(),
    }
}

/// Decodes an invoice status notification. Monobank notifications are not signed here;
/// the body is trusted as delivered.
pub fn parse_webhook(payload: &[u8]) -> Result<WebhookEvent, WebhookError> {
    let invoice: InvoiceStatus =
        serde_json::from_slice(payload).map_err(|e| WebhookError::Payload(e.to_string()))?;

    if invoice.status != "success" {
        return Ok(WebhookEvent::Ignored(format!(
            "invoice {} is {}",
            invoice.invoice_id, invoice.status
        )));
    }

    let Some(reference) = invoice.reference() else {
        return Ok(WebhookEvent::Ignored(format!(
            "invoice {} has no order reference",
            invoice.invoice_id
        )));
    };

    Ok(WebhookEvent::Succeeded(PaymentSucceeded {
        provider: PaymentProvider::Monobank,
        external_id: invoice.invoice_id,
        customer: CustomerRef::UserId(reference.user_id),
        course: reference.course,
        amount_cents: invoice.amount.unwrap_or_default(),
        currency: invoice.ccy.map(currency_code).unwrap_or_default(),
    }))
}

pub struct MonobankApi {
    config: settings::Monobank,
    currency: String,
    client: reqwest::Client,
}

impl MonobankApi {
    pub fn new(config: settings::Monobank) -> Self {
        Self {
            currency: currency_code(config.ccy),
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PaymentGateway for MonobankApi {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Monobank
    }

    fn currency(&self) -> &str {
        &self.currency
    }

    async fn create_checkout(&self, order: &CheckoutOrder) -> Result<Checkout, anyhow::Error> {
        let body = CreateInvoice {
            amount: order.amount_cents,
            ccy: self.config.ccy,
            merchant_paym_info: MerchantPaymInfo {
                reference: order.reference.to_string(),
                destination: &order.description,
            },
            redirect_url: &order.success_url,
            web_hook_url: &self.config.webhook_url,
        };

        let response = self
            .client
            .post(format!("{}/api/merchant/invoice/create", self.config.api_url))
            .header("X-Token", &self.config.token)
            .json(&body)
            .send()
            .await?;
        let invoice: CreatedInvoice = read_json(PaymentProvider::Monobank, response).await?;

        Ok(Checkout {
            provider: PaymentProvider::Monobank,
            external_id: invoice.invoice_id,
            redirect_url: invoice.page_url,
        })
    }

    async fn payment_status(
        &self,
        external_id: &str,
    ) -> Result<ProviderPaymentStatus, anyhow::Error> {
        let response = self
            .client
            .get(format!("{}/api/merchant/invoice/status", self.config.api_url))
            .query(&[("invoiceId", external_id)])
            .header("X-Token", &self.config.token)
            .send()
            .await?;
        let invoice: InvoiceStatus = read_json(PaymentProvider::Monobank, response).await?;

        let state = match invoice.status.as_str() {
            "success" => PaymentState::Succeeded,
            "failure" | "reversed" | "expired" => PaymentState::Failed,
            _ => PaymentState::Pending,
        };

        Ok(ProviderPaymentStatus {
            state,
            reference: invoice.reference(),
            amount_cents: invoice.amount,
            currency: invoice.ccy.map(currency_code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payments::CourseSelection;

    #[test]
    fn successful_invoice_becomes_a_payment() {
        let payload = serde_json::json!({
            "invoiceId": "p2_9ZgpZVsl3",
            "status": "success",
            "amount": 4900,
            "ccy": 980,
            "reference": "user-3:1:n0"
        })
        .to_string();

        let WebhookEvent::Succeeded(event) = parse_webhook(payload.as_bytes()).unwrap() else {
            panic!("expected a payment");
        };
        assert_eq!(event.external_id, "p2_9ZgpZVsl3");
        assert_eq!(event.customer, CustomerRef::UserId("user-3".to_string()));
        assert_eq!(event.course, CourseSelection::Course(1));
        assert_eq!(event.currency, "UAH");
    }

    #[test]
    fn processing_invoices_are_ignored() {
        let payload = r#"{"invoiceId": "p2_1", "status": "processing"}"#;

        assert!(matches!(
            parse_webhook(payload.as_bytes()).unwrap(),
            WebhookEvent::Ignored(_)
        ));
        assert!(parse_webhook(b"[]").is_err());
    }
}
