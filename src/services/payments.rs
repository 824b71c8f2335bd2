use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{call, referrals::ReferralRequest, RequestHandler, Service, ServiceError};
use crate::{
    models::{
        payments::{
            Checkout, CheckoutOrder, CourseSelection, CustomerRef, NewPaymentLog, OrderReference,
            PaymentProvider, PaymentState, PaymentStatusResponse, PaymentSucceeded,
            ReconciliationResult,
        },
        users::User,
    },
    repositories::{providers::Gateways, LedgerStore},
    settings,
};

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

pub enum PaymentRequest {
    Reconcile {
        event: PaymentSucceeded,
        response: oneshot::Sender<Result<ReconciliationResult, ServiceError>>,
    },
    CreateCheckout {
        user_id: String,
        provider: PaymentProvider,
        course: CourseSelection,
        response: oneshot::Sender<Result<Checkout, ServiceError>>,
    },
    PollStatus {
        user_id: String,
        provider: PaymentProvider,
        external_id: String,
        response: oneshot::Sender<Result<PaymentStatusResponse, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct PaymentRequestHandler {
    store: Arc<dyn LedgerStore>,
    gateways: Arc<Gateways>,
    courses: settings::Courses,
    referral_channel: mpsc::Sender<ReferralRequest>,
    log_only: Arc<HashSet<PaymentProvider>>,
    status_timeout: Duration,
}

impl PaymentRequestHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateways: Gateways,
        courses: settings::Courses,
        referral_channel: mpsc::Sender<ReferralRequest>,
        log_only: HashSet<PaymentProvider>,
    ) -> Self {
        Self {
            store,
            gateways: Arc::new(gateways),
            courses,
            referral_channel,
            log_only: Arc::new(log_only),
            status_timeout: STATUS_TIMEOUT,
        }
    }

    /// Applies a successful payment exactly once per `(provider, external_id)`.
    pub async fn reconcile(
        &self,
        event: PaymentSucceeded,
    ) -> Result<ReconciliationResult, ServiceError> {
        if self.log_only.contains(&event.provider) {
            log::info!(
                "{} payment {} for {:?} ({} {} cents) recorded without applying.",
                event.provider,
                event.external_id,
                event.customer,
                event.currency,
                event.amount_cents
            );
            return Ok(ReconciliationResult::Ignored {
                reason: format!("{} payments are not applied", event.provider),
            });
        }

        let claimed = self
            .store
            .claim_payment_event(event.provider, &event.external_id)
            .await
            .map_err(|e| ServiceError::from_store("PaymentService", e))?;
        if !claimed {
            log::info!(
                "Skipping duplicate {} event {}.",
                event.provider,
                event.external_id
            );
            return Ok(ReconciliationResult::Duplicate);
        }

        let user = match self.resolve_customer(&event.customer).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                log::warn!(
                    "No account for {} payment {} ({:?}).",
                    event.provider,
                    event.external_id,
                    event.customer
                );
                self.release(&event).await;
                return Ok(ReconciliationResult::UnknownCustomer);
            }
            Err(e) => {
                self.release(&event).await;
                return Err(e);
            }
        };

        let courses = event.course.course_ids(&self.courses.catalog);
        let (user, first_payment) = match self
            .store
            .grant_access(&user.id, &courses, event.course.is_all())
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                log::error!(
                    "Could not grant access for {} payment {}: {}",
                    event.provider,
                    event.external_id,
                    e
                );
                self.release(&event).await;
                return Err(ServiceError::UpdateFailed(e.to_string()));
            }
        };

        log::info!(
            "Granted {} to {} for {} payment {}.",
            event.course,
            user.id,
            event.provider,
            event.external_id
        );

        if let Err(e) = self
            .store
            .append_payment_log(NewPaymentLog {
                user_id: user.id.clone(),
                provider: event.provider,
                external_id: event.external_id.clone(),
                amount_cents: event.amount_cents,
                currency: event.currency.clone(),
                status: "succeeded".to_string(),
            })
            .await
        {
            log::warn!(
                "Could not log {} payment {}: {}",
                event.provider,
                event.external_id,
                e
            );
        }

        if first_payment {
            let referred_id = user.id.clone();
            let accrued = call("ReferralService", &self.referral_channel, |response| {
                ReferralRequest::Accrue {
                    referred_id,
                    response,
                }
            })
            .await;
            if let Err(e) = accrued {
                log::error!("Referral accrual failed for {}: {}", user.id, e);
            }
        }

        Ok(ReconciliationResult::Granted { user_id: user.id })
    }

    async fn resolve_customer(&self, customer: &CustomerRef) -> Result<Option<User>, ServiceError> {
        let user = match customer {
            CustomerRef::UserId(id) => self.store.get_user(id).await,
            CustomerRef::Email(email) => self.store.get_user_by_email(email).await,
        };

        user.map_err(|e| ServiceError::from_store("PaymentService", e))
    }

    async fn release(&self, event: &PaymentSucceeded) {
        if let Err(e) = self
            .store
            .release_payment_event(event.provider, &event.external_id)
            .await
        {
            log::error!(
                "Could not release {} event {}: {}",
                event.provider,
                event.external_id,
                e
            );
        }
    }

    pub async fn create_checkout(
        &self,
        user_id: &str,
        provider: PaymentProvider,
        course: CourseSelection,
    ) -> Result<Checkout, ServiceError> {
        let gateway = self
            .gateways
            .get(&provider)
            .ok_or_else(|| ServiceError::ProviderDisabled(provider.to_string()))?;

        let (amount_cents, description) = match course {
            CourseSelection::All => (
                self.courses.all_courses_price_cents,
                "All courses".to_string(),
            ),
            CourseSelection::Course(id) if self.courses.catalog.contains(&id) => {
                (self.courses.course_price_cents, format!("Course {}", id))
            }
            CourseSelection::Course(id) => {
                return Err(ServiceError::Validation(format!("Unknown course {}.", id)))
            }
        };

        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(|e| ServiceError::from_store("PaymentService", e))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", user_id)))?;

        let order = CheckoutOrder {
            reference: OrderReference::new(&user.id, course),
            email: user.email,
            amount_cents,
            description,
            success_url: self.courses.success_url.clone(),
            cancel_url: self.courses.cancel_url.clone(),
        };

        let checkout = gateway.create_checkout(&order).await.map_err(|e| {
            log::error!("{} checkout for {} failed: {}", provider, user_id, e);
            ServiceError::Upstream(provider.to_string(), e.to_string())
        })?;

        log::info!(
            "Created {} checkout {} for {} ({}).",
            provider,
            checkout.external_id,
            user_id,
            order.reference
        );

        Ok(checkout)
    }

    /// Asks the provider for the payment state and reconciles a success that belongs to
    /// the caller.
    pub async fn poll_status(
        &self,
        user_id: &str,
        provider: PaymentProvider,
        external_id: &str,
    ) -> Result<PaymentStatusResponse, ServiceError> {
        let gateway = self
            .gateways
            .get(&provider)
            .ok_or_else(|| ServiceError::ProviderDisabled(provider.to_string()))?;

        let status = tokio::time::timeout(self.status_timeout, gateway.payment_status(external_id))
            .await
            .map_err(|_| {
                log::warn!("{} status of {} timed out.", provider, external_id);
                ServiceError::Upstream(provider.to_string(), "status request timed out".to_string())
            })?
            .map_err(|e| ServiceError::Upstream(provider.to_string(), e.to_string()))?;

        if let Some(reference) = &status.reference {
            if reference.user_id != user_id {
                return Err(ServiceError::Forbidden);
            }
        }

        let reconciliation = match (status.state, status.reference) {
            (PaymentState::Succeeded, Some(reference)) => Some(
                self.reconcile(PaymentSucceeded {
                    provider,
                    external_id: external_id.to_string(),
                    customer: CustomerRef::UserId(reference.user_id),
                    course: reference.course,
                    amount_cents: status.amount_cents.unwrap_or_default(),
                    currency: status
                        .currency
                        .unwrap_or_else(|| gateway.currency().to_string()),
                })
                .await?,
            ),
            _ => None,
        };

        Ok(PaymentStatusResponse {
            provider,
            external_id: external_id.to_string(),
            state: status.state,
            reconciliation,
        })
    }
}

#[async_trait]
impl RequestHandler<PaymentRequest> for PaymentRequestHandler {
    async fn handle_request(&self, request: PaymentRequest) {
        match request {
            PaymentRequest::Reconcile { event, response } => {
                let result = self.reconcile(event).await;
                let _ = response.send(result);
            }
            PaymentRequest::CreateCheckout {
                user_id,
                provider,
                course,
                response,
            } => {
                let result = self.create_checkout(&user_id, provider, course).await;
                let _ = response.send(result);
            }
            PaymentRequest::PollStatus {
                user_id,
                provider,
                external_id,
                response,
            } => {
                let result = self.poll_status(&user_id, provider, &external_id).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct PaymentService;

impl PaymentService {
    pub fn new() -> Self {
        PaymentService {}
    }
}

#[async_trait]
impl Service<PaymentRequest, PaymentRequestHandler> for PaymentService {}
