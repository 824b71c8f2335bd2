use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::{
    models::payments::PaymentProvider,
    repositories::{providers::Gateways, LedgerStore, StoreError},
    settings,
};

pub mod admin;
pub mod http;
pub mod payments;
pub mod referrals;
pub mod users;
pub mod withdrawals;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Authentication required.")]
    Unauthorized,
    #[error("Not allowed.")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Amount {amount_cents} is below the minimum of {minimum_cents} cents.")]
    BelowMinimum { amount_cents: i64, minimum_cents: i64 },
    #[error("Insufficient balance: requested {requested_cents}, available {available_cents} cents.")]
    InsufficientBalance {
        requested_cents: i64,
        available_cents: i64,
    },
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),
    #[error("Payment provider not enabled: {0}")]
    ProviderDisabled(String),
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("Update failed: {0}")]
    UpdateFailed(String),
    #[error("Upstream failure: {0} => {1}")]
    Upstream(String, String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
}

impl ServiceError {
    /// Wraps a store failure from `context`, keeping the typed cases.
    pub fn from_store(context: &str, error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::AlreadyProcessed(status) => {
                ServiceError::AlreadyProcessed(format!("request is {}", status.as_str()))
            }
            other => ServiceError::Upstream(context.to_string(), other.to_string()),
        }
    }
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Sends a request built around a fresh response channel and waits for the answer.
pub async fn call<R, T>(
    service: &str,
    channel: &mpsc::Sender<R>,
    request: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> R,
) -> Result<T, ServiceError>
where
    R: Send + 'static,
{
    let (response_tx, response_rx) = oneshot::channel();

    channel
        .send(request(response_tx))
        .await
        .map_err(|e| ServiceError::Communication(service.to_string(), e.to_string()))?;

    response_rx
        .await
        .map_err(|e| ServiceError::Communication(service.to_string(), e.to_string()))?
}

#[derive(Clone)]
pub struct ServiceChannels {
    pub users: mpsc::Sender<users::UserRequest>,
    pub referrals: mpsc::Sender<referrals::ReferralRequest>,
    pub withdrawals: mpsc::Sender<withdrawals::WithdrawalServiceRequest>,
    pub admin: mpsc::Sender<admin::AdminRequest>,
    pub payments: mpsc::Sender<payments::PaymentRequest>,
}

/// Business rules the services need from the configuration.
#[derive(Clone, Debug)]
pub struct Policies {
    pub withdrawals: settings::Withdrawals,
    pub referrals: settings::Referrals,
    pub courses: settings::Courses,
    /// Providers whose notifications are logged but not applied.
    pub log_only: HashSet<PaymentProvider>,
}

pub fn start_services(
    store: Arc<dyn LedgerStore>,
    gateways: Gateways,
    policies: Policies,
) -> ServiceChannels {
    let (user_tx, mut user_rx) = mpsc::channel(512);
    let (referral_tx, mut referral_rx) = mpsc::channel(512);
    let (withdrawal_tx, mut withdrawal_rx) = mpsc::channel(512);
    let (admin_tx, mut admin_rx) = mpsc::channel(512);
    let (payment_tx, mut payment_rx) = mpsc::channel(512);

    let mut user_service = users::UserService::new();
    let mut referral_service = referrals::ReferralService::new();
    let mut withdrawal_service = withdrawals::WithdrawalService::new();
    let mut admin_service = admin::AdminService::new();
    let mut payment_service = payments::PaymentService::new();

    log::info!("Starting user service.");
    let user_store = store.clone();
    tokio::spawn(async move {
        user_service
            .run(users::UserRequestHandler::new(user_store), &mut user_rx)
            .await;
    });

    log::info!("Starting referral service.");
    let referral_store = store.clone();
    let reward_cents = policies.referrals.reward_cents;
    tokio::spawn(async move {
        referral_service
            .run(
                referrals::ReferralRequestHandler::new(referral_store, reward_cents),
                &mut referral_rx,
            )
            .await;
    });

    log::info!("Starting withdrawal service.");
    let withdrawal_store = store.clone();
    let minimum_cents = policies.withdrawals.minimum_cents;
    tokio::spawn(async move {
        withdrawal_service
            .run(
                withdrawals::WithdrawalRequestHandler::new(withdrawal_store, minimum_cents),
                &mut withdrawal_rx,
            )
            .await;
    });

    log::info!("Starting admin service.");
    let admin_store = store.clone();
    tokio::spawn(async move {
        admin_service
            .run(admin::AdminRequestHandler::new(admin_store), &mut admin_rx)
            .await;
    });

    log::info!("Starting payment service.");
    let payment_store = store.clone();
    let payment_referral_tx = referral_tx.clone();
    let courses = policies.courses.clone();
    let log_only = policies.log_only.clone();
    tokio::spawn(async move {
        payment_service
            .run(
                payments::PaymentRequestHandler::new(
                    payment_store,
                    gateways,
                    courses,
                    payment_referral_tx,
                    log_only,
                ),
                &mut payment_rx,
            )
            .await;
    });

    ServiceChannels {
        users: user_tx,
        referrals: referral_tx,
        withdrawals: withdrawal_tx,
        admin: admin_tx,
        payments: payment_tx,
    }
}
