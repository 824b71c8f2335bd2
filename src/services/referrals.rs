use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::{
    models::referrals::{Referral, ReferralSummary, ReferredUser},
    repositories::LedgerStore,
};

pub enum ReferralRequest {
    Accrue {
        referred_id: String,
        response: oneshot::Sender<Result<Vec<Referral>, ServiceError>>,
    },
    Summary {
        user_id: String,
        response: oneshot::Sender<Result<ReferralSummary, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct ReferralRequestHandler {
    store: Arc<dyn LedgerStore>,
    reward_cents: i64,
}

impl ReferralRequestHandler {
    pub fn new(store: Arc<dyn LedgerStore>, reward_cents: i64) -> Self {
        Self {
            store,
            reward_cents,
        }
    }

    /// Pays out every pending edge pointing at `referred_id`.
    pub async fn accrue(&self, referred_id: &str) -> Result<Vec<Referral>, ServiceError> {
        let settled = self
            .store
            .settle_referrals(referred_id, self.reward_cents)
            .await
            .map_err(|e| ServiceError::from_store("ReferralService", e))?;

        for referral in &settled {
            log::info!(
                "Credited {} cents to {} for referral {}.",
                self.reward_cents,
                referral.referrer_id,
                referral.id
            );
        }

        Ok(settled)
    }

    pub async fn summary(&self, user_id: &str) -> Result<ReferralSummary, ServiceError> {
        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(|e| ServiceError::from_store("ReferralService", e))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", user_id)))?;

        let referrals = self
            .store
            .list_referrals(user_id)
            .await
            .map_err(|e| ServiceError::from_store("ReferralService", e))?;

        let lookups = referrals
            .iter()
            .map(|referral| self.store.get_user(&referral.referred_id));
        let referred_users = join_all(lookups).await;

        let referrals = referrals
            .into_iter()
            .zip(referred_users)
            .map(|(referral, referred)| ReferredUser {
                email: match referred {
                    Ok(user) => user.map(|u| u.email),
                    Err(e) => {
                        log::warn!("Could not load referred user {}: {}", referral.referred_id, e);
                        None
                    }
                },
                status: referral.status,
                created_at: referral.created_at,
                paid_at: referral.paid_at,
            })
            .collect();

        Ok(ReferralSummary {
            referral_code: user.referral_code,
            balance_cents: user.balance_cents,
            total_referrals: user.total_referrals,
            paid_referrals: user.paid_referrals,
            referrals,
        })
    }
}

#[async_trait]
impl RequestHandler<ReferralRequest> for ReferralRequestHandler {
    async fn handle_request(&self, request: ReferralRequest) {
        match request {
            ReferralRequest::Accrue {
                referred_id,
                response,
            } => {
                let result = self.accrue(&referred_id).await;
                let _ = response.send(result);
            }
            ReferralRequest::Summary { user_id, response } => {
                let summary = self.summary(&user_id).await;
                let _ = response.send(summary);
            }
        }
    }
}

pub struct ReferralService;

impl ReferralService {
    pub fn new() -> Self {
        ReferralService {}
    }
}

#[async_trait]
impl Service<ReferralRequest, ReferralRequestHandler> for ReferralService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{referrals::ReferralStatus, users::Identity},
        repositories::memory::MemoryLedgerStore,
    };

    async fn account(store: &MemoryLedgerStore, id: &str) {
        store
            .ensure_user(&Identity {
                user_id: id.to_string(),
                email: format!("{}@example.com", id),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn summary_resolves_referred_emails() {
        let store = Arc::new(MemoryLedgerStore::new());
        account(&store, "referrer").await;
        account(&store, "ann").await;
        account(&store, "bob").await;
        store.create_referral("referrer", "ann").await.unwrap();
        store.create_referral("referrer", "bob").await.unwrap();

        let handler = ReferralRequestHandler::new(store.clone(), 1_500);
        handler.accrue("ann").await.unwrap();
        let summary = handler.summary("referrer").await.unwrap();

        assert_eq!(summary.total_referrals, 2);
        assert_eq!(summary.paid_referrals, 1);
        assert_eq!(summary.balance_cents, 1_500);
        let mut emails: Vec<_> = summary
            .referrals
            .iter()
            .map(|r| (r.email.clone().unwrap(), r.status))
            .collect();
        emails.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            emails,
            vec![
                ("ann@example.com".to_string(), ReferralStatus::Paid),
                ("bob@example.com".to_string(), ReferralStatus::Pending),
            ]
        );
    }

    #[tokio::test]
    async fn accrual_without_edges_is_a_no_op() {
        let store = Arc::new(MemoryLedgerStore::new());
        account(&store, "solo").await;

        let handler = ReferralRequestHandler::new(store, 1_500);
        assert!(handler.accrue("solo").await.unwrap().is_empty());
    }
}
