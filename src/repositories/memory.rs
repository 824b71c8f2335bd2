use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

use super::{LedgerStore, StoreError};
use crate::models::{
    payments::{NewPaymentLog, PaymentLog, PaymentProvider},
    referrals::{Referral, ReferralStatus},
    users::{Identity, Role, User},
    withdrawals::{Decision, NewWithdrawal, WithdrawalRequest, WithdrawalStatus},
};

/// In-process store for local runs and tests. Balance changes happen while the account's
/// map entry is locked; account locks are always taken before withdrawal locks.
#[derive(Default)]
pub struct MemoryLedgerStore {
    users: DashMap<String, User>,
    referrals: DashMap<String, Referral>,
    withdrawals: DashMap<String, WithdrawalRequest>,
    payment_events: DashMap<(PaymentProvider, String), DateTime<Utc>>,
    payment_logs: DashMap<String, PaymentLog>,
    payment_log_offline: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the balance of an existing account.
    #[cfg(test)]
    pub fn set_balance(&self, user_id: &str, balance_cents: i64) -> Result<(), StoreError> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        user.balance_cents = balance_cents;
        user.updated_at = Utc::now();
        Ok(())
    }

    #[cfg(test)]
    pub fn payment_logs(&self) -> Vec<PaymentLog> {
        self.payment_logs.iter().map(|e| e.value().clone()).collect()
    }

    #[cfg(test)]
    pub fn set_payment_log_offline(&self, offline: bool) {
        self.payment_log_offline.store(offline, Ordering::SeqCst);
    }
}

pub fn generate_referral_code() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_user(&self, identity: &Identity) -> Result<(User, bool), StoreError> {
        match self.users.entry(identity.user_id.clone()) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let now = Utc::now();
                let user = User {
                    id: identity.user_id.clone(),
                    email: identity.email.clone(),
                    role: Role::User,
                    referral_code: generate_referral_code(),
                    balance_cents: 0,
                    total_referrals: 0,
                    paid_referrals: 0,
                    has_paid: false,
                    paid_courses: Vec::new(),
                    subscription_status: None,
                    created_at: now,
                    updated_at: now,
                };
                entry.insert(user.clone());
                Ok((user, true))
            }
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(user_id).map(|u| u.value().clone()))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.value().clone()))
    }

    async fn get_user_by_referral_code(&self, code: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.referral_code == code)
            .map(|u| u.value().clone()))
    }

    async fn set_role(&self, email: &str, role: Role) -> Result<User, StoreError> {
        let mut user = self
            .users
            .iter_mut()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .ok_or_else(|| StoreError::NotFound(format!("user {}", email)))?;
        user.role = role;
        user.updated_at = Utc::now();
        Ok(user.value().clone())
    }

    async fn create_referral(
        &self,
        referrer_id: &str,
        referred_id: &str,
    ) -> Result<Referral, StoreError> {
        let mut referrer = self
            .users
            .get_mut(referrer_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", referrer_id)))?;

        let referral = Referral {
            id: Uuid::new_v4().hyphenated().to_string(),
            referrer_id: referrer_id.to_string(),
            referred_id: referred_id.to_string(),
            status: ReferralStatus::Pending,
            created_at: Utc::now(),
            paid_at: None,
        };
        referrer.total_referrals += 1;
        referrer.updated_at = Utc::now();
        self.referrals.insert(referral.id.clone(), referral.clone());

        Ok(referral)
    }

    async fn list_referrals(&self, referrer_id: &str) -> Result<Vec<Referral>, StoreError> {
        let mut referrals: Vec<Referral> = self
            .referrals
            .iter()
            .filter(|r| r.referrer_id == referrer_id)
            .map(|r| r.value().clone())
            .collect();
        referrals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(referrals)
    }

    async fn settle_referrals(
        &self,
        referred_id: &str,
        reward_cents: i64,
    ) -> Result<Vec<Referral>, StoreError> {
        let now = Utc::now();
        let settled: Vec<Referral> = self
            .referrals
            .iter_mut()
            .filter(|r| r.referred_id == referred_id)
            .filter_map(|mut r| {
                if r.status != ReferralStatus::Pending {
                    return None;
                }
                r.status = ReferralStatus::Paid;
                r.paid_at = Some(now);
                Some(r.value().clone())
            })
            .collect();

        for referral in &settled {
            if let Some(mut referrer) = self.users.get_mut(&referral.referrer_id) {
                referrer.balance_cents += reward_cents;
                referrer.paid_referrals += 1;
                referrer.updated_at = now;
            }
        }

        Ok(settled)
    }

    async fn create_withdrawal(
        &self,
        withdrawal: NewWithdrawal,
    ) -> Result<WithdrawalRequest, StoreError> {
        let mut user = self
            .users
            .get_mut(&withdrawal.user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", withdrawal.user_id)))?;

        if user.balance_cents < withdrawal.amount_cents {
            return Err(StoreError::InsufficientBalance {
                available: user.balance_cents,
            });
        }

        let now = Utc::now();
        let request = WithdrawalRequest {
            id: Uuid::new_v4().hyphenated().to_string(),
            user_id: withdrawal.user_id,
            amount_cents: withdrawal.amount_cents,
            payment_method: withdrawal.payment_method,
            payment_details: withdrawal.payment_details,
            status: WithdrawalStatus::Pending,
            admin_notes: None,
            created_at: now,
            processed_at: None,
        };

        user.balance_cents -= request.amount_cents;
        user.updated_at = now;
        self.withdrawals.insert(request.id.clone(), request.clone());

        Ok(request)
    }

    async fn get_withdrawal(&self, id: &str) -> Result<Option<WithdrawalRequest>, StoreError> {
        Ok(self.withdrawals.get(id).map(|w| w.value().clone()))
    }

    async fn list_withdrawals(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        let mut requests: Vec<WithdrawalRequest> = self
            .withdrawals
            .iter()
            .filter(|w| user_id.map_or(true, |id| w.user_id == id))
            .map(|w| w.value().clone())
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn decide_withdrawal(
        &self,
        id: &str,
        decision: Decision,
        admin_notes: Option<String>,
    ) -> Result<WithdrawalRequest, StoreError> {
        let user_id = self
            .withdrawals
            .get(id)
            .map(|w| w.user_id.clone())
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal request {}", id)))?;

        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;
        let mut request = self
            .withdrawals
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal request {}", id)))?;

        if request.status != WithdrawalStatus::Pending {
            return Err(StoreError::AlreadyProcessed(request.status));
        }

        let now = Utc::now();
        if decision == Decision::Rejected {
            user.balance_cents += request.amount_cents;
            user.updated_at = now;
        }
        request.status = decision.into();
        request.admin_notes = admin_notes;
        request.processed_at = Some(now);

        Ok(request.value().clone())
    }

    async fn claim_payment_event(
        &self,
        provider: PaymentProvider,
        external_id: &str,
    ) -> Result<bool, StoreError> {
        match self.payment_events.entry((provider, external_id.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(Utc::now());
                Ok(true)
            }
        }
    }

    async fn release_payment_event(
        &self,
        provider: PaymentProvider,
        external_id: &str,
    ) -> Result<(), StoreError> {
        self.payment_events
            .remove(&(provider, external_id.to_string()));
        Ok(())
    }

    async fn grant_access(
        &self,
        user_id: &str,
        courses: &[i32],
        premium: bool,
    ) -> Result<(User, bool), StoreError> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;

        let first_payment = !user.has_paid;
        user.has_paid = true;
        for course in courses {
            if !user.paid_courses.contains(course) {
                user.paid_courses.push(*course);
            }
        }
        user.paid_courses.sort_unstable();
        if premium {
            user.subscription_status = Some("premium".to_string());
        }
        user.updated_at = Utc::now();

        Ok((user.value().clone(), first_payment))
    }

    async fn append_payment_log(&self, entry: NewPaymentLog) -> Result<(), StoreError> {
        if self.payment_log_offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("payment_logs".to_string()));
        }

        let log = PaymentLog {
            id: Uuid::new_v4().hyphenated().to_string(),
            user_id: entry.user_id,
            provider: entry.provider,
            external_id: entry.external_id,
            amount_cents: entry.amount_cents,
            currency: entry.currency,
            status: entry.status,
            created_at: Utc::now(),
        };
        self.payment_logs.insert(log.id.clone(), log);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> Identity {
        Identity {
            user_id: id.to_string(),
            email: format!("{}@example.com", id),
        }
    }

    fn withdrawal(user_id: &str, amount_cents: i64) -> NewWithdrawal {
        NewWithdrawal {
            user_id: user_id.to_string(),
            amount_cents,
            payment_method: "paypal".to_string(),
            payment_details: serde_json::json!({"email": "payout@example.com"}),
        }
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let store = MemoryLedgerStore::new();
        let (first, created) = store.ensure_user(&identity("alice")).await.unwrap();
        let (second, created_again) = store.ensure_user(&identity("alice")).await.unwrap();

        assert!(created);
        assert!(!created_again);
        assert_eq!(first.referral_code, second.referral_code);
        assert_eq!(first.referral_code.len(), 8);
    }

    #[tokio::test]
    async fn concurrent_withdrawals_never_overdraw() {
        let store = std::sync::Arc::new(MemoryLedgerStore::new());
        store.ensure_user(&identity("alice")).await.unwrap();
        store.set_balance("alice", 10_000).unwrap();

        let attempts = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.create_withdrawal(withdrawal("alice", 6_000)).await })
        });
        let results = futures_util::future::join_all(attempts).await;

        let accepted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        let user = store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(user.balance_cents, 4_000);
    }

    #[tokio::test]
    async fn deciding_twice_is_refused() {
        let store = MemoryLedgerStore::new();
        store.ensure_user(&identity("alice")).await.unwrap();
        store.set_balance("alice", 10_000).unwrap();
        let request = store
            .create_withdrawal(withdrawal("alice", 6_000))
            .await
            .unwrap();

        store
            .decide_withdrawal(&request.id, Decision::Rejected, None)
            .await
            .unwrap();
        let again = store
            .decide_withdrawal(&request.id, Decision::Rejected, None)
            .await;

        assert!(matches!(
            again,
            Err(StoreError::AlreadyProcessed(WithdrawalStatus::Rejected))
        ));
        let user = store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(user.balance_cents, 10_000);
    }

    #[tokio::test]
    async fn settling_referrals_pays_each_edge_once() {
        let store = MemoryLedgerStore::new();
        store.ensure_user(&identity("referrer")).await.unwrap();
        store.ensure_user(&identity("friend")).await.unwrap();
        store.create_referral("referrer", "friend").await.unwrap();

        let first = store.settle_referrals("friend", 1_000).await.unwrap();
        let second = store.settle_referrals("friend", 1_000).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        let referrer = store.get_user("referrer").await.unwrap().unwrap();
        assert_eq!(referrer.balance_cents, 1_000);
        assert_eq!(referrer.total_referrals, 1);
        assert_eq!(referrer.paid_referrals, 1);
    }

    #[tokio::test]
    async fn payment_events_are_claimed_once() {
        let store = MemoryLedgerStore::new();

        assert!(store
            .claim_payment_event(PaymentProvider::Stripe, "cs_1")
            .await
            .unwrap());
        assert!(!store
            .claim_payment_event(PaymentProvider::Stripe, "cs_1")
            .await
            .unwrap());
        assert!(store
            .claim_payment_event(PaymentProvider::LiqPay, "cs_1")
            .await
            .unwrap());

        store
            .release_payment_event(PaymentProvider::Stripe, "cs_1")
            .await
            .unwrap();
        assert!(store
            .claim_payment_event(PaymentProvider::Stripe, "cs_1")
            .await
            .unwrap());
    }
}
