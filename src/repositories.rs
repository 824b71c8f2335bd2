use async_trait::async_trait;

use crate::models::{
    payments::{NewPaymentLog, PaymentProvider},
    referrals::Referral,
    users::{Identity, Role, User},
    withdrawals::{Decision, NewWithdrawal, WithdrawalRequest, WithdrawalStatus},
};

pub mod identity;
pub mod memory;
pub mod postgres;
pub mod providers;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Insufficient balance: {available} cents available")]
    InsufficientBalance { available: i64 },
    #[error("Withdrawal request already {}", .0.as_str())]
    AlreadyProcessed(WithdrawalStatus),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Authoritative record of accounts, referral edges, withdrawal requests and payment
/// events. Every balance mutation is a single atomic operation at the store level.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Returns the account for `identity`, creating it on first sight. The flag is true
    /// when the account was created by this call.
    async fn ensure_user(&self, identity: &Identity) -> Result<(User, bool), StoreError>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn get_user_by_referral_code(&self, code: &str) -> Result<Option<User>, StoreError>;

    async fn set_role(&self, email: &str, role: Role) -> Result<User, StoreError>;

    /// Records a `pending` edge and bumps the referrer's `total_referrals`.
    async fn create_referral(
        &self,
        referrer_id: &str,
        referred_id: &str,
    ) -> Result<Referral, StoreError>;

    async fn list_referrals(&self, referrer_id: &str) -> Result<Vec<Referral>, StoreError>;

    /// Flips every `pending` edge of `referred_id` to `paid` and credits each referrer
    /// `reward_cents`. Returns the edges that were settled by this call.
    async fn settle_referrals(
        &self,
        referred_id: &str,
        reward_cents: i64,
    ) -> Result<Vec<Referral>, StoreError>;

    /// Inserts a `pending` request and debits its amount in one step. Fails with
    /// `InsufficientBalance` without writing anything when the balance is short.
    async fn create_withdrawal(
        &self,
        withdrawal: NewWithdrawal,
    ) -> Result<WithdrawalRequest, StoreError>;

    async fn get_withdrawal(&self, id: &str) -> Result<Option<WithdrawalRequest>, StoreError>;

    /// Newest first. `None` lists every user's requests.
    async fn list_withdrawals(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError>;

    /// Moves a `pending` request to its terminal status, refunding the reserved amount on
    /// rejection in the same step.
    async fn decide_withdrawal(
        &self,
        id: &str,
        decision: Decision,
        admin_notes: Option<String>,
    ) -> Result<WithdrawalRequest, StoreError>;

    /// Claims the idempotency key of a provider event. Returns false if it was already
    /// claimed.
    async fn claim_payment_event(
        &self,
        provider: PaymentProvider,
        external_id: &str,
    ) -> Result<bool, StoreError>;

    async fn release_payment_event(
        &self,
        provider: PaymentProvider,
        external_id: &str,
    ) -> Result<(), StoreError>;

    /// Sets `has_paid`, unions `courses` into `paid_courses` and, when `premium`, marks the
    /// subscription premium. The flag is true when `has_paid` flipped on this call.
    async fn grant_access(
        &self,
        user_id: &str,
        courses: &[i32],
        premium: bool,
    ) -> Result<(User, bool), StoreError>;

    async fn append_payment_log(&self, entry: NewPaymentLog) -> Result<(), StoreError>;
}
