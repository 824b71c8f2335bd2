use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use super::{memory::generate_referral_code, LedgerStore, StoreError};
use crate::models::{
    payments::{NewPaymentLog, PaymentProvider},
    referrals::Referral,
    users::{Identity, Role, User},
    withdrawals::{Decision, NewWithdrawal, WithdrawalRequest, WithdrawalStatus},
};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    role: String,
    referral_code: String,
    balance_cents: i64,
    total_referrals: i32,
    paid_referrals: i32,
    has_paid: bool,
    paid_courses: Vec<i32>,
    subscription_status: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            role: row.role.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            email: row.email,
            referral_code: row.referral_code,
            balance_cents: row.balance_cents,
            total_referrals: row.total_referrals,
            paid_referrals: row.paid_referrals,
            has_paid: row.has_paid,
            paid_courses: row.paid_courses,
            subscription_status: row.subscription_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReferralRow {
    id: String,
    referrer_id: String,
    referred_id: String,
    status: String,
    created_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReferralRow> for Referral {
    type Error = StoreError;

    fn try_from(row: ReferralRow) -> Result<Self, Self::Error> {
        Ok(Referral {
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            referrer_id: row.referrer_id,
            referred_id: row.referred_id,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: String,
    user_id: String,
    amount_cents: i64,
    payment_method: String,
    payment_details: serde_json::Value,
    status: String,
    admin_notes: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WithdrawalRow> for WithdrawalRequest {
    type Error = StoreError;

    fn try_from(row: WithdrawalRow) -> Result<Self, Self::Error> {
        Ok(WithdrawalRequest {
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            user_id: row.user_id,
            amount_cents: row.amount_cents,
            payment_method: row.payment_method,
            payment_details: row.payment_details,
            admin_notes: row.admin_notes,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Clone)]
pub struct PgLedgerStore {
    conn: PgPool,
}

impl PgLedgerStore {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, anyhow::Error> {
        let conn = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations").run(&conn).await?;

        Ok(Self::new(conn))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_user(&self, identity: &Identity) -> Result<(User, bool), StoreError> {
        let inserted = sqlx::query_as::<_, UserRow>(
            r#"
                INSERT INTO users (id, email, referral_code)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO NOTHING
                RETURNING id, email, role, referral_code, balance_cents, total_referrals,
                    paid_referrals, has_paid, paid_courses, subscription_status, created_at, updated_at
            "#,
        )
        .bind(&identity.user_id)
        .bind(&identity.email)
        .bind(generate_referral_code())
        .fetch_optional(&self.conn)
        .await?;

        match inserted {
            Some(row) => Ok((row.try_into()?, true)),
            None => {
                let user = self.get_user(&identity.user_id).await?.ok_or_else(|| {
                    StoreError::NotFound(format!("user {}", identity.user_id))
                })?;
                Ok((user, false))
            }
        }
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
                SELECT id, email, role, referral_code, balance_cents, total_referrals,
                    paid_referrals, has_paid, paid_courses, subscription_status, created_at, updated_at
                FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.conn)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
                SELECT id, email, role, referral_code, balance_cents, total_referrals,
                    paid_referrals, has_paid, paid_courses, subscription_status, created_at, updated_at
                FROM users WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.conn)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn get_user_by_referral_code(&self, code: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
                SELECT id, email, role, referral_code, balance_cents, total_referrals,
                    paid_referrals, has_paid, paid_courses, subscription_status, created_at, updated_at
                FROM users WHERE referral_code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.conn)
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn set_role(&self, email: &str, role: Role) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
                UPDATE users SET role = $1, updated_at = CURRENT_TIMESTAMP
                WHERE LOWER(email) = LOWER($2)
                RETURNING id, email, role, referral_code, balance_cents, total_referrals,
                    paid_referrals, has_paid, paid_courses, subscription_status, created_at, updated_at
            "#,
        )
        .bind(role.as_str())
        .bind(email)
        .fetch_optional(&self.conn)
        .await?;

        row.ok_or_else(|| StoreError::NotFound(format!("user {}", email)))?
            .try_into()
    }

    async fn create_referral(
        &self,
        referrer_id: &str,
        referred_id: &str,
    ) -> Result<Referral, StoreError> {
        let mut tx = self.conn.begin().await?;

        let bumped = sqlx::query(
            r#"
                UPDATE users
                SET total_referrals = total_referrals + 1, updated_at = CURRENT_TIMESTAMP
                WHERE id = $1
            "#,
        )
        .bind(referrer_id)
        .execute(&mut *tx)
        .await?;
        if bumped.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {}", referrer_id)));
        }

        let row = sqlx::query_as::<_, ReferralRow>(
            r#"
                INSERT INTO referrals (id, referrer_id, referred_id, status)
                VALUES ($1, $2, $3, 'pending')
                RETURNING id, referrer_id, referred_id, status, created_at, paid_at
            "#,
        )
        .bind(Uuid::new_v4().hyphenated().to_string())
        .bind(referrer_id)
        .bind(referred_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn list_referrals(&self, referrer_id: &str) -> Result<Vec<Referral>, StoreError> {
        let rows = sqlx::query_as::<_, ReferralRow>(
            r#"
                SELECT id, referrer_id, referred_id, status, created_at, paid_at
                FROM referrals WHERE referrer_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(referrer_id)
        .fetch_all(&self.conn)
        .await?;

        rows.into_iter().map(Referral::try_from).collect()
    }

    async fn settle_referrals(
        &self,
        referred_id: &str,
        reward_cents: i64,
    ) -> Result<Vec<Referral>, StoreError> {
        let mut tx = self.conn.begin().await?;

        let rows = sqlx::query_as::<_, ReferralRow>(
            r#"
                UPDATE referrals SET status = 'paid', paid_at = CURRENT_TIMESTAMP
                WHERE referred_id = $1 AND status = 'pending'
                RETURNING id, referrer_id, referred_id, status, created_at, paid_at
            "#,
        )
        .bind(referred_id)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            sqlx::query(
                r#"
                    UPDATE users
                    SET balance_cents = balance_cents + $1,
                        paid_referrals = paid_referrals + 1,
                        updated_at = CURRENT_TIMESTAMP
                    WHERE id = $2
                "#,
            )
            .bind(reward_cents)
            .bind(&row.referrer_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        rows.into_iter().map(Referral::try_from).collect()
    }

    async fn create_withdrawal(
        &self,
        withdrawal: NewWithdrawal,
    ) -> Result<WithdrawalRequest, StoreError> {
        let mut tx = self.conn.begin().await?;

        let debited: Option<i64> = sqlx::query_scalar(
            r#"
                UPDATE users
                SET balance_cents = balance_cents - $1, updated_at = CURRENT_TIMESTAMP
                WHERE id = $2 AND balance_cents >= $1
                RETURNING balance_cents
            "#,
        )
        .bind(withdrawal.amount_cents)
        .bind(&withdrawal.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if debited.is_none() {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT balance_cents FROM users WHERE id = $1")
                    .bind(&withdrawal.user_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return Err(match available {
                Some(available) => StoreError::InsufficientBalance { available },
                None => StoreError::NotFound(format!("user {}", withdrawal.user_id)),
            });
        }

        let row = sqlx::query_as::<_, WithdrawalRow>(
            r#"
                INSERT INTO withdrawal_requests
                (id, user_id, amount_cents, payment_method, payment_details, status)
                VALUES ($1, $2, $3, $4, $5, 'pending')
                RETURNING id, user_id, amount_cents, payment_method, payment_details,
                    status, admin_notes, created_at, processed_at
            "#,
        )
        .bind(Uuid::new_v4().hyphenated().to_string())
        .bind(&withdrawal.user_id)
        .bind(withdrawal.amount_cents)
        .bind(&withdrawal.payment_method)
        .bind(&withdrawal.payment_details)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn get_withdrawal(&self, id: &str) -> Result<Option<WithdrawalRequest>, StoreError> {
        let row = sqlx::query_as::<_, WithdrawalRow>(
            r#"
                SELECT id, user_id, amount_cents, payment_method, payment_details,
                    status, admin_notes, created_at, processed_at
                FROM withdrawal_requests WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.conn)
        .await?;

        row.map(WithdrawalRequest::try_from).transpose()
    }

    async fn list_withdrawals(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<WithdrawalRequest>, StoreError> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            r#"
                SELECT id, user_id, amount_cents, payment_method, payment_details,
                    status, admin_notes, created_at, processed_at FROM withdrawal_requests
                WHERE ($1::TEXT IS NULL OR user_id = $1)
                ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.conn)
        .await?;

        rows.into_iter().map(WithdrawalRequest::try_from).collect()
    }

    async fn decide_withdrawal(
        &self,
        id: &str,
        decision: Decision,
        admin_notes: Option<String>,
    ) -> Result<WithdrawalRequest, StoreError> {
        let mut tx = self.conn.begin().await?;

        let current: WithdrawalRequest = sqlx::query_as::<_, WithdrawalRow>(
            r#"
                SELECT id, user_id, amount_cents, payment_method, payment_details,
                    status, admin_notes, created_at, processed_at
                FROM withdrawal_requests WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("withdrawal request {}", id)))?
        .try_into()?;

        if current.status != WithdrawalStatus::Pending {
            return Err(StoreError::AlreadyProcessed(current.status));
        }

        if decision == Decision::Rejected {
            let refunded = sqlx::query(
                r#"
                    UPDATE users
                    SET balance_cents = balance_cents + $1, updated_at = CURRENT_TIMESTAMP
                    WHERE id = $2
                "#,
            )
            .bind(current.amount_cents)
            .bind(&current.user_id)
            .execute(&mut *tx)
            .await?;
            if refunded.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("user {}", current.user_id)));
            }
        }

        let row = sqlx::query_as::<_, WithdrawalRow>(
            r#"
                UPDATE withdrawal_requests
                SET status = $1, admin_notes = $2, processed_at = CURRENT_TIMESTAMP
                WHERE id = $3
                RETURNING id, user_id, amount_cents, payment_method, payment_details,
                    status, admin_notes, created_at, processed_at
            "#,
        )
        .bind(WithdrawalStatus::from(decision).as_str())
        .bind(admin_notes)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn claim_payment_event(
        &self,
        provider: PaymentProvider,
        external_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
                INSERT INTO payment_events (provider, external_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
            "#,
        )
        .bind(provider.as_str())
        .bind(external_id)
        .execute(&self.conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_payment_event(
        &self,
        provider: PaymentProvider,
        external_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM payment_events WHERE provider = $1 AND external_id = $2")
            .bind(provider.as_str())
            .bind(external_id)
            .execute(&self.conn)
            .await?;

        Ok(())
    }

    async fn grant_access(
        &self,
        user_id: &str,
        courses: &[i32],
        premium: bool,
    ) -> Result<(User, bool), StoreError> {
        let mut tx = self.conn.begin().await?;

        let was_paid: bool =
            sqlx::query_scalar("SELECT has_paid FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("user {}", user_id)))?;

        let row = sqlx::query_as::<_, UserRow>(
            r#"
                UPDATE users
                SET has_paid = TRUE,
                    paid_courses = ARRAY(
                        SELECT DISTINCT c FROM unnest(paid_courses || $2::INTEGER[]) AS c ORDER BY c
                    ),
                    subscription_status = CASE WHEN $3 THEN 'premium' ELSE subscription_status END,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = $1
                RETURNING id, email, role, referral_code, balance_cents, total_referrals,
                    paid_referrals, has_paid, paid_courses, subscription_status, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(courses)
        .bind(premium)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((row.try_into()?, !was_paid))
    }

    async fn append_payment_log(&self, entry: NewPaymentLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
                INSERT INTO payment_logs
                (id, user_id, provider, external_id, amount_cents, currency, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4().hyphenated().to_string())
        .bind(&entry.user_id)
        .bind(entry.provider.as_str())
        .bind(&entry.external_id)
        .bind(entry.amount_cents)
        .bind(&entry.currency)
        .bind(&entry.status)
        .execute(&self.conn)
        .await?;

        Ok(())
    }
}
