use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::{
    models::withdrawals::{Amount, NewWithdrawal, WithdrawalRequest},
    repositories::{LedgerStore, StoreError},
};

pub enum WithdrawalServiceRequest {
    Request {
        user_id: String,
        amount: Amount,
        payment_method: String,
        payment_details: Option<serde_json::Value>,
        response: oneshot::Sender<Result<WithdrawalRequest, ServiceError>>,
    },
    List {
        user_id: String,
        response: oneshot::Sender<Result<Vec<WithdrawalRequest>, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct WithdrawalRequestHandler {
    store: Arc<dyn LedgerStore>,
    minimum_cents: i64,
}

impl WithdrawalRequestHandler {
    pub fn new(store: Arc<dyn LedgerStore>, minimum_cents: i64) -> Self {
        Self {
            store,
            minimum_cents,
        }
    }

    /// Validates the request and reserves the amount. The balance check is repeated by the
    /// store inside the debit, so a concurrent request cannot spend the same funds.
    pub async fn request_withdrawal(
        &self,
        user_id: &str,
        amount: &Amount,
        payment_method: &str,
        payment_details: Option<serde_json::Value>,
    ) -> Result<WithdrawalRequest, ServiceError> {
        let amount_cents = amount.to_cents().map_err(ServiceError::Validation)?;

        let payment_method = payment_method.trim();
        if payment_method.is_empty() {
            return Err(ServiceError::Validation(
                "Payment method is required.".to_string(),
            ));
        }
        let payment_details = match payment_details {
            Some(details) if !details.is_null() => details,
            _ => {
                return Err(ServiceError::Validation(
                    "Payment details are required.".to_string(),
                ))
            }
        };

        if amount_cents < self.minimum_cents {
            return Err(ServiceError::BelowMinimum {
                amount_cents,
                minimum_cents: self.minimum_cents,
            });
        }

        let user = self
            .store
            .get_user(user_id)
            .await
            .map_err(|e| ServiceError::from_store("WithdrawalService", e))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", user_id)))?;
        if user.balance_cents < amount_cents {
            return Err(ServiceError::InsufficientBalance {
                requested_cents: amount_cents,
                available_cents: user.balance_cents,
            });
        }

        let request = self
            .store
            .create_withdrawal(NewWithdrawal {
                user_id: user_id.to_string(),
                amount_cents,
                payment_method: payment_method.to_string(),
                payment_details,
            })
            .await
            .map_err(|e| match e {
                StoreError::InsufficientBalance { available } => {
                    ServiceError::InsufficientBalance {
                        requested_cents: amount_cents,
                        available_cents: available,
                    }
                }
                StoreError::NotFound(what) => ServiceError::NotFound(what),
                other => {
                    log::error!("Could not record withdrawal for {}: {}", user_id, other);
                    ServiceError::UpdateFailed(other.to_string())
                }
            })?;

        log::info!(
            "Withdrawal {} of {} cents reserved for {}.",
            request.id,
            request.amount_cents,
            user_id
        );

        Ok(request)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<WithdrawalRequest>, ServiceError> {
        self.store
            .list_withdrawals(Some(user_id))
            .await
            .map_err(|e| ServiceError::from_store("WithdrawalService", e))
    }
}

#[async_trait]
impl RequestHandler<WithdrawalServiceRequest> for WithdrawalRequestHandler {
    async fn handle_request(&self, request: WithdrawalServiceRequest) {
        match request {
            WithdrawalServiceRequest::Request {
                user_id,
                amount,
                payment_method,
                payment_details,
                response,
            } => {
                let result = self
                    .request_withdrawal(&user_id, &amount, &payment_method, payment_details)
                    .await;
                let _ = response.send(result);
            }
            WithdrawalServiceRequest::List { user_id, response } => {
                let result = self.list(&user_id).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct WithdrawalService;

impl WithdrawalService {
    pub fn new() -> Self {
        WithdrawalService {}
    }
}

#[async_trait]
impl Service<WithdrawalServiceRequest, WithdrawalRequestHandler> for WithdrawalService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{users::Identity, withdrawals::WithdrawalStatus},
        repositories::memory::MemoryLedgerStore,
    };

    async fn funded_store(balance_cents: i64) -> Arc<MemoryLedgerStore> {
        let store = Arc::new(MemoryLedgerStore::new());
        store
            .ensure_user(&Identity {
                user_id: "alice".to_string(),
                email: "alice@example.com".to_string(),
            })
            .await
            .unwrap();
        store.set_balance("alice", balance_cents).unwrap();
        store
    }

    fn details() -> Option<serde_json::Value> {
        Some(serde_json::json!({"email": "alice@paypal.example"}))
    }

    async fn balance(store: &MemoryLedgerStore) -> i64 {
        store.get_user("alice").await.unwrap().unwrap().balance_cents
    }

    #[tokio::test]
    async fn amounts_below_minimum_are_rejected() {
        let store = funded_store(100_00).await;
        let handler = WithdrawalRequestHandler::new(store.clone(), 50_00);

        for amount in ["0", "10", "49.99"] {
            let result = handler
                .request_withdrawal(
                    "alice",
                    &Amount::Text(amount.to_string()),
                    "paypal",
                    details(),
                )
                .await;
            assert!(matches!(result, Err(ServiceError::BelowMinimum { .. })));
        }
        assert_eq!(balance(&store).await, 100_00);
    }

    #[tokio::test]
    async fn amounts_above_balance_are_rejected() {
        let store = funded_store(100_00).await;
        let handler = WithdrawalRequestHandler::new(store.clone(), 50_00);

        let result = handler
            .request_withdrawal(
                "alice",
                &Amount::Text("100.01".to_string()),
                "paypal",
                details(),
            )
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::InsufficientBalance {
                requested_cents: 100_01,
                available_cents: 100_00
            })
        ));
        assert_eq!(balance(&store).await, 100_00);
    }

    #[tokio::test]
    async fn valid_request_reserves_the_amount() {
        let store = funded_store(100_00).await;
        let handler = WithdrawalRequestHandler::new(store.clone(), 50_00);

        let request = handler
            .request_withdrawal("alice", &Amount::Number(60.0), "paypal", details())
            .await
            .unwrap();

        assert_eq!(request.status, WithdrawalStatus::Pending);
        assert_eq!(request.amount_cents, 60_00);
        assert_eq!(balance(&store).await, 40_00);

        let pending = handler.list("alice").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, request.id);
    }

    #[tokio::test]
    async fn malformed_input_is_a_validation_error() {
        let store = funded_store(100_00).await;
        let handler = WithdrawalRequestHandler::new(store.clone(), 50_00);

        let bad_amount = handler
            .request_withdrawal("alice", &Amount::Text("lots".to_string()), "paypal", details())
            .await;
        let no_method = handler
            .request_withdrawal("alice", &Amount::Number(60.0), "  ", details())
            .await;
        let no_details = handler
            .request_withdrawal("alice", &Amount::Number(60.0), "paypal", None)
            .await;

        assert!(matches!(bad_amount, Err(ServiceError::Validation(_))));
        assert!(matches!(no_method, Err(ServiceError::Validation(_))));
        assert!(matches!(no_details, Err(ServiceError::Validation(_))));
        assert_eq!(balance(&store).await, 100_00);
    }
}
