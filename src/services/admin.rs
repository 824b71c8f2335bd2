use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::{
    models::{
        users::{AccountSummary, User},
        withdrawals::{AdminWithdrawal, Decision, WithdrawalRequest},
    },
    repositories::LedgerStore,
};

pub enum AdminRequest {
    ListWithdrawals {
        caller_id: String,
        response: oneshot::Sender<Result<Vec<AdminWithdrawal>, ServiceError>>,
    },
    DecideWithdrawal {
        caller_id: String,
        id: String,
        decision: Decision,
        admin_notes: Option<String>,
        response: oneshot::Sender<Result<WithdrawalRequest, ServiceError>>,
    },
}

/// The single authorization rule for the back office.
pub fn require_admin(user: &User) -> Result<(), ServiceError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden)
    }
}

#[derive(Clone)]
pub struct AdminRequestHandler {
    store: Arc<dyn LedgerStore>,
}

impl AdminRequestHandler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn authorize(&self, caller_id: &str) -> Result<User, ServiceError> {
        let caller = self
            .store
            .get_user(caller_id)
            .await
            .map_err(|e| ServiceError::from_store("AdminService", e))?
            .ok_or(ServiceError::Forbidden)?;
        require_admin(&caller)?;

        Ok(caller)
    }

    /// Every request, newest first, with a summary of the requesting account.
    pub async fn list_withdrawals(
        &self,
        caller_id: &str,
    ) -> Result<Vec<AdminWithdrawal>, ServiceError> {
        self.authorize(caller_id).await?;

        let requests = self
            .store
            .list_withdrawals(None)
            .await
            .map_err(|e| ServiceError::from_store("AdminService", e))?;

        let mut user_ids: Vec<&str> = requests.iter().map(|r| r.user_id.as_str()).collect();
        user_ids.sort_unstable();
        user_ids.dedup();

        let lookups = user_ids.iter().map(|id| self.store.get_user(id));
        let accounts: HashMap<String, AccountSummary> = join_all(lookups)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(user) => user,
                Err(e) => {
                    log::warn!("Could not load account for withdrawal listing: {}", e);
                    None
                }
            })
            .map(|user| (user.id.clone(), AccountSummary::from(&user)))
            .collect();

        Ok(requests
            .into_iter()
            .map(|request| AdminWithdrawal {
                user: accounts.get(&request.user_id).cloned(),
                request,
            })
            .collect())
    }

    /// Finalizes a pending request. Rejection returns the reserved amount to the balance in
    /// the same store operation.
    pub async fn decide_withdrawal(
        &self,
        caller_id: &str,
        id: &str,
        decision: Decision,
        admin_notes: Option<String>,
    ) -> Result<WithdrawalRequest, ServiceError> {
        let caller = self.authorize(caller_id).await?;

        self.store
            .get_withdrawal(id)
            .await
            .map_err(|e| ServiceError::from_store("AdminService", e))?
            .ok_or_else(|| ServiceError::NotFound(format!("withdrawal request {}", id)))?;

        let request = self
            .store
            .decide_withdrawal(id, decision, admin_notes)
            .await
            .map_err(|e| ServiceError::from_store("AdminService", e))?;

        log::info!(
            "Withdrawal {} marked {} by {}.",
            request.id,
            request.status.as_str(),
            caller.email
        );

        Ok(request)
    }
}

#[async_trait]
impl RequestHandler<AdminRequest> for AdminRequestHandler {
    async fn handle_request(&self, request: AdminRequest) {
        match request {
            AdminRequest::ListWithdrawals {
                caller_id,
                response,
            } => {
                let result = self.list_withdrawals(&caller_id).await;
                let _ = response.send(result);
            }
            AdminRequest::DecideWithdrawal {
                caller_id,
                id,
                decision,
                admin_notes,
                response,
            } => {
                let result = self
                    .decide_withdrawal(&caller_id, &id, decision, admin_notes)
                    .await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct AdminService;

impl AdminService {
    pub fn new() -> Self {
        AdminService {}
    }
}

#[async_trait]
impl Service<AdminRequest, AdminRequestHandler> for AdminService {}
