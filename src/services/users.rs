use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::{
    models::users::{Identity, Role, User},
    repositories::LedgerStore,
};

pub enum UserRequest {
    EnsureAccount {
        identity: Identity,
        referral_code: Option<String>,
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
    GetAccount {
        user_id: String,
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
    GrantAdmin {
        email: String,
        response: oneshot::Sender<Result<User, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct UserRequestHandler {
    store: Arc<dyn LedgerStore>,
}

impl UserRequestHandler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        UserRequestHandler { store }
    }

    /// Creates the account on first sight. A referral code only counts for a brand new
    /// account and never for the account's own code.
    pub async fn ensure_account(
        &self,
        identity: Identity,
        referral_code: Option<String>,
    ) -> Result<User, ServiceError> {
        let (user, created) = self
            .store
            .ensure_user(&identity)
            .await
            .map_err(|e| ServiceError::from_store("UserService", e))?;

        let code = referral_code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if let (true, Some(code)) = (created, code) {
            self.register_referral(&user, &code).await;
        }

        Ok(user)
    }

    async fn register_referral(&self, user: &User, code: &str) {
        let referrer = match self.store.get_user_by_referral_code(code).await {
            Ok(Some(referrer)) if referrer.id != user.id => referrer,
            Ok(_) => {
                log::warn!("Ignoring unknown referral code {} for {}.", code, user.id);
                return;
            }
            Err(e) => {
                log::error!("Could not look up referral code {}: {}", code, e);
                return;
            }
        };

        match self.store.create_referral(&referrer.id, &user.id).await {
            Ok(referral) => log::info!(
                "Registered referral {} ({} -> {}).",
                referral.id,
                referrer.id,
                user.id
            ),
            Err(e) => log::error!(
                "Could not register referral {} -> {}: {}",
                referrer.id,
                user.id,
                e
            ),
        }
    }

    pub async fn get_account(&self, user_id: &str) -> Result<User, ServiceError> {
        self.store
            .get_user(user_id)
            .await
            .map_err(|e| ServiceError::from_store("UserService", e))?
            .ok_or_else(|| ServiceError::NotFound(format!("account {}", user_id)))
    }

    pub async fn grant_admin(&self, email: &str) -> Result<User, ServiceError> {
        let user = self
            .store
            .set_role(email, Role::Admin)
            .await
            .map_err(|e| ServiceError::from_store("UserService", e))?;
        log::info!("Granted admin role to {}.", user.email);

        Ok(user)
    }
}

#[async_trait]
impl RequestHandler<UserRequest> for UserRequestHandler {
    async fn handle_request(&self, request: UserRequest) {
        match request {
            UserRequest::EnsureAccount {
                identity,
                referral_code,
                response,
            } => {
                let user = self.ensure_account(identity, referral_code).await;
                let _ = response.send(user);
            }
            UserRequest::GetAccount { user_id, response } => {
                let user = self.get_account(&user_id).await;
                let _ = response.send(user);
            }
            UserRequest::GrantAdmin { email, response } => {
                let user = self.grant_admin(&email).await;
                let _ = response.send(user);
            }
        }
    }
}

pub struct UserService;

impl UserService {
    pub fn new() -> Self {
        UserService {}
    }
}

#[async_trait]
impl Service<UserRequest, UserRequestHandler> for UserService {}
