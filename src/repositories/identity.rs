use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::models::users::Identity;

/// Resolves a bearer token to the caller's identity. `Ok(None)` means the token is not
/// accepted.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, anyhow::Error>;
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

/// Client for the hosted auth service (`GET /auth/v1/user`).
pub struct HostedAuth {
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HostedAuth {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            url,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HostedAuth {
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, anyhow::Error> {
        let response = self
            .client
            .get(format!("{}/auth/v1/user", self.url.trim_end_matches('/')))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
            status if !status.is_success() => {
                anyhow::bail!("Auth service answered {}", status)
            }
            _ => {}
        }

        let user: AuthUser = response.json().await?;
        Ok(user.email.map(|email| Identity {
            user_id: user.id,
            email,
        }))
    }
}

/// Fixed token table for tests.
#[cfg(test)]
#[derive(Default)]
pub struct StaticIdentities {
    tokens: dashmap::DashMap<String, Identity>,
}

#[cfg(test)]
impl StaticIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, token: &str, user_id: &str, email: &str) -> Self {
        self.tokens.insert(
            token.to_string(),
            Identity {
                user_id: user_id.to_string(),
                email: email.to_string(),
            },
        );
        self
    }
}

#[cfg(test)]
#[async_trait]
impl IdentityProvider for StaticIdentities {
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>, anyhow::Error> {
        Ok(self.tokens.get(token).map(|i| i.value().clone()))
    }
}
