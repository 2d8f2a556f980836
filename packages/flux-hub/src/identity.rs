//! Bearer-token verification.
//!
//! The hub never stores credentials; every WebSocket upgrade carries a
//! bearer token that is validated against the external identity provider.
//! The provider is a trait so tests can swap in a static map.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// How long to wait on the identity provider before failing the upgrade.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// A verified identity.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub email: String,
}

impl AuthedUser {
    /// Display handle: the email local-part.
    pub fn handle(&self) -> &str {
        self.email.split('@').next().unwrap_or(&self.email)
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    /// The token is missing, expired, or unknown to the provider.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// The provider could not be reached or answered garbage.
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Token verification seam.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthedUser, AuthError>;
}

// ── HTTP provider ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    user_id: String,
    email: String,
}

/// Verifies tokens against the identity service's verify endpoint.
pub struct HttpIdentityProvider {
    verify_url: String,
    client: reqwest::Client,
}

impl HttpIdentityProvider {
    pub fn new(verify_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            verify_url: verify_url.into(),
            client,
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify(&self, token: &str) -> Result<AuthedUser, AuthError> {
        let response = self
            .client
            .get(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AuthError::Unauthenticated);
        }

        let response = response
            .error_for_status()
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let verified: VerifyResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        Ok(AuthedUser {
            user_id: verified.user_id,
            email: verified.email,
        })
    }
}

// ── Static provider (tests) ───────────────────────────────────────────────────

/// Fixed token → identity map for tests.
#[derive(Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, AuthedUser>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            AuthedUser {
                user_id: user_id.into(),
                email: email.into(),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, token: &str) -> Result<AuthedUser, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }
}
