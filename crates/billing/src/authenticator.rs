//! Event and caller authentication
//!
//! Three gates guard the engine:
//!
//! - **Webhook secret**: the aggregator sends `Authorization: Bearer <secret>`.
//!   The authenticator is built from an optional secret; when none is
//!   configured it is constructed locked and rejects every request.
//! - **Caller resolution**: a session token is verified by an
//!   [`IdentityVerifier`] and the caller's role is loaded from the profile.
//! - **Policies**: admin-only, self-or-admin, and user sync (identity is the
//!   implicit target).

use std::sync::Arc;

use async_trait::async_trait;
use larder_shared::UserRole;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::profiles::ProfileStore;

/// Compare two secrets without leaking where they differ
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // Still do a comparison so a length mismatch costs the same
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

#[derive(Clone)]
enum SecretState {
    Enforcing(String),
    Locked,
}

/// Shared-secret authenticator for the aggregator webhook
#[derive(Clone)]
pub struct WebhookAuthenticator {
    state: SecretState,
}

impl WebhookAuthenticator {
    /// A missing or blank secret produces a locked authenticator
    pub fn new(secret: Option<String>) -> Self {
        let state = match secret {
            Some(s) if !s.trim().is_empty() => SecretState::Enforcing(s),
            _ => {
                tracing::warn!("Webhook secret not configured - endpoint will reject all requests");
                SecretState::Locked
            }
        };
        Self { state }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.state, SecretState::Enforcing(_))
    }

    /// Check the raw `Authorization` header value
    pub fn verify(&self, authorization: Option<&str>) -> BillingResult<()> {
        let secret = match &self.state {
            SecretState::Enforcing(secret) => secret,
            SecretState::Locked => {
                tracing::error!("Rejecting webhook: secret not configured");
                return Err(BillingError::NotConfigured(
                    "webhook secret is not configured".to_string(),
                ));
            }
        };

        let presented = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| {
                BillingError::Unauthenticated("missing bearer authorization".to_string())
            })?;

        if !constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
            tracing::warn!("Rejecting webhook: authorization mismatch");
            return Err(BillingError::Unauthenticated(
                "invalid webhook authorization".to_string(),
            ));
        }

        Ok(())
    }
}

/// Verifies a session token and returns the user it was issued to
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> BillingResult<Uuid>;
}

/// An authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Caller {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: UserRole::User,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: UserRole::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

/// Turns a bearer token into a [`Caller`] with its stored role
#[derive(Clone)]
pub struct CallerResolver {
    verifier: Arc<dyn IdentityVerifier>,
    profiles: Arc<dyn ProfileStore>,
}

impl CallerResolver {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, profiles: Arc<dyn ProfileStore>) -> Self {
        Self { verifier, profiles }
    }

    pub async fn resolve(&self, token: Option<&str>) -> BillingResult<Caller> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BillingError::Unauthenticated("missing session token".to_string()))?;

        let user_id = self.verifier.verify(token).await.map_err(|e| match e {
            BillingError::Unauthenticated(_) => e,
            other => {
                tracing::warn!(error = %other, "Session token verification failed");
                BillingError::Unauthenticated("invalid session token".to_string())
            }
        })?;

        // A caller without a profile is still authenticated, just never an admin
        let role = self
            .profiles
            .get_profile(user_id)
            .await?
            .map(|p| p.role)
            .unwrap_or_default();

        Ok(Caller { user_id, role })
    }
}

/// Admin-only operations
pub fn authorize_admin(caller: &Caller) -> BillingResult<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(BillingError::Forbidden("admin access required".to_string()))
    }
}

/// Self-service reads: the caller's own data, or anyone's for an admin
pub fn authorize_self_or_admin(caller: &Caller, target: Uuid) -> BillingResult<()> {
    if caller.user_id == target || caller.is_admin() {
        Ok(())
    } else {
        Err(BillingError::Forbidden(
            "cannot access another user's subscription".to_string(),
        ))
    }
}

/// User-initiated sync acts on the caller's own record only
pub fn authorize_user_sync(caller: &Caller) -> Uuid {
    caller.user_id
}
