//! Supabase session token validation

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use larder_billing::{BillingError, BillingResult, IdentityVerifier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audience Supabase puts on signed-in user tokens
const SUPABASE_AUDIENCE: &str = "authenticated";

/// JWT claims structure for Supabase-issued tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseClaims {
    /// Subject (user ID as string, parsed to UUID)
    pub sub: String,
    pub email: Option<String>,
    /// Role (authenticated, anon, etc.)
    pub role: Option<String>,
    pub aud: Option<String>,
    pub iat: Option<i64>,
    pub exp: i64,
}

/// JWT manager for session token validation
#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(supabase_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(supabase_secret.as_bytes()),
        }
    }

    /// Validate and decode a Supabase token
    pub fn validate_token(&self, token: &str) -> Result<SupabaseClaims, JwtError> {
        // Explicit algorithm prevents algorithm confusion attacks
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[SUPABASE_AUDIENCE]);
        validation.leeway = 60;

        decode::<SupabaseClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }

    /// Validate a token and return the user it was issued to
    pub fn validate_user(&self, token: &str) -> Result<Uuid, JwtError> {
        let claims = self.validate_token(token)?;
        Uuid::parse_str(&claims.sub).map_err(|_| JwtError::InvalidSubject)
    }
}

#[async_trait]
impl IdentityVerifier for JwtManager {
    async fn verify(&self, token: &str) -> BillingResult<Uuid> {
        self.validate_user(token).map_err(|e| {
            tracing::debug!(error = %e, "Session token rejected");
            BillingError::Unauthenticated(e.to_string())
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token subject is not a user id")]
    InvalidSubject,
    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};

    pub const TEST_SECRET: &str = "test-supabase-jwt-secret-at-least-32-chars";

    pub fn token_for(user_id: Uuid, audience: &str, ttl: Duration) -> String {
        let now = OffsetDateTime::now_utc();
        let claims = SupabaseClaims {
            sub: user_id.to_string(),
            email: Some(format!("{}@example.com", user_id)),
            role: Some("authenticated".to_string()),
            aud: Some(audience.to_string()),
            iat: Some(now.unix_timestamp()),
            exp: (now + ttl).unix_timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap()
    }

    pub fn valid_token(user_id: Uuid) -> String {
        token_for(user_id, SUPABASE_AUDIENCE, Duration::hours(1))
    }
}

#[cfg(test)]
mod tests {
    use super::test_tokens::*;
    use super::*;
    use time::Duration;

    #[test]
    fn test_valid_token_yields_user() {
        let user = Uuid::new_v4();
        let manager = JwtManager::new(TEST_SECRET);
        assert_eq!(manager.validate_user(&valid_token(user)).unwrap(), user);
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = JwtManager::new(TEST_SECRET);
        let token = token_for(Uuid::new_v4(), SUPABASE_AUDIENCE, Duration::hours(-2));
        assert!(matches!(manager.validate_user(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let manager = JwtManager::new(TEST_SECRET);
        let token = token_for(Uuid::new_v4(), "anon", Duration::hours(1));
        assert!(manager.validate_user(&token).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let manager = JwtManager::new("a-completely-different-secret-of-32-chars");
        assert!(manager.validate_user(&valid_token(Uuid::new_v4())).is_err());
    }

    #[tokio::test]
    async fn test_verifier_maps_to_unauthenticated() {
        let manager = JwtManager::new(TEST_SECRET);
        assert!(matches!(
            IdentityVerifier::verify(&manager, "garbage").await,
            Err(BillingError::Unauthenticated(_))
        ));
    }
}
