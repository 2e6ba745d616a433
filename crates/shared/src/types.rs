//! Common types used across Larder

use serde::{Deserialize, Serialize};

use crate::error::SharedError;

// =============================================================================
// Enums
// =============================================================================

/// Entitlement tier granted by a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
    Pro,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Pro => "pro",
        }
    }

    /// Paid tiers unlock premium features
    pub fn is_premium(&self) -> bool {
        matches!(self, Self::Premium | Self::Pro)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "premium" => Ok(Self::Premium),
            "pro" => Ok(Self::Pro),
            _ => Err(SharedError::InvalidTier(s.to_string())),
        }
    }
}

/// Lifecycle status of a subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Cancelled,
    Expired,
    BillingIssue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::BillingIssue => "billing_issue",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            // Stripe spells it with one "l"
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            "billing_issue" => Ok(Self::BillingIssue),
            _ => Err(SharedError::InvalidStatus(s.to_string())),
        }
    }
}

/// Payment backend that owns a subscription
///
/// Unrecognised store names reported by the aggregator are kept verbatim in
/// [`Provider::Other`] rather than rejected. Build those with
/// [`Provider::other`] so a tag that names a known provider never ends up in
/// `Other`, where it would read back as a different value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    Stripe,
    Apple,
    Google,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stripe => "stripe",
            Self::Apple => "apple",
            Self::Google => "google",
            Self::Other(tag) => tag,
        }
    }

    /// Provider for a free-form tag; known names map to their own variant
    pub fn other(tag: impl Into<String>) -> Self {
        Self::from(tag.into())
    }

    /// Parse a provider a client is allowed to claim for a native store sync
    pub fn parse_native(s: &str) -> Result<Self, SharedError> {
        match s {
            "apple" => Ok(Self::Apple),
            "google" => Ok(Self::Google),
            _ => Err(SharedError::InvalidProvider(s.to_string())),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Provider {
    fn from(s: String) -> Self {
        match s.as_str() {
            "stripe" => Self::Stripe,
            "apple" => Self::Apple,
            "google" => Self::Google,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for Provider {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<Provider> for String {
    fn from(p: Provider) -> Self {
        match p {
            Provider::Other(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

/// Account role stored on the profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
}

impl UserRole {
    /// Anything other than `admin` is an ordinary user
    pub fn from_db(role: Option<&str>) -> Self {
        match role {
            Some("admin") => Self::Admin,
            _ => Self::User,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::User => write!(f, "user"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trips_through_str() {
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::Premium,
            SubscriptionTier::Pro,
        ] {
            assert_eq!(tier.to_string().parse::<SubscriptionTier>().unwrap(), tier);
        }
        assert!("gold".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_premium_tiers() {
        assert!(!SubscriptionTier::Free.is_premium());
        assert!(SubscriptionTier::Premium.is_premium());
        assert!(SubscriptionTier::Pro.is_premium());
    }

    #[test]
    fn test_status_accepts_stripe_spelling() {
        assert_eq!(
            "canceled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Cancelled
        );
        assert_eq!(
            "billing_issue".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::BillingIssue
        );
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_provider_passes_unknown_tags_through() {
        assert_eq!(Provider::from("apple"), Provider::Apple);
        assert_eq!(
            Provider::from("AMAZON"),
            Provider::Other("AMAZON".to_string())
        );
        assert_eq!(String::from(Provider::Other("AMAZON".into())), "AMAZON");

        let json = serde_json::to_string(&Provider::Google).unwrap();
        assert_eq!(json, "\"google\"");
    }

    #[test]
    fn test_other_constructor_normalises_known_names() {
        assert_eq!(Provider::other("apple"), Provider::Apple);
        assert_eq!(Provider::other("stripe"), Provider::Stripe);
        assert_eq!(Provider::other("AMAZON"), Provider::Other("AMAZON".into()));

        for tag in ["apple", "google", "stripe", "AMAZON", "unknown"] {
            let provider = Provider::other(tag);
            assert_eq!(Provider::from(String::from(provider.clone())), provider);
        }
    }

    #[test]
    fn test_native_provider_rejects_stripe() {
        assert_eq!(Provider::parse_native("apple").unwrap(), Provider::Apple);
        assert!(Provider::parse_native("stripe").is_err());
        assert!(Provider::parse_native("Apple").is_err());
    }

    #[test]
    fn test_role_from_db() {
        assert!(UserRole::from_db(Some("admin")).is_admin());
        assert!(!UserRole::from_db(Some("editor")).is_admin());
        assert!(!UserRole::from_db(Some("Admin")).is_admin());
        assert!(!UserRole::from_db(Some("ADMIN ")).is_admin());
        assert!(!UserRole::from_db(None).is_admin());
    }
}
