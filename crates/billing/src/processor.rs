//! Billing processor capability
//!
//! The refund workflow needs three things from the processor: the customer's
//! latest subscription, their latest charge, and the ability to refund a
//! charge. [`ProcessorHandle`] makes the "processor not configured" case an
//! explicit variant so callers get a typed [`BillingError::Unavailable`]
//! instead of a client that fails on first use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stripe::{
    Charge, CreateRefund, CustomerId, ListCharges, ListSubscriptions, Refund,
    RefundReasonFilter, Subscription, SubscriptionStatusFilter,
};
use uuid::Uuid;

use crate::client::{StripeClient, StripeConfig};
use crate::error::{BillingError, BillingResult};

/// Processor view of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub id: String,
    /// Processor status string, e.g. `active` or `canceled`
    pub status: String,
    pub cancel_at_period_end: bool,
}

impl ProcessorSubscription {
    /// Canceled outright, or scheduled to cancel at period end
    pub fn is_cancelled_or_pending(&self) -> bool {
        self.status == "canceled" || self.cancel_at_period_end
    }
}

/// Processor view of a charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorCharge {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    /// `succeeded`, `pending` or `failed`
    pub status: String,
    pub refunded: bool,
}

/// A refund issued by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorRefund {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
}

/// Who asked for a refund, attached to the processor-side refund metadata
#[derive(Debug, Clone, Copy)]
pub struct RefundContext {
    pub actor_user_id: Uuid,
    pub target_user_id: Uuid,
}

#[async_trait]
pub trait BillingProcessor: Send + Sync {
    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProcessorSubscription>>;

    async fn latest_charge(&self, customer_id: &str) -> BillingResult<Option<ProcessorCharge>>;

    async fn refund_charge(
        &self,
        charge: &ProcessorCharge,
        context: RefundContext,
    ) -> BillingResult<ProcessorRefund>;
}

/// The processor capability, present or explicitly absent
#[derive(Clone)]
pub enum ProcessorHandle {
    Ready(Arc<dyn BillingProcessor>),
    Unavailable { reason: String },
}

impl ProcessorHandle {
    pub fn ready(processor: Arc<dyn BillingProcessor>) -> Self {
        Self::Ready(processor)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Build the Stripe-backed processor from `STRIPE_SECRET_KEY`
    pub fn from_env() -> Self {
        match StripeConfig::from_env() {
            Ok(config) => {
                tracing::info!("Stripe processor initialized");
                Self::Ready(Arc::new(StripeProcessor::new(StripeClient::new(config))))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stripe processor not configured");
                Self::unavailable(e.to_string())
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn get(&self) -> BillingResult<&dyn BillingProcessor> {
        match self {
            Self::Ready(processor) => Ok(processor.as_ref()),
            Self::Unavailable { reason } => Err(BillingError::Unavailable(format!(
                "billing processor unavailable: {}",
                reason
            ))),
        }
    }
}

/// Stripe implementation of [`BillingProcessor`]
pub struct StripeProcessor {
    stripe: StripeClient,
}

impl StripeProcessor {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn parse_customer(customer_id: &str) -> BillingResult<CustomerId> {
        customer_id.parse().map_err(|e| {
            BillingError::InvalidState(format!("Invalid Stripe customer ID: {}", e))
        })
    }
}

#[async_trait]
impl BillingProcessor for StripeProcessor {
    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProcessorSubscription>> {
        let mut params = ListSubscriptions::new();
        params.customer = Some(Self::parse_customer(customer_id)?);
        params.status = Some(SubscriptionStatusFilter::All);
        params.limit = Some(1);

        // Stripe lists newest first
        let list = Subscription::list(self.stripe.inner(), &params).await?;
        Ok(list.data.into_iter().next().map(|sub| ProcessorSubscription {
            id: sub.id.to_string(),
            status: sub.status.as_str().to_string(),
            cancel_at_period_end: sub.cancel_at_period_end,
        }))
    }

    async fn latest_charge(&self, customer_id: &str) -> BillingResult<Option<ProcessorCharge>> {
        let mut params = ListCharges::new();
        params.customer = Some(Self::parse_customer(customer_id)?);
        params.limit = Some(1);

        let list = Charge::list(self.stripe.inner(), &params).await?;
        Ok(list.data.into_iter().next().map(|charge| ProcessorCharge {
            id: charge.id.to_string(),
            amount: charge.amount,
            currency: charge.currency.to_string(),
            status: charge.status.as_str().to_string(),
            refunded: charge.refunded,
        }))
    }

    async fn refund_charge(
        &self,
        charge: &ProcessorCharge,
        context: RefundContext,
    ) -> BillingResult<ProcessorRefund> {
        let mut params = CreateRefund::new();
        params.charge = Some(
            charge
                .id
                .parse()
                .map_err(|e| BillingError::InvalidState(format!("Invalid charge ID: {}", e)))?,
        );
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let mut metadata = HashMap::new();
        metadata.insert("admin_refund".to_string(), "true".to_string());
        metadata.insert(
            "admin_user_id".to_string(),
            context.actor_user_id.to_string(),
        );
        metadata.insert("user_id".to_string(), context.target_user_id.to_string());
        params.metadata = Some(metadata);

        let refund = Refund::create(self.stripe.inner(), params).await?;

        Ok(ProcessorRefund {
            id: refund.id.to_string(),
            amount: refund.amount,
            currency: refund.currency.to_string(),
            status: refund.status.unwrap_or_else(|| "pending".to_string()),
        })
    }
}
