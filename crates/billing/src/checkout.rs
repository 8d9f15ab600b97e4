//! Checkout sessions
//!
//! A session is recorded when the hosted checkout page is opened and is
//! completed exactly once, by the `checkout.session.completed` webhook.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::catalog::{PlanKind, PriceResolver};
use crate::client::{CheckoutCustomer, CheckoutMode, CheckoutSessionRequest, PaymentProcessor};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::store::{CheckoutSessionStore, SubscriptionStore};
use crate::subscriptions::normalize_identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    #[default]
    Open,
    Complete,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::Open => "open",
            CheckoutStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(CheckoutStatus::Open),
            "complete" => Some(CheckoutStatus::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub customer_email: Option<String>,
    pub customer_id: Option<String>,
    pub price_id: String,
    pub subscription_id: Option<String>,
    pub session_type: PlanKind,
    /// Declared amount at creation, in minor units
    pub amount_cents: i64,
    pub currency: String,
    pub status: CheckoutStatus,
    pub schedule_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl CheckoutSession {
    pub fn is_complete(&self) -> bool {
        self.status == CheckoutStatus::Complete
    }
}

/// What the processor reported when the session completed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCompletion {
    pub session_id: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub subscription_id: Option<String>,
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutRequest {
    pub price_id: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    /// Token identifying one checkout attempt; retries reuse it
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
    pub publishable_key: String,
    pub price_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub mode: String,
}

pub struct CheckoutService {
    catalog: Arc<dyn PriceResolver>,
    sessions: Arc<dyn CheckoutSessionStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    processor: Arc<dyn PaymentProcessor>,
    clock: Arc<dyn Clock>,
    publishable_key: String,
    default_success_url: String,
    default_cancel_url: String,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn PriceResolver>,
        sessions: Arc<dyn CheckoutSessionStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        processor: Arc<dyn PaymentProcessor>,
        clock: Arc<dyn Clock>,
        publishable_key: String,
        default_success_url: String,
        default_cancel_url: String,
    ) -> Self {
        Self {
            catalog,
            sessions,
            subscriptions,
            processor,
            clock,
            publishable_key,
            default_success_url,
            default_cancel_url,
        }
    }

    /// Open a hosted checkout for `price_id` and record the session.
    pub async fn create_session(&self, request: &CheckoutRequest) -> BillingResult<CheckoutResponse> {
        let price_id = request.price_id.trim();
        let plan = self
            .catalog
            .plan_by_price(price_id)
            .await?
            .filter(|plan| plan.active)
            .ok_or_else(|| BillingError::PriceNotFound(price_id.to_string()))?;

        let mode = if plan.kind.is_one_time_payment() {
            CheckoutMode::Payment
        } else {
            CheckoutMode::Subscription
        };

        let success_url = non_blank(request.success_url.as_deref())
            .unwrap_or(&self.default_success_url)
            .to_string();
        let cancel_url = non_blank(request.cancel_url.as_deref())
            .unwrap_or(&self.default_cancel_url)
            .to_string();
        let customer_email = non_blank(request.customer_email.as_deref()).map(normalize_identity);

        // Reuse the processor customer from earlier purchases instead of
        // letting the processor create a duplicate from the email.
        let existing_customer = match &customer_email {
            Some(email) => self
                .subscriptions
                .latest_for_identity(email, &[])
                .await?
                .and_then(|record| record.customer_id),
            None => None,
        };
        let customer = match (&existing_customer, &customer_email) {
            (Some(customer_id), _) => CheckoutCustomer::Existing(customer_id.clone()),
            (None, Some(email)) => CheckoutCustomer::Email(email.clone()),
            (None, None) => CheckoutCustomer::Anonymous,
        };

        let mut metadata = vec![
            ("price_id".to_string(), plan.price_id.clone()),
            ("plan_tier".to_string(), plan.tier.as_str().to_string()),
            ("session_type".to_string(), plan.kind.as_str().to_string()),
        ];
        if let Some(bundle_key) = &plan.bundle_key {
            metadata.push(("bundle_key".to_string(), bundle_key.clone()));
        }

        let session = self
            .processor
            .create_checkout_session(&CheckoutSessionRequest {
                price_id: plan.price_id.clone(),
                mode,
                success_url,
                cancel_url,
                customer,
                metadata,
                idempotency_key: request.idempotency_key.clone(),
            })
            .await?;

        let url = session.url.clone().ok_or_else(|| {
            BillingError::Internal(format!("checkout session {} has no url", session.id))
        })?;

        let now = self.clock.now();
        let record = self
            .sessions
            .upsert_session(&CheckoutSession {
                session_id: session.id.clone(),
                customer_email,
                customer_id: existing_customer.or(session.customer.clone()),
                price_id: plan.price_id.clone(),
                subscription_id: None,
                session_type: plan.kind,
                amount_cents: plan.amount_cents,
                currency: plan.currency.clone(),
                status: CheckoutStatus::Open,
                schedule_id: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            })
            .await?;

        tracing::info!(
            session_id = %record.session_id,
            price_id = %record.price_id,
            mode = mode.as_str(),
            amount_cents = record.amount_cents,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: record.session_id,
            url,
            publishable_key: self.publishable_key.clone(),
            price_id: record.price_id,
            amount_cents: record.amount_cents,
            currency: record.currency,
            mode: mode.as_str().to_string(),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
