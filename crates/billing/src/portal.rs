//! Billing portal sessions

use serde::Serialize;
use std::sync::Arc;

use crate::client::PaymentProcessor;
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;
use crate::subscriptions::normalize_identity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

pub struct PortalService {
    subscriptions: Arc<dyn SubscriptionStore>,
    processor: Arc<dyn PaymentProcessor>,
    default_return_url: String,
}

impl PortalService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        processor: Arc<dyn PaymentProcessor>,
        default_return_url: String,
    ) -> Self {
        Self {
            subscriptions,
            processor,
            default_return_url,
        }
    }

    /// Open the processor's self-service portal for the identity's customer.
    pub async fn create_portal_session(
        &self,
        user_identity: &str,
        return_url: Option<&str>,
    ) -> BillingResult<PortalResponse> {
        let identity = normalize_identity(user_identity);

        let customer_id = self
            .subscriptions
            .latest_for_identity(&identity, &[])
            .await?
            .and_then(|record| record.customer_id)
            .ok_or_else(|| BillingError::NoActiveSubscription(identity.clone()))?;

        let return_url = return_url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.default_return_url);

        let url = self
            .processor
            .create_portal_session(&customer_id, return_url)
            .await?;

        tracing::info!(customer_id = %customer_id, "Created billing portal session");
        Ok(PortalResponse { url })
    }
}
