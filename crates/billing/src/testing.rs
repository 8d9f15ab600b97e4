//! Test doubles shared by the unit and scenario tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::catalog::{
    BillingInterval, BundleProduct, IntroPricing, PlanKind, PlanOption, PlanTier,
};
use crate::client::{CheckoutSessionRequest, PaymentProcessor};
use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutSessionObject, ListObject, SubscriptionItem, SubscriptionObject};

pub fn pro_monthly() -> PlanOption {
    PlanOption {
        price_id: "price_pro_monthly".into(),
        tier: PlanTier::Pro,
        interval: BillingInterval::Month,
        kind: PlanKind::Subscription,
        amount_cents: 4999,
        currency: "usd".into(),
        intro: None,
        monthly_credits: 50_000,
        one_time_credits: 0,
        bundle_key: Some("studio_suite".into()),
        display_name: "Pro".into(),
        description: None,
        sort_order: 2,
        active: true,
    }
}

pub fn solo_intro_monthly() -> PlanOption {
    PlanOption {
        price_id: "price_solo_monthly".into(),
        tier: PlanTier::Solo,
        amount_cents: 1999,
        intro: Some(IntroPricing {
            enabled: true,
            kind: "fixed_price".into(),
            amount_cents: 999,
            duration_periods: 3,
        }),
        bundle_key: None,
        display_name: "Solo".into(),
        sort_order: 1,
        ..pro_monthly()
    }
}

pub fn credits_topup() -> PlanOption {
    PlanOption {
        price_id: "price_credits_99".into(),
        tier: PlanTier::Credits,
        interval: BillingInterval::OneTime,
        kind: PlanKind::CreditsTopup,
        amount_cents: 9900,
        monthly_credits: 0,
        bundle_key: Some("studio_suite".into()),
        display_name: "99k credits".into(),
        sort_order: 10,
        ..pro_monthly()
    }
}

pub fn donation() -> PlanOption {
    PlanOption {
        price_id: "price_donation".into(),
        tier: PlanTier::Donation,
        interval: BillingInterval::OneTime,
        kind: PlanKind::SupporterContribution,
        amount_cents: 500,
        monthly_credits: 0,
        bundle_key: None,
        display_name: "Buy us a coffee".into(),
        sort_order: 20,
        ..pro_monthly()
    }
}

pub fn studio_suite() -> BundleProduct {
    BundleProduct {
        bundle_key: "studio_suite".into(),
        name: "Studio Suite".into(),
        credits_per_usd: 1000,
    }
}

pub fn subscription_object(id: &str, customer: &str, status: &str, price: &str) -> SubscriptionObject {
    SubscriptionObject {
        id: id.into(),
        customer: Some(customer.into()),
        status: status.into(),
        items: Some(ListObject {
            data: vec![SubscriptionItem {
                price: Some(price.into()),
            }],
        }),
        ..Default::default()
    }
}

/// In-memory processor. `set_unreachable(true)` makes every call fail as a
/// transport error.
#[derive(Default)]
pub struct FakeProcessor {
    subscriptions: Mutex<HashMap<String, SubscriptionObject>>,
    customers: Mutex<HashMap<String, String>>,
    canceled: Mutex<Vec<String>>,
    checkout_requests: Mutex<Vec<CheckoutSessionRequest>>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
    sessions_created: AtomicUsize,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn put_subscription(&self, subscription: SubscriptionObject) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription);
    }

    pub fn put_customer(&self, email: &str, customer_id: &str) {
        self.customers
            .lock()
            .unwrap()
            .insert(email.to_ascii_lowercase(), customer_id.into());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn canceled(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutSessionRequest> {
        self.checkout_requests.lock().unwrap().clone()
    }

    fn enter(&self) -> BillingResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BillingError::ProcessorTransport(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionObject> {
        self.enter()?;
        self.checkout_requests.lock().unwrap().push(request.clone());
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cs_test_{}", n);
        Ok(CheckoutSessionObject {
            url: Some(format!("https://checkout.test/{}", id)),
            id,
            ..Default::default()
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionObject>> {
        self.enter()?;
        Ok(self.subscriptions.lock().unwrap().get(subscription_id).cloned())
    }

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        self.enter()?;
        Ok(self
            .customers
            .lock()
            .unwrap()
            .get(&email.to_ascii_lowercase())
            .cloned())
    }

    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionObject>> {
        self.enter()?;
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.customer.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        self.enter()?;
        self.canceled.lock().unwrap().push(subscription_id.into());
        if let Some(subscription) = self.subscriptions.lock().unwrap().get_mut(subscription_id) {
            subscription.cancel_at_period_end = true;
        }
        Ok(())
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        self.enter()?;
        Ok(format!(
            "https://portal.test/{}?return={}",
            customer_id, return_url
        ))
    }
}
