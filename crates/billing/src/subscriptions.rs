//! Subscription state
//!
//! Local subscription records are the application's gate for paid features.
//! Reads go through a short-lived cache, then the durable record, and ask
//! the processor again once a record is older than the freshness window.
//! A failed refresh never fails the read: a stale answer beats no answer.

use serde::Serialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::cache::SubscriptionCache;
use crate::catalog::{PlanTier, PriceResolver};
use crate::client::PaymentProcessor;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionObject;
use crate::store::SubscriptionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    #[default]
    Inactive,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionState {
    /// Map the processor's raw status. Unrecognized values (including
    /// `unpaid` and `incomplete`) are treated as inactive.
    pub fn from_processor(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => SubscriptionState::Active,
            "trialing" => SubscriptionState::Trialing,
            "past_due" | "past-due" => SubscriptionState::PastDue,
            "canceled" | "cancelled" => SubscriptionState::Canceled,
            _ => SubscriptionState::Inactive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Inactive => "inactive",
            SubscriptionState::Trialing => "trialing",
            SubscriptionState::Active => "active",
            SubscriptionState::PastDue => "past_due",
            SubscriptionState::Canceled => "canceled",
        }
    }

    /// States that grant access to paid features
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionState::Active | SubscriptionState::Trialing)
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emails compare case-insensitively; processor ids are case-sensitive.
pub fn normalize_identity(identity: &str) -> String {
    let identity = identity.trim();
    if identity.contains('@') {
        identity.to_ascii_lowercase()
    } else {
        identity.to_string()
    }
}

/// Latest known state of one processor subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub status: SubscriptionState,
    pub plan_tier: Option<PlanTier>,
    pub price_id: Option<String>,
    pub bundle_key: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Identities this record can be looked up (and cached) under.
    pub fn identities(&self) -> Vec<&str> {
        let mut ids = vec![self.subscription_id.as_str()];
        ids.extend(self.customer_id.as_deref());
        ids.extend(self.customer_email.as_deref());
        ids
    }
}

/// Fields to merge into a subscription record. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionUpdate {
    pub subscription_id: String,
    pub status: SubscriptionState,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub plan_tier: Option<PlanTier>,
    pub price_id: Option<String>,
    pub bundle_key: Option<String>,
    pub canceled_at: Option<OffsetDateTime>,
    /// The processor reports the subscription as winding down to period end.
    pub cancel_pending: bool,
}

impl SubscriptionUpdate {
    pub fn new(subscription_id: impl Into<String>, status: SubscriptionState) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            status,
            ..Default::default()
        }
    }

    /// Status to store over `existing`. A subscription the processor still
    /// reports as running until period end does not undo a local cancel;
    /// only a processor-side cancel or a reactivation moves it.
    pub fn resolved_status(&self, existing: Option<SubscriptionState>) -> SubscriptionState {
        let winding_down = self.cancel_pending
            && matches!(
                self.status,
                SubscriptionState::Active | SubscriptionState::Trialing
            );
        if winding_down && existing == Some(SubscriptionState::Canceled) {
            SubscriptionState::Canceled
        } else {
            self.status
        }
    }

    /// Apply this update on top of an existing record (or create one).
    pub fn merge_into(
        &self,
        existing: Option<&SubscriptionRecord>,
        now: OffsetDateTime,
    ) -> SubscriptionRecord {
        let keep = |new: &Option<String>, old: Option<&Option<String>>| {
            new.clone()
                .filter(|v| !v.is_empty())
                .or_else(|| old.cloned().flatten())
        };
        SubscriptionRecord {
            subscription_id: self.subscription_id.clone(),
            customer_id: keep(&self.customer_id, existing.map(|r| &r.customer_id)),
            customer_email: keep(
                &self.customer_email.as_deref().map(normalize_identity),
                existing.map(|r| &r.customer_email),
            ),
            status: self.resolved_status(existing.map(|r| r.status)),
            plan_tier: self.plan_tier.or(existing.and_then(|r| r.plan_tier)),
            price_id: keep(&self.price_id, existing.map(|r| &r.price_id)),
            bundle_key: keep(&self.bundle_key, existing.map(|r| &r.bundle_key)),
            canceled_at: self.canceled_at.or(existing.and_then(|r| r.canceled_at)),
            created_at: existing.map_or(now, |r| r.created_at),
            updated_at: existing.map_or(now, |r| r.updated_at.max(now)),
        }
    }
}

/// Recorded intent to move a subscription from intro pricing to the
/// regular price. Nothing here executes the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionSchedule {
    pub schedule_id: String,
    pub subscription_id: String,
    pub price_id: String,
    pub intro_kind: String,
    pub intro_amount_cents: i64,
    pub intro_periods: u32,
    pub regular_amount_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Answer to "what can this user do right now".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatus {
    pub state: SubscriptionState,
    pub user_identity: String,
    /// When the underlying data was last confirmed
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
    pub cache_age_ms: i64,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub plan_tier: Option<PlanTier>,
    pub bundle_key: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
}

impl SubscriptionStatus {
    pub fn inactive(identity: &str) -> Self {
        Self::inactive_at(identity, OffsetDateTime::now_utc())
    }

    fn inactive_at(identity: &str, now: OffsetDateTime) -> Self {
        Self {
            state: SubscriptionState::Inactive,
            user_identity: identity.to_string(),
            cached_at: now,
            cache_age_ms: 0,
            subscription_id: None,
            price_id: None,
            plan_tier: None,
            bundle_key: None,
            canceled_at: None,
        }
    }

    fn from_record(identity: &str, record: &SubscriptionRecord, now: OffsetDateTime) -> Self {
        Self {
            state: record.status,
            user_identity: identity.to_string(),
            cached_at: record.updated_at,
            cache_age_ms: age_ms(now, record.updated_at),
            subscription_id: Some(record.subscription_id.clone()),
            price_id: record.price_id.clone(),
            plan_tier: record.plan_tier,
            bundle_key: record.bundle_key.clone(),
            canceled_at: record.canceled_at,
        }
    }
}

fn age_ms(now: OffsetDateTime, then: OffsetDateTime) -> i64 {
    let age = (now - then).whole_milliseconds().max(0);
    i64::try_from(age).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelResult {
    pub subscription_id: String,
    pub state: SubscriptionState,
    #[serde(with = "time::serde::rfc3339")]
    pub canceled_at: OffsetDateTime,
}

/// Set tier and bundle from the catalog entry for the update's price.
/// A price the catalog does not know leaves both untouched.
pub(crate) async fn fill_plan_fields(catalog: &dyn PriceResolver, update: &mut SubscriptionUpdate) {
    let Some(price_id) = update.price_id.clone() else {
        return;
    };
    match catalog.plan_by_price(&price_id).await {
        Ok(Some(plan)) => {
            update.plan_tier = Some(plan.tier);
            update.bundle_key = plan.bundle_key;
        }
        Ok(None) => {
            tracing::debug!(price_id = %price_id, "Subscription price not in catalog");
        }
        Err(e) => {
            tracing::warn!(price_id = %price_id, error = %e, "Catalog lookup failed while reconciling subscription");
        }
    }
}

/// Build a record update from a processor subscription object, resolving
/// tier and bundle from the catalog when the price is known there.
pub(crate) async fn update_from_processor(
    catalog: &dyn PriceResolver,
    subscription: &SubscriptionObject,
) -> SubscriptionUpdate {
    let mut update = SubscriptionUpdate::new(subscription.id.clone(), subscription.state());
    update.customer_id = subscription.customer.clone();
    update.price_id = subscription.price_id().map(str::to_string);
    update.cancel_pending = subscription.cancel_at_period_end;
    update.canceled_at = subscription
        .canceled_at
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

    fill_plan_fields(catalog, &mut update).await;

    // Metadata stamped at checkout fills in what the catalog could not
    if update.plan_tier.is_none() {
        update.plan_tier = subscription
            .metadata_value("plan_tier")
            .and_then(PlanTier::parse);
    }
    if update.bundle_key.is_none() {
        update.bundle_key = subscription.metadata_value("bundle_key").map(str::to_string);
    }

    update
}

/// Status reads and cancellation
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    catalog: Arc<dyn PriceResolver>,
    processor: Arc<dyn PaymentProcessor>,
    cache: Arc<SubscriptionCache>,
    clock: Arc<dyn Clock>,
    freshness_window: Duration,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn PriceResolver>,
        processor: Arc<dyn PaymentProcessor>,
        cache: Arc<SubscriptionCache>,
        clock: Arc<dyn Clock>,
        freshness_window: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            processor,
            cache,
            clock,
            freshness_window,
        }
    }

    /// Current subscription status for an email, customer id or
    /// subscription id. Only store failures are returned as errors.
    pub async fn get_subscription_status(
        &self,
        user_identity: &str,
    ) -> BillingResult<SubscriptionStatus> {
        let identity = normalize_identity(user_identity);
        let now = self.clock.now();
        if identity.is_empty() {
            return Ok(SubscriptionStatus::inactive_at("", now));
        }

        if let Some((mut status, cached_at)) = self.cache.get(&identity).await {
            tracing::debug!(identity = %identity, "Subscription status cache hit");
            status.cache_age_ms = age_ms(now, status.cached_at.min(cached_at));
            return Ok(status);
        }

        let generation = self.cache.generation();
        let record = self.store.latest_for_identity(&identity, &[]).await?;
        let is_stale = record
            .as_ref()
            .map_or(true, |r| now - r.updated_at > self.freshness_window);

        let (record, refreshed) = if is_stale {
            match self.refresh(&identity, record.as_ref()).await {
                Ok(Some(fresh)) => (Some(fresh), true),
                Ok(None) => (record, true),
                Err(e) => {
                    tracing::warn!(
                        identity = %identity,
                        error = %e,
                        has_local_record = record.is_some(),
                        "Subscription refresh failed, serving stored state"
                    );
                    (record, false)
                }
            }
        } else {
            (record, true)
        };

        let now = self.clock.now();
        let status = match &record {
            Some(record) => SubscriptionStatus::from_record(&identity, record, now),
            None => SubscriptionStatus::inactive_at(&identity, now),
        };

        // A fallback answer is not cached so the next read retries the processor
        if refreshed {
            self.cache
                .insert_if_current(&identity, status.clone(), generation)
                .await;
        }
        Ok(status)
    }

    /// Ask the processor for the identity's subscription and store it.
    async fn refresh(
        &self,
        identity: &str,
        existing: Option<&SubscriptionRecord>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let remote = if let Some(record) = existing {
            self.processor
                .retrieve_subscription(&record.subscription_id)
                .await?
        } else if identity.starts_with("sub_") {
            self.processor.retrieve_subscription(identity).await?
        } else if identity.contains('@') {
            match self.processor.find_customer_by_email(identity).await? {
                Some(customer_id) => self.processor.latest_subscription(&customer_id).await?,
                None => None,
            }
        } else {
            self.processor.latest_subscription(identity).await?
        };

        let Some(remote) = remote else {
            tracing::debug!(identity, "Processor has no subscription for identity");
            return Ok(None);
        };

        let mut update = update_from_processor(self.catalog.as_ref(), &remote).await;
        if identity.contains('@') {
            update.customer_email = Some(identity.to_string());
        }

        let record = self
            .store
            .upsert_subscription(&update, self.clock.now())
            .await?;
        tracing::info!(
            subscription_id = %record.subscription_id,
            status = %record.status,
            "Refreshed subscription from processor"
        );
        Ok(Some(record))
    }

    /// Cancel the identity's active or trialing subscription at period end.
    ///
    /// The processor call is best effort; the local record is canceled even
    /// when it fails, since local state gates the application.
    pub async fn cancel_subscription(&self, user_identity: &str) -> BillingResult<CancelResult> {
        let identity = normalize_identity(user_identity);
        if identity.is_empty() {
            return Err(BillingError::NoActiveSubscription(identity));
        }

        let record = self
            .store
            .latest_for_identity(
                &identity,
                &[SubscriptionState::Active, SubscriptionState::Trialing],
            )
            .await?
            .ok_or_else(|| BillingError::NoActiveSubscription(identity.clone()))?;

        if let Err(e) = self
            .processor
            .cancel_at_period_end(&record.subscription_id)
            .await
        {
            tracing::warn!(
                subscription_id = %record.subscription_id,
                error = %e,
                "Processor cancel failed, canceling locally anyway"
            );
        }

        let canceled_at = self.clock.now();
        let updated = self
            .store
            .mark_canceled(&record.subscription_id, canceled_at)
            .await?
            .ok_or_else(|| BillingError::NoActiveSubscription(identity.clone()))?;

        self.cache.invalidate(&identity).await;
        self.cache.invalidate_all(updated.identities()).await;

        tracing::info!(
            subscription_id = %updated.subscription_id,
            identity = %identity,
            "Subscription canceled"
        );

        Ok(CancelResult {
            subscription_id: updated.subscription_id,
            state: SubscriptionState::Canceled,
            canceled_at: updated.canceled_at.unwrap_or(canceled_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryPlanCatalog;
    use crate::clock::ManualClock;
    use crate::store::InMemoryBillingStore;
    use crate::testing::{pro_monthly, subscription_object, FakeProcessor};

    struct Harness {
        store: Arc<InMemoryBillingStore>,
        processor: Arc<FakeProcessor>,
        clock: Arc<ManualClock>,
        cache: Arc<SubscriptionCache>,
        service: SubscriptionService,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let processor = Arc::new(FakeProcessor::new());
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let catalog = Arc::new(InMemoryPlanCatalog::new(vec![pro_monthly()], vec![]));
        let cache = Arc::new(SubscriptionCache::new(Duration::seconds(60), clock.clone()));
        let service = SubscriptionService::new(
            store.clone(),
            catalog,
            processor.clone(),
            cache.clone(),
            clock.clone(),
            Duration::seconds(60),
        );
        Harness {
            store,
            processor,
            clock,
            cache,
            service,
        }
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(SubscriptionState::from_processor("ACTIVE"), SubscriptionState::Active);
        assert_eq!(SubscriptionState::from_processor("trialing"), SubscriptionState::Trialing);
        assert_eq!(SubscriptionState::from_processor("past-due"), SubscriptionState::PastDue);
        assert_eq!(SubscriptionState::from_processor("Past_Due"), SubscriptionState::PastDue);
        assert_eq!(SubscriptionState::from_processor("cancelled"), SubscriptionState::Canceled);
        assert_eq!(SubscriptionState::from_processor("unpaid"), SubscriptionState::Inactive);
        assert_eq!(SubscriptionState::from_processor(""), SubscriptionState::Inactive);
    }

    #[test]
    fn test_merge_keeps_known_values() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut first = SubscriptionUpdate::new("sub_1", SubscriptionState::Active);
        first.plan_tier = Some(PlanTier::Pro);
        first.price_id = Some("price_pro_monthly".into());
        first.customer_email = Some("A@Example.com".into());
        let record = first.merge_into(None, now);
        assert_eq!(record.customer_email.as_deref(), Some("a@example.com"));

        let mut second = SubscriptionUpdate::new("sub_1", SubscriptionState::PastDue);
        second.price_id = Some(String::new());
        let earlier = now - Duration::seconds(30);
        let merged = second.merge_into(Some(&record), earlier);

        assert_eq!(merged.status, SubscriptionState::PastDue);
        assert_eq!(merged.plan_tier, Some(PlanTier::Pro));
        assert_eq!(merged.price_id.as_deref(), Some("price_pro_monthly"));
        // never moves backwards
        assert_eq!(merged.updated_at, now);
    }

    #[test]
    fn test_merge_keeps_local_cancel_until_period_end() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let canceled = SubscriptionUpdate::new("sub_1", SubscriptionState::Canceled).merge_into(None, now);

        let mut winding_down = SubscriptionUpdate::new("sub_1", SubscriptionState::Active);
        winding_down.cancel_pending = true;
        assert_eq!(
            winding_down.merge_into(Some(&canceled), now).status,
            SubscriptionState::Canceled
        );

        // an uncanceled subscription winding down still reads as active
        let active = SubscriptionUpdate::new("sub_1", SubscriptionState::Active).merge_into(None, now);
        assert_eq!(
            winding_down.merge_into(Some(&active), now).status,
            SubscriptionState::Active
        );

        // reactivated on the processor side
        let reactivated = SubscriptionUpdate::new("sub_1", SubscriptionState::Active);
        assert_eq!(
            reactivated.merge_into(Some(&canceled), now).status,
            SubscriptionState::Active
        );
    }

    #[tokio::test]
    async fn test_blank_identity_is_inactive_without_lookup() {
        let h = harness();
        let status = h.service.get_subscription_status("   ").await.unwrap();
        assert_eq!(status.state, SubscriptionState::Inactive);
        assert_eq!(h.processor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_record_served_without_processor() {
        let h = harness();
        let mut update = SubscriptionUpdate::new("sub_1", SubscriptionState::Active);
        update.customer_email = Some("a@example.com".into());
        update.plan_tier = Some(PlanTier::Pro);
        h.store
            .upsert_subscription(&update, h.clock.now())
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(10));
        let status = h.service.get_subscription_status("a@example.com").await.unwrap();
        assert_eq!(status.state, SubscriptionState::Active);
        assert_eq!(status.plan_tier, Some(PlanTier::Pro));
        assert_eq!(status.cache_age_ms, 10_000);
        assert_eq!(h.processor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_record_refreshed_from_processor() {
        let h = harness();
        let mut update = SubscriptionUpdate::new("sub_1", SubscriptionState::Active);
        update.customer_id = Some("cus_1".into());
        h.store
            .upsert_subscription(&update, h.clock.now())
            .await
            .unwrap();
        h.processor
            .put_subscription(subscription_object("sub_1", "cus_1", "past_due", "price_pro_monthly"));

        h.clock.advance(Duration::seconds(61));
        let status = h.service.get_subscription_status("cus_1").await.unwrap();
        assert_eq!(status.state, SubscriptionState::PastDue);
        assert_eq!(status.plan_tier, Some(PlanTier::Pro));
        assert_eq!(status.cache_age_ms, 0);

        let stored = h.store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionState::PastDue);
    }

    #[tokio::test]
    async fn test_email_identity_searches_customer() {
        let h = harness();
        h.processor.put_customer("new@example.com", "cus_new");
        h.processor
            .put_subscription(subscription_object("sub_new", "cus_new", "trialing", "price_pro_monthly"));

        let status = h.service.get_subscription_status("New@Example.com").await.unwrap();
        assert_eq!(status.state, SubscriptionState::Trialing);
        assert_eq!(status.subscription_id.as_deref(), Some("sub_new"));

        // stored under the email so the next miss finds it locally
        let local = h
            .store
            .latest_for_identity("new@example.com", &[])
            .await
            .unwrap();
        assert!(local.is_some());
    }

    #[tokio::test]
    async fn test_cache_short_circuits_store() {
        let h = harness();
        h.processor.set_unreachable(false);
        let first = h.service.get_subscription_status("cus_none").await.unwrap();
        assert_eq!(first.state, SubscriptionState::Inactive);
        let calls = h.processor.call_count();

        let second = h.service.get_subscription_status("cus_none").await.unwrap();
        assert_eq!(second.state, SubscriptionState::Inactive);
        assert_eq!(h.processor.call_count(), calls);
        assert_eq!(h.cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_not_cached() {
        let h = harness();
        h.processor.set_unreachable(true);
        let status = h.service.get_subscription_status("cus_x").await.unwrap();
        assert_eq!(status.state, SubscriptionState::Inactive);
        assert!(h.cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_marks_local_even_when_processor_fails() {
        let h = harness();
        let mut update = SubscriptionUpdate::new("sub_c", SubscriptionState::Active);
        update.customer_email = Some("c@example.com".into());
        h.store
            .upsert_subscription(&update, h.clock.now())
            .await
            .unwrap();
        h.processor.set_unreachable(true);

        let result = h.service.cancel_subscription("c@example.com").await.unwrap();
        assert_eq!(result.subscription_id, "sub_c");
        assert_eq!(result.state, SubscriptionState::Canceled);
        assert_eq!(result.canceled_at, h.clock.now());

        let stored = h.store.get_subscription("sub_c").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionState::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_requires_active_subscription() {
        let h = harness();
        let update = SubscriptionUpdate::new("sub_p", SubscriptionState::PastDue);
        h.store
            .upsert_subscription(&update, h.clock.now())
            .await
            .unwrap();

        let err = h.service.cancel_subscription("sub_p").await.unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription(_)));

        let err = h.service.cancel_subscription("").await.unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription(_)));
    }

    #[tokio::test]
    async fn test_cancel_invalidates_cache() {
        let h = harness();
        let mut update = SubscriptionUpdate::new("sub_i", SubscriptionState::Active);
        update.customer_id = Some("cus_i".into());
        h.store
            .upsert_subscription(&update, h.clock.now())
            .await
            .unwrap();

        let before = h.service.get_subscription_status("cus_i").await.unwrap();
        assert_eq!(before.state, SubscriptionState::Active);

        h.service.cancel_subscription("cus_i").await.unwrap();
        let after = h.service.get_subscription_status("cus_i").await.unwrap();
        assert_eq!(after.state, SubscriptionState::Canceled);
        assert_eq!(h.processor.canceled(), vec!["sub_i".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_survives_refresh_while_processor_still_active() {
        let h = harness();
        let mut update = SubscriptionUpdate::new("sub_c", SubscriptionState::Active);
        update.customer_email = Some("c@example.com".into());
        update.customer_id = Some("cus_c".into());
        h.store
            .upsert_subscription(&update, h.clock.now())
            .await
            .unwrap();
        h.processor
            .put_subscription(subscription_object("sub_c", "cus_c", "active", "price_pro_monthly"));

        h.service.cancel_subscription("c@example.com").await.unwrap();

        h.clock.advance(Duration::seconds(61));
        let calls = h.processor.call_count();
        let status = h.service.get_subscription_status("c@example.com").await.unwrap();
        assert!(h.processor.call_count() > calls, "stale record was refreshed");
        assert_eq!(status.state, SubscriptionState::Canceled);
        assert!(status.canceled_at.is_some());

        // the period ends on the processor side
        h.processor
            .put_subscription(subscription_object("sub_c", "cus_c", "canceled", "price_pro_monthly"));
        h.cache.invalidate("c@example.com").await;
        h.clock.advance(Duration::seconds(61));
        let status = h.service.get_subscription_status("c@example.com").await.unwrap();
        assert_eq!(status.state, SubscriptionState::Canceled);
    }

    #[tokio::test]
    async fn test_reactivated_subscription_replaces_local_cancel() {
        let h = harness();
        let mut update = SubscriptionUpdate::new("sub_r", SubscriptionState::Active);
        update.customer_id = Some("cus_r".into());
        h.store
            .upsert_subscription(&update, h.clock.now())
            .await
            .unwrap();
        h.processor
            .put_subscription(subscription_object("sub_r", "cus_r", "active", "price_pro_monthly"));
        h.service.cancel_subscription("cus_r").await.unwrap();

        // customer resumed the subscription from the portal
        h.processor
            .put_subscription(subscription_object("sub_r", "cus_r", "active", "price_pro_monthly"));
        h.clock.advance(Duration::seconds(61));
        let status = h.service.get_subscription_status("cus_r").await.unwrap();
        assert_eq!(status.state, SubscriptionState::Active);
    }

    /// Store whose first identity lookup races a concurrent mutation: the
    /// lookup returns the old record, then the mutation lands and evicts.
    struct RacingStore {
        inner: Arc<InMemoryBillingStore>,
        cache: Arc<SubscriptionCache>,
        clock: Arc<ManualClock>,
        fired: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl SubscriptionStore for RacingStore {
        async fn upsert_subscription(
            &self,
            update: &SubscriptionUpdate,
            now: OffsetDateTime,
        ) -> BillingResult<SubscriptionRecord> {
            self.inner.upsert_subscription(update, now).await
        }

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Option<SubscriptionRecord>> {
            self.inner.get_subscription(subscription_id).await
        }

        async fn latest_for_identity(
            &self,
            identity: &str,
            states: &[SubscriptionState],
        ) -> BillingResult<Option<SubscriptionRecord>> {
            let found = self.inner.latest_for_identity(identity, states).await?;
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let mut update = SubscriptionUpdate::new("sub_race", SubscriptionState::PastDue);
                update.customer_id = Some("cus_race".into());
                let record = self.inner.upsert_subscription(&update, self.clock.now()).await?;
                self.cache.invalidate_all(record.identities()).await;
            }
            Ok(found)
        }

        async fn mark_canceled(
            &self,
            subscription_id: &str,
            at: OffsetDateTime,
        ) -> BillingResult<Option<SubscriptionRecord>> {
            self.inner.mark_canceled(subscription_id, at).await
        }

        async fn upsert_schedule(
            &self,
            schedule: &SubscriptionSchedule,
        ) -> BillingResult<SubscriptionSchedule> {
            self.inner.upsert_schedule(schedule).await
        }

        async fn schedule_for(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Option<SubscriptionSchedule>> {
            self.inner.schedule_for(subscription_id).await
        }
    }

    #[tokio::test]
    async fn test_snapshot_read_before_mutation_is_not_cached() {
        let inner = Arc::new(InMemoryBillingStore::new());
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let cache = Arc::new(SubscriptionCache::new(Duration::seconds(60), clock.clone()));
        let mut update = SubscriptionUpdate::new("sub_race", SubscriptionState::Active);
        update.customer_id = Some("cus_race".into());
        inner.upsert_subscription(&update, clock.now()).await.unwrap();

        let store = Arc::new(RacingStore {
            inner,
            cache: cache.clone(),
            clock: clock.clone(),
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let service = SubscriptionService::new(
            store,
            Arc::new(InMemoryPlanCatalog::new(vec![pro_monthly()], vec![])),
            Arc::new(FakeProcessor::new()),
            cache.clone(),
            clock.clone(),
            Duration::seconds(60),
        );

        let racing = service.get_subscription_status("cus_race").await.unwrap();
        assert_eq!(racing.state, SubscriptionState::Active);
        assert!(cache.get("cus_race").await.is_none());

        let next = service.get_subscription_status("cus_race").await.unwrap();
        assert_eq!(next.state, SubscriptionState::PastDue);
    }
}
