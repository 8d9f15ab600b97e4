//! Webhook handling
//!
//! Verifies processor deliveries and applies them to local state. Every
//! mutation is an upsert or a conditional transition, so a redelivered
//! event converges to the same result without a dedup table.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::SubscriptionCache;
use crate::catalog::{PlanKind, PlanOption, PriceResolver};
use crate::checkout::{CheckoutSession, SessionCompletion};
use crate::clock::Clock;
use crate::credits::CreditService;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSessionObject, EventEnvelope, InvoiceObject, SubscriptionObject, WebhookEvent,
};
use crate::signature::SignatureVerifier;
use crate::store::{CheckoutSessionStore, SubscriptionStore};
use crate::subscriptions::{
    fill_plan_fields, update_from_processor, SubscriptionRecord, SubscriptionSchedule,
    SubscriptionState, SubscriptionUpdate,
};

/// What a delivery did to local state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    /// Redelivery of a checkout completion that was already applied
    AlreadyProcessed,
    /// Verified but nothing to apply (unknown type, invoice without subscription)
    Ignored,
}

pub struct WebhookHandler {
    verifier: SignatureVerifier,
    catalog: Arc<dyn PriceResolver>,
    sessions: Arc<dyn CheckoutSessionStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    credits: Arc<CreditService>,
    cache: Arc<SubscriptionCache>,
    clock: Arc<dyn Clock>,
}

impl WebhookHandler {
    pub fn new(
        verifier: SignatureVerifier,
        catalog: Arc<dyn PriceResolver>,
        sessions: Arc<dyn CheckoutSessionStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        credits: Arc<CreditService>,
        cache: Arc<SubscriptionCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            verifier,
            catalog,
            sessions,
            subscriptions,
            credits,
            cache,
            clock,
        }
    }

    /// Verify, decode and apply one delivery.
    pub async fn handle_webhook(&self, body: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        if !self.verifier.verify_at(body, signature, self.clock.now()) {
            tracing::warn!(payload_len = body.len(), "Rejected webhook with invalid signature");
            return Err(BillingError::InvalidSignature);
        }

        let envelope = EventEnvelope::parse(body)?;
        let event_id = envelope.id.as_deref().unwrap_or("-");
        tracing::info!(event_id, event_type = %envelope.event_type, "Processing webhook event");

        let outcome = match &envelope.event {
            WebhookEvent::CheckoutSessionCompleted(session) => {
                self.handle_checkout_completed(session).await?
            }
            WebhookEvent::SubscriptionCreated(subscription)
            | WebhookEvent::SubscriptionUpdated(subscription) => {
                self.handle_subscription_changed(subscription, false).await?
            }
            WebhookEvent::SubscriptionDeleted(subscription) => {
                self.handle_subscription_changed(subscription, true).await?
            }
            WebhookEvent::InvoicePaid(invoice) => {
                self.handle_invoice(invoice, SubscriptionState::Active).await?
            }
            WebhookEvent::InvoicePaymentFailed(invoice) => {
                self.handle_invoice(invoice, SubscriptionState::PastDue).await?
            }
            WebhookEvent::Unknown { event_type, object } => {
                tracing::info!(
                    event_id,
                    event_type = %event_type,
                    object_id = object.get("id").and_then(|v| v.as_str()).unwrap_or("-"),
                    "Ignoring unhandled webhook event type"
                );
                WebhookOutcome::Ignored
            }
        };

        tracing::info!(event_id, event_type = %envelope.event_type, ?outcome, "Webhook event handled");
        Ok(outcome)
    }

    async fn handle_checkout_completed(
        &self,
        object: &CheckoutSessionObject,
    ) -> BillingResult<WebhookOutcome> {
        let session = self
            .sessions
            .get_session(&object.id)
            .await?
            .ok_or_else(|| BillingError::UnknownSession(object.id.clone()))?;

        if session.is_complete() {
            tracing::info!(session_id = %session.session_id, "Checkout session already complete, skipping");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        // Resolve before completing so a catalog outage leaves the session
        // open for the processor's retry
        let plan = self.catalog.plan_by_price(&session.price_id).await?;

        let completion = SessionCompletion {
            session_id: session.session_id.clone(),
            customer_id: object.customer.clone(),
            customer_email: object.email().map(str::to_string),
            subscription_id: object.subscription.clone(),
            completed_at: self.clock.now(),
        };
        let Some(session) = self.sessions.complete_session(&completion).await? else {
            tracing::info!(session_id = %object.id, "Checkout session completed by a concurrent delivery");
            return Ok(WebhookOutcome::AlreadyProcessed);
        };

        let kind = match &plan {
            Some(plan) => plan.kind,
            None => {
                tracing::warn!(
                    session_id = %session.session_id,
                    price_id = %session.price_id,
                    session_type = session.session_type.as_str(),
                    "Plan not found for completed checkout, using session type"
                );
                session.session_type
            }
        };

        let amount_cents = effective_amount(object.amount_total, &session, plan.as_ref());

        match kind {
            PlanKind::CreditsTopup => self.apply_topup(&session, plan.as_ref(), amount_cents).await?,
            PlanKind::SupporterContribution => {
                tracing::info!(
                    session_id = %session.session_id,
                    amount_cents,
                    customer = session.customer_email.as_deref().unwrap_or("-"),
                    "Supporter contribution received"
                );
            }
            PlanKind::Subscription => {
                self.apply_subscription_checkout(&session, plan.as_ref()).await?
            }
        }

        Ok(WebhookOutcome::Applied)
    }

    async fn apply_topup(
        &self,
        session: &CheckoutSession,
        plan: Option<&PlanOption>,
        amount_cents: i64,
    ) -> BillingResult<()> {
        let bundle = match plan.and_then(|p| p.bundle_key.as_deref()) {
            Some(bundle_key) => self.catalog.bundle(bundle_key).await?,
            None => None,
        };

        let credits = match (&bundle, plan) {
            (Some(bundle), _) => bundle.credits_for(amount_cents),
            (None, Some(plan)) => plan.one_time_credits,
            (None, None) => 0,
        };

        let Some(customer_key) = session
            .customer_email
            .as_deref()
            .or(session.customer_id.as_deref())
        else {
            tracing::warn!(session_id = %session.session_id, credits, "Top-up completed without a customer, nothing credited");
            return Ok(());
        };

        self.credits
            .grant_topup(
                customer_key,
                credits,
                serde_json::json!({
                    "session_id": session.session_id,
                    "price_id": session.price_id,
                    "amount_cents": amount_cents,
                    "bundle_key": bundle.as_ref().map(|b| b.bundle_key.as_str()),
                }),
            )
            .await?;
        Ok(())
    }

    async fn apply_subscription_checkout(
        &self,
        session: &CheckoutSession,
        plan: Option<&PlanOption>,
    ) -> BillingResult<()> {
        let Some(subscription_id) = session.subscription_id.as_deref() else {
            tracing::warn!(session_id = %session.session_id, "Subscription checkout completed without a subscription id");
            return Ok(());
        };

        let mut update = SubscriptionUpdate::new(subscription_id, SubscriptionState::Active);
        update.customer_id = session.customer_id.clone();
        update.customer_email = session.customer_email.clone();
        update.price_id = Some(session.price_id.clone());
        if let Some(plan) = plan {
            update.plan_tier = Some(plan.tier);
            update.bundle_key = plan.bundle_key.clone();
        }

        let record = self
            .subscriptions
            .upsert_subscription(&update, self.clock.now())
            .await?;
        tracing::info!(
            subscription_id = %record.subscription_id,
            session_id = %session.session_id,
            plan_tier = record.plan_tier.map(|t| t.as_str()).unwrap_or("-"),
            "Subscription activated from checkout"
        );

        if let Some((plan, intro)) = plan.and_then(|p| p.scheduled_intro().map(|i| (p, i))) {
            let schedule = self
                .subscriptions
                .upsert_schedule(&SubscriptionSchedule {
                    schedule_id: format!("sched_{}", Uuid::new_v4().simple()),
                    subscription_id: record.subscription_id.clone(),
                    price_id: plan.price_id.clone(),
                    intro_kind: intro.kind.clone(),
                    intro_amount_cents: intro.amount_cents,
                    intro_periods: intro.duration_periods,
                    regular_amount_cents: plan.amount_cents,
                    currency: plan.currency.clone(),
                    created_at: self.clock.now(),
                })
                .await?;
            self.sessions
                .link_schedule(&session.session_id, &schedule.schedule_id)
                .await?;
            tracing::info!(
                subscription_id = %record.subscription_id,
                schedule_id = %schedule.schedule_id,
                intro_periods = schedule.intro_periods,
                "Recorded intro pricing schedule"
            );
        }

        self.invalidate(&record).await;
        Ok(())
    }

    async fn handle_subscription_changed(
        &self,
        subscription: &SubscriptionObject,
        deleted: bool,
    ) -> BillingResult<WebhookOutcome> {
        let now = self.clock.now();
        let mut update = update_from_processor(self.catalog.as_ref(), subscription).await;
        if deleted {
            update.status = SubscriptionState::Canceled;
            update.canceled_at = Some(update.canceled_at.unwrap_or(now));
        }

        let record = self.subscriptions.upsert_subscription(&update, now).await?;
        tracing::info!(
            subscription_id = %record.subscription_id,
            status = %record.status,
            deleted,
            "Subscription state updated"
        );

        self.invalidate(&record).await;
        Ok(WebhookOutcome::Applied)
    }

    async fn handle_invoice(
        &self,
        invoice: &InvoiceObject,
        status: SubscriptionState,
    ) -> BillingResult<WebhookOutcome> {
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::info!(
                invoice_id = invoice.id.as_deref().unwrap_or("-"),
                "Invoice is not for a subscription, ignoring"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let mut update = SubscriptionUpdate::new(subscription_id, status);
        update.customer_id = invoice.customer.clone();
        update.customer_email = invoice.email().map(str::to_string);
        update.price_id = invoice.price_id().map(str::to_string);
        fill_plan_fields(self.catalog.as_ref(), &mut update).await;

        let record = self
            .subscriptions
            .upsert_subscription(&update, self.clock.now())
            .await?;
        tracing::info!(
            subscription_id = %record.subscription_id,
            invoice_id = invoice.id.as_deref().unwrap_or("-"),
            status = %record.status,
            "Subscription state updated from invoice"
        );

        self.invalidate(&record).await;
        Ok(WebhookOutcome::Applied)
    }

    async fn invalidate(&self, record: &SubscriptionRecord) {
        self.cache.invalidate_all(record.identities()).await;
    }
}

/// Amount actually charged: the event's total, else the declared session
/// amount, else the plan's list price.
fn effective_amount(
    event_amount: Option<i64>,
    session: &CheckoutSession,
    plan: Option<&PlanOption>,
) -> i64 {
    event_amount
        .filter(|a| *a > 0)
        .or(Some(session.amount_cents).filter(|a| *a > 0))
        .or(plan.map(|p| p.amount_cents))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryPlanCatalog;
    use crate::checkout::CheckoutStatus;
    use crate::clock::ManualClock;
    use crate::signature::sign;
    use crate::store::InMemoryBillingStore;
    use crate::testing::{pro_monthly, solo_intro_monthly};
    use time::{Duration, OffsetDateTime};

    const SECRET: &str = "whsec_unit";

    struct Harness {
        store: Arc<InMemoryBillingStore>,
        clock: Arc<ManualClock>,
        handler: WebhookHandler,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let catalog = Arc::new(InMemoryPlanCatalog::new(
            vec![pro_monthly(), solo_intro_monthly()],
            vec![],
        ));
        let cache = Arc::new(SubscriptionCache::new(Duration::seconds(60), clock.clone()));
        let credits = Arc::new(CreditService::new(store.clone(), clock.clone()));
        let handler = WebhookHandler::new(
            SignatureVerifier::new(Some(SECRET.to_string()), 300),
            catalog,
            store.clone(),
            store.clone(),
            credits,
            cache,
            clock.clone(),
        );
        Harness {
            store,
            clock,
            handler,
        }
    }

    fn signed(h: &Harness, body: &str) -> String {
        let ts = h.clock.now().unix_timestamp();
        format!("t={},v1={}", ts, sign(body.as_bytes(), ts, SECRET))
    }

    fn session(id: &str, price_id: &str, amount_cents: i64) -> CheckoutSession {
        let at = OffsetDateTime::from_unix_timestamp(1_699_999_000).unwrap();
        CheckoutSession {
            session_id: id.into(),
            customer_email: Some("buyer@example.com".into()),
            customer_id: None,
            price_id: price_id.into(),
            subscription_id: None,
            session_type: PlanKind::Subscription,
            amount_cents,
            currency: "usd".into(),
            status: CheckoutStatus::Open,
            schedule_id: None,
            created_at: at,
            updated_at: at,
            completed_at: None,
        }
    }

    #[test]
    fn test_effective_amount_fallbacks() {
        let s = session("cs", "price_pro_monthly", 4999);
        let plan = pro_monthly();
        assert_eq!(effective_amount(Some(3000), &s, Some(&plan)), 3000);
        assert_eq!(effective_amount(Some(0), &s, Some(&plan)), 4999);
        let zero = session("cs", "price_pro_monthly", 0);
        assert_eq!(effective_amount(None, &zero, Some(&plan)), 4999);
        assert_eq!(effective_amount(None, &zero, None), 0);
    }

    #[tokio::test]
    async fn test_bad_signature_applies_nothing() {
        let h = harness();
        h.store
            .upsert_session(&session("cs_sig", "price_pro_monthly", 4999))
            .await
            .unwrap();
        let body = r#"{"type":"checkout.session.completed","data":{"object":{"id":"cs_sig","subscription":"sub_sig"}}}"#;

        let err = h
            .handler
            .handle_webhook(body.as_bytes(), "t=1700000000,v1=00")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
        let stored = h.store.get_session("cs_sig").await.unwrap().unwrap();
        assert_eq!(stored.status, CheckoutStatus::Open);
    }

    #[tokio::test]
    async fn test_replayed_delivery_outside_tolerance_rejected() {
        let h = harness();
        let body = r#"{"type":"payout.paid","data":{"object":{}}}"#;
        let header = signed(&h, body);
        h.clock.advance(Duration::seconds(301));

        let err = h
            .handler
            .handle_webhook(body.as_bytes(), &header)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    #[tokio::test]
    async fn test_intro_plan_records_schedule() {
        let h = harness();
        h.store
            .upsert_session(&session("cs_intro", "price_solo_monthly", 1999))
            .await
            .unwrap();
        let body = r#"{"type":"checkout.session.completed","data":{"object":{"id":"cs_intro","customer":"cus_s","subscription":"sub_intro"}}}"#;

        let outcome = h
            .handler
            .handle_webhook(body.as_bytes(), &signed(&h, body))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied);

        let schedule = h.store.schedule_for("sub_intro").await.unwrap().unwrap();
        assert_eq!(schedule.intro_amount_cents, 999);
        assert_eq!(schedule.intro_periods, 3);
        assert_eq!(schedule.regular_amount_cents, 1999);

        let stored = h.store.get_session("cs_intro").await.unwrap().unwrap();
        assert_eq!(stored.schedule_id.as_deref(), Some(schedule.schedule_id.as_str()));
        assert_eq!(stored.customer_id.as_deref(), Some("cus_s"));
    }

    #[tokio::test]
    async fn test_plain_plan_records_no_schedule() {
        let h = harness();
        h.store
            .upsert_session(&session("cs_plain", "price_pro_monthly", 4999))
            .await
            .unwrap();
        let body = r#"{"type":"checkout.session.completed","data":{"object":{"id":"cs_plain","subscription":"sub_plain"}}}"#;
        h.handler
            .handle_webhook(body.as_bytes(), &signed(&h, body))
            .await
            .unwrap();
        assert!(h.store.schedule_for("sub_plain").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_forces_canceled() {
        let h = harness();
        let body = r#"{"type":"customer.subscription.deleted","data":{"object":{"id":"sub_d","customer":"cus_d","status":"active"}}}"#;
        h.handler
            .handle_webhook(body.as_bytes(), &signed(&h, body))
            .await
            .unwrap();

        let record = h.store.get_subscription("sub_d").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionState::Canceled);
        assert_eq!(record.canceled_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_invoice_without_subscription_ignored() {
        let h = harness();
        let body = r#"{"type":"invoice.paid","data":{"object":{"id":"in_1","customer":"cus_1"}}}"#;
        let outcome = h
            .handler
            .handle_webhook(body.as_bytes(), &signed(&h, body))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_subscription_metadata_fills_unknown_price() {
        let h = harness();
        let body = r#"{"type":"customer.subscription.created","data":{"object":{
            "id":"sub_meta","customer":{"id":"cus_m"},"status":"trialing",
            "items":{"data":[{"price":{"id":"price_legacy"}}]},
            "metadata":{"plan_tier":"studio","bundle_key":"studio_suite"}}}}"#;
        h.handler
            .handle_webhook(body.as_bytes(), &signed(&h, body))
            .await
            .unwrap();

        let record = h.store.get_subscription("sub_meta").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionState::Trialing);
        assert_eq!(record.customer_id.as_deref(), Some("cus_m"));
        assert_eq!(record.plan_tier, Some(crate::catalog::PlanTier::Studio));
        assert_eq!(record.bundle_key.as_deref(), Some("studio_suite"));
        assert_eq!(record.price_id.as_deref(), Some("price_legacy"));
    }
}
