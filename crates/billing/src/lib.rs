// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries processor messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Brandsite Billing Module
//!
//! Reconciles local subscription and credit state with the payment
//! processor.
//!
//! ## Features
//!
//! - **Checkout**: Open hosted checkout sessions for catalog prices
//! - **Webhooks**: Verify processor deliveries and apply them idempotently
//! - **Subscription Status**: Cached reads that refresh stale records from the processor
//! - **Cancellation**: Cancel at period end, locally authoritative
//! - **Credits**: Top-up ledger with wallet reconciliation
//! - **Portal**: Self-service billing portal sessions

pub mod cache;
pub mod catalog;
pub mod checkout;
pub mod client;
pub mod clock;
pub mod config;
pub mod credits;
pub mod error;
pub mod events;
pub mod portal;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod testing;

// Cache
pub use cache::SubscriptionCache;

// Catalog
pub use catalog::{
    BillingInterval, BundleProduct, InMemoryPlanCatalog, IntroPricing, PlanKind, PlanOption,
    PlanTier, PriceResolver,
};

// Checkout
pub use checkout::{
    CheckoutRequest, CheckoutResponse, CheckoutService, CheckoutSession, CheckoutStatus,
};

// Client
pub use client::{PaymentProcessor, StripeClient, StripeConfig};

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::BillingConfig;

// Credits
pub use credits::{CreditHistory, CreditService, CreditTransaction, CreditWallet, WalletReconciliation};

// Error
pub use error::{BillingError, BillingResult};

// Portal
pub use portal::{PortalResponse, PortalService};

// Signature
pub use signature::SignatureVerifier;

// Store
pub use store::{
    run_migrations, CheckoutSessionStore, CreditLedger, InMemoryBillingStore, PgBillingStore,
    PgPlanCatalog, SubscriptionStore,
};

// Subscriptions
pub use subscriptions::{
    CancelResult, SubscriptionRecord, SubscriptionService, SubscriptionState, SubscriptionStatus,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use sqlx::PgPool;
use std::sync::Arc;

/// Collaborators the billing engine runs against
#[derive(Clone)]
pub struct BillingDeps {
    pub catalog: Arc<dyn PriceResolver>,
    pub sessions: Arc<dyn CheckoutSessionStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub ledger: Arc<dyn CreditLedger>,
    pub processor: Arc<dyn PaymentProcessor>,
    pub clock: Arc<dyn Clock>,
}

impl BillingDeps {
    /// One in-process store for every capability, the given processor and
    /// the system clock.
    pub fn in_memory(catalog: InMemoryPlanCatalog, processor: Arc<dyn PaymentProcessor>) -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        Self {
            catalog: Arc::new(catalog),
            sessions: store.clone(),
            subscriptions: store.clone(),
            ledger: store,
            processor,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: Arc<dyn PriceResolver>,
    pub checkout: CheckoutService,
    pub credits: Arc<CreditService>,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub cache: Arc<SubscriptionCache>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeConfig::from_env()?;
        let processor = Arc::new(StripeClient::new(stripe.clone())?);
        let store = Arc::new(PgBillingStore::new(pool.clone()));

        let deps = BillingDeps {
            catalog: Arc::new(PgPlanCatalog::new(pool)),
            sessions: store.clone(),
            subscriptions: store.clone(),
            ledger: store,
            processor,
            clock: Arc::new(SystemClock),
        };
        Ok(Self::new(deps, &BillingConfig::from_env(), &stripe))
    }

    /// Environment-configured processor over in-process stores
    pub fn in_memory_from_env(catalog: InMemoryPlanCatalog) -> BillingResult<Self> {
        let stripe = StripeConfig::from_env()?;
        let processor = Arc::new(StripeClient::new(stripe.clone())?);
        let deps = BillingDeps::in_memory(catalog, processor);
        Ok(Self::new(deps, &BillingConfig::from_env(), &stripe))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(deps: BillingDeps, config: &BillingConfig, stripe: &StripeConfig) -> Self {
        let cache = Arc::new(SubscriptionCache::new(config.cache_ttl, deps.clock.clone()));
        let credits = Arc::new(CreditService::new(deps.ledger.clone(), deps.clock.clone()));

        Self {
            checkout: CheckoutService::new(
                deps.catalog.clone(),
                deps.sessions.clone(),
                deps.subscriptions.clone(),
                deps.processor.clone(),
                deps.clock.clone(),
                stripe.publishable_key.clone(),
                config.success_url.clone(),
                config.cancel_url.clone(),
            ),
            portal: PortalService::new(
                deps.subscriptions.clone(),
                deps.processor.clone(),
                config.portal_return_url.clone(),
            ),
            subscriptions: SubscriptionService::new(
                deps.subscriptions.clone(),
                deps.catalog.clone(),
                deps.processor.clone(),
                cache.clone(),
                deps.clock.clone(),
                config.freshness_window,
            ),
            webhooks: WebhookHandler::new(
                SignatureVerifier::new(stripe.webhook_secret.clone(), config.webhook_tolerance_secs),
                deps.catalog.clone(),
                deps.sessions,
                deps.subscriptions,
                credits.clone(),
                cache.clone(),
                deps.clock,
            ),
            catalog: deps.catalog,
            credits,
            cache,
        }
    }

    /// Active plans for pricing pages
    pub async fn list_plans(&self) -> BillingResult<Vec<PlanOption>> {
        self.catalog.list_plans().await
    }
}
