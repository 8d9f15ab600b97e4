//! Persistence for checkout sessions, subscription records and credits.
//!
//! Each concern is a narrow trait so services only see what they use.
//! `postgres` backs them with sqlx; `memory` keeps everything in process for
//! tests and database-less local runs.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::checkout::{CheckoutSession, SessionCompletion};
use crate::credits::{CreditTransaction, CreditWallet, NewCreditTransaction};
use crate::error::BillingResult;
use crate::subscriptions::{
    SubscriptionRecord, SubscriptionSchedule, SubscriptionState, SubscriptionUpdate,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::{run_migrations, PgBillingStore, PgPlanCatalog};

#[async_trait]
pub trait CheckoutSessionStore: Send + Sync {
    async fn upsert_session(&self, session: &CheckoutSession) -> BillingResult<CheckoutSession>;

    async fn get_session(&self, session_id: &str) -> BillingResult<Option<CheckoutSession>>;

    /// Move an open session to complete and fill in what the processor
    /// reported. Returns `None` when the session was already complete, so
    /// only one delivery of a completion ever gets to act on it.
    async fn complete_session(
        &self,
        completion: &SessionCompletion,
    ) -> BillingResult<Option<CheckoutSession>>;

    async fn link_schedule(&self, session_id: &str, schedule_id: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or merge by subscription id. Absent fields in `update` keep the
    /// stored value; `updated_at` never moves backwards.
    async fn upsert_subscription(
        &self,
        update: &SubscriptionUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord>;

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Most recently updated record matching the identity by subscription id,
    /// customer id, or email (case-insensitive). An empty `states` slice
    /// matches any status.
    async fn latest_for_identity(
        &self,
        identity: &str,
        states: &[SubscriptionState],
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn mark_canceled(
        &self,
        subscription_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    async fn upsert_schedule(
        &self,
        schedule: &SubscriptionSchedule,
    ) -> BillingResult<SubscriptionSchedule>;

    async fn schedule_for(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionSchedule>>;
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Append a transaction and apply it to the wallet as one unit.
    async fn append(
        &self,
        transaction: &NewCreditTransaction,
        at: OffsetDateTime,
    ) -> BillingResult<(CreditWallet, CreditTransaction)>;

    async fn wallet(&self, customer_key: &str) -> BillingResult<Option<CreditWallet>>;

    /// Transactions for a wallet, newest first.
    async fn transactions(&self, customer_key: &str) -> BillingResult<Vec<CreditTransaction>>;

    /// Overwrite the stored balance. Only reconciliation uses this.
    async fn set_balance(
        &self,
        customer_key: &str,
        balance: i64,
        at: OffsetDateTime,
    ) -> BillingResult<CreditWallet>;
}
