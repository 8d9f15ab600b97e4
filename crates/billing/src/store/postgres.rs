//! Postgres-backed stores

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{CheckoutSessionStore, CreditLedger, SubscriptionStore};
use crate::catalog::{
    BillingInterval, BundleProduct, IntroPricing, PlanKind, PlanOption, PlanTier, PriceResolver,
};
use crate::checkout::{CheckoutSession, CheckoutStatus, SessionCompletion};
use crate::credits::{CreditTransaction, CreditWallet, NewCreditTransaction};
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{
    SubscriptionRecord, SubscriptionSchedule, SubscriptionState, SubscriptionUpdate,
};

/// Apply the embedded billing migrations.
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const SESSION_COLUMNS: &str = "session_id, customer_email, customer_id, price_id, subscription_id, \
     session_type, amount_cents, currency, status, schedule_id, created_at, updated_at, completed_at";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, customer_id, customer_email, status, plan_tier, \
     price_id, bundle_key, canceled_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct CheckoutSessionRow {
    session_id: String,
    customer_email: Option<String>,
    customer_id: Option<String>,
    price_id: String,
    subscription_id: Option<String>,
    session_type: String,
    amount_cents: i64,
    currency: String,
    status: String,
    schedule_id: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl From<CheckoutSessionRow> for CheckoutSession {
    fn from(row: CheckoutSessionRow) -> Self {
        CheckoutSession {
            session_type: PlanKind::parse(&row.session_type).unwrap_or_default(),
            status: CheckoutStatus::parse(&row.status).unwrap_or_default(),
            session_id: row.session_id,
            customer_email: row.customer_email,
            customer_id: row.customer_id,
            price_id: row.price_id,
            subscription_id: row.subscription_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            schedule_id: row.schedule_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: String,
    customer_id: Option<String>,
    customer_email: Option<String>,
    status: String,
    plan_tier: Option<String>,
    price_id: Option<String>,
    bundle_key: Option<String>,
    canceled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionRecord {
            status: SubscriptionState::from_processor(&row.status),
            plan_tier: row.plan_tier.as_deref().and_then(PlanTier::parse),
            subscription_id: row.subscription_id,
            customer_id: row.customer_id,
            customer_email: row.customer_email,
            price_id: row.price_id,
            bundle_key: row.bundle_key,
            canceled_at: row.canceled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    schedule_id: String,
    subscription_id: String,
    price_id: String,
    intro_kind: String,
    intro_amount_cents: i64,
    intro_periods: i32,
    regular_amount_cents: i64,
    currency: String,
    created_at: OffsetDateTime,
}

impl From<ScheduleRow> for SubscriptionSchedule {
    fn from(row: ScheduleRow) -> Self {
        SubscriptionSchedule {
            schedule_id: row.schedule_id,
            subscription_id: row.subscription_id,
            price_id: row.price_id,
            intro_kind: row.intro_kind,
            intro_amount_cents: row.intro_amount_cents,
            intro_periods: u32::try_from(row.intro_periods).unwrap_or(0),
            regular_amount_cents: row.regular_amount_cents,
            currency: row.currency,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WalletRow {
    customer_key: String,
    balance: i64,
    updated_at: OffsetDateTime,
}

impl From<WalletRow> for CreditWallet {
    fn from(row: WalletRow) -> Self {
        CreditWallet {
            customer_key: row.customer_key,
            balance: row.balance,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    customer_key: String,
    amount_credits: i64,
    transaction_type: String,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
}

impl From<TransactionRow> for CreditTransaction {
    fn from(row: TransactionRow) -> Self {
        CreditTransaction {
            id: row.id,
            customer_key: row.customer_key,
            amount_credits: row.amount_credits,
            transaction_type: row.transaction_type,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

/// Checkout, subscription and credit storage over one pool
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckoutSessionStore for PgBillingStore {
    async fn upsert_session(&self, session: &CheckoutSession) -> BillingResult<CheckoutSession> {
        // Status, subscription and completion are owned by the webhook path
        let row: CheckoutSessionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO checkout_sessions
                (session_id, customer_email, customer_id, price_id, subscription_id,
                 session_type, amount_cents, currency, status, schedule_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            ON CONFLICT (session_id) DO UPDATE SET
                customer_email = COALESCE(EXCLUDED.customer_email, checkout_sessions.customer_email),
                customer_id = COALESCE(EXCLUDED.customer_id, checkout_sessions.customer_id),
                price_id = EXCLUDED.price_id,
                session_type = EXCLUDED.session_type,
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(&session.session_id)
        .bind(&session.customer_email)
        .bind(&session.customer_id)
        .bind(&session.price_id)
        .bind(&session.subscription_id)
        .bind(session.session_type.as_str())
        .bind(session.amount_cents)
        .bind(&session.currency)
        .bind(session.status.as_str())
        .bind(&session.schedule_id)
        .bind(session.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_session(&self, session_id: &str) -> BillingResult<Option<CheckoutSession>> {
        let row: Option<CheckoutSessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM checkout_sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn complete_session(
        &self,
        completion: &SessionCompletion,
    ) -> BillingResult<Option<CheckoutSession>> {
        // Conditional on 'open' so concurrent redeliveries cannot both win
        let row: Option<CheckoutSessionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE checkout_sessions SET
                status = 'complete',
                customer_id = COALESCE($2, customer_id),
                customer_email = COALESCE(LOWER($3), customer_email),
                subscription_id = COALESCE($4, subscription_id),
                completed_at = $5,
                updated_at = $5
            WHERE session_id = $1 AND status = 'open'
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(&completion.session_id)
        .bind(&completion.customer_id)
        .bind(&completion.customer_email)
        .bind(&completion.subscription_id)
        .bind(completion.completed_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn link_schedule(&self, session_id: &str, schedule_id: &str) -> BillingResult<()> {
        sqlx::query("UPDATE checkout_sessions SET schedule_id = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn upsert_subscription(
        &self,
        update: &SubscriptionUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscription_records
                (subscription_id, customer_id, customer_email, status, plan_tier,
                 price_id, bundle_key, canceled_at, created_at, updated_at)
            VALUES ($1, NULLIF($2, ''), LOWER(NULLIF($3, '')), $4, $5,
                    NULLIF($6, ''), NULLIF($7, ''), $8, $9, $9)
            ON CONFLICT (subscription_id) DO UPDATE SET
                customer_id = COALESCE(EXCLUDED.customer_id, subscription_records.customer_id),
                customer_email = COALESCE(EXCLUDED.customer_email, subscription_records.customer_email),
                status = CASE
                    WHEN subscription_records.status = 'canceled'
                        AND $10
                        AND EXCLUDED.status IN ('active', 'trialing')
                    THEN subscription_records.status
                    ELSE EXCLUDED.status
                END,
                plan_tier = COALESCE(EXCLUDED.plan_tier, subscription_records.plan_tier),
                price_id = COALESCE(EXCLUDED.price_id, subscription_records.price_id),
                bundle_key = COALESCE(EXCLUDED.bundle_key, subscription_records.bundle_key),
                canceled_at = COALESCE(EXCLUDED.canceled_at, subscription_records.canceled_at),
                updated_at = GREATEST(subscription_records.updated_at, EXCLUDED.updated_at)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(&update.subscription_id)
        .bind(&update.customer_id)
        .bind(update.customer_email.as_deref().map(str::trim))
        .bind(update.status.as_str())
        .bind(update.plan_tier.map(|t| t.as_str()))
        .bind(&update.price_id)
        .bind(&update.bundle_key)
        .bind(update.canceled_at)
        .bind(now)
        .bind(update.cancel_pending)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_records WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn latest_for_identity(
        &self,
        identity: &str,
        states: &[SubscriptionState],
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Ok(None);
        }
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscription_records
            WHERE (subscription_id = $1 OR customer_id = $1 OR LOWER(customer_email) = LOWER($1))
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            ORDER BY updated_at DESC, subscription_id DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(identity)
        .bind(&states)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn mark_canceled(
        &self,
        subscription_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscription_records SET
                status = 'canceled',
                canceled_at = $2,
                updated_at = GREATEST(updated_at, $2)
            WHERE subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn upsert_schedule(
        &self,
        schedule: &SubscriptionSchedule,
    ) -> BillingResult<SubscriptionSchedule> {
        let intro_periods = i32::try_from(schedule.intro_periods).map_err(|_| {
            BillingError::Internal(format!(
                "intro period count {} out of range",
                schedule.intro_periods
            ))
        })?;

        let row: ScheduleRow = sqlx::query_as(
            r#"
            INSERT INTO subscription_schedules
                (schedule_id, subscription_id, price_id, intro_kind, intro_amount_cents,
                 intro_periods, regular_amount_cents, currency, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (subscription_id) DO UPDATE SET
                price_id = EXCLUDED.price_id,
                intro_kind = EXCLUDED.intro_kind,
                intro_amount_cents = EXCLUDED.intro_amount_cents,
                intro_periods = EXCLUDED.intro_periods,
                regular_amount_cents = EXCLUDED.regular_amount_cents,
                currency = EXCLUDED.currency
            RETURNING schedule_id, subscription_id, price_id, intro_kind, intro_amount_cents,
                      intro_periods, regular_amount_cents, currency, created_at
            "#,
        )
        .bind(&schedule.schedule_id)
        .bind(&schedule.subscription_id)
        .bind(&schedule.price_id)
        .bind(&schedule.intro_kind)
        .bind(schedule.intro_amount_cents)
        .bind(intro_periods)
        .bind(schedule.regular_amount_cents)
        .bind(&schedule.currency)
        .bind(schedule.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn schedule_for(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionSchedule>> {
        let row: Option<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT schedule_id, subscription_id, price_id, intro_kind, intro_amount_cents,
                   intro_periods, regular_amount_cents, currency, created_at
            FROM subscription_schedules WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl CreditLedger for PgBillingStore {
    async fn append(
        &self,
        transaction: &NewCreditTransaction,
        at: OffsetDateTime,
    ) -> BillingResult<(CreditWallet, CreditTransaction)> {
        let mut tx = self.pool.begin().await?;

        let recorded: TransactionRow = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (id, customer_key, amount_credits, transaction_type, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, customer_key, amount_credits, transaction_type, metadata, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&transaction.customer_key)
        .bind(transaction.amount_credits)
        .bind(&transaction.transaction_type)
        .bind(&transaction.metadata)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        let wallet: WalletRow = sqlx::query_as(
            r#"
            INSERT INTO credit_wallets (customer_key, balance, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (customer_key) DO UPDATE SET
                balance = credit_wallets.balance + EXCLUDED.balance,
                updated_at = EXCLUDED.updated_at
            RETURNING customer_key, balance, updated_at
            "#,
        )
        .bind(&transaction.customer_key)
        .bind(transaction.amount_credits)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((wallet.into(), recorded.into()))
    }

    async fn wallet(&self, customer_key: &str) -> BillingResult<Option<CreditWallet>> {
        let row: Option<WalletRow> = sqlx::query_as(
            "SELECT customer_key, balance, updated_at FROM credit_wallets WHERE customer_key = $1",
        )
        .bind(customer_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn transactions(&self, customer_key: &str) -> BillingResult<Vec<CreditTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT id, customer_key, amount_credits, transaction_type, metadata, created_at
            FROM credit_transactions
            WHERE customer_key = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(customer_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_balance(
        &self,
        customer_key: &str,
        balance: i64,
        at: OffsetDateTime,
    ) -> BillingResult<CreditWallet> {
        let row: WalletRow = sqlx::query_as(
            r#"
            INSERT INTO credit_wallets (customer_key, balance, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (customer_key) DO UPDATE SET
                balance = EXCLUDED.balance,
                updated_at = EXCLUDED.updated_at
            RETURNING customer_key, balance, updated_at
            "#,
        )
        .bind(customer_key)
        .bind(balance)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    price_id: String,
    tier: String,
    billing_interval: String,
    kind: String,
    amount_cents: i64,
    currency: String,
    intro_enabled: bool,
    intro_type: Option<String>,
    intro_amount_cents: Option<i64>,
    intro_duration_periods: Option<i32>,
    monthly_credits: i64,
    one_time_credits: i64,
    bundle_key: Option<String>,
    display_name: String,
    description: Option<String>,
    sort_order: i32,
    active: bool,
}

impl PlanRow {
    fn into_plan(self) -> Option<PlanOption> {
        let Some(tier) = PlanTier::parse(&self.tier) else {
            tracing::warn!(price_id = %self.price_id, tier = %self.tier, "Plan has unknown tier, skipping");
            return None;
        };
        let intro = self.intro_type.map(|kind| IntroPricing {
            enabled: self.intro_enabled,
            kind,
            amount_cents: self.intro_amount_cents.unwrap_or(0),
            duration_periods: self
                .intro_duration_periods
                .and_then(|p| u32::try_from(p).ok())
                .unwrap_or(0),
        });
        Some(PlanOption {
            price_id: self.price_id,
            tier,
            interval: BillingInterval::parse(&self.billing_interval),
            kind: PlanKind::parse(&self.kind).unwrap_or_default(),
            amount_cents: self.amount_cents,
            currency: self.currency,
            intro,
            monthly_credits: self.monthly_credits,
            one_time_credits: self.one_time_credits,
            bundle_key: self.bundle_key,
            display_name: self.display_name,
            description: self.description,
            sort_order: self.sort_order,
            active: self.active,
        })
    }
}

const PLAN_COLUMNS: &str = "price_id, tier, billing_interval, kind, amount_cents, currency, \
     intro_enabled, intro_type, intro_amount_cents, intro_duration_periods, monthly_credits, \
     one_time_credits, bundle_key, display_name, description, sort_order, active";

/// Plan catalog read from `plan_options` / `bundle_products`
#[derive(Clone)]
pub struct PgPlanCatalog {
    pool: PgPool,
}

impl PgPlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceResolver for PgPlanCatalog {
    async fn plan_by_price(&self, price_id: &str) -> BillingResult<Option<PlanOption>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plan_options WHERE price_id = $1",
            PLAN_COLUMNS
        ))
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(PlanRow::into_plan))
    }

    async fn bundle(&self, bundle_key: &str) -> BillingResult<Option<BundleProduct>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT bundle_key, name, credits_per_usd FROM bundle_products WHERE bundle_key = $1",
        )
        .bind(bundle_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(bundle_key, name, credits_per_usd)| BundleProduct {
            bundle_key,
            name,
            credits_per_usd,
        }))
    }

    async fn list_plans(&self) -> BillingResult<Vec<PlanOption>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {} FROM plan_options WHERE active ORDER BY sort_order, price_id",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(PlanRow::into_plan).collect())
    }
}
