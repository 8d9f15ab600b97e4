//! In-process store used by tests and database-less local runs.

use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CheckoutSessionStore, CreditLedger, SubscriptionStore};
use crate::checkout::{CheckoutSession, CheckoutStatus, SessionCompletion};
use crate::credits::{CreditTransaction, CreditWallet, NewCreditTransaction};
use crate::error::BillingResult;
use crate::subscriptions::{
    normalize_identity, SubscriptionRecord, SubscriptionSchedule, SubscriptionState,
    SubscriptionUpdate,
};

#[derive(Debug, Default)]
struct CreditBook {
    wallets: HashMap<String, CreditWallet>,
    transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    sessions: RwLock<HashMap<String, CheckoutSession>>,
    subscriptions: RwLock<HashMap<String, SubscriptionRecord>>,
    schedules: RwLock<HashMap<String, SubscriptionSchedule>>,
    credits: RwLock<CreditBook>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_identity(record: &SubscriptionRecord, identity: &str) -> bool {
    record.subscription_id == identity
        || record.customer_id.as_deref() == Some(identity)
        || record
            .customer_email
            .as_deref()
            .is_some_and(|email| email.eq_ignore_ascii_case(identity))
}

#[async_trait]
impl CheckoutSessionStore for InMemoryBillingStore {
    async fn upsert_session(&self, session: &CheckoutSession) -> BillingResult<CheckoutSession> {
        let mut sessions = self.sessions.write().await;
        let stored = match sessions.get(&session.session_id) {
            // Lifecycle fields stay as they are on a repeated create
            Some(existing) => CheckoutSession {
                customer_email: session
                    .customer_email
                    .clone()
                    .or_else(|| existing.customer_email.clone()),
                customer_id: session
                    .customer_id
                    .clone()
                    .or_else(|| existing.customer_id.clone()),
                price_id: session.price_id.clone(),
                session_type: session.session_type,
                amount_cents: session.amount_cents,
                currency: session.currency.clone(),
                updated_at: session.updated_at,
                ..existing.clone()
            },
            None => session.clone(),
        };
        sessions.insert(stored.session_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_session(&self, session_id: &str) -> BillingResult<Option<CheckoutSession>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn complete_session(
        &self,
        completion: &SessionCompletion,
    ) -> BillingResult<Option<CheckoutSession>> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&completion.session_id) else {
            return Ok(None);
        };
        if session.status == CheckoutStatus::Complete {
            return Ok(None);
        }

        session.status = CheckoutStatus::Complete;
        session.completed_at = Some(completion.completed_at);
        session.updated_at = completion.completed_at;
        if completion.customer_id.is_some() {
            session.customer_id = completion.customer_id.clone();
        }
        if let Some(email) = &completion.customer_email {
            session.customer_email = Some(normalize_identity(email));
        }
        if completion.subscription_id.is_some() {
            session.subscription_id = completion.subscription_id.clone();
        }
        Ok(Some(session.clone()))
    }

    async fn link_schedule(&self, session_id: &str, schedule_id: &str) -> BillingResult<()> {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.schedule_id = Some(schedule_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn upsert_subscription(
        &self,
        update: &SubscriptionUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        let mut subscriptions = self.subscriptions.write().await;
        let record = update.merge_into(subscriptions.get(&update.subscription_id), now);
        subscriptions.insert(record.subscription_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.subscriptions.read().await.get(subscription_id).cloned())
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
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|r| matches_identity(r, identity))
            .filter(|r| states.is_empty() || states.contains(&r.status))
            .max_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.subscription_id.cmp(&b.subscription_id))
            })
            .cloned())
    }

    async fn mark_canceled(
        &self,
        subscription_id: &str,
        at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(record) = subscriptions.get_mut(subscription_id) else {
            return Ok(None);
        };
        record.status = SubscriptionState::Canceled;
        record.canceled_at = Some(at);
        record.updated_at = record.updated_at.max(at);
        Ok(Some(record.clone()))
    }

    async fn upsert_schedule(
        &self,
        schedule: &SubscriptionSchedule,
    ) -> BillingResult<SubscriptionSchedule> {
        let mut schedules = self.schedules.write().await;
        // One schedule per subscription; the first id sticks
        let stored = match schedules.get(&schedule.subscription_id) {
            Some(existing) => SubscriptionSchedule {
                schedule_id: existing.schedule_id.clone(),
                created_at: existing.created_at,
                ..schedule.clone()
            },
            None => schedule.clone(),
        };
        schedules.insert(stored.subscription_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn schedule_for(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionSchedule>> {
        Ok(self.schedules.read().await.get(subscription_id).cloned())
    }
}

#[async_trait]
impl CreditLedger for InMemoryBillingStore {
    async fn append(
        &self,
        transaction: &NewCreditTransaction,
        at: OffsetDateTime,
    ) -> BillingResult<(CreditWallet, CreditTransaction)> {
        let mut book = self.credits.write().await;

        let recorded = CreditTransaction {
            id: Uuid::new_v4(),
            customer_key: transaction.customer_key.clone(),
            amount_credits: transaction.amount_credits,
            transaction_type: transaction.transaction_type.clone(),
            metadata: transaction.metadata.clone(),
            created_at: at,
        };
        book.transactions.push(recorded.clone());

        let wallet = book
            .wallets
            .entry(transaction.customer_key.clone())
            .or_insert_with(|| CreditWallet::empty(&transaction.customer_key, at));
        wallet.balance = wallet.balance.saturating_add(transaction.amount_credits);
        wallet.updated_at = at;

        Ok((wallet.clone(), recorded))
    }

    async fn wallet(&self, customer_key: &str) -> BillingResult<Option<CreditWallet>> {
        Ok(self.credits.read().await.wallets.get(customer_key).cloned())
    }

    async fn transactions(&self, customer_key: &str) -> BillingResult<Vec<CreditTransaction>> {
        let book = self.credits.read().await;
        let mut transactions: Vec<CreditTransaction> = book
            .transactions
            .iter()
            .filter(|tx| tx.customer_key == customer_key)
            .cloned()
            .collect();
        transactions.reverse();
        Ok(transactions)
    }

    async fn set_balance(
        &self,
        customer_key: &str,
        balance: i64,
        at: OffsetDateTime,
    ) -> BillingResult<CreditWallet> {
        let mut book = self.credits.write().await;
        let wallet = book
            .wallets
            .entry(customer_key.to_string())
            .or_insert_with(|| CreditWallet::empty(customer_key, at));
        wallet.balance = balance;
        wallet.updated_at = at;
        Ok(wallet.clone())
    }
}
