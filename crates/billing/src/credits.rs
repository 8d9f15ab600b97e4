//! Credit wallets
//!
//! Transactions are append-only; the wallet balance is a running total of
//! them and must always equal their sum.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::BillingResult;
use crate::store::CreditLedger;
use crate::subscriptions::normalize_identity;

/// Transaction type written for purchased credit top-ups
pub const TRANSACTION_TOPUP: &str = "topup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditWallet {
    pub customer_key: String,
    pub balance: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CreditWallet {
    pub fn empty(customer_key: &str, at: OffsetDateTime) -> Self {
        Self {
            customer_key: customer_key.to_string(),
            balance: 0,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub customer_key: String,
    pub amount_credits: i64,
    pub transaction_type: String,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCreditTransaction {
    pub customer_key: String,
    pub amount_credits: i64,
    pub transaction_type: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditHistory {
    pub wallet: CreditWallet,
    pub transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletReconciliation {
    pub customer_key: String,
    pub stored_balance: i64,
    pub ledger_sum: i64,
    pub corrected: bool,
}

pub struct CreditService {
    ledger: Arc<dyn CreditLedger>,
    clock: Arc<dyn Clock>,
}

impl CreditService {
    pub fn new(ledger: Arc<dyn CreditLedger>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// Credit a purchased top-up. Non-positive amounts are skipped and
    /// return `None`.
    pub async fn grant_topup(
        &self,
        customer_key: &str,
        credits: i64,
        metadata: serde_json::Value,
    ) -> BillingResult<Option<CreditWallet>> {
        let customer_key = normalize_identity(customer_key);
        if credits <= 0 {
            tracing::info!(customer_key = %customer_key, credits, "Top-up computed no credits, skipping");
            return Ok(None);
        }

        let (wallet, transaction) = self
            .ledger
            .append(
                &NewCreditTransaction {
                    customer_key: customer_key.clone(),
                    amount_credits: credits,
                    transaction_type: TRANSACTION_TOPUP.to_string(),
                    metadata,
                },
                self.clock.now(),
            )
            .await?;

        tracing::info!(
            customer_key = %customer_key,
            credits,
            balance = wallet.balance,
            transaction_id = %transaction.id,
            "Credited top-up"
        );
        Ok(Some(wallet))
    }

    /// Wallet for a customer; a zero balance when none exists yet.
    pub async fn balance(&self, customer: &str) -> BillingResult<CreditWallet> {
        let key = normalize_identity(customer);
        Ok(self
            .ledger
            .wallet(&key)
            .await?
            .unwrap_or_else(|| CreditWallet::empty(&key, self.clock.now())))
    }

    pub async fn history(&self, customer: &str) -> BillingResult<CreditHistory> {
        let key = normalize_identity(customer);
        let wallet = self.balance(&key).await?;
        let transactions = self.ledger.transactions(&key).await?;
        Ok(CreditHistory {
            wallet,
            transactions,
        })
    }

    /// Compare the stored balance with the ledger sum and rewrite the
    /// balance if they differ.
    pub async fn reconcile_wallet(&self, customer: &str) -> BillingResult<WalletReconciliation> {
        let key = normalize_identity(customer);
        let stored_balance = self.ledger.wallet(&key).await?.map_or(0, |w| w.balance);
        let ledger_sum = self
            .ledger
            .transactions(&key)
            .await?
            .iter()
            .fold(0i64, |sum, tx| sum.saturating_add(tx.amount_credits));

        let corrected = stored_balance != ledger_sum;
        if corrected {
            tracing::warn!(
                customer_key = %key,
                stored_balance,
                ledger_sum,
                drift = stored_balance.saturating_sub(ledger_sum),
                "Credit wallet drifted from ledger, correcting"
            );
            self.ledger
                .set_balance(&key, ledger_sum, self.clock.now())
                .await?;
        }

        Ok(WalletReconciliation {
            customer_key: key,
            stored_balance,
            ledger_sum,
            corrected,
        })
    }
}
