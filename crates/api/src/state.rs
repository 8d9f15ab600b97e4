//! Application state

use brandsite_billing::{BillingService, InMemoryPlanCatalog};
use sqlx::PgPool;
use std::sync::Arc;

use crate::{config::Config, error::ApiError};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Billing engine, absent when the processor is not configured
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    /// Build billing over Postgres when a pool is given, otherwise over
    /// in-process stores seeded from `PLAN_CATALOG_FILE`.
    pub fn new(config: Config, pool: Option<PgPool>) -> Self {
        let billing = match pool {
            Some(pool) => BillingService::from_env(pool),
            None => load_catalog(&config).and_then(BillingService::in_memory_from_env),
        };

        let billing = match billing {
            Ok(svc) => {
                tracing::info!("Billing service initialized");
                Some(Arc::new(svc))
            }
            Err(e) => {
                tracing::warn!("Billing not configured: {}", e);
                None
            }
        };

        Self { config, billing }
    }

    pub fn with_billing(config: Config, billing: BillingService) -> Self {
        Self {
            config,
            billing: Some(Arc::new(billing)),
        }
    }

    pub fn billing(&self) -> Result<&BillingService, ApiError> {
        self.billing.as_deref().ok_or(ApiError::ServiceUnavailable)
    }
}

fn load_catalog(config: &Config) -> brandsite_billing::BillingResult<InMemoryPlanCatalog> {
    match &config.plan_catalog_file {
        Some(path) => InMemoryPlanCatalog::from_json_file(path),
        None => {
            tracing::warn!("PLAN_CATALOG_FILE not set, plan catalog is empty");
            Ok(InMemoryPlanCatalog::default())
        }
    }
}
