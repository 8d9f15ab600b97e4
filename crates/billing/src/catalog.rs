//! Plan catalog
//!
//! Maps a processor price id to the plan it sells. The catalog is owned by
//! catalog administration; billing only ever reads it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Solo,
    Pro,
    Studio,
    Business,
    Credits,
    Donation,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Solo => "solo",
            PlanTier::Pro => "pro",
            PlanTier::Studio => "studio",
            PlanTier::Business => "business",
            PlanTier::Credits => "credits",
            PlanTier::Donation => "donation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Some(PlanTier::Free),
            "solo" => Some(PlanTier::Solo),
            "pro" => Some(PlanTier::Pro),
            "studio" => Some(PlanTier::Studio),
            "business" => Some(PlanTier::Business),
            "credits" => Some(PlanTier::Credits),
            "donation" => Some(PlanTier::Donation),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
    OneTime,
    #[default]
    Unspecified,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
            BillingInterval::OneTime => "one_time",
            BillingInterval::Unspecified => "unspecified",
        }
    }

    /// Lenient parse; anything unrecognized is `Unspecified`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "month" | "monthly" => BillingInterval::Month,
            "year" | "yearly" | "annual" => BillingInterval::Year,
            "one_time" | "one-time" | "onetime" | "once" => BillingInterval::OneTime,
            _ => BillingInterval::Unspecified,
        }
    }
}

/// What a checkout for this plan sells. Also the checkout session type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    #[default]
    Subscription,
    CreditsTopup,
    SupporterContribution,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Subscription => "subscription",
            PlanKind::CreditsTopup => "credits_topup",
            PlanKind::SupporterContribution => "supporter_contribution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subscription" => Some(PlanKind::Subscription),
            "credits_topup" | "credits-topup" | "topup" => Some(PlanKind::CreditsTopup),
            "supporter_contribution" | "supporter-contribution" | "donation" => {
                Some(PlanKind::SupporterContribution)
            }
            _ => None,
        }
    }

    /// Top-ups and contributions are charged once; everything else recurs.
    pub fn is_one_time_payment(&self) -> bool {
        matches!(
            self,
            PlanKind::CreditsTopup | PlanKind::SupporterContribution
        )
    }
}

/// Introductory pricing applied for the first `duration_periods` periods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroPricing {
    pub enabled: bool,
    /// e.g. `fixed_price` or `percent_off`
    #[serde(rename = "type")]
    pub kind: String,
    pub amount_cents: i64,
    pub duration_periods: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOption {
    pub price_id: String,
    pub tier: PlanTier,
    #[serde(default)]
    pub interval: BillingInterval,
    #[serde(default)]
    pub kind: PlanKind,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub intro: Option<IntroPricing>,
    #[serde(default)]
    pub monthly_credits: i64,
    #[serde(default)]
    pub one_time_credits: i64,
    #[serde(default)]
    pub bundle_key: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_active() -> bool {
    true
}

impl PlanOption {
    /// Intro pricing that should produce a schedule: enabled, monthly only.
    pub fn scheduled_intro(&self) -> Option<&IntroPricing> {
        self.intro
            .as_ref()
            .filter(|intro| intro.enabled && self.interval == BillingInterval::Month)
    }
}

/// Product grouping that owns plans and a credit conversion rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleProduct {
    pub bundle_key: String,
    pub name: String,
    pub credits_per_usd: i64,
}

impl BundleProduct {
    /// `floor(credits_per_usd * amount_cents / 100)`, saturating at i64 bounds.
    pub fn credits_for(&self, amount_cents: i64) -> i64 {
        let raw = (self.credits_per_usd as i128 * amount_cents as i128).div_euclid(100);
        raw.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

/// Read-only catalog capability used by the billing engine.
#[async_trait]
pub trait PriceResolver: Send + Sync {
    async fn plan_by_price(&self, price_id: &str) -> BillingResult<Option<PlanOption>>;

    async fn bundle(&self, bundle_key: &str) -> BillingResult<Option<BundleProduct>>;

    /// Active plans, ordered for display.
    async fn list_plans(&self) -> BillingResult<Vec<PlanOption>>;
}

/// JSON layout accepted by [`InMemoryPlanCatalog::from_json_file`].
#[derive(Debug, Default, Deserialize)]
struct CatalogSeed {
    #[serde(default)]
    plans: Vec<PlanOption>,
    #[serde(default)]
    bundles: Vec<BundleProduct>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryPlanCatalog {
    plans: HashMap<String, PlanOption>,
    bundles: HashMap<String, BundleProduct>,
}

impl InMemoryPlanCatalog {
    pub fn new(plans: Vec<PlanOption>, bundles: Vec<BundleProduct>) -> Self {
        Self {
            plans: plans
                .into_iter()
                .map(|p| (p.price_id.clone(), p))
                .collect(),
            bundles: bundles
                .into_iter()
                .map(|b| (b.bundle_key.clone(), b))
                .collect(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> BillingResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        let seed: CatalogSeed = serde_json::from_str(&raw).map_err(|e| {
            BillingError::Config(format!("invalid catalog {}: {}", path.display(), e))
        })?;
        tracing::info!(
            plans = seed.plans.len(),
            bundles = seed.bundles.len(),
            path = %path.display(),
            "Loaded plan catalog"
        );
        Ok(Self::new(seed.plans, seed.bundles))
    }
}

#[async_trait]
impl PriceResolver for InMemoryPlanCatalog {
    async fn plan_by_price(&self, price_id: &str) -> BillingResult<Option<PlanOption>> {
        Ok(self.plans.get(price_id).cloned())
    }

    async fn bundle(&self, bundle_key: &str) -> BillingResult<Option<BundleProduct>> {
        Ok(self.bundles.get(bundle_key).cloned())
    }

    async fn list_plans(&self) -> BillingResult<Vec<PlanOption>> {
        let mut plans: Vec<PlanOption> = self.plans.values().filter(|p| p.active).cloned().collect();
        plans.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then_with(|| a.price_id.cmp(&b.price_id))
        });
        Ok(plans)
    }
}
