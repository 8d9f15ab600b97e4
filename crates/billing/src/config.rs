//! Billing behaviour knobs loaded from the environment

use time::Duration;

use crate::signature::DEFAULT_TOLERANCE_SECS;

pub const DEFAULT_FRESHNESS_SECS: i64 = 60;
pub const DEFAULT_CACHE_TTL_SECS: i64 = 60;
pub const DEFAULT_SITE_URL: &str = "http://localhost:3000";

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// How old a stored subscription record may be before a status read
    /// asks the processor again.
    pub freshness_window: Duration,
    /// Lifetime of cached status responses. Zero disables the cache.
    pub cache_ttl: Duration,
    /// Allowed webhook timestamp skew in seconds. Zero disables the check.
    pub webhook_tolerance_secs: i64,
    pub success_url: String,
    pub cancel_url: String,
    pub portal_return_url: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self::for_site(DEFAULT_SITE_URL)
    }
}

impl BillingConfig {
    /// Defaults with redirect URLs rooted at `site_url`.
    pub fn for_site(site_url: &str) -> Self {
        let site = site_url.trim_end_matches('/');
        Self {
            freshness_window: Duration::seconds(DEFAULT_FRESHNESS_SECS),
            cache_ttl: Duration::seconds(DEFAULT_CACHE_TTL_SECS),
            webhook_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            success_url: format!("{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}", site),
            cancel_url: format!("{}/pricing", site),
            portal_return_url: format!("{}/account", site),
        }
    }

    pub fn from_env() -> Self {
        let site_url = std::env::var("SITE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SITE_URL.to_string());
        let defaults = Self::for_site(&site_url);

        Self {
            freshness_window: Duration::seconds(env_secs(
                "SUBSCRIPTION_FRESHNESS_SECS",
                DEFAULT_FRESHNESS_SECS,
            )),
            cache_ttl: Duration::seconds(env_secs(
                "SUBSCRIPTION_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            webhook_tolerance_secs: env_secs("WEBHOOK_TOLERANCE_SECS", DEFAULT_TOLERANCE_SECS),
            success_url: env_or("CHECKOUT_SUCCESS_URL", defaults.success_url),
            cancel_url: env_or("CHECKOUT_CANCEL_URL", defaults.cancel_url),
            portal_return_url: env_or("PORTAL_RETURN_URL", defaults.portal_return_url),
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(v) if v >= 0 => v,
            _ => {
                tracing::warn!(var = name, value = %raw, default, "Invalid seconds value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
