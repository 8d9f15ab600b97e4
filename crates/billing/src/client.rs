//! Payment processor client
//!
//! `PaymentProcessor` is the seam every service talks to. `StripeClient`
//! implements it over the processor's form-encoded REST API with a bounded
//! request timeout; tests swap in a fake.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutSessionObject, ListObject, SubscriptionObject};

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

const MAX_METADATA_VALUE_LENGTH: usize = 500;

/// Processor credentials and transport settings
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub publishable_key: String,
    pub webhook_secret: Option<String>,
    pub api_base: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[REDACTED]")
            .field("publishable_key", &self.publishable_key)
            .field("webhook_secret_configured", &self.webhook_secret.is_some())
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            publishable_key: String::new(),
            webhook_secret: None,
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Load from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY is not set".to_string()))?;

        if !["sk_", "rk_"].iter().any(|p| secret_key.starts_with(p)) {
            tracing::warn!("STRIPE_SECRET_KEY does not look like a secret or restricted key");
        }

        let timeout_secs = std::env::var("PROCESSOR_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            secret_key,
            publishable_key: std::env::var("STRIPE_PUBLISHABLE_KEY").unwrap_or_default(),
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            api_base: std::env::var("STRIPE_API_BASE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn is_test_mode(&self) -> bool {
        self.secret_key.starts_with("sk_test_") || self.secret_key.starts_with("rk_test_")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    Subscription,
    Payment,
}

impl CheckoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutMode::Subscription => "subscription",
            CheckoutMode::Payment => "payment",
        }
    }
}

/// Who the hosted checkout page is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutCustomer {
    /// A processor customer we already know about
    Existing(String),
    /// Prefill the email; the processor creates the customer
    Email(String),
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub price_id: String,
    pub mode: CheckoutMode,
    pub success_url: String,
    pub cancel_url: String,
    pub customer: CheckoutCustomer,
    pub metadata: Vec<(String, String)>,
    /// Caller's token for one checkout attempt. Retries carrying the same
    /// token get the same processor session back.
    pub idempotency_key: Option<String>,
}

impl CheckoutSessionRequest {
    /// Processor idempotency key, bound to the caller's token and to what is
    /// being bought so a reused token cannot return another price's session.
    fn processor_idempotency_key(&self) -> Option<String> {
        let token = self.idempotency_key.as_deref().map(str::trim)?;
        if token.is_empty() {
            return None;
        }
        let customer = match &self.customer {
            CheckoutCustomer::Existing(id) => id.as_str(),
            CheckoutCustomer::Email(email) => email.as_str(),
            CheckoutCustomer::Anonymous => "",
        };
        let mut hasher = Sha256::new();
        for part in [token, self.price_id.as_str(), self.mode.as_str(), customer] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Some(format!("checkout_{}", hex::encode(hasher.finalize())))
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionObject>;

    /// `None` when the processor has no such subscription.
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionObject>>;

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<String>>;

    /// Newest subscription for a customer, in any status.
    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionObject>>;

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()>;

    /// Create a billing portal session and return its URL.
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String>;
}

#[derive(Debug, Deserialize)]
struct CustomerRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PortalSessionResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// REST client for the processor API
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    config: Arc<StripeConfig>,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("config", &self.config)
            .finish()
    }
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> BillingResult<Option<T>> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .query(query)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<String>,
    ) -> BillingResult<T> {
        let mut request = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        decode(request.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> BillingResult<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .map(|e| match (e.error.message, e.error.code) {
                (Some(message), _) => message,
                (None, Some(code)) => code,
                (None, None) => status.to_string(),
            })
            .unwrap_or_else(|| status.to_string());
        return Err(BillingError::Processor {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        BillingError::ProcessorTransport(format!("unexpected processor response: {}", e))
    })
}

/// Ids are interpolated into URL paths, so only plain id characters pass.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn sanitize_metadata_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_METADATA_VALUE_LENGTH)
        .collect::<String>()
        .trim()
        .to_string()
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionObject> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), request.mode.as_str().into()),
            ("line_items[0][price]".into(), request.price_id.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
        ];

        match &request.customer {
            CheckoutCustomer::Existing(customer_id) => {
                form.push(("customer".into(), customer_id.clone()));
            }
            CheckoutCustomer::Email(email) => {
                form.push(("customer_email".into(), email.clone()));
            }
            CheckoutCustomer::Anonymous => {}
        }

        for (key, value) in &request.metadata {
            let value = sanitize_metadata_value(value);
            form.push((format!("metadata[{}]", key), value.clone()));
            // Copy onto the subscription so later subscription events carry it
            if request.mode == CheckoutMode::Subscription {
                form.push((format!("subscription_data[metadata][{}]", key), value));
            }
        }

        let session: CheckoutSessionObject = self
            .post_form(
                "/v1/checkout/sessions",
                &form,
                request.processor_idempotency_key(),
            )
            .await?;

        tracing::debug!(session_id = %session.id, mode = request.mode.as_str(), "Created checkout session");
        Ok(session)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionObject>> {
        if !is_safe_id(subscription_id) {
            return Ok(None);
        }
        self.get(&format!("/v1/subscriptions/{}", subscription_id), &[])
            .await
    }

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        let customers: Option<ListObject<CustomerRef>> = self
            .get("/v1/customers", &[("email", email), ("limit", "1")])
            .await?;
        Ok(customers.and_then(|list| list.data.into_iter().next().map(|c| c.id)))
    }

    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionObject>> {
        let subscriptions: Option<ListObject<SubscriptionObject>> = self
            .get(
                "/v1/subscriptions",
                &[("customer", customer_id), ("status", "all"), ("limit", "1")],
            )
            .await?;
        Ok(subscriptions.and_then(|list| list.data.into_iter().next()))
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        if !is_safe_id(subscription_id) {
            return Err(BillingError::NoActiveSubscription(subscription_id.to_string()));
        }
        let _: SubscriptionObject = self
            .post_form(
                &format!("/v1/subscriptions/{}", subscription_id),
                &[("cancel_at_period_end".into(), "true".into())],
                None,
            )
            .await?;
        Ok(())
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let session: PortalSessionResponse = self
            .post_form(
                "/v1/billing_portal/sessions",
                &[
                    ("customer".into(), customer_id.to_string()),
                    ("return_url".into(), return_url.to_string()),
                ],
                None,
            )
            .await?;
        Ok(session.url)
    }
}
