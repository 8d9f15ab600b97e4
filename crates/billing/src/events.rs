//! Webhook event decoding
//!
//! The envelope's `type` is read first and selects the concrete shape that
//! `data.object` is decoded into. Types we do not handle keep their raw
//! object so they can still be logged.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionState;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// A decoded webhook delivery.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: Option<String>,
    pub event_type: String,
    pub created: Option<i64>,
    pub event: WebhookEvent,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutSessionCompleted(CheckoutSessionObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    Unknown {
        event_type: String,
        object: Map<String, Value>,
    },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    #[serde(default)]
    object: Option<Value>,
}

impl EventEnvelope {
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        let raw: RawEnvelope = serde_json::from_slice(body)
            .map_err(|e| BillingError::MalformedEvent(format!("invalid envelope: {}", e)))?;

        let event_type = raw
            .event_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BillingError::MalformedEvent("missing type".to_string()))?;

        let object = match raw.data.and_then(|d| d.object) {
            Some(Value::Object(object)) => object,
            Some(_) => {
                return Err(BillingError::MalformedEvent(
                    "data.object is not an object".to_string(),
                ))
            }
            None => {
                return Err(BillingError::MalformedEvent(
                    "missing data.object".to_string(),
                ))
            }
        };

        let event = WebhookEvent::decode(&event_type, object)?;

        Ok(Self {
            id: raw.id,
            event_type,
            created: raw.created,
            event,
        })
    }
}

impl WebhookEvent {
    fn decode(event_type: &str, object: Map<String, Value>) -> BillingResult<Self> {
        let event = match event_type {
            CHECKOUT_SESSION_COMPLETED => {
                WebhookEvent::CheckoutSessionCompleted(typed(event_type, object)?)
            }
            SUBSCRIPTION_CREATED => WebhookEvent::SubscriptionCreated(typed(event_type, object)?),
            SUBSCRIPTION_UPDATED => WebhookEvent::SubscriptionUpdated(typed(event_type, object)?),
            SUBSCRIPTION_DELETED => WebhookEvent::SubscriptionDeleted(typed(event_type, object)?),
            INVOICE_PAID => WebhookEvent::InvoicePaid(typed(event_type, object)?),
            INVOICE_PAYMENT_FAILED => WebhookEvent::InvoicePaymentFailed(typed(event_type, object)?),
            other => WebhookEvent::Unknown {
                event_type: other.to_string(),
                object,
            },
        };
        Ok(event)
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: Map<String, Value>,
) -> BillingResult<T> {
    serde_json::from_value(Value::Object(object)).map_err(|e| {
        BillingError::MalformedEvent(format!("{} object did not decode: {}", event_type, e))
    })
}

// =============================================================================
// Processor objects
// =============================================================================

/// Processor list response (`{ "data": [...] }`).
#[derive(Debug, Clone, Deserialize)]
pub struct ListObject<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for ListObject<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    /// Email the processor collected, preferring the confirmed customer details.
    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default, deserialize_with = "expandable_id")]
    pub price: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub status: String,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    /// Still running, but set to end with the current period
    #[serde(default, deserialize_with = "null_default")]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub items: Option<ListObject<SubscriptionItem>>,
    #[serde(default, deserialize_with = "null_default")]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_processor(&self.status)
    }

    /// Price of the first item, or a `price_id` stamped into metadata.
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_deref())
            .or_else(|| self.metadata_value("price_id"))
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default, deserialize_with = "expandable_id")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub lines: Option<ListObject<InvoiceLine>>,
}

impl InvoiceObject {
    /// Subscription id from the top level, the invoice parent, or the first
    /// line that carries one, in that order.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_deref()
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|p| p.subscription_details.as_ref())
                    .and_then(|d| d.subscription.as_deref())
            })
            .or_else(|| {
                self.lines
                    .as_ref()
                    .and_then(|lines| lines.data.iter().find_map(|l| l.subscription.as_deref()))
            })
    }

    pub fn price_id(&self) -> Option<&str> {
        self.lines
            .as_ref()
            .and_then(|lines| lines.data.iter().find_map(|l| l.price.as_deref()))
    }

    pub fn email(&self) -> Option<&str> {
        self.customer_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

/// Accepts an id string or an expanded object carrying `id`.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    let value = Option::<Expandable>::deserialize(deserializer)?;
    Ok(value
        .map(|v| match v {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        })
        .filter(|id| !id.is_empty()))
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
