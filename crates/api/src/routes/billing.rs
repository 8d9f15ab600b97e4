//! Billing routes

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use brandsite_billing::{
    BillingError, CancelResult, CheckoutRequest, CheckoutResponse, CreditHistory, PlanOption,
    PortalResponse, SubscriptionStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Signature headers, checked in order
const SIGNATURE_HEADERS: [&str; 2] = ["x-signature", "stripe-signature"];

#[derive(Debug, Deserialize)]
pub struct IdentityRequest {
    pub user_identity: String,
}

#[derive(Debug, Deserialize)]
pub struct PortalRequest {
    pub user_identity: String,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreditsQuery {
    pub identity: String,
}

/// Handle payment processor webhook deliveries
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    tracing::info!(body_len = body.len(), "Billing webhook received");

    let billing = state.billing()?;

    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .ok_or_else(|| {
            tracing::warn!("Billing webhook missing signature header");
            ApiError::Billing(BillingError::InvalidSignature)
        })?;

    let outcome = billing.webhooks.handle_webhook(&body, signature).await?;
    tracing::info!(outcome = ?outcome, "Billing webhook processed");

    Ok(Json(json!({ "received": true, "outcome": outcome })))
}

/// Open a hosted checkout session for a catalog price
pub async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = state.billing()?;

    if req.price_id.trim().is_empty() {
        return Err(ApiError::BadRequest("price_id is required".to_string()));
    }

    if req.idempotency_key.is_none() {
        req.idempotency_key = headers
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    let response = billing.checkout.create_session(&req).await?;
    Ok(Json(response))
}

pub async fn verify_subscription(
    State(state): State<AppState>,
    Json(req): Json<IdentityRequest>,
) -> ApiResult<Json<SubscriptionStatus>> {
    let billing = state.billing()?;
    let status = billing
        .subscriptions
        .get_subscription_status(&req.user_identity)
        .await?;
    Ok(Json(status))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(req): Json<IdentityRequest>,
) -> ApiResult<Json<CancelResult>> {
    let billing = state.billing()?;
    let result = billing
        .subscriptions
        .cancel_subscription(&req.user_identity)
        .await?;
    Ok(Json(result))
}

pub async fn create_portal_session(
    State(state): State<AppState>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<PortalResponse>> {
    let billing = state.billing()?;
    let portal = billing
        .portal
        .create_portal_session(&req.user_identity, req.return_url.as_deref())
        .await?;
    Ok(Json(portal))
}

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanOption>>> {
    let billing = state.billing()?;
    Ok(Json(billing.list_plans().await?))
}

pub async fn get_credits(
    State(state): State<AppState>,
    Query(query): Query<CreditsQuery>,
) -> ApiResult<Json<CreditHistory>> {
    let billing = state.billing()?;

    if query.identity.trim().is_empty() {
        return Err(ApiError::BadRequest("identity is required".to_string()));
    }

    Ok(Json(billing.credits.history(&query.identity).await?))
}
