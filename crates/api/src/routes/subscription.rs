//! Subscription status of the caller's tenants

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionBusinessDto {
    pub id: Uuid,
    pub name: String,
    pub is_subscribed: bool,
    pub subscription_status: String,
    pub price_ref: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub user_id: String,
    /// True if any owned business is subscribed
    pub is_subscribed: bool,
    pub businesses: Vec<SubscriptionBusinessDto>,
}

pub async fn subscription_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let businesses = state.tenants.list(&auth_user.user_id).await?;

    let businesses: Vec<SubscriptionBusinessDto> = businesses
        .into_iter()
        .map(|b| SubscriptionBusinessDto {
            id: b.id,
            name: b.name,
            is_subscribed: b.is_subscribed,
            subscription_status: b.subscription_status.to_string(),
            price_ref: b.stripe_price_id,
        })
        .collect();

    Ok(Json(SubscriptionResponse {
        user_id: auth_user.user_id,
        is_subscribed: businesses.iter().any(|b| b.is_subscribed),
        businesses,
    }))
}
