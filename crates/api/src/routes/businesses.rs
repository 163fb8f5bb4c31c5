//! Tenant listing and manual creation

use axum::{
    body::Bytes,
    extract::{Extension, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use iva_shared::Business;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ACTIVE_BUSINESS_HEADER, CLIENT_TIMEZONE_HEADER};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
    tenancy::{select_active_business, TenantResolution},
};

const MAX_BUSINESS_NAME_LEN: usize = 120;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessDto {
    pub id: Uuid,
    pub name: String,
    pub timezone: String,
    pub is_default: bool,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub price_ref: Option<String>,
    pub subscription_status: String,
    pub is_subscribed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&Business> for BusinessDto {
    fn from(b: &Business) -> Self {
        Self {
            id: b.id,
            name: b.name.clone(),
            timezone: b.timezone.clone(),
            is_default: b.is_default,
            customer_ref: b.stripe_customer_id.clone(),
            subscription_ref: b.stripe_subscription_id.clone(),
            price_ref: b.stripe_price_id.clone(),
            subscription_status: b.subscription_status.to_string(),
            is_subscribed: b.is_subscribed,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessListResponse {
    pub user_id: String,
    pub businesses: Vec<BusinessDto>,
    /// Whether this request created the default business
    pub created: bool,
    pub active_business_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateBusinessRequest {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    pub active: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Remembered selection from the header, else the query string; malformed ids are ignored
fn remembered_business(headers: &HeaderMap, query: &ActiveQuery) -> Option<Uuid> {
    header_str(headers, ACTIVE_BUSINESS_HEADER)
        .or(query.active.as_deref())
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
}

fn list_response(
    user: &AuthUser,
    resolution: TenantResolution,
    remembered: Option<Uuid>,
) -> BusinessListResponse {
    let active_business_id = select_active_business(remembered, &resolution.businesses).map(|b| b.id);

    BusinessListResponse {
        user_id: user.user_id.clone(),
        businesses: resolution.businesses.iter().map(BusinessDto::from).collect(),
        created: resolution.created,
        active_business_id,
    }
}

/// List the caller's businesses, creating the default one on first use
pub async fn list_businesses(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
    Query(query): Query<ActiveQuery>,
) -> ApiResult<Json<BusinessListResponse>> {
    let timezone_hint = header_str(&headers, CLIENT_TIMEZONE_HEADER);

    let resolution = state
        .tenants
        .resolve(&auth_user.user_id, timezone_hint)
        .await?;

    tracing::debug!(
        user_id = %auth_user.user_id,
        count = resolution.businesses.len(),
        created = resolution.created,
        "Listed businesses"
    );

    Ok(Json(list_response(
        &auth_user,
        resolution,
        remembered_business(&headers, &query),
    )))
}

/// Explicit fallback for creating the default business
///
/// Idempotent: a user that already owns a business gets the existing list back.
pub async fn create_business(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<BusinessListResponse>)> {
    let request: CreateBusinessRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateBusinessRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {}", e)))?
    };

    if let Some(name) = &request.name {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::BadRequest("name must not be blank".to_string()));
        }
        if name.chars().count() > MAX_BUSINESS_NAME_LEN {
            return Err(ApiError::BadRequest(format!(
                "name must be at most {} characters",
                MAX_BUSINESS_NAME_LEN
            )));
        }
    }

    let resolution = state
        .tenants
        .resolve_with(
            &auth_user.user_id,
            header_str(&headers, CLIENT_TIMEZONE_HEADER),
            request.name.as_deref(),
        )
        .await?;

    let status = if resolution.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(list_response(&auth_user, resolution, None))))
}
