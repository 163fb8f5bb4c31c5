//! HTTP routes

mod businesses;
mod health;
mod subscription;
mod webhooks;

#[cfg(test)]
mod tests;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{auth::require_auth, state::AppState};

pub use businesses::{BusinessDto, BusinessListResponse, CreateBusinessRequest};
pub use subscription::{SubscriptionBusinessDto, SubscriptionResponse};

/// Header carrying the client's IANA timezone
pub const CLIENT_TIMEZONE_HEADER: &str = "x-client-timezone";

/// Header carrying the client's remembered active business
pub const ACTIVE_BUSINESS_HEADER: &str = "x-active-business-id";

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/api/stripe/webhook", post(webhooks::stripe_webhook));

    let protected = Router::new()
        .route(
            "/api/businesses",
            get(businesses::list_businesses).post(businesses::create_business),
        )
        .route("/api/subscription", get(subscription::subscription_status))
        .layer(middleware::from_fn_with_state(state.auth_state(), require_auth));

    public.merge(protected).with_state(state)
}
