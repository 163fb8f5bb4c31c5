// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! IVA API Library
//!
//! HTTP surface of the tenant service: authenticated tenant listing with
//! implicit provisioning, subscription status and the payment processor
//! webhook endpoint.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tenancy;

pub use config::{Config, ConfigError, LogFormat};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
pub use tenancy::{select_active_business, TenancyError, TenantResolution, TenantResolver, TenantSettings};
