//! Application state

use iva_billing::{WebhookConfig, WebhookHandler};
use iva_shared::SharedStore;
use std::sync::Arc;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    tenancy::{TenantResolver, TenantSettings},
};

/// Validity of tokens issued through [`JwtManager`]; the server itself only validates
const ACCESS_TOKEN_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub config: Arc<Config>,
    pub tenants: Arc<TenantResolver>,
    pub webhooks: Arc<WebhookHandler>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(store: SharedStore, config: Config) -> Self {
        let tenants = TenantResolver::new(
            store.clone(),
            TenantSettings {
                default_timezone: config.default_timezone.clone(),
                default_business_name: config.default_business_name.clone(),
                max_attempts: config.tenant_create_max_attempts,
            },
        );

        let webhooks = WebhookHandler::new(
            store.clone(),
            WebhookConfig {
                secret: config.stripe_webhook_secret.clone(),
                tolerance_secs: config.stripe_webhook_tolerance_secs,
            },
        );

        let auth = AuthState {
            jwt_manager: JwtManager::new(&config.jwt_secret, ACCESS_TOKEN_EXPIRY_HOURS),
        };

        Self {
            store,
            config: Arc::new(config),
            tenants: Arc::new(tenants),
            webhooks: Arc::new(webhooks),
            auth,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }
}
