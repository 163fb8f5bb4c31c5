//! Billing error types

use iva_shared::StoreError;
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// No signing secret configured; nothing is processed until one is set
    #[error("webhook secret not configured")]
    WebhookSecretMissing,

    #[error("invalid webhook signature: {0}")]
    WebhookSignatureInvalid(String),

    /// Signature was valid but the body is not an event envelope
    #[error("invalid webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BillingError {
    /// Rejections the processor must not retry blindly (4xx)
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSecretMissing
                | BillingError::WebhookSignatureInvalid(_)
                | BillingError::WebhookPayloadInvalid(_)
        )
    }

    /// Failures a redelivery may get past (lock timeouts, lost connections)
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Store(StoreError::from(e))
    }
}
