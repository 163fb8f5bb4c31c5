// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! IVA Billing Module
//!
//! Keeps tenant subscription state in sync with the payment processor's
//! webhook stream.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body with a clock-skew window
//! - **Event Parsing**: closed set of handled event types, tolerant of API version drift
//! - **Business Resolution**: ordered fallback from explicit id to owning user
//! - **State Machine**: field-level coalescing with an unconditional termination override
//! - **Webhooks**: exactly-once application on top of at-least-once delivery
//! - **Invariants**: read-only consistency checks for scheduled monitoring

pub mod error;
pub mod events;
pub mod invariants;
pub mod resolver;
pub mod signature;
pub mod state_machine;
pub mod webhooks;


// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventEnvelope, PaymentEvent, PaymentEventType};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Resolution
pub use resolver::{resolve_business, Resolution, ResolutionKeys, ResolvedBy};

// Signatures
pub use signature::{compute_signature, verify_signature, SIGNATURE_HEADER};

// State machine
pub use state_machine::SubscriptionUpdate;

// Webhooks
pub use webhooks::{IngestOutcome, WebhookConfig, WebhookHandler};
