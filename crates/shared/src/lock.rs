//! Advisory lock keys
//!
//! Postgres advisory locks are keyed by a 64-bit integer. The key for a user is
//! the first eight bytes (big-endian) of `SHA-256("tenant-provision:" || user_id)`.
//! The legacy-owner backfill migration derives the same key in SQL, so the
//! derivation must never change.

use sha2::{Digest, Sha256};

pub const PROVISIONING_LOCK_NAMESPACE: &str = "tenant-provision:";

/// Stable advisory lock key for provisioning the tenant of `user_id`
pub fn advisory_lock_key(user_id: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(PROVISIONING_LOCK_NAMESPACE.as_bytes());
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}
