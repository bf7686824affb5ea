//! Placeholder identities for records not yet created downstream.
//!
//! A record registered before its downstream resource exists carries
//! `pending-<contributor-name>` as its external id until the first successful
//! push reports the real one (see `concord_sync::identity`).

use crate::types::ExternalId;

pub const PENDING_PREFIX: &str = "pending-";

pub fn generate_pending_id(name: &str) -> ExternalId {
    ExternalId(format!("{PENDING_PREFIX}{name}"))
}

/// True iff `id` is the prefix followed by at least one character.
pub fn is_pending_id(id: &str) -> bool {
    id.len() > PENDING_PREFIX.len() && id.starts_with(PENDING_PREFIX)
}
