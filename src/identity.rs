//! # Identity Normalization and Request Validation
//!
//! Callers identify themselves in one of two ways:
//!
//! - `keycloak_id`: verified by a trusted upstream authority
//! - `client_id`: self-declared by a web/mobile client
//!
//! Both end up in the single `user_id` column. Client ids are prefixed with
//! [`CLIENT_USER_ID_PREFIX`] so that a client can never claim a verified
//! user's id:
//!
//! ```text
//! keycloak_id = "u1"   →  user_id = "u1"
//! client_id   = "abc"  →  user_id = "client:abc"
//! ```
//!
//! Everything here is a pure function of the request; nothing touches the
//! store, so a rejected request has no side effects.

use crate::error::ValidationError;
use crate::types::{AppendRequest, CLIENT_USER_ID_PREFIX};

/// The `user_id` an accepted request will be stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentity {
    pub user_id: String,
    /// True when `user_id` came from a verified `keycloak_id`.
    pub verified: bool,
}

/// Validates an append request and derives its `user_id`.
///
/// Rules, first violation wins:
///
/// 1. exactly one of `keycloak_id` / `client_id` is non-empty
/// 2. `namespace` is non-empty
/// 3. `client_event_type` is non-empty
/// 4. `data`, when present, parses as JSON
pub fn normalize(request: &AppendRequest) -> Result<NormalizedIdentity, ValidationError> {
    let keycloak_id = non_empty(&request.keycloak_id);
    let client_id = non_empty(&request.client_id);

    let identity = match (keycloak_id, client_id) {
        (None, None) => return Err(ValidationError::MissingIdentity),
        (Some(_), Some(_)) => return Err(ValidationError::AmbiguousIdentity),
        (Some(verified), None) => NormalizedIdentity {
            user_id: verified.to_string(),
            verified: true,
        },
        (None, Some(client)) => NormalizedIdentity {
            user_id: format!("{CLIENT_USER_ID_PREFIX}{client}"),
            verified: false,
        },
    };

    if request.namespace.is_empty() {
        return Err(ValidationError::EmptyNamespace);
    }
    if request.client_event_type.is_empty() {
        return Err(ValidationError::EmptyEventType);
    }
    if let Some(data) = &request.data {
        serde_json::from_str::<serde::de::IgnoredAny>(data)
            .map_err(|e| ValidationError::InvalidData(e.to_string()))?;
    }

    Ok(identity)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// =============================================================================
// Tests
// =============================================================================
