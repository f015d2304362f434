//! Error taxonomy shared across the gateway
//!
//! Components return tagged errors from this taxonomy; the HTTP surface
//! maps each kind to a status code. Transient adapter errors
//! (SourceUnavailable, Timeout) are not retried inside the core.

use thiserror::Error;

use crate::ActionErrorCode;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Tagged error kinds the HTTP surface maps onto status codes.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Caller error (HTTP 400)
    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Missing entity, room, adapter, or action (HTTP 404)
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Duplicate id or conflicting mutation (HTTP 409)
    #[error("conflict on {kind} {id}: {reason}")]
    Conflict {
        kind: &'static str,
        id: String,
        reason: String,
    },

    /// Missing or invalid credentials (HTTP 401)
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated but not allowed (HTTP 403)
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No connected adapter for the source (HTTP 503)
    #[error("no connected adapter for source '{source_id}'")]
    NoAdapterForSource { source_id: String },

    /// Adapter is known but currently disconnected (HTTP 503)
    #[error("source '{source_id}' is unavailable")]
    SourceUnavailable { source_id: String },

    /// The adapter executed the action and reported failure (HTTP 422)
    #[error("action failed with {code}: {message}")]
    ActionFailed {
        code: ActionErrorCode,
        message: String,
    },

    /// Deadline exceeded (HTTP 504)
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Unexpected failure (HTTP 500), logged with a correlation id
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn entity_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "entity",
            id: id.into(),
        }
    }

    pub fn room_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "room",
            id: id.into(),
        }
    }

    pub fn adapter_not_found(id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind: "adapter",
            id: id.into(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for errors a caller may retry without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::SourceUnavailable { .. }
                | CoreError::NoAdapterForSource { .. }
                | CoreError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages_are_human_readable() {
        let err = CoreError::entity_not_found("ha_light_kitchen");
        assert_eq!(err.to_string(), "entity not found: ha_light_kitchen");

        let err = CoreError::ActionFailed {
            code: ActionErrorCode::ActionNotSupported,
            message: "entity is not a camera".to_string(),
        };
        assert!(err.to_string().contains("action_not_supported"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CoreError::SourceUnavailable {
            source_id: "ring".to_string()
        }
        .is_transient());
        assert!(CoreError::Timeout(std::time::Duration::from_secs(30)).is_transient());
        assert!(!CoreError::entity_not_found("x").is_transient());
    }
}
