//! Actions and their results
//!
//! An Action is a command issued by a caller against one entity. It is
//! dispatched to the adapter that owns the entity; the adapter answers
//! with an ActionResult carrying either the authoritative post-action
//! state or an optimistic value that a later sync converges on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EntityState;

/// A command against one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Target entity
    pub entity_id: String,

    /// Action name (e.g. "turn_on", "set_brightness", "lock")
    pub action: String,

    /// Action parameters (e.g. {"brightness": 128})
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,

    /// Caller-supplied traceability context
    pub context: ActionContext,
}

impl Action {
    pub fn new(entity_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            action: action.into(),
            parameters: HashMap::new(),
            context: ActionContext::new("api"),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_context(mut self, context: ActionContext) -> Self {
        self.context = context;
        self
    }
}

/// Who asked for an action and why. The correlation id ties pipeline log
/// lines, the result, and the pushed state-change event together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    /// Origin of the request ("api", "ws", "automation", ...)
    pub source: String,

    /// When the caller issued the action
    pub timestamp: DateTime<Utc>,

    /// Free-form description for traceability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Correlation id (ULID), generated if the caller does not supply one
    pub correlation_id: String,
}

impl ActionContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            description: None,
            correlation_id: ulid::Ulid::new().to_string().to_lowercase(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Typed failure codes adapters must use for permanent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorCode {
    EntityNotFound,
    ActionNotSupported,
    SourceUnavailable,
    InvalidParameter,
    Timeout,
}

impl ActionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionErrorCode::EntityNotFound => "entity_not_found",
            ActionErrorCode::ActionNotSupported => "action_not_supported",
            ActionErrorCode::SourceUnavailable => "source_unavailable",
            ActionErrorCode::InvalidParameter => "invalid_parameter",
            ActionErrorCode::Timeout => "timeout",
        }
    }

    /// Whether a caller may reasonably retry the same action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActionErrorCode::SourceUnavailable | ActionErrorCode::Timeout
        )
    }
}

impl std::fmt::Display for ActionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured action failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionError {
    pub code: ActionErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ActionError {
    pub fn new(code: ActionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }
}

/// Outcome of one action. A single action never produces more than one
/// result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub entity_id: String,
    pub action: String,

    /// Post-action state: authoritative when the source confirmed
    /// synchronously, optimistic otherwise. Absent on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<EntityState>,

    /// Attributes reported alongside the new state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    pub processed_at: DateTime<Utc>,

    /// Wall-clock time the adapter spent executing, in milliseconds
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl ActionResult {
    pub fn success(action: &Action, new_state: EntityState, duration_ms: u64) -> Self {
        Self {
            success: true,
            entity_id: action.entity_id.clone(),
            action: action.action.clone(),
            new_state: Some(new_state),
            attributes: HashMap::new(),
            processed_at: Utc::now(),
            duration_ms,
            error: None,
        }
    }

    pub fn failure(action: &Action, error: ActionError, duration_ms: u64) -> Self {
        Self {
            success: false,
            entity_id: action.entity_id.clone(),
            action: action.action.clone(),
            new_state: None,
            attributes: HashMap::new(),
            processed_at: Utc::now(),
            duration_ms,
            error: Some(error),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_builder() {
        let action = Action::new("ha_light_kitchen", "set_brightness")
            .with_parameter("brightness", json!(128))
            .with_context(ActionContext::new("ws").with_description("dimming for movie night"));

        assert_eq!(action.entity_id, "ha_light_kitchen");
        assert_eq!(action.parameters["brightness"], 128);
        assert_eq!(action.context.source, "ws");
        assert!(!action.context.correlation_id.is_empty());
    }

    #[test]
    fn test_result_success_carries_state() {
        let action = Action::new("ha_light_kitchen", "turn_on");
        let result = ActionResult::success(&action, EntityState::On, 12);

        assert!(result.success);
        assert_eq!(result.new_state, Some(EntityState::On));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_result_failure_carries_code() {
        let action = Action::new("ha_light_kitchen", "fly");
        let result = ActionResult::failure(
            &action,
            ActionError::new(ActionErrorCode::ActionNotSupported, "lights cannot fly"),
            3,
        );

        assert!(!result.success);
        assert!(result.new_state.is_none());
        let err = result.error.unwrap();
        assert_eq!(err.code, ActionErrorCode::ActionNotSupported);
        assert!(!err.retryable);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ActionErrorCode::SourceUnavailable.is_retryable());
        assert!(ActionErrorCode::Timeout.is_retryable());
        assert!(!ActionErrorCode::InvalidParameter.is_retryable());
        assert!(!ActionErrorCode::EntityNotFound.is_retryable());
    }
}
