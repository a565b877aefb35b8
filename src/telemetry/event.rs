//! Telemetry event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of recorded activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An inbound chat message.
    ChatMessage,
    /// A moderation action.
    ModAction,
    /// A trigger fired.
    TriggerEvent,
}

impl EventType {
    /// Stable string form as written to the sink.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::ModAction => "mod_action",
            Self::TriggerEvent => "trigger_event",
        }
    }
}

/// One telemetry row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub channel: String,
    pub user: String,
    pub triggered: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl TelemetryEvent {
    /// A chat message, `fired` when at least one trigger matched.
    #[must_use]
    pub fn chat(channel: &str, user: &str, fired: bool, name: Option<String>, details: Map<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: EventType::ChatMessage,
            channel: channel.to_string(),
            user: user.to_string(),
            triggered: fired,
            name,
            details,
        }
    }

    /// A moderation action against `target_user`.
    #[must_use]
    pub fn mod_action(channel: &str, target_user: &str, action: &str, details: Map<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: EventType::ModAction,
            channel: channel.to_string(),
            user: target_user.to_string(),
            triggered: false,
            name: Some(action.to_string()),
            details,
        }
    }

    /// A trigger fire. `trigger_type` is recorded under `details.trigger_type`.
    #[must_use]
    pub fn trigger(channel: &str, trigger_name: &str, trigger_type: &str, mut details: Map<String, Value>) -> Self {
        details.insert("trigger_type".to_string(), Value::String(trigger_type.to_string()));
        Self {
            timestamp: Utc::now(),
            event_type: EventType::TriggerEvent,
            channel: channel.to_string(),
            user: String::new(),
            triggered: true,
            name: Some(trigger_name.to_string()),
            details,
        }
    }
}
