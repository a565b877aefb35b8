//! Trigger definitions.
//!
//! A trigger is a pattern-to-action rule. The store persists [`TriggerRow`]s;
//! the cache compiles them into immutable [`TriggerRecord`]s that are published
//! in snapshots and scanned by the match engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Unique identifier for a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    /// Create a new random trigger id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TriggerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What a trigger does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Send a chat reply.
    Reply,
    /// Emit a structured alert on the side channel.
    Alert,
}

/// Argument-name to source-field-name mapping for ALERT triggers.
pub type AlertMapping = BTreeMap<String, String>;

/// The action half of a trigger, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerResponse {
    /// Reply with fixed text.
    Reply { text: String },
    /// Build an alert payload from the mapping.
    Alert { mapping: AlertMapping },
}

impl TriggerResponse {
    /// The response kind.
    #[must_use]
    pub const fn kind(&self) -> ResponseKind {
        match self {
            Self::Reply { .. } => ResponseKind::Reply,
            Self::Alert { .. } => ResponseKind::Alert,
        }
    }
}

/// A trigger as persisted in the store.
///
/// `alert_mapping` holds the serialized JSON exactly as stored so that a
/// malformed mapping surfaces when the cache compiles the row, not when the
/// store lists it.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRow {
    pub id: TriggerId,
    pub pattern: String,
    pub kind: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_mapping: Option<String>,
    #[serde(default)]
    pub cooldown_minutes: u32,
    #[serde(default)]
    pub last_fired_at: f64,
}

/// Admin input for creating a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrigger {
    /// Regular expression, matched as a search anywhere in the message.
    pub pattern: String,
    /// Action to take on a match.
    pub response: TriggerResponse,
    /// Minimum minutes between fires; 0 disables the cooldown.
    pub cooldown_minutes: u32,
}

impl NewTrigger {
    /// A REPLY trigger.
    #[must_use]
    pub fn reply(pattern: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            response: TriggerResponse::Reply { text: text.into() },
            cooldown_minutes: 0,
        }
    }

    /// An ALERT trigger.
    #[must_use]
    pub fn alert(pattern: impl Into<String>, mapping: AlertMapping) -> Self {
        Self {
            pattern: pattern.into(),
            response: TriggerResponse::Alert { mapping },
            cooldown_minutes: 0,
        }
    }

    /// Set the cooldown in minutes.
    #[must_use]
    pub const fn with_cooldown(mut self, minutes: u32) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    /// Validate and compile the pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an empty or invalid pattern, or a
    /// REPLY trigger without text.
    pub fn validate(&self) -> Result<Regex, ValidationError> {
        if self.pattern.trim().is_empty() {
            return Err(ValidationError::EmptyPattern);
        }
        if let TriggerResponse::Reply { text } = &self.response {
            if text.is_empty() {
                return Err(ValidationError::MissingField {
                    field: "response_text".to_string(),
                });
            }
        }
        compile_pattern(&self.pattern)
    }

    /// Convert into a storable row with a fresh id.
    #[must_use]
    pub fn into_row(self, id: TriggerId) -> TriggerRow {
        let (response_text, alert_mapping) = match &self.response {
            TriggerResponse::Reply { text } => (Some(text.clone()), None),
            TriggerResponse::Alert { mapping } => (None, serde_json::to_string(mapping).ok()),
        };
        TriggerRow {
            id,
            pattern: self.pattern,
            kind: self.response.kind(),
            response_text,
            alert_mapping,
            cooldown_minutes: self.cooldown_minutes,
            last_fired_at: 0.0,
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// A compiled, immutable trigger as held in a snapshot.
#[derive(Debug, Clone)]
pub struct TriggerRecord {
    /// Trigger id.
    pub id: TriggerId,
    /// Compiled pattern.
    pub pattern: Regex,
    /// Action on match.
    pub response: TriggerResponse,
    /// Cooldown in minutes; 0 means none.
    pub cooldown_minutes: u32,
    /// Last fire time as loaded from the store (seconds since epoch, 0 = never).
    pub last_fired_at: f64,
}

impl TriggerRecord {
    /// Compile a stored row.
    ///
    /// # Errors
    ///
    /// Fails when the pattern does not compile, when a REPLY row has no text,
    /// or when an ALERT row has a missing or unparsable mapping.
    pub fn compile(row: &TriggerRow) -> Result<Self, ValidationError> {
        let pattern = compile_pattern(&row.pattern)?;

        let response = match row.kind {
            ResponseKind::Reply => {
                let text = row.response_text.clone().ok_or_else(|| ValidationError::MissingField {
                    field: "response_text".to_string(),
                })?;
                TriggerResponse::Reply { text }
            }
            ResponseKind::Alert => {
                let raw = row.alert_mapping.as_deref().ok_or_else(|| ValidationError::MissingField {
                    field: "alert_mapping".to_string(),
                })?;
                let mapping: AlertMapping =
                    serde_json::from_str(raw).map_err(|e| ValidationError::InvalidConfig {
                        field: "alert_mapping".to_string(),
                        reason: e.to_string(),
                    })?;
                TriggerResponse::Alert { mapping }
            }
        };

        Ok(Self {
            id: row.id,
            pattern,
            response,
            cooldown_minutes: row.cooldown_minutes,
            last_fired_at: row.last_fired_at,
        })
    }

    /// Response kind.
    #[must_use]
    pub const fn kind(&self) -> ResponseKind {
        self.response.kind()
    }

    /// Substring search; never anchored.
    #[must_use]
    pub fn is_match(&self, content: &str) -> bool {
        self.pattern.is_match(content)
    }

    /// Cooldown length in seconds.
    #[must_use]
    pub fn cooldown_secs(&self) -> f64 {
        f64::from(self.cooldown_minutes) * 60.0
    }

    /// Whether a trigger last fired at `last_fired_at` may fire at `now`.
    #[must_use]
    pub fn is_ready(&self, last_fired_at: f64, now: f64) -> bool {
        self.cooldown_minutes == 0 || now - last_fired_at >= self.cooldown_secs()
    }
}
