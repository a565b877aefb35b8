//! ALERT payload construction.

use regex::Captures;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::trigger::{AlertMapping, TriggerId, TriggerRecord};

/// Structured alert handed to the host's alert handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// The trigger that fired.
    pub trigger_id: TriggerId,
    /// Argument name to resolved value; unknown source fields are `null`.
    pub args: Map<String, Value>,
}

/// Message context an alert argument may read from.
pub(crate) struct AlertSource<'a> {
    pub author: &'a str,
    pub content: &'a str,
    pub timestamp: f64,
    pub captures: Option<Captures<'a>>,
}

impl AlertSource<'_> {
    fn field(&self, trigger: &TriggerRecord, name: &str) -> Value {
        match name {
            "user" => return Value::String(self.author.to_string()),
            "message" => return Value::String(self.content.to_string()),
            "trigger_id" => return Value::String(trigger.id.to_string()),
            "timestamp" => return Number::from_f64(self.timestamp).map_or(Value::Null, Value::Number),
            _ => {}
        }

        let Some(caps) = self.captures.as_ref() else {
            return Value::Null;
        };
        let group = match name.parse::<usize>() {
            Ok(idx) => caps.get(idx),
            Err(_) => caps.name(name),
        };
        group.map_or(Value::Null, |m| Value::String(m.as_str().to_string()))
    }
}

pub(crate) fn build_payload(trigger: &TriggerRecord, mapping: &AlertMapping, source: &AlertSource<'_>) -> AlertPayload {
    let args = mapping
        .iter()
        .map(|(arg, field)| (arg.clone(), source.field(trigger, field)))
        .collect();
    AlertPayload {
        trigger_id: trigger.id,
        args,
    }
}
