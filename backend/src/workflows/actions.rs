// Workflow Actions - outcome of executing a single action

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of executing an action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub ok: bool,
    /// Keys merged into the run context when the step succeeds
    pub context_patch: Map<String, Value>,
    pub error: Option<String>,
    /// Set by `Wait`: the run parks until this instant
    pub pause_until: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn with_patch(mut self, key: &str, value: Value) -> Self {
        self.context_patch.insert(key.to_string(), value);
        self
    }

    pub fn with_pause(mut self, until: DateTime<Utc>) -> Self {
        self.pause_until = Some(until);
        self
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Shallow merge of `patch` into an object context.
pub fn merge_patch(context: &mut Value, patch: &Map<String, Value>) {
    if !context.is_object() {
        *context = Value::Object(Map::new());
    }
    if let Value::Object(map) = context {
        for (key, value) in patch {
            map.insert(key.clone(), value.clone());
        }
    }
}
