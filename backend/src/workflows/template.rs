// Template substitution for action definitions
//
// `{path.to.value}` placeholders inside strings are replaced with the value
// found at that path in the run scope. Missing paths render as "".

use flowcore_shared::User;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_$][A-Za-z0-9_.$\-]*)\}").unwrap_or_else(|_| unreachable!())
});

/// Walk `template` leaf by leaf, substituting every string.
pub fn substitute(template: &Value, scope: &Value) -> Value {
    match template {
        Value::String(s) => Value::String(render(s, scope)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, scope)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, scope)).collect()),
        other => other.clone(),
    }
}

pub fn render(template: &str, scope: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            lookup(scope, &caps[1]).map(stringify).unwrap_or_default()
        })
        .into_owned()
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The object placeholders resolve against: the run context plus `env`
/// and `user`.
pub fn scope(context: &Value, env: &Map<String, Value>, user: Option<&User>) -> Value {
    let mut merged = match context {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    merged.insert("env".to_string(), Value::Object(env.clone()));
    if let Some(user) = user {
        if let Ok(user) = serde_json::to_value(user) {
            merged.insert("user".to_string(), user);
        }
    }
    Value::Object(merged)
}
