//! Decoding heterogeneous wait responses into [`Event`]s.
//!
//! The server has answered with several payload shapes over time. Each shape
//! is a [`Strategy`]; they are tried in order and the first that recognizes
//! the payload wins. Nothing outside this module sees a raw payload.
//!
//! | order | strategy        | shape                                             |
//! |-------|-----------------|---------------------------------------------------|
//! | 1     | `direct_list`   | `[ {..}, {..} ]`                                  |
//! | 2     | `messages_key`  | `{ "messages": [..] }`                            |
//! | 3     | `plural_keys`   | `{ "events" \| "items" \| "data": [..] }`         |
//! | 4     | `nested_result` | `{ "result" \| "data": { .. } }`, decoded again   |

use serde_json::{Map, Value};
use tether_core::{Event, EventId};
use tracing::{debug, warn};

use crate::errors::ProtocolError;

/// Keys that may carry the event id, in priority order.
pub const ID_KEYS: &[&str] = &["id", "message_id", "messageId", "short_id", "shortId"];
const SENDER_KEYS: &[&str] = &["sender", "sender_name", "senderName", "author", "from"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "created_at", "createdAt", "sent_at"];
const SPACE_KEYS: &[&str] = &["space_id", "spaceId", "channel", "space"];
const PLURAL_KEYS: &[&str] = &["events", "items", "data"];
const NESTING_KEYS: &[&str] = &["result", "data"];
const MAX_NESTING: usize = 4;

/// A decode strategy: the items of a recognized payload, or `None`.
type Strategy = fn(&Value, usize) -> Option<Vec<Value>>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct_list", direct_list),
    ("messages_key", messages_key),
    ("plural_keys", plural_keys),
    ("nested_result", nested_result),
];

/// Decode a tool payload into normalized events.
///
/// A string payload is parsed as JSON first. Acknowledgements with nothing
/// to deliver decode to an empty list. Items without any id are dropped.
pub fn decode_events(payload: &Value) -> Result<Vec<Event>, ProtocolError> {
    let parsed;
    let value = match payload {
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() || is_no_messages_text(text) {
                return Ok(Vec::new());
            }
            parsed = serde_json::from_str::<Value>(text)?;
            &parsed
        }
        Value::Null => return Ok(Vec::new()),
        other => other,
    };

    let Some(items) = run_strategies(value, 0) else {
        if is_acknowledgement(value) {
            debug!("wait returned an acknowledgement without events");
            return Ok(Vec::new());
        }
        return Err(ProtocolError::UnknownShape(describe(value)));
    };

    let events: Vec<Event> = items.iter().filter_map(normalize_event).collect();
    if events.len() < items.len() {
        warn!(
            dropped = items.len() - events.len(),
            "dropped items without an id"
        );
    }
    Ok(events)
}

fn run_strategies(value: &Value, depth: usize) -> Option<Vec<Value>> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let items = strategy(value, depth)?;
        debug!(strategy = name, depth, count = items.len(), "decoded wait payload");
        Some(items)
    })
}

fn direct_list(value: &Value, _depth: usize) -> Option<Vec<Value>> {
    let items = value.as_array()?;
    Some(items.iter().filter(|i| i.is_object()).cloned().collect())
}

fn messages_key(value: &Value, _depth: usize) -> Option<Vec<Value>> {
    let items = value.get("messages")?.as_array()?;
    Some(items.iter().filter(|i| i.is_object()).cloned().collect())
}

fn plural_keys(value: &Value, _depth: usize) -> Option<Vec<Value>> {
    PLURAL_KEYS.iter().find_map(|key| {
        let items = value.get(*key)?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|item| match item.get("message") {
                    Some(inner) if inner.is_object() => Some(inner.clone()),
                    _ => item.is_object().then(|| item.clone()),
                })
                .collect(),
        )
    })
}

fn nested_result(value: &Value, depth: usize) -> Option<Vec<Value>> {
    if depth >= MAX_NESTING {
        return None;
    }
    NESTING_KEYS.iter().find_map(|key| {
        let inner = value.get(*key)?;
        if inner.is_object() {
            run_strategies(inner, depth + 1)
        } else {
            None
        }
    })
}

/// Normalize one item. `None` when no id field is present.
pub fn normalize_event(item: &Value) -> Option<Event> {
    let obj = item.as_object()?;
    let id = ID_KEYS.iter().find_map(|k| scalar(obj.get(*k)?))?;

    Some(Event {
        id: EventId::from_string(id),
        sender: SENDER_KEYS.iter().find_map(|k| named(obj.get(*k)?)),
        body: body_of(obj),
        timestamp: TIMESTAMP_KEYS.iter().find_map(|k| scalar(obj.get(*k)?)),
        space: SPACE_KEYS.iter().find_map(|k| named(obj.get(*k)?)),
        raw: item.clone(),
    })
}

/// `content` (string, or object with `text`/`body`/`message`), then `text`, then `body`.
fn body_of(obj: &Map<String, Value>) -> String {
    let from_content = match obj.get("content") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Object(inner)) => ["text", "body", "message"]
            .iter()
            .find_map(|k| inner.get(*k).and_then(Value::as_str)),
        _ => None,
    };
    from_content
        .filter(|s| !s.trim().is_empty())
        .or_else(|| obj.get("text").and_then(Value::as_str))
        .or_else(|| obj.get("body").and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Non-empty string or number rendered as a string.
fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A scalar, or the `name`/`handle`/`username`/`id` of an object.
fn named(v: &Value) -> Option<String> {
    scalar(v).or_else(|| {
        ["name", "handle", "username", "id"]
            .iter()
            .find_map(|k| scalar(v.get(*k)?))
    })
}

fn is_no_messages_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.starts_with("no new messages") || lower.starts_with("no messages")
}

fn is_acknowledgement(value: &Value) -> bool {
    match value {
        Value::Object(obj) => {
            obj.is_empty()
                || obj.contains_key("status")
                || obj.get("message").is_some_and(Value::is_string)
        }
        _ => false,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Object(obj) => {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
        Value::Array(_) => "array".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Null => "null".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
