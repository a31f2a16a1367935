use kimi_contracts::{ErrorRecord, OutputRecord, Usage};
use serde_json::Value;

use crate::KimiError;

/// Flattens a chat-completion response. Missing fields stay `None`.
pub fn normalize_response(model: &str, raw: Value) -> OutputRecord {
    let message = raw.pointer("/choices/0/message");
    let content =
        message.and_then(|message| message.get("content")).and_then(extract_message_content);
    let reasoning = message
        .and_then(|message| message.get("reasoning_content"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = raw
        .get("usage")
        .filter(|usage| usage.is_object())
        .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok());
    let id = raw.get("id").and_then(Value::as_str).map(str::to_string);
    let created = raw.get("created").and_then(Value::as_i64);

    OutputRecord { model: model.to_string(), usage, id, created, content, reasoning, raw }
}

fn extract_message_content(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let text = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            if text.is_empty() { None } else { Some(text) }
        }
        _ => None,
    }
}

/// Error output for continue-on-failure mode.
pub fn error_record(error: &KimiError) -> ErrorRecord {
    let kind = match error {
        KimiError::Remote(fault) => {
            fault.error_type.clone().unwrap_or_else(|| error.kind().to_string())
        }
        other => other.kind().to_string(),
    };
    ErrorRecord { error: error.best_message(), status_code: error.status_code(), kind: Some(kind) }
}
