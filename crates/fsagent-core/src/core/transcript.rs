//! Renders one turn's ordered events into a human-readable transcript.
//!
//! Pure and deterministic: the same event sequence always yields the same
//! string. The line formats (including the Python-style argument
//! rendering) are an external presentation contract and must not change.

use std::fmt::Write as _;

use serde_json::Value;

use crate::core::events::TurnEvent;

/// Placeholder for a turn that produced no events.
pub const EMPTY_TRANSCRIPT: &str = "<no text>";

/// Formats the events of one turn, in arrival order, joined by newlines.
pub fn format_events(events: &[TurnEvent]) -> String {
    let mut lines: Vec<String> = Vec::new();

    for event in events {
        match event {
            TurnEvent::TextFragment { content } => lines.push(content.clone()),
            TurnEvent::ToolCallRequest {
                name, arguments, ..
            } => {
                lines.push(format!(
                    "[Function Call] name: {name}, args: {}",
                    render_value(arguments)
                ));
            }
            TurnEvent::ToolCallResult {
                id, name, payload, ..
            } => match payload {
                Some(blocks) => {
                    lines.push(format!("[Function Response] id: {id}, name: {name}"));
                    for block in blocks {
                        match &block.text {
                            Some(text) => lines.push(format!("  - {text}")),
                            None => lines.push("  - (no text)".to_string()),
                        }
                    }
                }
                None => lines.push("[Function Response] No response content".to_string()),
            },
        }
    }

    if lines.is_empty() {
        EMPTY_TRANSCRIPT.to_string()
    } else {
        lines.join("\n")
    }
}

/// Renders a JSON value in Python literal style: single-quoted strings,
/// `True`/`False`/`None`, `{...}` dicts with sorted keys.
fn render_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_quoted(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_quoted(out, key);
                out.push_str(": ");
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_quoted(out: &mut String, s: &str) {
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
}
