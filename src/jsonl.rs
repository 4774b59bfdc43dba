//! Bounded JSONL parsing for client-pushed issue payloads.
//!
//! Limits guard against hostile payloads: total size, record count, and
//! nesting depth are all capped before any record reaches the sync engine.

use serde_json::Value;
use thiserror::Error;

pub const MAX_JSONL_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_ISSUES_COUNT: usize = 10_000;
pub const MAX_JSON_DEPTH: usize = 10;

#[derive(Debug, Error)]
pub enum JsonlError {
    #[error("payload exceeds {MAX_JSONL_SIZE} bytes")]
    TooLarge,

    #[error("too many records (max {MAX_ISSUES_COUNT})")]
    TooMany,

    #[error("line {line}: nesting deeper than {MAX_JSON_DEPTH}")]
    TooDeep { line: usize },

    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("line {line}: expected a JSON object")]
    NotAnObject { line: usize },
}

fn depth_of(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        _ => 1,
    }
}

/// Parse newline-delimited JSON objects. Blank lines are skipped.
pub fn parse_jsonl(body: &str) -> Result<Vec<serde_json::Map<String, Value>>, JsonlError> {
    if body.len() > MAX_JSONL_SIZE {
        return Err(JsonlError::TooLarge);
    }

    let mut records = Vec::new();
    for (idx, raw_line) in body.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if records.len() >= MAX_ISSUES_COUNT {
            return Err(JsonlError::TooMany);
        }

        let value: Value = serde_json::from_str(line).map_err(|e| JsonlError::Malformed {
            line: idx + 1,
            message: e.to_string(),
        })?;
        if depth_of(&value) > MAX_JSON_DEPTH {
            return Err(JsonlError::TooDeep { line: idx + 1 });
        }
        match value {
            Value::Object(map) => records.push(map),
            _ => return Err(JsonlError::NotAnObject { line: idx + 1 }),
        }
    }

    Ok(records)
}
