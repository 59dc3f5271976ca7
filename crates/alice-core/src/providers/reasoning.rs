//! Reasoning-text extraction from chat completion deltas.
//!
//! OpenAI-compatible servers disagree on where the separate reasoning channel
//! lives in a delta. Each known shape is one extractor; they are tried in
//! order and the first non-empty value wins.

use serde_json::Value;

/// Pulls reasoning text out of one delta shape.
pub type ReasoningExtractor = fn(&Value) -> Option<String>;

/// Extractors in priority order, with the field each one reads.
pub const REASONING_EXTRACTORS: &[(&str, ReasoningExtractor)] = &[
    ("reasoning_content", reasoning_content),
    ("reasoning", reasoning),
    ("reasoning_details", reasoning_details),
    ("thinking", thinking),
];

/// Returns the reasoning text of `delta`, if any extractor finds some.
pub fn extract_reasoning(delta: &Value) -> Option<String> {
    REASONING_EXTRACTORS
        .iter()
        .find_map(|(_, extract)| extract(delta).filter(|text| !text.is_empty()))
}

/// DeepSeek / ModelScope / Moonshot: `delta.reasoning_content`.
fn reasoning_content(delta: &Value) -> Option<String> {
    string_field(delta, "reasoning_content")
}

/// OpenRouter and vLLM: `delta.reasoning`.
fn reasoning(delta: &Value) -> Option<String> {
    string_field(delta, "reasoning")
}

/// OpenRouter structured form: `delta.reasoning_details[].text`.
fn reasoning_details(delta: &Value) -> Option<String> {
    let details = delta.get("reasoning_details")?.as_array()?;
    let text: String = details
        .iter()
        .filter_map(|d| d.get("text").or_else(|| d.get("summary")))
        .filter_map(Value::as_str)
        .collect();
    Some(text)
}

/// `delta.thinking`, either a string or `{ "content": ... }`.
fn thinking(delta: &Value) -> Option<String> {
    let value = delta.get("thinking")?;
    value
        .as_str()
        .or_else(|| value.get("content").and_then(Value::as_str))
        .map(str::to_string)
}

fn string_field(delta: &Value, field: &str) -> Option<String> {
    delta.get(field)?.as_str().map(str::to_string)
}
