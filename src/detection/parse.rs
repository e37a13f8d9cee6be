use serde_json::Value;
use tracing::debug;

use crate::fields::RawDetection;
use crate::geometry::BoundingBox;

/// Turns whatever the model returned into detections. Never fails: an
/// unreadable payload is zero detections, a malformed entry is skipped.
pub fn parse_payload(value: &Value) -> Vec<RawDetection> {
    match value {
        Value::String(text) => parse_text(text),
        Value::Array(entries) => parse_entries(entries),
        Value::Object(map) => match map.get("fields") {
            Some(Value::Array(entries)) => parse_entries(entries),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Reads the JSON object spanning the first `{` to the last `}`, which
/// tolerates code fences and chatter around it.
pub fn parse_text(text: &str) -> Vec<RawDetection> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        debug!("detector reply carries no JSON object");
        return Vec::new();
    };
    if end < start {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(value @ Value::Object(_)) => parse_payload(&value),
        Ok(_) => Vec::new(),
        Err(err) => {
            debug!("detector reply is not valid JSON: {}", err);
            Vec::new()
        }
    }
}

fn parse_entries(entries: &[Value]) -> Vec<RawDetection> {
    let detections = entries.iter().filter_map(parse_entry).collect::<Vec<_>>();
    if detections.len() != entries.len() {
        debug!(
            "dropped {} malformed detection(s)",
            entries.len() - detections.len()
        );
    }
    detections
}

fn parse_entry(entry: &Value) -> Option<RawDetection> {
    let coords = entry.get("box")?.as_array()?;
    if coords.len() < 4 {
        return None;
    }
    let mut edges = [0.0f64; 4];
    for (slot, value) in edges.iter_mut().zip(coords) {
        *slot = value.as_f64()?;
    }
    let hint = entry
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("text");
    Some(RawDetection::new(BoundingBox::from_array(edges), hint))
}
