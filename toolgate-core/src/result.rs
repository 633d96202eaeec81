//! Normalized tool results
//!
//! Servers answer `tools/call` with `{content: [...], isError?}`. Shapes vary
//! a lot in practice, so normalization never fails: a result with no usable
//! shape becomes a failed result instead of an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text produced by a tool call, split by whether the server flagged an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum ToolOutput {
    Text(String),
    Error(String),
}

impl ToolOutput {
    /// Normalize a raw `tools/call` result.
    pub fn from_call_result(raw: &Value) -> Self {
        let is_error = raw
            .get("isError")
            .or_else(|| raw.get("is_error"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let text = match raw {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("content") {
                Some(Value::Array(parts)) => join_parts(parts),
                Some(Value::String(s)) => s.clone(),
                Some(other) => {
                    return ToolOutput::Error(format!(
                        "Malformed tool result: content is {}",
                        json_kind(other)
                    ));
                }
                None => map
                    .get("structuredContent")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            },
            other => {
                return ToolOutput::Error(format!(
                    "Malformed tool result: expected an object, got {}",
                    json_kind(other)
                ));
            }
        };

        if is_error {
            if text.is_empty() {
                ToolOutput::Error("Tool returned an error".to_string())
            } else {
                ToolOutput::Error(text)
            }
        } else {
            ToolOutput::Text(text)
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutput::Error(_))
    }

    pub fn text(&self) -> &str {
        match self {
            ToolOutput::Text(text) | ToolOutput::Error(text) => text,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn join_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(render_part)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_part(part: &Value) -> Option<String> {
    let kind = part.get("type").and_then(Value::as_str).unwrap_or("text");
    match kind {
        "text" => part.get("text").and_then(Value::as_str).map(str::to_string),
        "image" | "audio" => {
            let mime = part
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Some(format!("[{}: {}]", kind, mime))
        }
        "resource" => {
            let resource = part.get("resource").unwrap_or(part);
            if let Some(text) = resource.get("text").and_then(Value::as_str) {
                return Some(text.to_string());
            }
            let uri = resource.get("uri").and_then(Value::as_str).unwrap_or("?");
            Some(format!("[resource: {}]", uri))
        }
        other => part
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(format!("[{}]", other))),
    }
}

/// Result handed back to the LLM orchestration loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FunctionResult {
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl From<ToolOutput> for FunctionResult {
    fn from(output: ToolOutput) -> Self {
        match output {
            ToolOutput::Text(text) => FunctionResult::success(text),
            ToolOutput::Error(message) => FunctionResult::failure(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_joins_text_parts() {
        let raw = json!({
            "content": [
                { "type": "text", "text": "line one" },
                { "type": "text", "text": "line two" }
            ]
        });
        assert_eq!(
            ToolOutput::from_call_result(&raw),
            ToolOutput::Text("line one\nline two".to_string())
        );
    }

    #[test]
    fn test_error_flag() {
        let raw = json!({ "content": [{ "type": "text", "text": "no such file" }], "isError": true });
        let output = ToolOutput::from_call_result(&raw);
        assert!(output.is_error());
        let result = FunctionResult::from(output);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no such file"));
    }

    #[test]
    fn test_odd_shapes_degrade_quietly() {
        assert_eq!(ToolOutput::from_call_result(&json!({})), ToolOutput::Text(String::new()));
        assert_eq!(
            ToolOutput::from_call_result(&json!("plain")),
            ToolOutput::Text("plain".to_string())
        );
        assert_eq!(
            ToolOutput::from_call_result(&json!({ "isError": true })),
            ToolOutput::Error("Tool returned an error".to_string())
        );
    }

    #[test]
    fn test_unusable_shapes_are_failures() {
        assert_eq!(
            ToolOutput::from_call_result(&json!(42)),
            ToolOutput::Error("Malformed tool result: expected an object, got a number".to_string())
        );
        assert!(ToolOutput::from_call_result(&Value::Null).is_error());
        assert!(ToolOutput::from_call_result(&json!([1, 2])).is_error());

        let result = FunctionResult::from(ToolOutput::from_call_result(&json!({ "content": 42 })));
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Malformed tool result: content is a number")
        );
    }

    #[test]
    fn test_non_text_parts_get_placeholders() {
        let raw = json!({
            "content": [
                { "type": "image", "data": "...", "mimeType": "image/png" },
                { "type": "resource", "resource": { "uri": "file:///a.bin" } },
                { "type": "resource", "resource": { "uri": "file:///a.md", "text": "# A" } }
            ]
        });
        assert_eq!(
            ToolOutput::from_call_result(&raw).text(),
            "[image: image/png]\n[resource: file:///a.bin]\n# A"
        );
    }
}
