//! Export of capabilities as LLM function-calling tools.
//!
//! Provider tool names only allow `[a-z0-9_]` (max 64 chars), so dotted
//! capability names are sanitized; the original name is kept alongside for
//! routing the model's tool call back to the registry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::capability::CapabilityDescriptor;

static CAMEL_LOWER_UPPER: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z])([A-Z])").unwrap());
static CAMEL_UPPER_LOWER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").unwrap());
static DISALLOWED_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());
static DUPLICATE_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());

const MAX_TOOL_NAME_LENGTH: usize = 64;

/// A capability as presented to an external tool-invocation API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    /// Provider-safe tool name
    pub name: String,
    /// Canonical capability name the tool routes to
    pub capability: String,
    pub description: String,
    /// JSON schema of the arguments (always an object schema)
    pub parameters: Value,
}

impl ToolDescriptor {
    pub fn from_capability(descriptor: &CapabilityDescriptor, input_schema: Value) -> Self {
        Self {
            name: sanitize_tool_name(&descriptor.name, None),
            capability: descriptor.name.clone(),
            description: descriptor.description.clone(),
            parameters: object_schema(input_schema),
        }
    }

    /// OpenAI-style `{"type": "function", "function": {...}}` object.
    pub fn to_function_tool(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Sanitize a capability name for LLM provider compatibility.
///
/// Splits camelCase, lowercases, replaces anything outside `[a-z0-9]` with
/// underscores, collapses repeats, and truncates to `max_length` (default 64).
pub fn sanitize_tool_name(name: &str, max_length: Option<usize>) -> String {
    let max_len = max_length.unwrap_or(MAX_TOOL_NAME_LENGTH);

    let ascii_name: String = name.chars().filter(|c| c.is_ascii()).collect();
    let step1 = CAMEL_UPPER_LOWER.replace_all(&ascii_name, "${1}_${2}");
    let step2 = CAMEL_LOWER_UPPER.replace_all(&step1, "${1}_${2}");
    let lowered = step2.to_lowercase();
    let replaced = DISALLOWED_CHARS.replace_all(&lowered, "_");
    let collapsed = DUPLICATE_UNDERSCORE.replace_all(&replaced, "_");
    let stripped = collapsed.trim_matches('_').to_string();

    if stripped.len() > max_len {
        stripped[..max_len].trim_end_matches('_').to_string()
    } else {
        stripped
    }
}

/// Providers reject parameter schemas that are not objects.
fn object_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("object") => {
            Value::Object(map)
        }
        _ => serde_json::json!({"type": "object", "properties": {}}),
    }
}
