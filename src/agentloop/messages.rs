//! Conversation messages and tool schemas.
//!
//! [`Message`] is the unit of conversation exchanged with the injected LLM
//! handler: user/system/assistant text, model-emitted tool calls, and their
//! textual results. [`ToolSchema`] describes a registered tool to the model;
//! its parameter **order is authoritative** — the tool runtime zips the
//! model's name→value argument map against the schema's positional order
//! when invoking the registered function.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single conversation message. Immutable once produced; conversations are
/// append-only lists of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: String,
    },
    System {
        content: String,
    },
    Assistant {
        content: String,
    },
    /// A model-emitted intent to invoke a named tool. `tool_call_id` must be
    /// unique within one response.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        arguments: Map<String, Value>,
    },
    /// The textual outcome of a tool call, answering the `ToolCall` with the
    /// same `tool_call_id`.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: String,
    },
}

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ToolParamType {
    /// Lowercase JSON-schema name of the type, used in error messages.
    pub fn type_name(self) -> &'static str {
        match self {
            ToolParamType::String => "string",
            ToolParamType::Integer => "integer",
            ToolParamType::Number => "number",
            ToolParamType::Boolean => "boolean",
            ToolParamType::Array => "array",
            ToolParamType::Object => "object",
        }
    }

    /// The zero value passed for an absent optional argument.
    pub fn zero_value(self) -> Value {
        match self {
            ToolParamType::String => Value::String(String::new()),
            ToolParamType::Integer => Value::from(0i64),
            ToolParamType::Number => Value::from(0.0f64),
            ToolParamType::Boolean => Value::Bool(false),
            ToolParamType::Array => Value::Array(Vec::new()),
            ToolParamType::Object => Value::Object(Map::new()),
        }
    }
}

/// Declaration of one tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParamSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParamType,
    pub description: String,
    pub required: bool,
    /// For array parameters, the element type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<ToolParamType>,
}

impl ToolParamSchema {
    /// Define a new parameter with the provided name and type.
    pub fn new(name: impl Into<String>, param_type: ToolParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: false,
            items: None,
        }
    }

    /// Add a human readable description that surfaces in generated schemas.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the argument as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// For array parameters, declare the type of the contained items.
    pub fn with_items(mut self, item_type: ToolParamType) -> Self {
        self.items = Some(item_type);
        self
    }
}

/// Description of a tool as shown to the model: name, purpose, and ordered
/// parameter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParamSchema>,
}

impl ToolSchema {
    /// Create a schema with the supplied identifier and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter definition. Order of appends is the positional
    /// order used at invocation time.
    pub fn with_parameter(mut self, param: ToolParamSchema) -> Self {
        self.parameters.push(param);
        self
    }
}
