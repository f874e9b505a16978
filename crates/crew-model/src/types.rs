use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

/// A file attached to a user message (image, PDF, plain text).
///
/// The runtime treats attachment data as opaque; providers decide how to
/// encode it on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type, e.g. `image/png`, `application/pdf`, `text/plain`.
    pub mime_type: String,
    /// Base64 payload for binary types, raw text for `text/*`.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The function half of a tool call on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.  May be a growing prefix while the
    /// model is still streaming; never parse it before the terminal chunk.
    pub arguments: String,
}

/// A model-emitted request to execute a named function.
///
/// OpenAI-compatible wire shape:
/// `{ "id": …, "type": "function", "function": { "name": …, "arguments": … } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id, or runtime-generated when the provider omits one.
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_call_type() -> String {
    "function".into()
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: function_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse the accumulated arguments as a JSON object.
    ///
    /// Empty arguments resolve to `{}`; some models omit the argument
    /// payload entirely for zero-parameter tools.
    pub fn parsed_arguments(&self) -> anyhow::Result<serde_json::Value> {
        if self.function.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(&self.function.arguments).map_err(|e| {
            anyhow::anyhow!(
                "invalid JSON arguments for tool {}: {e}",
                self.function.name
            )
        })
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Reasoning trace captured alongside the content when the session has
    /// thinking enabled and the model supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool invocations requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages: the id of the assistant tool call this replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            attachments: Vec::new(),
        }
    }

    /// An assistant message carrying streamed text plus the tool calls the
    /// model requested on the same turn.
    pub fn assistant_with_calls(
        text: impl Into<String>,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            reasoning_content: reasoning.filter(|r| !r.is_empty()),
            tool_calls,
            tool_call_id: None,
            attachments: Vec::new(),
        }
    }

    /// A tool message replying to the call with the given id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            reasoning_content: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            attachments: Vec::new(),
        }
    }
}

// ─── Request / response types ─────────────────────────────────────────────────

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Per-request knobs the runtime composes onto a provider call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    /// Request a reasoning trace when the model supports one.
    pub thinking: bool,
    /// JSON Schema the provider should constrain its output to.
    pub response_schema: Option<serde_json::Value>,
    /// Proxy URL fronting the provider API for centralized credentials.
    pub gateway: Option<String>,
    /// Marks low-budget title-generation calls so providers can route them
    /// to a cheaper model tier.
    pub title_generation: bool,
    pub parallel_tool_calls: Option<bool>,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub options: RequestOptions,
}

/// Why a completion stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A partial tool call inside one streamed chunk.
///
/// Providers interleave chunks for different parallel calls by `index`;
/// `id` and `name` arrive once, `arguments` arrives as a growing prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A reasoning delta (when thinking was requested and is supported)
    ReasoningDelta(String),
    /// A fragment of a tool call the model is composing
    ToolCallDelta(ToolCallDelta),
    /// Usage statistics for the turn
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        reasoning_tokens: u64,
        /// Provider-reported cost for this turn, when available.
        cost: f64,
    },
    /// Terminal chunk: the stream finished with the given reason
    Finish(FinishReason),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
