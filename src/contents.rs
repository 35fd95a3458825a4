//! Content model for conversations
//!
//! Every unit of conversation is a [`ChatMessageContent`]: an author role, an
//! ordered list of [`ContentItem`]s, and some optional provenance (model id,
//! finish reason, metadata). Streaming responses arrive as
//! [`StreamingChatMessageContent`] deltas that the aggregator in
//! [`crate::streaming`] folds back into complete messages.
//!
//! All types here are plain values: cloning is cheap enough, equality is
//! structural, and nothing performs I/O.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Separator between plugin and function name in a fully qualified name.
pub const FQN_SEPARATOR: &str = "-";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorRole {
    System,
    User,
    Assistant,
    Tool,
}

impl AuthorRole {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorRole::System => "system",
            AuthorRole::User => "user",
            AuthorRole::Assistant => "assistant",
            AuthorRole::Tool => "tool",
        }
    }
}

impl fmt::Display for AuthorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the model stopped producing output for a choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Any provider-specific reason not covered above
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(s) => s,
        }
    }
}

impl From<&str> for FinishReason {
    fn from(value: &str) -> Self {
        match value {
            "stop" | "end_turn" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            // Older OpenAI servers still report the legacy "function_call"
            "tool_calls" | "function_call" | "tool_use" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl From<String> for FinishReason {
    fn from(value: String) -> Self {
        FinishReason::from(value.as_str())
    }
}

impl From<FinishReason> for String {
    fn from(value: FinishReason) -> Self {
        value.as_str().to_string()
    }
}

/// Text encoding used by `as_bytes` and checked when combining chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Ascii,
}

impl TextEncoding {
    /// Parse an encoding label such as `"utf-8"` or `"ascii"`.
    pub fn from_label(label: &str) -> Result<Self> {
        match label.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            other => Err(Error::invalid_input(format!(
                "unsupported text encoding: {}",
                other
            ))),
        }
    }

    /// Encode `text`, failing for characters outside the encoding.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::Ascii => {
                if let Some(c) = text.chars().find(|c| !c.is_ascii()) {
                    return Err(Error::invalid_input(format!(
                        "character {:?} cannot be encoded as ascii",
                        c
                    )));
                }
                Ok(text.as_bytes().to_vec())
            }
        }
    }
}

/// A run of plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

impl TextContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A model-issued request to call a registered function.
///
/// While streaming, every field is optional: the first fragment of a call
/// usually carries `id` and `name`, later fragments only carry a piece of the
/// JSON `arguments`. Once aggregated, `id`, `name` and `arguments` are set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionCallContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Position of the call within a streamed choice, as reported by the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Fully qualified function name, `plugin-function`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// JSON-encoded arguments, possibly partial while streaming
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl FunctionCallContent {
    /// Create a complete function call.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            index: None,
            name: Some(name.into()),
            arguments: Some(arguments.into()),
        }
    }

    /// Create a streaming fragment that only carries part of the arguments.
    pub fn fragment(arguments: impl Into<String>) -> Self {
        Self {
            arguments: Some(arguments.into()),
            ..Default::default()
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Split the fully qualified name into `(plugin, function)`.
    ///
    /// Splits on the first separator. A name without a separator belongs to
    /// the empty plugin.
    pub fn split_name(&self) -> Option<(&str, &str)> {
        let name = self.name.as_deref()?;
        Some(name.split_once(FQN_SEPARATOR).unwrap_or(("", name)))
    }

    /// Parse the JSON arguments into an object map.
    ///
    /// Absent or blank arguments parse to an empty map. Anything that is not
    /// a JSON object fails with [`Error::MalformedToolArguments`].
    pub fn parse_arguments(&self) -> Result<Map<String, Value>> {
        let raw = match self.arguments.as_deref().map(str::trim) {
            None | Some("") => return Ok(Map::new()),
            Some(raw) => raw,
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(Error::malformed_tool_arguments(format!(
                "expected a JSON object, got {}",
                other
            ))),
            Err(e) => Err(Error::malformed_tool_arguments(e.to_string())),
        }
    }

    /// Fold a later fragment of the same call into this one.
    ///
    /// Arguments concatenate. Identity fields keep the first value seen.
    pub fn merge(&mut self, other: FunctionCallContent) {
        if self.id.is_none() {
            self.id = other.id;
        }
        if self.index.is_none() {
            self.index = other.index;
        }
        if self.name.is_none() {
            self.name = other.name;
        }
        if let Some(more) = other.arguments {
            match &mut self.arguments {
                Some(args) => args.push_str(&more),
                None => self.arguments = Some(more),
            }
        }
    }
}

/// Result of executing a requested function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResultContent {
    /// Id of the originating [`FunctionCallContent`]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub result: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl FunctionResultContent {
    /// A successful result for `call`.
    pub fn success(call: &FunctionCallContent, result: Value) -> Self {
        Self {
            id: call.id.clone().unwrap_or_default(),
            name: call.name.clone(),
            result,
            is_error: false,
        }
    }

    /// An error result for `call`, carrying a message meant for the model.
    pub fn error(call: &FunctionCallContent, message: impl Into<String>) -> Self {
        Self {
            id: call.id.clone().unwrap_or_default(),
            name: call.name.clone(),
            result: Value::String(message.into()),
            is_error: true,
        }
    }

    /// Result rendered as text: strings verbatim, everything else as JSON.
    pub fn as_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// An image referenced by URL or carried inline as base64 data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Base64 payload when the image is inline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ImageContent {
    pub fn from_url(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            data: None,
            mime_type: None,
        }
    }

    /// Parse a `data:<mime>;base64,<payload>` URI.
    pub fn from_data_uri(data_uri: &str) -> Result<Self> {
        let rest = data_uri
            .strip_prefix("data:")
            .ok_or_else(|| Error::invalid_input("data URI must start with 'data:'"))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| Error::invalid_input("data URI is missing ','"))?;
        let mime_type = header
            .strip_suffix(";base64")
            .ok_or_else(|| Error::invalid_input("only base64 data URIs are supported"))?;
        if mime_type.is_empty() || payload.is_empty() {
            return Err(Error::invalid_input("data URI has an empty mime type or payload"));
        }
        Ok(Self {
            uri: None,
            data: Some(payload.to_string()),
            mime_type: Some(mime_type.to_string()),
        })
    }

    /// URL suitable for an `image_url` field: the URI, or a rebuilt data URI.
    pub fn to_url(&self) -> Option<String> {
        if let Some(uri) = &self.uri {
            return Some(uri.clone());
        }
        match (&self.mime_type, &self.data) {
            (Some(mime), Some(data)) => Some(format!("data:{};base64,{}", mime, data)),
            _ => None,
        }
    }
}

/// One item inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text(TextContent),
    FunctionCall(FunctionCallContent),
    FunctionResult(FunctionResultContent),
    Image(ImageContent),
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text(TextContent::new(text))
    }
}

/// A finalized message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageContent {
    pub role: AuthorRole,
    pub items: Vec<ContentItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub encoding: TextEncoding,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ChatMessageContent {
    pub fn new(role: AuthorRole, items: Vec<ContentItem>) -> Self {
        Self {
            role,
            items,
            ai_model_id: None,
            finish_reason: None,
            encoding: TextEncoding::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(AuthorRole::System, vec![ContentItem::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(AuthorRole::User, vec![ContentItem::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(AuthorRole::Assistant, vec![ContentItem::text(text)])
    }

    /// An assistant message requesting the given function calls.
    pub fn assistant_with_calls(calls: Vec<FunctionCallContent>) -> Self {
        Self::new(
            AuthorRole::Assistant,
            calls.into_iter().map(ContentItem::FunctionCall).collect(),
        )
    }

    /// A tool message carrying one function result.
    pub fn tool(result: FunctionResultContent) -> Self {
        Self::new(AuthorRole::Tool, vec![ContentItem::FunctionResult(result)])
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.ai_model_id = Some(model_id.into());
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concatenated text of all text items.
    pub fn as_text(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Text encoded with the message's encoding.
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        self.encoding.encode(&self.as_text())
    }

    /// Function-call requests carried by this message, in order.
    pub fn function_calls(&self) -> Vec<&FunctionCallContent> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ContentItem::FunctionCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Function results carried by this message, in order.
    pub fn function_results(&self) -> Vec<&FunctionResultContent> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ContentItem::FunctionResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Whether every item is valid for this message's role.
    ///
    /// Function calls only come from the assistant and function results only
    /// travel in tool messages.
    pub fn is_well_formed(&self) -> bool {
        self.items.iter().all(|item| match item {
            ContentItem::FunctionCall(_) => self.role == AuthorRole::Assistant,
            ContentItem::FunctionResult(_) => self.role == AuthorRole::Tool,
            ContentItem::Text(_) | ContentItem::Image(_) => true,
        })
    }
}

impl fmt::Display for ChatMessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// A delta of one choice in a streamed response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamingChatMessageContent {
    pub choice_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AuthorRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCallContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model_id: Option<String>,
    #[serde(default)]
    pub encoding: TextEncoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl StreamingChatMessageContent {
    /// A chunk with nothing in it.
    pub fn empty(choice_index: u32) -> Self {
        Self {
            choice_index,
            ..Default::default()
        }
    }

    /// A chunk carrying a piece of text.
    pub fn text(choice_index: u32, text: impl Into<String>) -> Self {
        Self {
            choice_index,
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: AuthorRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.ai_model_id = Some(model_id.into());
        self
    }

    pub fn with_tool_call(mut self, call: FunctionCallContent) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn as_text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Convert an aggregated chunk into a finalized message.
    ///
    /// The role defaults to assistant. Text comes first, followed by the
    /// tool calls in first-appearance order.
    pub fn into_message(self) -> ChatMessageContent {
        let mut items = Vec::with_capacity(self.tool_calls.len() + 1);
        if let Some(text) = self.content.filter(|t| !t.is_empty()) {
            items.push(ContentItem::Text(TextContent::new(text)));
        }
        items.extend(self.tool_calls.into_iter().map(ContentItem::FunctionCall));

        let mut metadata = self.metadata;
        metadata.insert("choice_index".to_string(), Value::from(self.choice_index));

        ChatMessageContent {
            role: self.role.unwrap_or(AuthorRole::Assistant),
            items,
            ai_model_id: self.ai_model_id,
            finish_reason: self.finish_reason,
            encoding: self.encoding,
            metadata,
        }
    }
}
