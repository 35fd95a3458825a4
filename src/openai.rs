//! Chat completion service for OpenAI-compatible servers
//!
//! Works with the OpenAI API and local servers that mimic it (LM Studio,
//! Ollama, llama.cpp, vLLM). Non-streaming requests decode the JSON body;
//! streaming requests read Server-Sent Events until `data: [DONE]`.
//!
//! Tool calls use the fully qualified function name (`plugin-function`) as
//! the wire-level tool name, so a response can be routed back to the kernel
//! without any renaming.

use crate::config::OpenAIConfig;
use crate::contents::{
    AuthorRole, ChatMessageContent, ContentItem, FinishReason, FunctionCallContent,
    StreamingChatMessageContent,
};
use crate::history::ChatHistory;
use crate::retry::retry_with_backoff;
use crate::services::{ChatCompletionService, StreamingChunkStream};
use crate::settings::PromptExecutionSettings;
use crate::{Error, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    #[serde(flatten)]
    extra: &'a std::collections::HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunction,
}

fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    index: u32,
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    role: Option<String>,
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

// ============================================================================
// CONVERSION
// ============================================================================

fn parse_role(role: &str) -> Option<AuthorRole> {
    match role {
        "system" | "developer" => Some(AuthorRole::System),
        "user" => Some(AuthorRole::User),
        "assistant" => Some(AuthorRole::Assistant),
        "tool" => Some(AuthorRole::Tool),
        _ => None,
    }
}

/// Map one history message to one or more wire messages.
///
/// Each function result becomes its own `tool` message.
fn to_wire(message: &ChatMessageContent, out: &mut Vec<WireMessage>) {
    match message.role {
        AuthorRole::Tool => {
            for result in message.function_results() {
                out.push(WireMessage {
                    role: "tool",
                    content: Some(Value::String(result.as_text())),
                    tool_calls: Vec::new(),
                    tool_call_id: Some(result.id.clone()),
                });
            }
        }
        AuthorRole::Assistant => {
            let text = message.as_text();
            let tool_calls = message
                .function_calls()
                .into_iter()
                .map(|call| WireToolCall {
                    id: call.id.clone().unwrap_or_default(),
                    call_type: function_type(),
                    function: WireFunction {
                        name: call.name.clone().unwrap_or_default(),
                        arguments: call
                            .arguments
                            .clone()
                            .filter(|a| !a.trim().is_empty())
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                })
                .collect::<Vec<_>>();
            out.push(WireMessage {
                role: "assistant",
                content: (!text.is_empty() || tool_calls.is_empty()).then(|| Value::String(text)),
                tool_calls,
                tool_call_id: None,
            });
        }
        role => {
            let has_images = message
                .items
                .iter()
                .any(|item| matches!(item, ContentItem::Image(_)));
            let content = if has_images {
                let parts = message
                    .items
                    .iter()
                    .filter_map(|item| match item {
                        ContentItem::Text(t) => Some(json!({"type": "text", "text": t.text})),
                        ContentItem::Image(image) => image
                            .to_url()
                            .map(|url| json!({"type": "image_url", "image_url": {"url": url}})),
                        _ => None,
                    })
                    .collect();
                Value::Array(parts)
            } else {
                Value::String(message.as_text())
            };
            out.push(WireMessage {
                role: role.as_str(),
                content: Some(content),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
    }
}

fn wire_messages(history: &ChatHistory) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(history.len());
    for message in history {
        to_wire(message, &mut out);
    }
    out
}

fn from_wire_choice(choice: WireChoice, model: Option<&str>) -> ChatMessageContent {
    let mut items = Vec::new();
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        items.push(ContentItem::text(text));
    }
    items.extend(choice.message.tool_calls.into_iter().map(|call| {
        ContentItem::FunctionCall(FunctionCallContent::new(
            call.id,
            call.function.name,
            call.function.arguments,
        ))
    }));

    let mut message = ChatMessageContent::new(AuthorRole::Assistant, items)
        .with_metadata("choice_index", Value::from(choice.index));
    if let Some(model) = model {
        message = message.with_model_id(model);
    }
    if let Some(reason) = choice.finish_reason {
        message = message.with_finish_reason(FinishReason::from(reason.as_str()));
    }
    message
}

fn from_wire_chunk(chunk: WireChunk) -> Vec<StreamingChatMessageContent> {
    let model = chunk.model;
    chunk
        .choices
        .into_iter()
        .map(|choice| {
            let mut delta = StreamingChatMessageContent::empty(choice.index);
            delta.role = choice.delta.role.as_deref().and_then(parse_role);
            delta.content = choice.delta.content;
            delta.ai_model_id = model.clone();
            delta.finish_reason = choice.finish_reason.as_deref().map(FinishReason::from);
            delta.tool_calls = choice
                .delta
                .tool_calls
                .into_iter()
                .map(|call| {
                    let (name, arguments) = match call.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    FunctionCallContent {
                        id: call.id,
                        index: Some(call.index),
                        name,
                        arguments,
                    }
                })
                .collect();
            delta
        })
        .collect()
}

// ============================================================================
// SERVICE
// ============================================================================

/// [`ChatCompletionService`] over the `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAIChatCompletion {
    config: OpenAIConfig,
    http_client: reqwest::Client,
}

impl OpenAIChatCompletion {
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    fn request_body(
        &self,
        history: &ChatHistory,
        settings: &PromptExecutionSettings,
        stream: bool,
    ) -> Result<Value> {
        let request = WireRequest {
            model: settings.ai_model_id.as_deref().unwrap_or(&self.config.model),
            messages: wire_messages(history),
            stream,
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
            n: (settings.number_of_responses > 1).then_some(settings.number_of_responses),
            stop: &settings.stop,
            tools: settings.tools.as_deref().filter(|t| !t.is_empty()),
            tool_choice: settings
                .tools
                .as_ref()
                .filter(|t| !t.is_empty())
                .and(settings.tool_choice.as_deref()),
            extra: &settings.extension_data,
        };
        Ok(serde_json::to_value(request)?)
    }

    /// POST the body, retrying transient failures, and return the
    /// successful response.
    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = self.config.chat_completions_url();
        let url = &url;
        retry_with_backoff(&self.config.retry, move || async move {
            let mut request = self
                .http_client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().await.map_err(Error::Http)?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_else(|e| {
                    log::warn!("Failed to read error response body: {}", e);
                    String::new()
                });
                log::debug!("Chat completion request failed with {}: {}", status, text);
                return Err(Error::api(format!("HTTP {}: {}", status.as_u16(), text)));
            }
            Ok(response)
        })
        .await
    }
}

#[async_trait]
impl ChatCompletionService for OpenAIChatCompletion {
    fn service_id(&self) -> &str {
        &self.config.service_id
    }

    fn ai_model_id(&self) -> Option<&str> {
        Some(&self.config.model)
    }

    async fn get_chat_message_contents(
        &self,
        history: &ChatHistory,
        settings: &PromptExecutionSettings,
    ) -> Result<Vec<ChatMessageContent>> {
        let body = self.request_body(history, settings, false)?;
        log::debug!(
            "Sending {} messages to {} (model {})",
            history.len(),
            self.config.base_url,
            body["model"]
        );

        let response = self.post(&body).await?;
        let decoded: WireResponse = response.json().await.map_err(Error::Http)?;
        let model = decoded.model;
        let mut messages: Vec<_> = decoded
            .choices
            .into_iter()
            .map(|choice| from_wire_choice(choice, model.as_deref()))
            .collect();
        messages.sort_by_key(|m| m.metadata.get("choice_index").and_then(Value::as_u64));
        Ok(messages)
    }

    async fn get_streaming_chat_message_contents(
        &self,
        history: &ChatHistory,
        settings: &PromptExecutionSettings,
    ) -> Result<StreamingChunkStream> {
        let body = self.request_body(history, settings, true)?;
        let response = self.post(&body).await?;

        let mut events = response.bytes_stream().eventsource();
        Ok(Box::pin(try_stream! {
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| Error::stream(e.to_string()))?;
                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    break;
                }
                let chunk: WireChunk = serde_json::from_str(data)
                    .map_err(|e| Error::stream(format!("Failed to parse chunk: {}", e)))?;
                let batch = from_wire_chunk(chunk);
                if !batch.is_empty() {
                    yield batch;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contents::{FunctionResultContent, ImageContent};

    fn service() -> OpenAIChatCompletion {
        let config = OpenAIConfig::builder()
            .model("gpt-test")
            .base_url("http://localhost:1/v1")
            .build()
            .unwrap();
        OpenAIChatCompletion::new(config).unwrap()
    }

    #[test]
    fn test_history_to_wire() {
        let call = FunctionCallContent::new("call_1", "math-Add", r#"{"a":1}"#);
        let mut history = ChatHistory::with_system_message("be brief");
        history.add_user_message("add");
        history.add_message(ChatMessageContent::assistant_with_calls(vec![call.clone()]));
        history.add_message(ChatMessageContent::tool(FunctionResultContent::success(
            &call,
            json!(2),
        )));

        let wire = serde_json::to_value(wire_messages(&history)).unwrap();
        assert_eq!(wire[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(wire[2]["tool_calls"][0]["function"]["name"], "math-Add");
        assert!(wire[2].get("content").is_none());
        assert_eq!(
            wire[3],
            json!({"role": "tool", "content": "2", "tool_call_id": "call_1"})
        );
    }

    #[test]
    fn test_image_parts() {
        let message = ChatMessageContent::new(
            AuthorRole::User,
            vec![
                ContentItem::text("what is this?"),
                ContentItem::Image(ImageContent::from_url("https://x/cat.png")),
            ],
        );
        let mut out = Vec::new();
        to_wire(&message, &mut out);
        let wire = serde_json::to_value(&out[0]).unwrap();
        assert_eq!(wire["content"][1]["image_url"]["url"], "https://x/cat.png");
    }

    #[test]
    fn test_request_body_tools_and_extras() {
        let mut settings = PromptExecutionSettings::default();
        settings.temperature = Some(0.2);
        settings
            .extension_data
            .insert("seed".to_string(), json!(7));
        let body = service()
            .request_body(&ChatHistory::new(), &settings, true)
            .unwrap();
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["seed"], 7);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("n").is_none());

        settings.tools = Some(vec![json!({"type": "function"})]);
        settings.tool_choice = Some("auto".into());
        let body = service()
            .request_body(&ChatHistory::new(), &settings, false)
            .unwrap();
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_chunk_mapping() {
        let chunk: WireChunk = serde_json::from_value(json!({
            "model": "gpt-test",
            "choices": [{
                "index": 0,
                "delta": {
                    "role": "assistant",
                    "tool_calls": [{"index": 0, "id": "c1", "function": {"name": "math-Add", "arguments": "{\"a\""}}]
                },
                "finish_reason": null
            }]
        }))
        .unwrap();
        let batch = from_wire_chunk(chunk);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].role, Some(AuthorRole::Assistant));
        assert_eq!(batch[0].tool_calls[0].id.as_deref(), Some("c1"));
        assert_eq!(batch[0].tool_calls[0].index, Some(0));
        assert_eq!(batch[0].ai_model_id.as_deref(), Some("gpt-test"));
    }

    #[test]
    fn test_choice_mapping() {
        let response: WireResponse = serde_json::from_value(json!({
            "model": "gpt-test",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "math-Add", "arguments": "{}"}}
                ]},
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        let message = from_wire_choice(response.choices.into_iter().next().unwrap(), Some("gpt-test"));
        assert_eq!(message.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(message.function_calls().len(), 1);
        assert_eq!(message.as_text(), "");
    }
}
