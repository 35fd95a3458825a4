//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use open_kernel::{
    AuthorRole, ChatCompletionService, ChatHistory, ChatMessageContent, FunctionCallContent,
    KernelFunction, PromptExecutionSettings, Result, StreamingChatMessageContent,
    StreamingChunkStream, function,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

/// What the service saw for one request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub history_len: usize,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<String>,
}

impl RecordedRequest {
    /// Names of the offered tools.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .flatten()
            .filter_map(|t| t["function"]["name"].as_str().map(str::to_string))
            .collect()
    }
}

/// Chat service that replays scripted responses.
///
/// Behaves like a model that honors the tool offer: without tools it always
/// answers with the fallback text. With tools it returns the next scripted
/// response, then `repeat` (if set), then the fallback. `ignoring_tool_offer`
/// makes it script every request, tools or not.
pub struct ScriptedService {
    id: String,
    responses: Mutex<VecDeque<ChatMessageContent>>,
    repeat: Option<ChatMessageContent>,
    fallback: String,
    honors_tool_offer: bool,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedService {
    pub fn new(responses: Vec<ChatMessageContent>) -> Self {
        Self {
            id: "default".to_string(),
            responses: Mutex::new(responses.into()),
            repeat: None,
            fallback: "Done.".to_string(),
            honors_tool_offer: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn repeating(mut self, message: ChatMessageContent) -> Self {
        self.repeat = Some(message);
        self
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn ignoring_tool_offer(mut self) -> Self {
        self.honors_tool_offer = false;
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self, history: &ChatHistory, settings: &PromptExecutionSettings) -> ChatMessageContent {
        self.requests.lock().unwrap().push(RecordedRequest {
            history_len: history.len(),
            tools: settings.tools.clone(),
            tool_choice: settings.tool_choice.clone(),
        });

        let fallback = ChatMessageContent::assistant(self.fallback.clone()).with_model_id("scripted");
        if self.honors_tool_offer && settings.tools.as_ref().is_none_or(|t| t.is_empty()) {
            return fallback;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or(fallback)
    }
}

/// Split a finalized message into the deltas a real server would send.
///
/// Every delta carries the message's model id, as a real server repeats it
/// on each chunk.
pub fn to_chunks(message: &ChatMessageContent) -> Vec<Vec<StreamingChatMessageContent>> {
    let delta = |mut chunk: StreamingChatMessageContent| {
        chunk.ai_model_id = message.ai_model_id.clone();
        chunk
    };
    let mut batches = vec![vec![delta(
        StreamingChatMessageContent::empty(0).with_role(AuthorRole::Assistant),
    )]];

    let text = message.as_text();
    let mut chars = text.chars().peekable();
    while chars.peek().is_some() {
        let piece: String = chars.by_ref().take(3).collect();
        batches.push(vec![delta(StreamingChatMessageContent::text(0, piece))]);
    }

    for (index, call) in message.function_calls().into_iter().enumerate() {
        let args = call.arguments.clone().unwrap_or_default();
        let split = args.len() / 2;
        let mut head = FunctionCallContent::fragment(&args[..split]).with_index(index as u32);
        head.id = call.id.clone();
        head.name = call.name.clone();
        let tail = FunctionCallContent::fragment(&args[split..]).with_index(index as u32);

        let mut first = delta(StreamingChatMessageContent::empty(0));
        first.tool_calls.push(head);
        let mut second = delta(StreamingChatMessageContent::empty(0));
        second.tool_calls.push(tail);
        batches.push(vec![first]);
        batches.push(vec![second]);
    }
    batches
}

#[async_trait]
impl ChatCompletionService for ScriptedService {
    fn service_id(&self) -> &str {
        &self.id
    }

    async fn get_chat_message_contents(
        &self,
        history: &ChatHistory,
        settings: &PromptExecutionSettings,
    ) -> Result<Vec<ChatMessageContent>> {
        Ok(vec![self.next_response(history, settings)])
    }

    async fn get_streaming_chat_message_contents(
        &self,
        history: &ChatHistory,
        settings: &PromptExecutionSettings,
    ) -> Result<StreamingChunkStream> {
        let message = self.next_response(history, settings);
        let batches = to_chunks(&message).into_iter().map(Ok);
        Ok(Box::pin(tokio_stream::iter(batches)))
    }
}

/// Assistant message requesting the given calls.
pub fn calls(calls: &[(&str, &str, &str)]) -> ChatMessageContent {
    ChatMessageContent::assistant_with_calls(
        calls
            .iter()
            .map(|(id, name, args)| FunctionCallContent::new(*id, *name, *args))
            .collect(),
    )
}

/// `math-Add(a, b)`
pub fn add_function() -> KernelFunction {
    function("math", "Add")
        .description("Add two integers")
        .param("a", "integer", "First addend")
        .param("b", "integer", "Second addend")
        .build(|args| async move {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
        .unwrap()
}

/// `math-Multiply(a, b)`
pub fn multiply_function() -> KernelFunction {
    function("math", "Multiply")
        .description("Multiply two integers")
        .param("a", "integer", "First factor")
        .param("b", "integer", "Second factor")
        .build(|args| async move {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a * b))
        })
        .unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
