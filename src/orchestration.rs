//! Tool-call orchestration loop
//!
//! Drives a conversation through automatic function calling:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   send history + settings ──► append assistant message    │
//!                                   │                       │
//!                       no calls ◄──┴──► calls              │
//!                          │              │                 │
//!                        Done     auto-invoke off?          │
//!                                  yes │      │ no          │
//!                    PendingFunctionCalls     ▼             │
//!                                execute calls concurrently │
//!                                append tool results        │
//!                                terminate? ──► Terminated  │
//!                                round < ceiling ───────────┘
//!                                round == ceiling
//!                                     ▼
//!                      final send without tools ──► AttemptCeilingReached
//! ```
//!
//! # History
//!
//! The history is borrowed mutably for the whole call. Messages are appended
//! in a fixed order: the assistant response, then one tool message per
//! requested call in request order (execution itself is concurrent), and
//! finally the tool-free answer if the ceiling was reached. Function calls the
//! model still requests in that answer are dropped, so the history never ends
//! with calls that have no results. Nothing is rolled back if the caller drops
//! the future midway.
//!
//! # Errors
//!
//! Send failures, service resolution failures, and streaming protocol
//! violations propagate. Problems with individual tool calls (unknown or
//! disallowed function, malformed JSON arguments, too few arguments, a
//! failing function) become error tool results so the model can recover.

use crate::contents::{
    ChatMessageContent, ContentItem, FunctionCallContent, FunctionResultContent,
    StreamingChatMessageContent,
};
use crate::filters::{AutoFunctionInvocationContext, PostInvocationContext};
use crate::functions::{KernelArguments, KernelFunction};
use crate::history::ChatHistory;
use crate::kernel::Kernel;
use crate::services::ChatCompletionService;
use crate::settings::{FunctionChoiceBehavior, FunctionChoiceType, PromptExecutionSettings};
use crate::streaming::StreamingAggregator;
use crate::{Error, Result};
use async_stream::try_stream;
use futures::future::join_all;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

/// Why the loop returned control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The model answered without requesting functions
    Done,
    /// The model requested functions but auto-invoke is off
    PendingFunctionCalls,
    /// A function or filter asked to end the loop
    Terminated,
    /// The round ceiling was hit and a tool-free answer was requested
    AttemptCeilingReached,
}

/// Outcome of [`get_chat_message_contents`].
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    /// Candidates of the last request; the first one was appended to history
    pub messages: Vec<ChatMessageContent>,
    /// Unexecuted calls, set when the status is `PendingFunctionCalls`
    pub pending_function_calls: Vec<FunctionCallContent>,
    pub status: CompletionStatus,
    /// Number of rounds in which functions were executed
    pub rounds: u32,
}

impl ChatCompletion {
    /// The message appended to history last by the loop.
    pub fn message(&self) -> Option<&ChatMessageContent> {
        self.messages.first()
    }

    pub fn text(&self) -> String {
        self.message().map(|m| m.as_text()).unwrap_or_default()
    }

    pub fn has_pending_function_calls(&self) -> bool {
        !self.pending_function_calls.is_empty()
    }
}

/// One item of [`get_streaming_chat_message_contents`].
#[derive(Debug, Clone)]
pub enum ChatStreamEvent {
    /// Delta batch of the current request, one chunk per choice
    Delta(Vec<StreamingChatMessageContent>),
    /// Last item of the stream: why the loop returned control
    Completed(ChatCompletion),
}

impl ChatStreamEvent {
    /// The delta batch, if this is one.
    pub fn delta(&self) -> Option<&[StreamingChatMessageContent]> {
        match self {
            ChatStreamEvent::Delta(batch) => Some(batch),
            ChatStreamEvent::Completed(_) => None,
        }
    }
}

/// Events from every request of the loop, ending with
/// [`ChatStreamEvent::Completed`].
pub type ChatMessageStream<'a> =
    Pin<Box<dyn Stream<Item = Result<ChatStreamEvent>> + Send + 'a>>;

const MALFORMED_ARGUMENTS_MESSAGE: &str =
    "The tool call arguments are malformed. Arguments must be in JSON format. Please try again.";

/// Settings and tool offer for one run of the loop.
struct LoopPlan {
    service: Arc<dyn ChatCompletionService>,
    settings: PromptExecutionSettings,
    behavior: Option<FunctionChoiceBehavior>,
    offered: Vec<Arc<KernelFunction>>,
}

impl LoopPlan {
    fn new(kernel: &Kernel, settings: &PromptExecutionSettings) -> Result<Self> {
        let mut settings = settings.clone();
        settings.validate()?;
        let service = kernel.select_service(&settings)?;
        let behavior = settings.function_choice_behavior.clone();

        let offered = match &behavior {
            Some(behavior) => kernel.functions_for_behavior(behavior)?,
            None => Vec::new(),
        };
        match (&behavior, offered.is_empty()) {
            (Some(behavior), false) => {
                settings.tools = Some(offered.iter().map(|f| f.to_tool_definition()).collect());
                settings.tool_choice = Some(behavior.choice_type.as_tool_choice().to_string());
            }
            _ => {
                settings.tools = None;
                settings.tool_choice = None;
            }
        }

        Ok(Self {
            service,
            settings,
            behavior,
            offered,
        })
    }

    fn max_rounds(&self) -> Option<u32> {
        self.behavior
            .as_ref()
            .filter(|b| b.auto_invoke_kernel_functions())
            .map(FunctionChoiceBehavior::maximum_auto_invoke_attempts)
    }

    /// A required call has been made; stop forcing tools on later requests.
    fn after_round(&mut self) {
        let required = self
            .behavior
            .as_ref()
            .is_some_and(|b| b.choice_type == FunctionChoiceType::Required);
        if required {
            self.settings.tools = None;
            self.settings.tool_choice = None;
        }
    }
}

/// Run the orchestration loop over `history`.
///
/// Returns the last completion together with a [`CompletionStatus`]. With
/// auto-invoke enabled the loop executes requested functions, feeds the
/// results back, and stops after at most
/// `maximum_auto_invoke_attempts` rounds plus one tool-free request.
pub async fn get_chat_message_contents(
    kernel: &Kernel,
    history: &mut ChatHistory,
    settings: &PromptExecutionSettings,
    arguments: &KernelArguments,
) -> Result<ChatCompletion> {
    let mut plan = LoopPlan::new(kernel, settings)?;

    let Some(max_rounds) = plan.max_rounds() else {
        let messages = send(&*plan.service, history, &plan.settings).await?;
        return Ok(finish_without_invoking(history, messages));
    };

    for request_index in 0..max_rounds {
        let messages = send(&*plan.service, history, &plan.settings).await?;
        let calls = append_first(history, &messages);
        if calls.is_empty() {
            return Ok(ChatCompletion {
                messages,
                pending_function_calls: Vec::new(),
                status: CompletionStatus::Done,
                rounds: request_index,
            });
        }

        let terminate =
            execute_round(kernel, history, &calls, arguments, &plan.offered, request_index).await;
        if terminate {
            return Ok(ChatCompletion {
                messages,
                pending_function_calls: Vec::new(),
                status: CompletionStatus::Terminated,
                rounds: request_index + 1,
            });
        }
        plan.after_round();
    }

    log::info!(
        "Reached the maximum of {} auto-invoke rounds; requesting a final answer without tools",
        max_rounds
    );
    let final_settings = plan.settings.without_tools();
    let mut messages = send(&*plan.service, history, &final_settings).await?;
    strip_function_calls(&mut messages);
    append_first(history, &messages);
    Ok(ChatCompletion {
        messages,
        pending_function_calls: Vec::new(),
        status: CompletionStatus::AttemptCeilingReached,
        rounds: max_rounds,
    })
}

/// Streaming variant of [`get_chat_message_contents`].
///
/// Yields every delta batch of every request as it arrives. Each response
/// is aggregated and appended to `history` once its stream ends, and
/// function calls are then executed exactly as in the non-streaming loop.
/// The last item is [`ChatStreamEvent::Completed`] with the same status,
/// pending calls, and round count the non-streaming loop would return.
pub fn get_streaming_chat_message_contents<'a>(
    kernel: &'a Kernel,
    history: &'a mut ChatHistory,
    settings: &'a PromptExecutionSettings,
    arguments: &'a KernelArguments,
) -> ChatMessageStream<'a> {
    Box::pin(try_stream! {
        let mut plan = LoopPlan::new(kernel, settings)?;
        let max_rounds = plan.max_rounds();
        let mut request_index = 0u32;

        let completion = loop {
            let ceiling_reached = max_rounds.is_some_and(|max| request_index >= max);
            let round_settings = if ceiling_reached {
                log::info!(
                    "Reached the maximum of {} auto-invoke rounds; requesting a final answer without tools",
                    request_index
                );
                plan.settings.without_tools()
            } else {
                plan.settings.clone()
            };

            let mut batches = plan
                .service
                .get_streaming_chat_message_contents(history, &round_settings)
                .await?;
            let mut aggregator = StreamingAggregator::new();
            while let Some(batch) = batches.next().await {
                let batch = batch?;
                aggregator.push_batch(batch.clone())?;
                yield ChatStreamEvent::Delta(batch);
            }
            let mut messages = aggregator.finish();

            if ceiling_reached {
                strip_function_calls(&mut messages);
                append_first(history, &messages);
                break ChatCompletion {
                    messages,
                    pending_function_calls: Vec::new(),
                    status: CompletionStatus::AttemptCeilingReached,
                    rounds: request_index,
                };
            }
            if max_rounds.is_none() {
                break finish_without_invoking(history, messages);
            }

            let calls = append_first(history, &messages);
            if calls.is_empty() {
                break ChatCompletion {
                    messages,
                    pending_function_calls: Vec::new(),
                    status: CompletionStatus::Done,
                    rounds: request_index,
                };
            }

            let terminate = execute_round(
                kernel,
                history,
                &calls,
                arguments,
                &plan.offered,
                request_index,
            )
            .await;
            if terminate {
                break ChatCompletion {
                    messages,
                    pending_function_calls: Vec::new(),
                    status: CompletionStatus::Terminated,
                    rounds: request_index + 1,
                };
            }
            plan.after_round();
            request_index += 1;
        };

        yield ChatStreamEvent::Completed(completion);
    })
}

async fn send(
    service: &dyn ChatCompletionService,
    history: &ChatHistory,
    settings: &PromptExecutionSettings,
) -> Result<Vec<ChatMessageContent>> {
    let messages = service.get_chat_message_contents(history, settings).await?;
    if messages.is_empty() {
        return Err(Error::api(format!(
            "completion service {} returned no choices",
            service.service_id()
        )));
    }
    Ok(messages)
}

/// Append the first candidate to history and return its function calls.
fn append_first(
    history: &mut ChatHistory,
    messages: &[ChatMessageContent],
) -> Vec<FunctionCallContent> {
    let Some(first) = messages.first() else {
        return Vec::new();
    };
    history.add_message(first.clone());
    first.function_calls().into_iter().cloned().collect()
}

/// Drop function calls from an answer requested without a tool offer.
fn strip_function_calls(messages: &mut [ChatMessageContent]) {
    let mut dropped = 0;
    for message in messages.iter_mut() {
        let before = message.items.len();
        message
            .items
            .retain(|item| !matches!(item, ContentItem::FunctionCall(_)));
        dropped += before - message.items.len();
    }
    if dropped > 0 {
        log::warn!(
            "Dropped {} function call(s) requested after the auto-invoke ceiling",
            dropped
        );
    }
}

fn finish_without_invoking(
    history: &mut ChatHistory,
    messages: Vec<ChatMessageContent>,
) -> ChatCompletion {
    let pending = append_first(history, &messages);
    let status = if pending.is_empty() {
        CompletionStatus::Done
    } else {
        CompletionStatus::PendingFunctionCalls
    };
    ChatCompletion {
        messages,
        pending_function_calls: pending,
        status,
        rounds: 0,
    }
}

/// Execute one round of calls concurrently, then append results in request
/// order. Returns whether any call asked to end the loop.
async fn execute_round(
    kernel: &Kernel,
    history: &mut ChatHistory,
    calls: &[FunctionCallContent],
    arguments: &KernelArguments,
    offered: &[Arc<KernelFunction>],
    request_index: u32,
) -> bool {
    log::info!("Processing {} tool calls in parallel", calls.len());

    let outcomes = join_all(calls.iter().enumerate().map(|(index, call)| {
        invoke_function_call(
            kernel,
            call,
            arguments,
            offered,
            AutoFunctionInvocationContext {
                function_name: call.name.clone().unwrap_or_default(),
                call_id: call.id.clone(),
                arguments: Value::Null,
                request_sequence_index: request_index,
                function_sequence_index: index,
                function_count: calls.len(),
            },
        )
    }))
    .await;

    let mut terminate = false;
    for outcome in outcomes {
        terminate |= outcome.terminate;
        history.add_message(ChatMessageContent::tool(outcome.result));
    }
    terminate
}

/// Result of handling one requested call.
#[derive(Debug, Clone)]
pub struct FunctionCallOutcome {
    pub result: FunctionResultContent,
    pub terminate: bool,
}

impl FunctionCallOutcome {
    fn error(call: &FunctionCallContent, message: impl Into<String>) -> Self {
        Self {
            result: FunctionResultContent::error(call, message),
            terminate: false,
        }
    }
}

/// Validate and execute one model-requested call.
///
/// Never fails: every problem is reported to the model through an error
/// [`FunctionResultContent`] with the same call id.
pub async fn invoke_function_call(
    kernel: &Kernel,
    call: &FunctionCallContent,
    arguments: &KernelArguments,
    offered: &[Arc<KernelFunction>],
    mut context: AutoFunctionInvocationContext,
) -> FunctionCallOutcome {
    let Some(name) = call.name.as_deref() else {
        log::info!("Tool call {:?} is missing a function name", call.id);
        return FunctionCallOutcome::error(
            call,
            "The tool call is missing a function name. Please try again with a supplied tool call name.",
        );
    };

    let Some(function) = offered
        .iter()
        .find(|f| f.fully_qualified_name() == name)
        .cloned()
    else {
        log::info!("Function {} is not part of the provided tools", name);
        return FunctionCallOutcome::error(
            call,
            format!(
                "The tool call with name `{}` is not part of the provided tools, please try again \
                 with a supplied tool call name and make sure to validate the name.",
                name
            ),
        );
    };

    let parsed = match call.parse_arguments() {
        Ok(parsed) => parsed,
        Err(e) => {
            log::info!("Received invalid arguments for function {}: {}", name, e);
            return FunctionCallOutcome::error(call, MALFORMED_ARGUMENTS_MESSAGE);
        }
    };

    let required = function.required_parameter_count();
    if parsed.len() < required {
        let names: Vec<&str> = function
            .parameters()
            .iter()
            .filter(|p| p.required && p.default.is_none())
            .map(|p| p.name.as_str())
            .collect();
        return FunctionCallOutcome::error(
            call,
            format!(
                "There are `{}` tool call arguments required and only `{}` received. The \
                 required arguments are: {:?}. Please provide the required arguments and try again.",
                required,
                parsed.len(),
                names
            ),
        );
    }

    log::debug!("Calling {} function with args: {}", name, Value::Object(parsed.clone()));

    let mut terminate = function.metadata().terminates;
    let mut call_args = Value::Object(parsed);
    context.arguments = call_args.clone();

    if let Some(decision) = kernel.filters().run_pre_invocation(context.clone()).await {
        terminate |= decision.should_terminate();
        if !decision.continue_execution() {
            let reason = decision.reason().unwrap_or("No reason provided");
            log::info!("Function {} blocked by filter: {}", name, reason);
            return FunctionCallOutcome {
                result: FunctionResultContent::error(
                    call,
                    format!("The function call was blocked: {}", reason),
                ),
                terminate,
            };
        }
        if let Some(modified) = decision.modified_arguments() {
            call_args = modified.clone();
            context.arguments = call_args.clone();
        }
    }

    let mut invocation_args = arguments.clone();
    if let Value::Object(map) = &call_args {
        for (key, value) in map {
            invocation_args.insert(key.clone(), value.clone());
        }
    }

    let (mut value, mut is_error) = match kernel.invoke(&function, invocation_args).await {
        Ok(result) => match result.error() {
            Some(e) => (Value::String(invocation_error(name, e)), true),
            None => (result.value.clone().unwrap_or(Value::Null), false),
        },
        Err(e) => (Value::String(invocation_error(name, &e)), true),
    };
    if is_error {
        log::info!("Function {} failed: {}", name, value);
    }

    let post = PostInvocationContext {
        invocation: context,
        result: value.clone(),
        is_error,
    };
    if let Some(decision) = kernel.filters().run_post_invocation(post).await {
        terminate |= decision.should_terminate();
        if let Some(overridden) = decision.overridden_result() {
            value = overridden.clone();
            is_error = false;
        }
    }

    if terminate {
        log::info!("Function {} requested termination of the auto-invoke loop", name);
    }

    let mut result = FunctionResultContent::success(call, value);
    result.is_error = is_error;
    FunctionCallOutcome { result, terminate }
}

fn invocation_error(name: &str, error: &Error) -> String {
    format!("An error occurred while invoking the function {}: {}", name, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{FilterDecision, FunctionInvocationFilters};
    use crate::functions::function;
    use serde_json::json;

    fn kernel_with_add() -> (Kernel, Vec<Arc<KernelFunction>>) {
        let mut kernel = Kernel::new();
        kernel
            .register(
                function("math", "Add")
                    .param("a", "number", "")
                    .param("b", "number", "")
                    .build(|args| async move {
                        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                        Ok(json!(a + b))
                    })
                    .unwrap(),
            )
            .unwrap();
        let offered = kernel.list_for_choice(&Default::default());
        (kernel, offered)
    }

    fn context(call: &FunctionCallContent) -> AutoFunctionInvocationContext {
        AutoFunctionInvocationContext {
            function_name: call.name.clone().unwrap_or_default(),
            call_id: call.id.clone(),
            arguments: Value::Null,
            request_sequence_index: 0,
            function_sequence_index: 0,
            function_count: 1,
        }
    }

    async fn run(kernel: &Kernel, offered: &[Arc<KernelFunction>], call: FunctionCallContent) -> FunctionCallOutcome {
        invoke_function_call(kernel, &call, &KernelArguments::new(), offered, context(&call)).await
    }

    #[tokio::test]
    async fn test_successful_call() {
        let (kernel, offered) = kernel_with_add();
        let outcome = run(&kernel, &offered, FunctionCallContent::new("a", "math-Add", r#"{"a":2,"b":2}"#)).await;
        assert!(!outcome.result.is_error);
        assert_eq!(outcome.result.id, "a");
        assert_eq!(outcome.result.result, json!(4));
        assert!(!outcome.terminate);
    }

    #[tokio::test]
    async fn test_malformed_arguments() {
        let (kernel, offered) = kernel_with_add();
        let outcome = run(&kernel, &offered, FunctionCallContent::new("a", "math-Add", "{\"a\": 2,")).await;
        assert!(outcome.result.is_error);
        assert_eq!(outcome.result.as_text(), MALFORMED_ARGUMENTS_MESSAGE);
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let (kernel, offered) = kernel_with_add();
        let outcome = run(&kernel, &offered, FunctionCallContent::new("a", "math-Pow", "{}")).await;
        assert!(outcome.result.is_error);
        assert!(outcome.result.as_text().contains("`math-Pow` is not part of the provided tools"));
    }

    #[tokio::test]
    async fn test_registered_but_not_offered() {
        let (kernel, _) = kernel_with_add();
        let outcome = run(&kernel, &[], FunctionCallContent::new("a", "math-Add", r#"{"a":1,"b":1}"#)).await;
        assert!(outcome.result.as_text().contains("not part of the provided tools"));
    }

    #[tokio::test]
    async fn test_too_few_arguments() {
        let (kernel, offered) = kernel_with_add();
        let outcome = run(&kernel, &offered, FunctionCallContent::new("a", "math-Add", r#"{"a":1}"#)).await;
        assert!(outcome.result.is_error);
        assert!(outcome.result.as_text().starts_with("There are `2` tool call arguments required and only `1` received."));
    }

    #[tokio::test]
    async fn test_function_failure_message() {
        let mut kernel = Kernel::new();
        kernel
            .register(
                function("util", "Boom")
                    .build(|_| async { Err(Error::function_execution("kaput")) })
                    .unwrap(),
            )
            .unwrap();
        let offered = kernel.list_for_choice(&Default::default());
        let outcome = run(&kernel, &offered, FunctionCallContent::new("x", "util-Boom", "{}")).await;
        assert!(outcome.result.is_error);
        assert_eq!(
            outcome.result.as_text(),
            "An error occurred while invoking the function util-Boom: Function execution error: kaput"
        );
    }

    #[tokio::test]
    async fn test_filters_block_modify_and_terminate() {
        let (mut kernel, offered) = kernel_with_add();
        kernel.set_filters(
            FunctionInvocationFilters::new()
                .add_pre_invocation(|ctx| async move {
                    if ctx.call_id.as_deref() == Some("blocked") {
                        return Some(FilterDecision::block("no adding today"));
                    }
                    if ctx.call_id.as_deref() == Some("doubled") {
                        return Some(FilterDecision::modify_arguments(json!({"a": 10, "b": 10}), "bigger"));
                    }
                    None
                })
                .add_post_invocation(|ctx| async move {
                    (ctx.result == json!(20)).then(FilterDecision::terminate)
                }),
        );

        let blocked = run(&kernel, &offered, FunctionCallContent::new("blocked", "math-Add", r#"{"a":1,"b":1}"#)).await;
        assert!(blocked.result.is_error);
        assert_eq!(blocked.result.as_text(), "The function call was blocked: no adding today");

        let doubled = run(&kernel, &offered, FunctionCallContent::new("doubled", "math-Add", r#"{"a":1,"b":1}"#)).await;
        assert_eq!(doubled.result.result, json!(20));
        assert!(doubled.terminate);
    }

    #[tokio::test]
    async fn test_terminating_function() {
        let mut kernel = Kernel::new();
        kernel
            .register(
                function("chat", "Goodbye")
                    .terminates_conversation()
                    .build(|_| async { Ok(json!("bye")) })
                    .unwrap(),
            )
            .unwrap();
        let offered = kernel.list_for_choice(&Default::default());
        let outcome = run(&kernel, &offered, FunctionCallContent::new("g", "chat-Goodbye", "")).await;
        assert!(outcome.terminate);
        assert_eq!(outcome.result.as_text(), "bye");
    }

    #[test]
    fn test_completion_accessors() {
        let completion = ChatCompletion {
            messages: vec![ChatMessageContent::assistant("4")],
            pending_function_calls: Vec::new(),
            status: CompletionStatus::Done,
            rounds: 1,
        };
        assert_eq!(completion.text(), "4");
        assert!(!completion.has_pending_function_calls());
    }

    #[test]
    fn test_strip_function_calls_keeps_text() {
        let mut message = ChatMessageContent::assistant_with_calls(vec![FunctionCallContent::new(
            "c1", "math-Add", "{}",
        )]);
        message.items.insert(0, ContentItem::text("Let me add."));
        let mut messages = vec![message];

        strip_function_calls(&mut messages);

        assert!(messages[0].function_calls().is_empty());
        assert_eq!(messages[0].as_text(), "Let me add.");
    }

    #[test]
    fn test_stream_event_delta() {
        let delta = ChatStreamEvent::Delta(vec![StreamingChatMessageContent::text(0, "hi")]);
        assert_eq!(delta.delta().map(|b| b.len()), Some(1));

        let done = ChatStreamEvent::Completed(ChatCompletion {
            messages: Vec::new(),
            pending_function_calls: Vec::new(),
            status: CompletionStatus::Done,
            rounds: 0,
        });
        assert!(done.delta().is_none());
    }
}
