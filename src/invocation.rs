//! Function invocation engine
//!
//! Executes one [`KernelFunction`] against a [`Kernel`]:
//!
//! ```text
//! arguments ──► gather (defaults, required check)
//!                 │
//!        ┌────────┴─────────┐
//!     Native              Prompt
//!  call handler     select service + settings
//!                   render template
//!                   send to completion service
//!        └────────┬─────────┘
//!                 ▼
//!          FunctionResult
//! ```
//!
//! Failures below the invocation boundary (missing arguments, template
//! errors, handler errors, completion-service errors) come back as a
//! [`FunctionResult`] carrying the error. Only service resolution failures
//! propagate as `Err`, since no function ran at all.

use crate::contents::StreamingChatMessageContent;
use crate::functions::{FunctionKind, FunctionResult, KernelArguments, KernelFunction};
use crate::history::ChatHistory;
use crate::kernel::Kernel;
use crate::{Error, Result};
use async_stream::try_stream;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;

/// One item of a streaming invocation.
#[derive(Debug, Clone)]
pub enum StreamingFunctionUpdate {
    /// Delta batch from a prompt function, one chunk per choice
    Content(Vec<StreamingChatMessageContent>),
    /// Partial (or single) value from a native function
    Value(Value),
    /// The function failed; this is the last item
    Failed(FunctionResult),
}

/// Lazy, finite, non-restartable output of [`Kernel::invoke_stream`].
pub type FunctionStream<'a> =
    Pin<Box<dyn Stream<Item = Result<StreamingFunctionUpdate>> + Send + 'a>>;

impl Kernel {
    /// Invoke `function` with `arguments`.
    ///
    /// Returns `Err` only when no completion service can be resolved for a
    /// prompt function. Every other failure is reported through
    /// [`FunctionResult::error`].
    pub async fn invoke(
        &self,
        function: &KernelFunction,
        arguments: KernelArguments,
    ) -> Result<FunctionResult> {
        let fqn = function.fully_qualified_name();
        log::debug!("Invoking function {}", fqn);

        let gathered = match function.gather_arguments(&arguments) {
            Ok(gathered) => gathered,
            Err(e) => return Ok(failed(function, &arguments, e)),
        };

        match function.kind() {
            FunctionKind::Native { handler, .. } => match handler(gathered.clone()).await {
                Ok(value) => Ok(FunctionResult::success(function.metadata(), value)
                    .with_metadata("arguments", gathered.to_value())),
                Err(e) => Ok(failed(function, &gathered, e)),
            },
            FunctionKind::Prompt { template, .. } => {
                let (service, mut settings) = self.select_ai_service(function, &gathered)?;
                let outcome = async {
                    settings.validate()?;
                    let rendered = self.renderer().render(template, &gathered).await?;
                    let history = ChatHistory::from_rendered_prompt(rendered.clone());
                    let messages = service
                        .get_chat_message_contents(&history, &settings)
                        .await?;
                    Ok::<_, Error>((rendered, messages))
                }
                .await;

                match outcome {
                    Ok((rendered, messages)) => {
                        let text = messages.first().map(|m| m.as_text()).unwrap_or_default();
                        let mut result =
                            FunctionResult::success(function.metadata(), Value::String(text))
                                .with_metadata("arguments", gathered.to_value())
                                .with_metadata("rendered_prompt", Value::String(rendered))
                                .with_metadata(
                                    "service_id",
                                    Value::String(service.service_id().to_string()),
                                );
                        result.messages = messages;
                        Ok(result)
                    }
                    Err(e) => Ok(failed(function, &gathered, e)),
                }
            }
        }
    }

    /// Render `prompt` as an ad-hoc prompt function and invoke it.
    pub async fn invoke_prompt(
        &self,
        prompt: &str,
        arguments: KernelArguments,
    ) -> Result<FunctionResult> {
        let function = crate::functions::function("prompts", "InvokePrompt").prompt(prompt)?;
        self.invoke(&function, arguments).await
    }

    /// Invoke `function`, streaming its output.
    ///
    /// Prompt functions yield the completion service's delta batches. Native
    /// functions yield their streaming handler's values, or the single value
    /// of their regular handler. A failed function yields one final
    /// [`StreamingFunctionUpdate::Failed`]; service resolution failures are
    /// yielded as `Err`.
    pub fn invoke_stream<'a>(
        &'a self,
        function: &'a KernelFunction,
        arguments: KernelArguments,
    ) -> FunctionStream<'a> {
        let fqn = function.fully_qualified_name();
        let inner = try_stream! {
            log::debug!("Invoking function {} (streaming)", fqn);
            let gathered = function.gather_arguments(&arguments)?;

            match function.kind() {
                FunctionKind::Native { stream_handler: Some(stream_handler), .. } => {
                    let mut values = stream_handler(gathered);
                    while let Some(value) = values.next().await {
                        yield StreamingFunctionUpdate::Value(value?);
                    }
                }
                FunctionKind::Native { handler, stream_handler: None } => {
                    let value = handler(gathered).await?;
                    yield StreamingFunctionUpdate::Value(value);
                }
                FunctionKind::Prompt { template, .. } => {
                    let (service, mut settings) = self.select_ai_service(function, &gathered)?;
                    settings.validate()?;
                    let rendered = self.renderer().render(template, &gathered).await?;
                    let history = ChatHistory::from_rendered_prompt(rendered);
                    let mut batches = service
                        .get_streaming_chat_message_contents(&history, &settings)
                        .await?;
                    while let Some(batch) = batches.next().await {
                        yield StreamingFunctionUpdate::Content(batch?);
                    }
                }
            }
        };

        let metadata = function.metadata().clone();
        Box::pin(inner.map(move |item: Result<StreamingFunctionUpdate>| match item {
            Err(e @ Error::ServiceNotFound { .. }) => Err(e),
            Err(e) => {
                log::debug!("Streaming function {} failed: {}", metadata.fully_qualified_name(), e);
                Ok(StreamingFunctionUpdate::Failed(FunctionResult::failure(&metadata, e)))
            }
            ok => ok,
        }))
    }
}

fn failed(function: &KernelFunction, arguments: &KernelArguments, error: Error) -> FunctionResult {
    log::debug!(
        "Function {} failed: {}",
        function.fully_qualified_name(),
        error
    );
    FunctionResult::failure(function.metadata(), error)
        .with_metadata("arguments", arguments.to_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contents::ChatMessageContent;
    use crate::functions::function;
    use crate::services::{ChatCompletionService, StreamingChunkStream};
    use crate::settings::PromptExecutionSettings;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Echoes the last user message back, recording what it was sent.
    struct EchoService {
        seen: Mutex<Vec<String>>,
    }

    impl EchoService {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatCompletionService for EchoService {
        fn service_id(&self) -> &str {
            "echo"
        }

        async fn get_chat_message_contents(
            &self,
            history: &ChatHistory,
            _settings: &PromptExecutionSettings,
        ) -> Result<Vec<ChatMessageContent>> {
            let prompt = history.last().map(|m| m.as_text()).unwrap_or_default();
            self.seen.lock().unwrap().push(prompt.clone());
            Ok(vec![ChatMessageContent::assistant(format!("echo: {}", prompt))])
        }

        async fn get_streaming_chat_message_contents(
            &self,
            history: &ChatHistory,
            _settings: &PromptExecutionSettings,
        ) -> Result<StreamingChunkStream> {
            let prompt = history.last().map(|m| m.as_text()).unwrap_or_default();
            let batches: Vec<Result<Vec<StreamingChatMessageContent>>> = prompt
                .split_whitespace()
                .map(|word| Ok(vec![StreamingChatMessageContent::text(0, word)]))
                .collect();
            Ok(Box::pin(futures::stream::iter(batches)))
        }
    }

    fn add() -> KernelFunction {
        function("math", "Add")
            .param("a", "number", "")
            .param("b", "number", "")
            .build(|args| async move {
                let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
                let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
                Ok(json!(a + b))
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_native_success() {
        let kernel = Kernel::new();
        let result = kernel
            .invoke(&add(), KernelArguments::new().with("a", 2).with("b", 2))
            .await
            .unwrap();
        assert!(!result.is_error());
        assert_eq!(result.value, Some(json!(4.0)));
        assert_eq!(result.metadata["arguments"], json!({"a": 2, "b": 2}));
    }

    #[tokio::test]
    async fn test_missing_argument_is_data() {
        let kernel = Kernel::new();
        let result = kernel
            .invoke(&add(), KernelArguments::new().with("a", 2))
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.value.is_none());
        assert!(matches!(result.error(), Some(Error::MissingArgument { .. })));
    }

    #[tokio::test]
    async fn test_handler_error_is_data() {
        let kernel = Kernel::new();
        let boom = function("util", "Boom")
            .build(|_| async { Err(Error::function_execution("boom")) })
            .unwrap();
        let result = kernel.invoke(&boom, KernelArguments::new()).await.unwrap();
        assert!(result.is_error());
        assert_eq!(result.metadata["error"], json!("Function execution error: boom"));
    }

    #[tokio::test]
    async fn test_prompt_function_renders_and_sends() {
        let service = EchoService::new();
        let mut kernel = Kernel::new();
        kernel.add_service(service.clone()).unwrap();

        let greet = function("chat", "Greet")
            .param("name", "string", "Who to greet")
            .prompt("Hello {{$name}}")
            .unwrap();
        let result = kernel
            .invoke(&greet, KernelArguments::new().with("name", "Ada"))
            .await
            .unwrap();

        assert_eq!(result.to_string(), "echo: Hello Ada");
        assert_eq!(result.metadata["rendered_prompt"], json!("Hello Ada"));
        assert_eq!(result.metadata["service_id"], json!("echo"));
        assert_eq!(result.messages.len(), 1);
        assert_eq!(service.seen.lock().unwrap().as_slice(), ["Hello Ada"]);
    }

    #[tokio::test]
    async fn test_prompt_template_error_is_data() {
        let mut kernel = Kernel::new();
        kernel.add_service(EchoService::new()).unwrap();
        let result = kernel
            .invoke_prompt("Hello {{$missing}}", KernelArguments::new())
            .await
            .unwrap();
        assert!(matches!(result.error(), Some(Error::Template(_))));
    }

    #[tokio::test]
    async fn test_prompt_without_service_propagates() {
        let kernel = Kernel::new();
        let err = kernel
            .invoke_prompt("Hello", KernelArguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stream_prompt_function() {
        let mut kernel = Kernel::new();
        kernel.add_service(EchoService::new()).unwrap();
        let f = function("chat", "Words").prompt("one two three").unwrap();

        let updates: Vec<_> = kernel
            .invoke_stream(&f, KernelArguments::new())
            .collect()
            .await;
        let words: Vec<String> = updates
            .into_iter()
            .map(|u| match u.unwrap() {
                StreamingFunctionUpdate::Content(batch) => batch[0].as_text().to_string(),
                other => panic!("unexpected update: {other:?}"),
            })
            .collect();
        assert_eq!(words, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_stream_native_function() {
        let kernel = Kernel::new();
        let counter = function("util", "Count")
            .stream_handler(|_| futures::stream::iter((1..=3).map(|n| Ok::<_, Error>(json!(n)))))
            .build(|_| async { Ok(json!(3)) })
            .unwrap();

        let values: Vec<Value> = kernel
            .invoke_stream(&counter, KernelArguments::new())
            .map(|u| match u.unwrap() {
                StreamingFunctionUpdate::Value(v) => v,
                other => panic!("unexpected update: {other:?}"),
            })
            .collect()
            .await;
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);

        let single: Vec<_> = kernel
            .invoke_stream(&add(), KernelArguments::new().with("a", 1).with("b", 1))
            .collect()
            .await;
        assert_eq!(single.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_is_final_item() {
        let kernel = Kernel::new();
        let updates: Vec<_> = kernel
            .invoke_stream(&add(), KernelArguments::new())
            .collect()
            .await;
        assert_eq!(updates.len(), 1);
        match updates.into_iter().next().unwrap().unwrap() {
            StreamingFunctionUpdate::Failed(result) => {
                assert!(matches!(result.error(), Some(Error::MissingArgument { .. })));
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }
}
