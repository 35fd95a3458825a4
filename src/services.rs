//! Capability traits for the kernel's external collaborators
//!
//! The kernel never talks to a model provider or a templating engine
//! directly. It goes through two narrow interfaces:
//!
//! - [`ChatCompletionService`]: sends a conversation and returns finalized
//!   messages, or a stream of per-choice deltas.
//! - [`PromptTemplateRenderer`]: turns a template and arguments into a prompt.
//!
//! [`BasicTemplateRenderer`] covers plain `{{$variable}}` substitution. Richer
//! template languages plug in by implementing the trait.

use crate::contents::{ChatMessageContent, StreamingChatMessageContent};
use crate::functions::KernelArguments;
use crate::history::ChatHistory;
use crate::settings::PromptExecutionSettings;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value;
use std::pin::Pin;

/// Stream of delta batches, one [`StreamingChatMessageContent`] per choice.
///
/// Finite and not restartable. The stream owns everything it needs, so it
/// can outlive the borrowed history and settings that produced it.
pub type StreamingChunkStream =
    Pin<Box<dyn Stream<Item = Result<Vec<StreamingChatMessageContent>>> + Send>>;

/// A chat model behind some provider.
///
/// Implementations report function calls with [`FunctionCallContent`]
/// items (id, fully qualified name, JSON arguments) and set a finish reason
/// per choice when the provider gives one. Timeouts and retries are the
/// implementation's business; the kernel propagates whatever error comes out.
///
/// [`FunctionCallContent`]: crate::FunctionCallContent
#[async_trait]
pub trait ChatCompletionService: Send + Sync {
    /// Id the kernel registers this service under.
    fn service_id(&self) -> &str;

    /// Model the service talks to, if known.
    fn ai_model_id(&self) -> Option<&str> {
        None
    }

    /// Send the conversation and return one message per requested choice.
    async fn get_chat_message_contents(
        &self,
        history: &ChatHistory,
        settings: &PromptExecutionSettings,
    ) -> Result<Vec<ChatMessageContent>>;

    /// Send the conversation and stream the response as delta batches.
    async fn get_streaming_chat_message_contents(
        &self,
        history: &ChatHistory,
        settings: &PromptExecutionSettings,
    ) -> Result<StreamingChunkStream>;
}

/// Renders a prompt template with the given arguments.
#[async_trait]
pub trait PromptTemplateRenderer: Send + Sync {
    async fn render(&self, template: &str, arguments: &KernelArguments) -> Result<String>;
}

/// Substitutes `{{$name}}` with the argument `name`.
///
/// String values are inserted verbatim, other values as JSON. An unknown
/// variable, an unterminated block, or any other expression is a
/// [`Error::Template`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicTemplateRenderer;

impl BasicTemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    fn render_sync(template: &str, arguments: &KernelArguments) -> Result<String> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            output.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or_else(|| Error::template("unterminated '{{' block"))?;
            let expression = after_open[..end].trim();

            let variable = expression.strip_prefix('$').ok_or_else(|| {
                Error::template(format!("unsupported template expression: {}", expression))
            })?;
            let variable = variable.trim();
            match arguments.get(variable) {
                Some(Value::String(s)) => output.push_str(s),
                Some(Value::Null) => {}
                Some(other) => output.push_str(&other.to_string()),
                None => {
                    return Err(Error::template(format!(
                        "variable '{}' not found in arguments",
                        variable
                    )));
                }
            }
            rest = &after_open[end + 2..];
        }
        output.push_str(rest);
        Ok(output)
    }
}

#[async_trait]
impl PromptTemplateRenderer for BasicTemplateRenderer {
    async fn render(&self, template: &str, arguments: &KernelArguments) -> Result<String> {
        Self::render_sync(template, arguments)
    }
}
