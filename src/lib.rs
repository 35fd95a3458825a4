//! # Open Kernel
//!
//! An orchestration core for LLM applications: a registry of callable
//! functions, pluggable chat completion services, and a loop that lets the
//! model call those functions on its own.
//!
//! ## Overview
//!
//! - **Content model**: role-tagged chat messages made of text, image,
//!   function call, and function result items
//! - **Streaming**: per-choice deltas and an aggregator that folds them
//!   into finalized messages, including fragmented tool-call arguments
//! - **Functions**: native async functions and prompt templates, grouped
//!   into plugins and addressed as `plugin-function`
//! - **Execution settings**: sampling options plus a function choice
//!   behavior (auto, required, none) that decides what the model is offered
//! - **Invocation**: service selection, argument gathering, template
//!   rendering, and uniform results for both function kinds
//! - **Auto-invoke loop**: concurrent execution of model-requested calls,
//!   filters, termination, and a bounded number of rounds
//! - **OpenAI connector**: any OpenAI-compatible server (OpenAI, LM Studio,
//!   Ollama, llama.cpp, vLLM), with SSE streaming and retries
//!
//! ## Example
//!
//! ```rust,no_run
//! use open_kernel::prelude::*;
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let service = OpenAIChatCompletion::new(
//!         OpenAIConfig::builder()
//!             .model("qwen2.5-32b-instruct")
//!             .provider(Provider::LMStudio)
//!             .build()?,
//!     )?;
//!
//!     let add = function("math", "Add")
//!         .description("Add two numbers")
//!         .param("a", "number", "First number")
//!         .param("b", "number", "Second number")
//!         .build(|args| async move {
//!             let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
//!             let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
//!             Ok(json!(a + b))
//!         })?;
//!
//!     let kernel = Kernel::builder()
//!         .service(Arc::new(service))
//!         .function(add)
//!         .build()?;
//!
//!     let settings = PromptExecutionSettings::builder()
//!         .function_choice_behavior(FunctionChoiceBehavior::auto(true))
//!         .build()?;
//!
//!     let mut history = ChatHistory::with_system_message("You are a calculator.");
//!     history.add_user_message("What is 2 + 2?");
//!
//!     let completion =
//!         get_chat_message_contents(&kernel, &mut history, &settings, &KernelArguments::new())
//!             .await?;
//!     println!("{}", completion.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **contents** / **history**: messages and conversations
//! - **streaming**: delta combination and aggregation
//! - **settings**: execution settings and function choice behavior
//! - **functions**: kernel functions, metadata, arguments, and results
//! - **services**: chat completion and template renderer traits
//! - **kernel**: function registry and service selection
//! - **invocation**: invoking a single function
//! - **orchestration**: the auto-invoke loop
//! - **filters**: pre- and post-invocation filters for the loop
//! - **openai** / **config**: the OpenAI-compatible connector
//! - **retry**: exponential backoff with jitter
//! - **error**: error types

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Message content items and chat messages.
mod contents;

/// Connection settings and provider defaults.
mod config;

mod error;

/// Function invocation filters for the auto-invoke loop.
mod filters;

/// Kernel functions, their metadata, arguments, and results.
mod functions;

/// Ordered conversation history.
mod history;

/// Single-function invocation on the kernel.
mod invocation;

/// Function registry and service selection.
mod kernel;

/// OpenAI-compatible chat completion service.
mod openai;

/// Execution settings and function choice behavior.
mod settings;

/// Service and template renderer traits.
mod services;

/// Streaming delta combination and aggregation.
mod streaming;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// The auto-invoke loop. Public as a module so the lower-level pieces
/// ([`orchestration::invoke_function_call`]) can be reused.
pub mod orchestration;

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

// --- Content ---

pub use contents::{
    AuthorRole, ChatMessageContent, ContentItem, FQN_SEPARATOR, FinishReason,
    FunctionCallContent, FunctionResultContent, ImageContent, StreamingChatMessageContent,
    TextContent, TextEncoding,
};
pub use history::ChatHistory;

// --- Streaming ---

pub use streaming::{StreamingAggregator, aggregate_stream, combine};

// --- Settings ---

pub use settings::{
    DEFAULT_MAX_AUTO_INVOKE_ATTEMPTS, DEFAULT_SERVICE_ID, FunctionChoiceBehavior,
    FunctionChoiceType, FunctionFilters, MAX_NUMBER_OF_RESPONSES, PromptExecutionSettings,
    PromptExecutionSettingsBuilder,
};

// --- Functions ---

pub use functions::{
    FunctionBuilder, FunctionKind, FunctionMetadata, FunctionResult, KernelArguments,
    KernelFunction, NativeHandler, NativeStreamHandler, ParameterMetadata, ReturnMetadata,
    function,
};

// --- Kernel ---

pub use invocation::{FunctionStream, StreamingFunctionUpdate};
pub use kernel::{Kernel, KernelBuilder};
pub use services::{
    BasicTemplateRenderer, ChatCompletionService, PromptTemplateRenderer, StreamingChunkStream,
};

// --- Orchestration ---

pub use filters::{
    AutoFunctionInvocationContext, FilterDecision, FunctionInvocationFilters,
    PostInvocationContext, PostInvocationFilter, PreInvocationFilter,
};
pub use orchestration::{
    ChatCompletion, ChatMessageStream, ChatStreamEvent, CompletionStatus,
    get_chat_message_contents, get_streaming_chat_message_contents,
};

// --- Connector ---

pub use config::{
    API_KEY_ENV, BASE_URL_ENV, MODEL_ENV, OpenAIConfig, OpenAIConfigBuilder, Provider,
    get_base_url, get_model,
};
pub use openai::OpenAIChatCompletion;

// --- Error Handling ---

pub use error::{Error, Result};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most applications need: `use open_kernel::prelude::*;`
pub mod prelude {
    pub use crate::{
        AuthorRole, ChatCompletion, ChatCompletionService, ChatHistory, ChatMessageContent,
        ChatStreamEvent, CompletionStatus, Error, FilterDecision, FunctionCallContent, FunctionChoiceBehavior,
        FunctionInvocationFilters, FunctionResult, Kernel, KernelArguments, KernelFunction,
        OpenAIChatCompletion, OpenAIConfig, PromptExecutionSettings, Provider, Result,
        StreamingChatMessageContent, function, get_chat_message_contents,
        get_streaming_chat_message_contents,
    };
}
