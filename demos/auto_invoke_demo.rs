//! Auto-Invoke Demo
//!
//! The kernel runs model-requested functions on its own and streams the
//! final answer. A pre-invocation filter logs every call and refuses to
//! divide by zero; a terminating function ends the conversation early.
//!
//! Usage:
//!   RUST_LOG=open_kernel=debug cargo run --example auto_invoke_demo
//!
//! Requires:
//!   - Ollama running on localhost:11434 (or set OPEN_KERNEL_BASE_URL)
//!   - qwen3:8b model (or set OPEN_KERNEL_MODEL)

use futures::StreamExt;
use open_kernel::prelude::*;
use open_kernel::{Provider, get_base_url, get_model};
use serde_json::{Value, json};
use std::io::Write;
use std::sync::Arc;

fn number(args: &KernelArguments, key: &str) -> f64 {
    args.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("{}", "=".repeat(70));
    println!("AUTO-INVOKE DEMO");
    println!("{}", "=".repeat(70));

    let config = OpenAIConfig::builder()
        .model(get_model(Some("qwen3:8b"), true).unwrap_or_default())
        .base_url(get_base_url(Some(Provider::Ollama), None))
        .build()?;

    let add = function("math", "Add")
        .description("Add two numbers")
        .param("a", "number", "First number")
        .param("b", "number", "Second number")
        .build(|args| async move { Ok(json!(number(&args, "a") + number(&args, "b"))) })?;

    let multiply = function("math", "Multiply")
        .description("Multiply two numbers")
        .param("a", "number", "First number")
        .param("b", "number", "Second number")
        .build(|args| async move { Ok(json!(number(&args, "a") * number(&args, "b"))) })?;

    let divide = function("math", "Divide")
        .description("Divide a by b")
        .param("a", "number", "Dividend")
        .param("b", "number", "Divisor")
        .build(|args| async move { Ok(json!(number(&args, "a") / number(&args, "b"))) })?;

    let goodbye = function("chat", "EndConversation")
        .description("Call when the user says goodbye")
        .terminates_conversation()
        .build(|_| async { Ok(json!("Conversation ended.")) })?;

    let filters = FunctionInvocationFilters::new().add_pre_invocation(|ctx| async move {
        println!(
            "  [round {} call {}/{}] {}({})",
            ctx.request_sequence_index,
            ctx.function_sequence_index + 1,
            ctx.function_count,
            ctx.function_name,
            ctx.arguments
        );
        if ctx.function_name == "math-Divide" && ctx.arguments.get("b").and_then(Value::as_f64) == Some(0.0) {
            return Some(FilterDecision::block("Division by zero is not allowed"));
        }
        None
    });

    let kernel = Kernel::builder()
        .service(Arc::new(OpenAIChatCompletion::new(config)?))
        .functions([add, multiply, divide])
        .function(goodbye)
        .filters(filters)
        .build()?;

    let settings = PromptExecutionSettings::builder()
        .temperature(0.1)
        .function_choice_behavior(FunctionChoiceBehavior::auto(true))
        .build()?;
    let arguments = KernelArguments::new();

    let mut history = ChatHistory::with_system_message(
        "You are a math assistant. Always use the provided functions for arithmetic.",
    );

    for question in [
        "What is (12 + 30) * 2?",
        "Now divide that by zero.",
        "Thanks, goodbye!",
    ] {
        println!("\nUser: {}", question);
        history.add_user_message(question);

        print!("Assistant: ");
        let mut stream = get_streaming_chat_message_contents(&kernel, &mut history, &settings, &arguments);
        while let Some(event) = stream.next().await {
            match event? {
                ChatStreamEvent::Delta(batch) => {
                    for chunk in batch {
                        print!("{}", chunk.as_text());
                    }
                    let _ = std::io::stdout().flush();
                }
                ChatStreamEvent::Completed(completion) => {
                    println!();
                    if completion.status != CompletionStatus::Done {
                        println!("  [{:?} after {} round(s)]", completion.status, completion.rounds);
                    }
                }
            }
        }
    }

    println!("\nHistory has {} messages.", history.len());
    Ok(())
}
