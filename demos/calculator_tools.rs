//! Calculator with Manual Function Calling
//!
//! Auto-invoke is off: the loop hands requested calls back, and this program
//! decides to run them through the kernel and report the results.
//!
//! Point it at any OpenAI-compatible server:
//!
//! ```text
//! OPEN_KERNEL_BASE_URL=http://localhost:11434/v1 OPEN_KERNEL_MODEL=qwen3:8b \
//!     cargo run --example calculator_tools
//! ```

use open_kernel::prelude::*;
use open_kernel::{CompletionStatus, FunctionResultContent, Provider, get_base_url, get_model};
use serde_json::{Value, json};
use std::sync::Arc;

fn binary(name: &str, description: &str, op: fn(f64, f64) -> Result<f64>) -> Result<KernelFunction> {
    function("calculator", name)
        .description(description)
        .param("a", "number", "Left operand")
        .param("b", "number", "Right operand")
        .build(move |args| async move {
            let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            Ok(json!({ "result": op(a, b)? }))
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OpenAIConfig::builder()
        .model(get_model(Some("qwen3:8b"), true).unwrap_or_default())
        .base_url(get_base_url(Some(Provider::Ollama), None))
        .build()?;

    let kernel = Kernel::builder()
        .service(Arc::new(OpenAIChatCompletion::new(config)?))
        .function(binary("Add", "Add two numbers", |a, b| Ok(a + b))?)
        .function(binary("Subtract", "Subtract b from a", |a, b| Ok(a - b))?)
        .function(binary("Multiply", "Multiply two numbers", |a, b| Ok(a * b))?)
        .function(binary("Divide", "Divide a by b", |a, b| {
            if b == 0.0 {
                return Err(Error::function_execution("Cannot divide by zero"));
            }
            Ok(a / b)
        })?)
        .build()?;

    let settings = PromptExecutionSettings::builder()
        .temperature(0.1)
        .function_choice_behavior(FunctionChoiceBehavior::auto(false))
        .build()?;

    let queries = [
        "What is 25 plus 17?",
        "Calculate 144 divided by 12",
        "What's 7 times 8, then add 5?",
    ];

    for query in queries {
        println!("\nUser: {}", query);
        let mut history = ChatHistory::with_system_message(
            "You are a helpful calculator assistant. Use the provided tools to perform \
             calculations and explain the result.",
        );
        history.add_user_message(query);

        for _ in 0..5 {
            let completion =
                get_chat_message_contents(&kernel, &mut history, &settings, &KernelArguments::new())
                    .await?;
            if completion.status != CompletionStatus::PendingFunctionCalls {
                println!("Assistant: {}", completion.text());
                break;
            }

            for call in &completion.pending_function_calls {
                let name = call.name.as_deref().unwrap_or_default();
                println!("  -> {}({})", name, call.arguments.as_deref().unwrap_or(""));

                let result = match (kernel.resolve(name), call.parse_arguments()) {
                    (Ok(function), Ok(arguments)) => {
                        let outcome = kernel.invoke(&function, arguments.into()).await?;
                        match outcome.error() {
                            Some(e) => FunctionResultContent::error(call, e.to_string()),
                            None => FunctionResultContent::success(
                                call,
                                outcome.value.clone().unwrap_or(Value::Null),
                            ),
                        }
                    }
                    (Err(e), _) | (_, Err(e)) => FunctionResultContent::error(call, e.to_string()),
                };
                println!("  <- {}", result.as_text());
                history.add_message(ChatMessageContent::tool(result));
            }
        }
    }

    Ok(())
}
