//! Auto-function-invocation filters
//!
//! Filters intercept each function call the orchestration loop executes on
//! the model's behalf. They run at two points:
//!
//! 1. **Pre-invocation**: before the function runs. A filter may block the
//!    call (the model receives the reason as the tool result), replace the
//!    arguments, or end the auto-invoke loop.
//! 2. **Post-invocation**: after the function ran. A filter may replace the
//!    result or end the loop.
//!
//! # Execution Model
//!
//! Filters run sequentially in registration order and the **first filter
//! that returns `Some(FilterDecision)` wins**; later filters are skipped. If
//! every filter returns `None`, the call proceeds unchanged.
//!
//! ```rust,no_run
//! use open_kernel::{FilterDecision, FunctionInvocationFilters};
//!
//! let filters = FunctionInvocationFilters::new()
//!     .add_pre_invocation(|ctx| async move {
//!         if ctx.function_name == "admin-DropTables" {
//!             return Some(FilterDecision::block("not allowed"));
//!         }
//!         None
//!     })
//!     .add_post_invocation(|ctx| async move {
//!         // Stop after the farewell tool ran
//!         if ctx.invocation.function_name == "chat-Goodbye" {
//!             return Some(FilterDecision::terminate());
//!         }
//!         None
//!     });
//! ```

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What the loop knows about the call being executed.
#[derive(Debug, Clone)]
pub struct AutoFunctionInvocationContext {
    /// Fully qualified function name
    pub function_name: String,
    pub call_id: Option<String>,
    /// Parsed arguments (a JSON object)
    pub arguments: Value,
    /// Zero-based round of the orchestration loop
    pub request_sequence_index: u32,
    /// Position of this call among the calls of the current round
    pub function_sequence_index: usize,
    /// Number of calls requested in the current round
    pub function_count: usize,
}

/// Context handed to post-invocation filters.
#[derive(Debug, Clone)]
pub struct PostInvocationContext {
    pub invocation: AutoFunctionInvocationContext,
    /// Value that will be sent back to the model
    pub result: Value,
    pub is_error: bool,
}

/// Decision returned by a filter that takes control.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    continue_execution: bool,
    modified_arguments: Option<Value>,
    override_result: Option<Value>,
    terminate: bool,
    reason: Option<String>,
}

impl FilterDecision {
    /// Proceed unchanged, and stop consulting later filters.
    pub fn continue_() -> Self {
        Self {
            continue_execution: true,
            modified_arguments: None,
            override_result: None,
            terminate: false,
            reason: None,
        }
    }

    /// Skip the function; the reason becomes the tool result.
    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            continue_execution: false,
            reason: Some(reason.into()),
            ..Self::continue_()
        }
    }

    /// Run the function with different arguments.
    pub fn modify_arguments(arguments: Value, reason: impl Into<String>) -> Self {
        Self {
            modified_arguments: Some(arguments),
            reason: Some(reason.into()),
            ..Self::continue_()
        }
    }

    /// Send `value` to the model instead of the function's own result.
    pub fn override_result(value: Value) -> Self {
        Self {
            override_result: Some(value),
            ..Self::continue_()
        }
    }

    /// End the auto-invoke loop after this round.
    pub fn terminate() -> Self {
        Self {
            terminate: true,
            ..Self::continue_()
        }
    }

    /// Also end the loop.
    pub fn and_terminate(mut self) -> Self {
        self.terminate = true;
        self
    }

    pub fn continue_execution(&self) -> bool {
        self.continue_execution
    }

    pub fn modified_arguments(&self) -> Option<&Value> {
        self.modified_arguments.as_ref()
    }

    pub fn overridden_result(&self) -> Option<&Value> {
        self.override_result.as_ref()
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

pub type PreInvocationFilter = Arc<
    dyn Fn(AutoFunctionInvocationContext) -> Pin<Box<dyn Future<Output = Option<FilterDecision>> + Send>>
        + Send
        + Sync,
>;

pub type PostInvocationFilter = Arc<
    dyn Fn(PostInvocationContext) -> Pin<Box<dyn Future<Output = Option<FilterDecision>> + Send>>
        + Send
        + Sync,
>;

/// Ordered pre- and post-invocation filters.
#[derive(Clone, Default)]
pub struct FunctionInvocationFilters {
    pre_invocation: Vec<PreInvocationFilter>,
    post_invocation: Vec<PostInvocationFilter>,
}

impl FunctionInvocationFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre_invocation<F, Fut>(mut self, filter: F) -> Self
    where
        F: Fn(AutoFunctionInvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<FilterDecision>> + Send + 'static,
    {
        self.pre_invocation
            .push(Arc::new(move |ctx| Box::pin(filter(ctx))));
        self
    }

    pub fn add_post_invocation<F, Fut>(mut self, filter: F) -> Self
    where
        F: Fn(PostInvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<FilterDecision>> + Send + 'static,
    {
        self.post_invocation
            .push(Arc::new(move |ctx| Box::pin(filter(ctx))));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre_invocation.is_empty() && self.post_invocation.is_empty()
    }

    /// Run pre-invocation filters; first decision wins.
    pub async fn run_pre_invocation(
        &self,
        ctx: AutoFunctionInvocationContext,
    ) -> Option<FilterDecision> {
        for filter in &self.pre_invocation {
            let decision = filter(ctx.clone()).await;
            if decision.is_some() {
                return decision;
            }
        }
        None
    }

    /// Run post-invocation filters; first decision wins.
    pub async fn run_post_invocation(&self, ctx: PostInvocationContext) -> Option<FilterDecision> {
        for filter in &self.post_invocation {
            let decision = filter(ctx.clone()).await;
            if decision.is_some() {
                return decision;
            }
        }
        None
    }
}

impl fmt::Debug for FunctionInvocationFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionInvocationFilters")
            .field("pre_invocation", &format!("{} filters", self.pre_invocation.len()))
            .field("post_invocation", &format!("{} filters", self.post_invocation.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(name: &str) -> AutoFunctionInvocationContext {
        AutoFunctionInvocationContext {
            function_name: name.to_string(),
            call_id: Some("call_1".into()),
            arguments: json!({"a": 1}),
            request_sequence_index: 0,
            function_sequence_index: 0,
            function_count: 1,
        }
    }

    #[test]
    fn test_decision_constructors() {
        let d = FilterDecision::continue_();
        assert!(d.continue_execution());
        assert!(!d.should_terminate());

        let d = FilterDecision::block("nope");
        assert!(!d.continue_execution());
        assert_eq!(d.reason(), Some("nope"));

        let d = FilterDecision::modify_arguments(json!({"a": 2}), "clamp");
        assert_eq!(d.modified_arguments(), Some(&json!({"a": 2})));

        let d = FilterDecision::override_result(json!("redacted")).and_terminate();
        assert_eq!(d.overridden_result(), Some(&json!("redacted")));
        assert!(d.should_terminate());
    }

    #[tokio::test]
    async fn test_no_filters_no_decision() {
        let filters = FunctionInvocationFilters::new();
        assert!(filters.is_empty());
        assert!(filters.run_pre_invocation(ctx("math-Add")).await.is_none());
    }

    #[tokio::test]
    async fn test_first_decision_wins() {
        let filters = FunctionInvocationFilters::new()
            .add_pre_invocation(|_| async { None })
            .add_pre_invocation(|_| async { Some(FilterDecision::block("first")) })
            .add_pre_invocation(|_| async { Some(FilterDecision::block("second")) });

        let decision = filters.run_pre_invocation(ctx("math-Add")).await.unwrap();
        assert_eq!(decision.reason(), Some("first"));
    }

    #[tokio::test]
    async fn test_post_filter_sees_result() {
        let filters = FunctionInvocationFilters::new().add_post_invocation(|ctx| async move {
            if ctx.result == json!(4) {
                Some(FilterDecision::terminate())
            } else {
                None
            }
        });

        let post = PostInvocationContext {
            invocation: ctx("math-Add"),
            result: json!(4),
            is_error: false,
        };
        let decision = filters.run_post_invocation(post).await.unwrap();
        assert!(decision.should_terminate());
    }

    #[test]
    fn test_debug_shows_counts() {
        let filters = FunctionInvocationFilters::new().add_pre_invocation(|_| async { None });
        let debug = format!("{:?}", filters);
        assert!(debug.contains("1 filters"));
    }
}
