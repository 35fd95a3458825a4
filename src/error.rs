//! Error types for the Open Kernel
//!
//! Errors fall into two groups. Setup and protocol errors (`ServiceNotFound`,
//! `FunctionNotFound`, `DuplicateFunction`, `IncompatibleChunk`, transport
//! failures) propagate to the caller. Per-call errors (`MissingArgument`,
//! `MalformedToolArguments`, `FunctionExecution`, `Template`) are caught at the
//! function-invocation boundary and turned into data, see
//! [`Error::is_recoverable`].

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the kernel
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No completion service matches the requested id and no default exists
    #[error("Service not found: {service_id}")]
    ServiceNotFound { service_id: String },

    /// No function is registered under the given fully qualified name
    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    /// A function with the same plugin and function name is already registered
    #[error("Function already registered: {name}")]
    DuplicateFunction { name: String },

    /// A required parameter was absent from the arguments and has no default
    #[error("Missing argument '{parameter}' for function {function}")]
    MissingArgument { function: String, parameter: String },

    /// Two streaming chunks could not be combined
    #[error("Incompatible streaming chunk: {0}")]
    IncompatibleChunk(String),

    /// Tool-call arguments were not a JSON object
    #[error("Malformed tool arguments: {0}")]
    MalformedToolArguments(String),

    /// Execution settings failed validation
    #[error("Invalid execution settings: {0}")]
    InvalidExecutionSettings(String),

    /// A native callable or prompt execution failed
    #[error("Function execution error: {0}")]
    FunctionExecution(String),

    /// Template rendering failed
    #[error("Template error: {0}")]
    Template(String),

    /// API error from the model server
    #[error("API error: {0}")]
    Api(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a service-not-found error
    pub fn service_not_found(service_id: impl Into<String>) -> Self {
        Error::ServiceNotFound {
            service_id: service_id.into(),
        }
    }

    /// Create a function-not-found error
    pub fn function_not_found(name: impl Into<String>) -> Self {
        Error::FunctionNotFound { name: name.into() }
    }

    /// Create a duplicate-function error
    pub fn duplicate_function(name: impl Into<String>) -> Self {
        Error::DuplicateFunction { name: name.into() }
    }

    /// Create a missing-argument error
    pub fn missing_argument(function: impl Into<String>, parameter: impl Into<String>) -> Self {
        Error::MissingArgument {
            function: function.into(),
            parameter: parameter.into(),
        }
    }

    /// Create an incompatible-chunk error
    pub fn incompatible_chunk(msg: impl Into<String>) -> Self {
        Error::IncompatibleChunk(msg.into())
    }

    /// Create a malformed-tool-arguments error
    pub fn malformed_tool_arguments(msg: impl Into<String>) -> Self {
        Error::MalformedToolArguments(msg.into())
    }

    /// Create an invalid-execution-settings error
    pub fn invalid_settings(msg: impl Into<String>) -> Self {
        Error::InvalidExecutionSettings(msg.into())
    }

    /// Create a function-execution error
    pub fn function_execution(msg: impl Into<String>) -> Self {
        Error::FunctionExecution(msg.into())
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Error::Template(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Whether this error belongs below the function-invocation boundary.
    ///
    /// Recoverable errors are folded into a [`FunctionResult`](crate::FunctionResult)
    /// or a tool-result message so the conversation can continue. Everything
    /// else propagates to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MissingArgument { .. }
                | Error::MalformedToolArguments(_)
                | Error::FunctionExecution(_)
                | Error::Template(_)
        )
    }
}
