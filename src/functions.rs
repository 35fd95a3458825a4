//! # Kernel Functions
//!
//! A [`KernelFunction`] is the registered unit of work the model can call. It
//! pairs validated metadata (plugin, name, description, parameter schema) with
//! an execution body, which is either a prompt template rendered and sent to a
//! completion service, or a native async callable.
//!
//! ## Naming
//!
//! Functions live in plugins. The fully qualified name handed to the model is
//! `plugin-function`, so neither part may contain the separator:
//!
//! ```text
//! plugin "math" + function "Add"  ──►  "math-Add"
//! ```
//!
//! ## Building functions
//!
//! Metadata is declared once with a builder and validated at `build` time:
//!
//! ```rust
//! use open_kernel::function;
//! use serde_json::json;
//!
//! let add = function("math", "Add")
//!     .description("Add two numbers")
//!     .param("a", "number", "First addend")
//!     .param("b", "number", "Second addend")
//!     .build(|args| async move {
//!         let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!         let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
//!         Ok(json!(a + b))
//!     })
//!     .unwrap();
//!
//! assert_eq!(add.fully_qualified_name(), "math-Add");
//! assert_eq!(add.to_tool_definition()["function"]["name"], "math-Add");
//! ```
//!
//! Prompt functions take a template instead of a handler:
//!
//! ```rust
//! use open_kernel::function;
//!
//! let summarize = function("writer", "Summarize")
//!     .param("input", "string", "Text to summarize")
//!     .prompt("Summarize this: {{$input}}")
//!     .unwrap();
//! assert!(summarize.is_prompt());
//! ```

use crate::contents::{ChatMessageContent, FQN_SEPARATOR};
use crate::settings::{DEFAULT_SERVICE_ID, PromptExecutionSettings};
use crate::{Error, Result};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Async body of a native function.
///
/// Receives the gathered arguments (declared parameters with defaults filled
/// in) and returns a JSON value or an error. Errors never escape the
/// invocation engine; they become a failed [`FunctionResult`].
pub type NativeHandler = Arc<
    dyn Fn(KernelArguments) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync,
>;

/// Streaming body of a native function, yielding partial values.
pub type NativeStreamHandler = Arc<
    dyn Fn(KernelArguments) -> Pin<Box<dyn Stream<Item = Result<Value>> + Send>> + Send + Sync,
>;

/// Named arguments for a function call, plus optional per-call execution
/// settings keyed by service id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelArguments {
    values: Map<String, Value>,
    execution_settings: HashMap<String, PromptExecutionSettings>,
}

impl KernelArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Attach execution settings, keyed by their service id.
    pub fn with_settings(mut self, settings: PromptExecutionSettings) -> Self {
        self.execution_settings
            .insert(settings.service_id().to_string(), settings);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn execution_settings(&self) -> &HashMap<String, PromptExecutionSettings> {
        &self.execution_settings
    }

    /// Argument values as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

impl From<Map<String, Value>> for KernelArguments {
    fn from(values: Map<String, Value>) -> Self {
        Self {
            values,
            execution_settings: HashMap::new(),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Simple type name: string, number, integer, boolean, array, object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Full JSON schema, used verbatim when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl ParameterMetadata {
    pub fn required(
        name: impl Into<String>,
        type_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            type_name: Some(type_name.into()),
            required: true,
            default: None,
            schema: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        type_name: impl Into<String>,
        default: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            type_name: Some(type_name.into()),
            required: false,
            default,
            schema: None,
        }
    }

    /// JSON schema for this parameter in a tool definition.
    pub fn json_schema(&self) -> Value {
        let mut schema = match &self.schema {
            Some(schema) => schema.clone(),
            None => type_to_json_schema(self.type_name.as_deref().unwrap_or("string")),
        };
        if let Some(obj) = schema.as_object_mut() {
            if !self.description.is_empty() && !obj.contains_key("description") {
                obj.insert("description".into(), Value::String(self.description.clone()));
            }
        }
        schema
    }
}

fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    json!({ "type": json_type })
}

/// Declared return value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReturnMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Immutable description of a registered function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub plugin_name: String,
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterMetadata>,
    pub return_parameter: ReturnMetadata,
    pub is_prompt: bool,
    /// Calling this function ends the auto-invoke loop
    #[serde(default)]
    pub terminates: bool,
}

impl FunctionMetadata {
    pub fn fully_qualified_name(&self) -> String {
        format!("{}{}{}", self.plugin_name, FQN_SEPARATOR, self.name)
    }
}

/// Execution body of a function.
#[derive(Clone)]
pub enum FunctionKind {
    Prompt {
        template: String,
        /// Execution settings keyed by service id
        execution_settings: HashMap<String, PromptExecutionSettings>,
    },
    Native {
        handler: NativeHandler,
        stream_handler: Option<NativeStreamHandler>,
    },
}

impl fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionKind::Prompt {
                template,
                execution_settings,
            } => f
                .debug_struct("Prompt")
                .field("template", template)
                .field("execution_settings", execution_settings)
                .finish(),
            FunctionKind::Native { stream_handler, .. } => f
                .debug_struct("Native")
                .field("streaming", &stream_handler.is_some())
                .finish_non_exhaustive(),
        }
    }
}

/// A registered function: metadata plus execution body.
#[derive(Debug, Clone)]
pub struct KernelFunction {
    metadata: FunctionMetadata,
    kind: FunctionKind,
}

impl KernelFunction {
    pub fn metadata(&self) -> &FunctionMetadata {
        &self.metadata
    }

    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    pub fn plugin_name(&self) -> &str {
        &self.metadata.plugin_name
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn description(&self) -> &str {
        &self.metadata.description
    }

    pub fn parameters(&self) -> &[ParameterMetadata] {
        &self.metadata.parameters
    }

    pub fn is_prompt(&self) -> bool {
        self.metadata.is_prompt
    }

    pub fn fully_qualified_name(&self) -> String {
        self.metadata.fully_qualified_name()
    }

    /// Execution settings declared on a prompt function, keyed by service id.
    pub fn execution_settings(&self) -> Option<&HashMap<String, PromptExecutionSettings>> {
        match &self.kind {
            FunctionKind::Prompt {
                execution_settings, ..
            } => Some(execution_settings),
            FunctionKind::Native { .. } => None,
        }
    }

    /// Number of parameters the model must supply.
    pub fn required_parameter_count(&self) -> usize {
        self.metadata
            .parameters
            .iter()
            .filter(|p| p.required && p.default.is_none())
            .count()
    }

    /// Collect declared parameters from `arguments`, filling in defaults.
    ///
    /// Undeclared arguments pass through. A required parameter with no value
    /// and no default fails with [`Error::MissingArgument`].
    pub fn gather_arguments(&self, arguments: &KernelArguments) -> Result<KernelArguments> {
        let mut gathered = arguments.clone();
        for param in &self.metadata.parameters {
            if gathered.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    gathered.insert(param.name.clone(), default.clone());
                }
                None if param.required => {
                    return Err(Error::missing_argument(
                        self.fully_qualified_name(),
                        param.name.clone(),
                    ));
                }
                None => {}
            }
        }
        Ok(gathered)
    }

    /// OpenAI-style function-calling definition for this function.
    pub fn to_tool_definition(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.metadata.parameters {
            properties.insert(param.name.clone(), param.json_schema());
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": self.fully_qualified_name(),
                "description": self.metadata.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required
                }
            }
        })
    }
}

/// Outcome of invoking a function.
///
/// Failures are data: `error` is set, `value` is empty, and the error text is
/// also recorded under the `"error"` metadata key.
#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub function: FunctionMetadata,
    pub value: Option<Value>,
    /// Messages produced by a prompt function
    pub messages: Vec<ChatMessageContent>,
    pub metadata: HashMap<String, Value>,
    pub error: Option<Arc<Error>>,
}

impl FunctionResult {
    pub fn success(function: &FunctionMetadata, value: Value) -> Self {
        Self {
            function: function.clone(),
            value: Some(value),
            messages: Vec::new(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn failure(function: &FunctionMetadata, error: Error) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), Value::String(error.to_string()));
        Self {
            function: function.clone(),
            value: None,
            messages: Vec::new(),
            metadata,
            error: Some(Arc::new(error)),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_deref()
    }
}

impl fmt::Display for FunctionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(Value::String(s)) => f.write_str(s),
            Some(Value::Null) | None => Ok(()),
            Some(other) => write!(f, "{}", other),
        }
    }
}

/// Builder for [`KernelFunction`].
pub struct FunctionBuilder {
    plugin_name: String,
    name: String,
    description: String,
    parameters: Vec<ParameterMetadata>,
    return_parameter: ReturnMetadata,
    execution_settings: HashMap<String, PromptExecutionSettings>,
    stream_handler: Option<NativeStreamHandler>,
    terminates: bool,
}

impl FunctionBuilder {
    pub fn new(plugin_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            name: name.into(),
            description: String::new(),
            parameters: Vec::new(),
            return_parameter: ReturnMetadata::default(),
            execution_settings: HashMap::new(),
            stream_handler: None,
            terminates: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a required parameter.
    pub fn param(mut self, name: &str, type_name: &str, description: &str) -> Self {
        self.parameters
            .push(ParameterMetadata::required(name, type_name, description));
        self
    }

    /// Add an optional parameter with an optional default.
    pub fn optional_param(mut self, name: &str, type_name: &str, default: Option<Value>) -> Self {
        self.parameters
            .push(ParameterMetadata::optional(name, type_name, default));
        self
    }

    /// Add a fully specified parameter.
    pub fn parameter(mut self, parameter: ParameterMetadata) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn returns(mut self, type_name: &str, description: &str) -> Self {
        self.return_parameter = ReturnMetadata {
            type_name: Some(type_name.to_string()),
            description: description.to_string(),
        };
        self
    }

    /// Execution settings for a prompt function, keyed by their service id.
    pub fn execution_settings(mut self, settings: PromptExecutionSettings) -> Self {
        let key = settings
            .service_id
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVICE_ID.to_string());
        self.execution_settings.insert(key, settings);
        self
    }

    /// Mark the function as ending the auto-invoke loop when called.
    pub fn terminates_conversation(mut self) -> Self {
        self.terminates = true;
        self
    }

    /// Streaming body used by `invoke_stream` for native functions.
    pub fn stream_handler<F, S>(mut self, handler: F) -> Self
    where
        F: Fn(KernelArguments) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        self.stream_handler = Some(Arc::new(move |args| Box::pin(handler(args))));
        self
    }

    fn validate(&self) -> Result<()> {
        validate_name("plugin", &self.plugin_name)?;
        validate_name("function", &self.name)?;
        let mut seen = std::collections::HashSet::new();
        for param in &self.parameters {
            if param.name.is_empty() {
                return Err(Error::invalid_input("parameter name cannot be empty"));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(Error::invalid_input(format!(
                    "duplicate parameter '{}' on {}{}{}",
                    param.name, self.plugin_name, FQN_SEPARATOR, self.name
                )));
            }
        }
        Ok(())
    }

    fn metadata(self, is_prompt: bool) -> (FunctionMetadata, Option<NativeStreamHandler>) {
        (
            FunctionMetadata {
                plugin_name: self.plugin_name,
                name: self.name,
                description: self.description,
                parameters: self.parameters,
                return_parameter: self.return_parameter,
                is_prompt,
                terminates: self.terminates,
            },
            self.stream_handler,
        )
    }

    /// Finish as a native function.
    pub fn build<F, Fut>(self, handler: F) -> Result<KernelFunction>
    where
        F: Fn(KernelArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.validate()?;
        let (metadata, stream_handler) = self.metadata(false);
        Ok(KernelFunction {
            metadata,
            kind: FunctionKind::Native {
                handler: Arc::new(move |args| Box::pin(handler(args))),
                stream_handler,
            },
        })
    }

    /// Finish as a prompt function rendering `template`.
    pub fn prompt(self, template: impl Into<String>) -> Result<KernelFunction> {
        self.validate()?;
        let execution_settings = self.execution_settings.clone();
        let (metadata, _) = self.metadata(true);
        Ok(KernelFunction {
            metadata,
            kind: FunctionKind::Prompt {
                template: template.into(),
                execution_settings,
            },
        })
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_input(format!("{} name cannot be empty", what)));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::invalid_input(format!(
            "{} name '{}' may only contain ASCII letters, digits and underscores",
            what, name
        )));
    }
    Ok(())
}

/// Start building a function in `plugin`.
pub fn function(plugin_name: impl Into<String>, name: impl Into<String>) -> FunctionBuilder {
    FunctionBuilder::new(plugin_name, name)
}
