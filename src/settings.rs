//! Prompt execution settings and function-choice behavior
//!
//! [`PromptExecutionSettings`] carries the per-request knobs sent to a
//! completion service. Its [`FunctionChoiceBehavior`] decides which kernel
//! functions are offered to the model as tools, whether the model may, must,
//! or must not call them, and how many automatic invoke-and-resend rounds the
//! orchestration loop may run.
//!
//! ```rust
//! use open_kernel::{FunctionChoiceBehavior, PromptExecutionSettings};
//!
//! let settings = PromptExecutionSettings::builder()
//!     .temperature(0.2)
//!     .number_of_responses(3)
//!     .function_choice_behavior(FunctionChoiceBehavior::auto(true))
//!     .build()
//!     .unwrap();
//!
//! // Auto-invoke is undefined for several candidates, so validation clamps it
//! assert_eq!(settings.number_of_responses, 1);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Service id used when settings do not name one.
pub const DEFAULT_SERVICE_ID: &str = "default";

/// Default ceiling on automatic invoke-and-resend rounds.
pub const DEFAULT_MAX_AUTO_INVOKE_ATTEMPTS: u32 = 5;

/// Upper bound on candidate completions per request.
pub const MAX_NUMBER_OF_RESPONSES: u32 = 128;

/// How the model may use the offered functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionChoiceType {
    /// The model decides whether to call functions
    #[default]
    Auto,
    /// Functions are described but the model must not call them
    #[serde(rename = "none")]
    NoneInvoke,
    /// The model must call at least one function
    Required,
}

impl FunctionChoiceType {
    /// Value for the `tool_choice` request field.
    pub fn as_tool_choice(&self) -> &'static str {
        match self {
            FunctionChoiceType::Auto => "auto",
            FunctionChoiceType::NoneInvoke => "none",
            FunctionChoiceType::Required => "required",
        }
    }
}

/// Include/exclude filters over plugin names and fully qualified function names.
///
/// A function passes when every non-empty include list contains it and no
/// exclude list does. Exclusion therefore always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_plugins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_plugins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_functions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_functions: Vec<String>,
}

impl FunctionFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.included_plugins.push(plugin.into());
        self
    }

    pub fn exclude_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.excluded_plugins.push(plugin.into());
        self
    }

    pub fn include_function(mut self, fqn: impl Into<String>) -> Self {
        self.included_functions.push(fqn.into());
        self
    }

    pub fn exclude_function(mut self, fqn: impl Into<String>) -> Self {
        self.excluded_functions.push(fqn.into());
        self
    }

    /// Whether the function `fqn` in `plugin` passes the filters.
    pub fn allows(&self, plugin: &str, fqn: &str) -> bool {
        if self.excluded_plugins.iter().any(|p| p == plugin)
            || self.excluded_functions.iter().any(|f| f == fqn)
        {
            return false;
        }
        if !self.included_plugins.is_empty() && !self.included_plugins.iter().any(|p| p == plugin)
        {
            return false;
        }
        if !self.included_functions.is_empty()
            && !self.included_functions.iter().any(|f| f == fqn)
        {
            return false;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.included_plugins.is_empty()
            && self.excluded_plugins.is_empty()
            && self.included_functions.is_empty()
            && self.excluded_functions.is_empty()
    }
}

/// Policy for offering kernel functions to the model and auto-invoking them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionChoiceBehavior {
    #[serde(rename = "type")]
    pub choice_type: FunctionChoiceType,
    #[serde(default)]
    pub filters: FunctionFilters,
    /// Explicit allow-list of fully qualified names; empty means "all that pass the filters"
    #[serde(default, rename = "functions", skip_serializing_if = "Vec::is_empty")]
    pub function_fully_qualified_names: Vec<String>,
    /// When false, no kernel function is offered at all
    #[serde(default = "default_true")]
    pub enable_kernel_functions: bool,
    #[serde(default = "default_max_attempts")]
    maximum_auto_invoke_attempts: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_AUTO_INVOKE_ATTEMPTS
}

impl Default for FunctionChoiceBehavior {
    fn default() -> Self {
        Self::auto(true)
    }
}

impl FunctionChoiceBehavior {
    fn with_type(choice_type: FunctionChoiceType, max_attempts: u32) -> Self {
        Self {
            choice_type,
            filters: FunctionFilters::default(),
            function_fully_qualified_names: Vec::new(),
            enable_kernel_functions: true,
            maximum_auto_invoke_attempts: max_attempts,
        }
    }

    /// The model chooses freely. With `auto_invoke`, calls are executed automatically.
    pub fn auto(auto_invoke: bool) -> Self {
        let attempts = if auto_invoke {
            DEFAULT_MAX_AUTO_INVOKE_ATTEMPTS
        } else {
            0
        };
        Self::with_type(FunctionChoiceType::Auto, attempts)
    }

    /// The model must call a function. Auto-invoke runs at most one round.
    pub fn required(auto_invoke: bool) -> Self {
        Self::with_type(FunctionChoiceType::Required, u32::from(auto_invoke))
    }

    /// Functions are described to the model, which must not call them.
    pub fn none_invoke() -> Self {
        Self::with_type(FunctionChoiceType::NoneInvoke, 0)
    }

    pub fn with_filters(mut self, filters: FunctionFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.function_fully_qualified_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_maximum_auto_invoke_attempts(mut self, attempts: u32) -> Self {
        self.maximum_auto_invoke_attempts = attempts;
        self.clamp();
        self
    }

    pub fn disable_kernel_functions(mut self) -> Self {
        self.enable_kernel_functions = false;
        self
    }

    pub fn maximum_auto_invoke_attempts(&self) -> u32 {
        self.maximum_auto_invoke_attempts
    }

    /// Whether the orchestration loop executes tool calls itself.
    pub fn auto_invoke_kernel_functions(&self) -> bool {
        self.maximum_auto_invoke_attempts > 0
    }

    /// Stop auto-invoking. Used once a required call has been consumed.
    pub fn disable_auto_invoke(&mut self) {
        self.maximum_auto_invoke_attempts = 0;
    }

    fn clamp(&mut self) {
        if self.choice_type == FunctionChoiceType::Required {
            self.maximum_auto_invoke_attempts = self.maximum_auto_invoke_attempts.min(1);
        }
        if self.choice_type == FunctionChoiceType::NoneInvoke {
            self.maximum_auto_invoke_attempts = 0;
        }
    }

    /// Build from a JSON object.
    ///
    /// ```json
    /// {"type": "auto", "auto_invoke": true, "maximum_auto_invoke_attempts": 3,
    ///  "filters": {"excluded_plugins": ["admin"]}, "functions": ["math-Add"]}
    /// ```
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::invalid_settings("function choice behavior must be an object"))?;

        let choice_type = match obj.get("type").and_then(Value::as_str).unwrap_or("auto") {
            "auto" => FunctionChoiceType::Auto,
            "none" => FunctionChoiceType::NoneInvoke,
            "required" => FunctionChoiceType::Required,
            other => {
                return Err(Error::invalid_settings(format!(
                    "unknown function choice type: {}",
                    other
                )));
            }
        };
        let auto_invoke = obj
            .get("auto_invoke")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut behavior = match choice_type {
            FunctionChoiceType::Auto => Self::auto(auto_invoke),
            FunctionChoiceType::Required => Self::required(auto_invoke),
            FunctionChoiceType::NoneInvoke => Self::none_invoke(),
        };

        if let Some(filters) = obj.get("filters") {
            behavior.filters = serde_json::from_value(filters.clone())
                .map_err(|e| Error::invalid_settings(format!("invalid filters: {}", e)))?;
        }
        if let Some(functions) = obj.get("functions") {
            behavior.function_fully_qualified_names = serde_json::from_value(functions.clone())
                .map_err(|e| Error::invalid_settings(format!("invalid functions: {}", e)))?;
        }
        if auto_invoke {
            if let Some(n) = obj.get("maximum_auto_invoke_attempts").and_then(Value::as_u64) {
                behavior.maximum_auto_invoke_attempts = u32::try_from(n).unwrap_or(u32::MAX);
            }
        }
        behavior.clamp();
        Ok(behavior)
    }
}

/// Per-request settings for a completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptExecutionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_number_of_responses")]
    pub number_of_responses: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_choice_behavior: Option<FunctionChoiceBehavior>,
    /// Tool definitions offered on the next request, written by the orchestration loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// `tool_choice` for the next request, written by the orchestration loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    /// Provider-specific extras passed through untouched
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extension_data: HashMap<String, Value>,
}

fn default_number_of_responses() -> u32 {
    1
}

impl Default for PromptExecutionSettings {
    fn default() -> Self {
        Self {
            service_id: None,
            ai_model_id: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            number_of_responses: 1,
            stop: Vec::new(),
            function_choice_behavior: None,
            tools: None,
            tool_choice: None,
            extension_data: HashMap::new(),
        }
    }
}

impl PromptExecutionSettings {
    pub fn builder() -> PromptExecutionSettingsBuilder {
        PromptExecutionSettingsBuilder::default()
    }

    /// Settings targeting one service id.
    pub fn for_service(service_id: impl Into<String>) -> Self {
        Self {
            service_id: Some(service_id.into()),
            ..Self::default()
        }
    }

    /// Requested service id, or [`DEFAULT_SERVICE_ID`].
    pub fn service_id(&self) -> &str {
        self.service_id.as_deref().unwrap_or(DEFAULT_SERVICE_ID)
    }

    /// Whether the orchestration loop should execute tool calls itself.
    pub fn auto_invoke_enabled(&self) -> bool {
        self.function_choice_behavior
            .as_ref()
            .is_some_and(FunctionChoiceBehavior::auto_invoke_kernel_functions)
    }

    /// Check ranges and apply clamps.
    ///
    /// With auto-invoke enabled, `number_of_responses` is forced to 1.
    pub fn validate(&mut self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::invalid_settings(format!(
                    "temperature must be between 0.0 and 2.0, got {}",
                    t
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::invalid_settings(format!(
                    "top_p must be between 0.0 and 1.0, got {}",
                    p
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(Error::invalid_settings("max_tokens must be greater than 0"));
        }
        if !(1..=MAX_NUMBER_OF_RESPONSES).contains(&self.number_of_responses) {
            return Err(Error::invalid_settings(format!(
                "number_of_responses must be between 1 and {}, got {}",
                MAX_NUMBER_OF_RESPONSES, self.number_of_responses
            )));
        }
        if let Some(behavior) = self.function_choice_behavior.as_mut() {
            behavior.clamp();
        }
        if self.auto_invoke_enabled() && self.number_of_responses > 1 {
            log::debug!(
                "Auto-invoke is enabled; forcing number_of_responses from {} to 1",
                self.number_of_responses
            );
            self.number_of_responses = 1;
        }
        Ok(())
    }

    /// Settings for the final tool-free request after the attempt ceiling.
    pub fn without_tools(&self) -> Self {
        let mut settings = self.clone();
        if let Some(behavior) = settings.function_choice_behavior.as_mut() {
            behavior.disable_auto_invoke();
        }
        settings.tools = None;
        settings.tool_choice = None;
        settings
    }
}

/// Builder for [`PromptExecutionSettings`].
#[derive(Debug, Default)]
pub struct PromptExecutionSettingsBuilder {
    service_id: Option<String>,
    ai_model_id: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
    number_of_responses: Option<u32>,
    stop: Vec<String>,
    function_choice_behavior: Option<FunctionChoiceBehavior>,
    extension_data: HashMap<String, Value>,
}

impl PromptExecutionSettingsBuilder {
    pub fn service_id(mut self, id: impl Into<String>) -> Self {
        self.service_id = Some(id.into());
        self
    }

    pub fn ai_model_id(mut self, model: impl Into<String>) -> Self {
        self.ai_model_id = Some(model.into());
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn number_of_responses(mut self, n: u32) -> Self {
        self.number_of_responses = Some(n);
        self
    }

    pub fn stop(mut self, sequence: impl Into<String>) -> Self {
        self.stop.push(sequence.into());
        self
    }

    pub fn function_choice_behavior(mut self, behavior: FunctionChoiceBehavior) -> Self {
        self.function_choice_behavior = Some(behavior);
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extension_data.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<PromptExecutionSettings> {
        let mut settings = PromptExecutionSettings {
            service_id: self.service_id,
            ai_model_id: self.ai_model_id,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            number_of_responses: self.number_of_responses.unwrap_or(1),
            stop: self.stop,
            function_choice_behavior: self.function_choice_behavior,
            tools: None,
            tool_choice: None,
            extension_data: self.extension_data,
        };
        settings.validate()?;
        Ok(settings)
    }
}
