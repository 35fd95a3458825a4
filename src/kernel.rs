//! The kernel: function registry, service registry, and resolver
//!
//! A [`Kernel`] is an explicit object the application builds once and passes
//! by reference to the invocation engine and the orchestration loop. It owns:
//!
//! - the registered [`KernelFunction`]s, unique by `plugin-function`
//! - the registered [`ChatCompletionService`]s and which one is the default
//! - the [`PromptTemplateRenderer`] used by prompt functions
//! - the [`FunctionInvocationFilters`] applied during auto-invocation
//!
//! Registration needs `&mut self`; everything else takes `&self`, so a built
//! kernel can be shared across concurrent invocations.
//!
//! ```rust
//! use open_kernel::{Kernel, FunctionFilters, function};
//! use serde_json::json;
//!
//! let mut kernel = Kernel::new();
//! kernel
//!     .register(function("math", "Add").build(|_| async { Ok(json!(0)) }).unwrap())
//!     .unwrap();
//!
//! let add = kernel.resolve("math-Add").unwrap();
//! assert_eq!(add.name(), "Add");
//!
//! let offered = kernel.list_for_choice(&FunctionFilters::new().exclude_plugin("math"));
//! assert!(offered.is_empty());
//! ```

use crate::filters::FunctionInvocationFilters;
use crate::functions::{KernelArguments, KernelFunction};
use crate::services::{BasicTemplateRenderer, ChatCompletionService, PromptTemplateRenderer};
use crate::settings::{
    DEFAULT_SERVICE_ID, FunctionChoiceBehavior, FunctionFilters, PromptExecutionSettings,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub struct Kernel {
    /// Registration order is the order tools are offered in
    functions: Vec<Arc<KernelFunction>>,
    function_index: HashMap<String, usize>,
    services: Vec<Arc<dyn ChatCompletionService>>,
    default_service_id: Option<String>,
    renderer: Arc<dyn PromptTemplateRenderer>,
    filters: FunctionInvocationFilters,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// An empty kernel using [`BasicTemplateRenderer`].
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            function_index: HashMap::new(),
            services: Vec::new(),
            default_service_id: None,
            renderer: Arc::new(BasicTemplateRenderer::new()),
            filters: FunctionInvocationFilters::default(),
        }
    }

    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Register a function. Fails with [`Error::DuplicateFunction`] if its
    /// fully qualified name is taken.
    pub fn register(&mut self, function: KernelFunction) -> Result<()> {
        let fqn = function.fully_qualified_name();
        if self.function_index.contains_key(&fqn) {
            return Err(Error::duplicate_function(fqn));
        }
        log::debug!(
            "Registering {} function {}",
            if function.is_prompt() { "prompt" } else { "native" },
            fqn
        );
        self.function_index.insert(fqn, self.functions.len());
        self.functions.push(Arc::new(function));
        Ok(())
    }

    /// Register several functions, stopping at the first failure.
    pub fn register_plugin(
        &mut self,
        functions: impl IntoIterator<Item = KernelFunction>,
    ) -> Result<()> {
        for function in functions {
            self.register(function)?;
        }
        Ok(())
    }

    /// Look up a function by `plugin-function`.
    pub fn resolve(&self, fully_qualified_name: &str) -> Result<Arc<KernelFunction>> {
        self.function_index
            .get(fully_qualified_name)
            .map(|&idx| Arc::clone(&self.functions[idx]))
            .ok_or_else(|| Error::function_not_found(fully_qualified_name))
    }

    /// Look up a function by plugin and function name.
    pub fn get_function(&self, plugin_name: &str, function_name: &str) -> Result<Arc<KernelFunction>> {
        self.resolve(&format!(
            "{}{}{}",
            plugin_name,
            crate::contents::FQN_SEPARATOR,
            function_name
        ))
    }

    /// All registered functions, in registration order.
    pub fn functions(&self) -> impl Iterator<Item = &Arc<KernelFunction>> {
        self.functions.iter()
    }

    /// Distinct plugin names, in first-registration order.
    pub fn plugin_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for f in &self.functions {
            if !names.contains(&f.plugin_name()) {
                names.push(f.plugin_name());
            }
        }
        names
    }

    /// Functions passing `filters`, in registration order.
    pub fn list_for_choice(&self, filters: &FunctionFilters) -> Vec<Arc<KernelFunction>> {
        self.functions
            .iter()
            .filter(|f| filters.allows(f.plugin_name(), &f.fully_qualified_name()))
            .cloned()
            .collect()
    }

    /// Functions a [`FunctionChoiceBehavior`] offers to the model.
    ///
    /// An explicit allow-list must name registered functions, otherwise
    /// [`Error::InvalidExecutionSettings`]. Filters apply on top of it.
    pub fn functions_for_behavior(
        &self,
        behavior: &FunctionChoiceBehavior,
    ) -> Result<Vec<Arc<KernelFunction>>> {
        if !behavior.enable_kernel_functions {
            return Ok(Vec::new());
        }
        if behavior.function_fully_qualified_names.is_empty() {
            return Ok(self.list_for_choice(&behavior.filters));
        }

        let mut selected = Vec::with_capacity(behavior.function_fully_qualified_names.len());
        for name in &behavior.function_fully_qualified_names {
            let function = self.resolve(name).map_err(|_| {
                Error::invalid_settings(format!(
                    "function {} named in function choice behavior is not registered",
                    name
                ))
            })?;
            if behavior
                .filters
                .allows(function.plugin_name(), &function.fully_qualified_name())
            {
                selected.push(function);
            }
        }
        Ok(selected)
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Register a completion service under its own id.
    ///
    /// The first service registered becomes the default until
    /// [`set_default_service`](Self::set_default_service) says otherwise.
    pub fn add_service(&mut self, service: Arc<dyn ChatCompletionService>) -> Result<()> {
        let id = service.service_id().to_string();
        if self.services.iter().any(|s| s.service_id() == id) {
            return Err(Error::config(format!(
                "a service with id '{}' is already registered",
                id
            )));
        }
        log::debug!("Registering completion service {}", id);
        self.services.push(service);
        Ok(())
    }

    pub fn set_default_service(&mut self, service_id: &str) -> Result<()> {
        self.get_service(service_id)?;
        self.default_service_id = Some(service_id.to_string());
        Ok(())
    }

    /// Service registered under `service_id`.
    pub fn get_service(&self, service_id: &str) -> Result<Arc<dyn ChatCompletionService>> {
        self.services
            .iter()
            .find(|s| s.service_id() == service_id)
            .cloned()
            .ok_or_else(|| Error::service_not_found(service_id))
    }

    /// The default service: explicitly chosen, a service registered as
    /// `"default"`, or else the first one registered.
    pub fn default_service(&self) -> Result<Arc<dyn ChatCompletionService>> {
        if let Some(id) = &self.default_service_id {
            return self.get_service(id);
        }
        self.get_service(DEFAULT_SERVICE_ID)
            .or_else(|_| {
                self.services
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::service_not_found(DEFAULT_SERVICE_ID))
            })
    }

    /// Service for a set of execution settings.
    ///
    /// A specific service id must be registered; no id (or `"default"`)
    /// selects the default service.
    pub fn select_service(
        &self,
        settings: &PromptExecutionSettings,
    ) -> Result<Arc<dyn ChatCompletionService>> {
        match settings.service_id.as_deref() {
            Some(id) if id != DEFAULT_SERVICE_ID => self.get_service(id),
            _ => self.default_service(),
        }
    }

    /// Service and settings for invoking a prompt function.
    ///
    /// Settings come from the arguments when they carry any, else from the
    /// function. Specific service ids are tried first, in sorted order, and
    /// the first registered one wins. Settings keyed `"default"` fall back
    /// to the default service.
    pub fn select_ai_service(
        &self,
        function: &KernelFunction,
        arguments: &KernelArguments,
    ) -> Result<(Arc<dyn ChatCompletionService>, PromptExecutionSettings)> {
        let candidates = if !arguments.execution_settings().is_empty() {
            Some(arguments.execution_settings())
        } else {
            function.execution_settings().filter(|s| !s.is_empty())
        };

        let Some(candidates) = candidates else {
            return Ok((self.default_service()?, PromptExecutionSettings::default()));
        };

        let mut specific: Vec<&String> = candidates
            .keys()
            .filter(|id| id.as_str() != DEFAULT_SERVICE_ID)
            .collect();
        specific.sort();
        for id in specific {
            if let Ok(service) = self.get_service(id) {
                return Ok((service, candidates[id].clone()));
            }
        }

        if let Some(settings) = candidates.get(DEFAULT_SERVICE_ID) {
            return Ok((self.default_service()?, settings.clone()));
        }

        let mut requested: Vec<&str> = candidates.keys().map(String::as_str).collect();
        requested.sort();
        Err(Error::service_not_found(requested.join(", ")))
    }

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------

    pub fn renderer(&self) -> &Arc<dyn PromptTemplateRenderer> {
        &self.renderer
    }

    pub fn set_renderer(&mut self, renderer: Arc<dyn PromptTemplateRenderer>) {
        self.renderer = renderer;
    }

    pub fn filters(&self) -> &FunctionInvocationFilters {
        &self.filters
    }

    pub fn set_filters(&mut self, filters: FunctionInvocationFilters) {
        self.filters = filters;
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let functions: Vec<String> = self
            .functions
            .iter()
            .map(|f| f.fully_qualified_name())
            .collect();
        let services: Vec<&str> = self.services.iter().map(|s| s.service_id()).collect();
        f.debug_struct("Kernel")
            .field("functions", &functions)
            .field("services", &services)
            .field("default_service_id", &self.default_service_id)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Kernel`].
#[derive(Default)]
pub struct KernelBuilder {
    functions: Vec<KernelFunction>,
    services: Vec<Arc<dyn ChatCompletionService>>,
    default_service_id: Option<String>,
    renderer: Option<Arc<dyn PromptTemplateRenderer>>,
    filters: Option<FunctionInvocationFilters>,
}

impl KernelBuilder {
    pub fn service(mut self, service: Arc<dyn ChatCompletionService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn default_service(mut self, service_id: impl Into<String>) -> Self {
        self.default_service_id = Some(service_id.into());
        self
    }

    pub fn function(mut self, function: KernelFunction) -> Self {
        self.functions.push(function);
        self
    }

    pub fn functions(mut self, functions: impl IntoIterator<Item = KernelFunction>) -> Self {
        self.functions.extend(functions);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn PromptTemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn filters(mut self, filters: FunctionInvocationFilters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn build(self) -> Result<Kernel> {
        let mut kernel = Kernel::new();
        for service in self.services {
            kernel.add_service(service)?;
        }
        if let Some(id) = self.default_service_id {
            kernel.set_default_service(&id)?;
        }
        kernel.register_plugin(self.functions)?;
        if let Some(renderer) = self.renderer {
            kernel.set_renderer(renderer);
        }
        if let Some(filters) = self.filters {
            kernel.set_filters(filters);
        }
        Ok(kernel)
    }
}
