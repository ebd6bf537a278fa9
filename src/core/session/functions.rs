//! Function execution bridge.
//!
//! The backend asks for functions by name; the [`FunctionBridge`] resolves the
//! name against a [`FunctionRegistry`], runs the implementation on its own
//! task and produces exactly one [`FunctionResult`] per call ID. Failures,
//! panics and timeouts all become failed results, so a misbehaving function
//! never takes the session down.

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::{Value, json};
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::base::{FunctionCallRequest, SessionError};
use super::protocol::ToolDef;

/// Async function implementation: JSON arguments in, JSON payload or error
/// message out.
pub type FunctionHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync,
>;

/// Wrap an async closure as a [`FunctionHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FunctionHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(
        move |args: Value| -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> {
            Box::pin(f(args))
        },
    )
}

/// Description of a function advertised to the backend as a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    fn to_tool(&self) -> ToolDef {
        ToolDef {
            tool_type: "function".to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Clone)]
struct RegisteredFunction {
    handler: FunctionHandler,
    definition: Option<FunctionDefinition>,
}

// =============================================================================
// Registry
// =============================================================================

/// Name-indexed set of callable functions.
///
/// Several registries supplied by different collaborators are combined with
/// [`FunctionRegistry::merge`] into one flat namespace.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, RegisteredFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function without a tool definition.
    pub fn register(&self, name: &str, handler: FunctionHandler) {
        self.insert(name.to_string(), handler, None);
    }

    /// Register a function and advertise it to the backend.
    pub fn register_with_definition(&self, definition: FunctionDefinition, handler: FunctionHandler) {
        self.insert(definition.name.clone(), handler, Some(definition));
    }

    fn insert(&self, name: String, handler: FunctionHandler, definition: Option<FunctionDefinition>) {
        if self
            .functions
            .insert(name.clone(), RegisteredFunction { handler, definition })
            .is_some()
        {
            warn!(function = %name, "Function registered twice, keeping the latest");
        } else {
            debug!(function = %name, "Registered function");
        }
    }

    /// Copy every entry of `other` into this registry. On a name collision
    /// the entry from `other` wins.
    pub fn merge(&self, other: &FunctionRegistry) {
        for entry in other.functions.iter() {
            let (name, function) = entry.pair();
            if self
                .functions
                .insert(name.clone(), function.clone())
                .is_some()
            {
                warn!(function = %name, "Function name collision while merging registries");
            }
        }
    }

    /// Build the union of several registries, later ones winning on collision.
    pub fn from_registries<'a>(registries: impl IntoIterator<Item = &'a FunctionRegistry>) -> Self {
        let combined = Self::new();
        for registry in registries {
            combined.merge(registry);
        }
        combined
    }

    pub fn get(&self, name: &str) -> Option<FunctionHandler> {
        self.functions.get(name).map(|f| f.handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Tool definitions for every function that has one, sorted by name.
    pub fn tool_definitions(&self) -> Vec<ToolDef> {
        let mut tools: Vec<ToolDef> = self
            .functions
            .iter()
            .filter_map(|e| e.value().definition.as_ref().map(FunctionDefinition::to_tool))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

// =============================================================================
// Results
// =============================================================================

/// Settled outcome of one function call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResult {
    pub call_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FunctionResult {
    pub fn ok(call_id: impl Into<String>, data: Value) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Output payload sent back to the backend.
    pub fn output(&self) -> Value {
        if self.success {
            json!({ "success": true, "data": self.data.clone().unwrap_or(Value::Null) })
        } else {
            json!({ "success": false, "error": self.error.clone().unwrap_or_default() })
        }
    }
}

/// What the bridge hands back to the controller.
#[derive(Debug, Clone)]
pub struct FunctionOutcome {
    pub name: String,
    pub result: FunctionResult,
    /// Non-fatal problem to surface through the error callbacks
    pub error: Option<SessionError>,
    /// The end-session function completed successfully
    pub end_session_confirmed: bool,
}

// =============================================================================
// Bridge
// =============================================================================

/// Executes function-call requests against a registry.
#[derive(Clone)]
pub struct FunctionBridge {
    registry: FunctionRegistry,
    end_session_function: String,
    timeout: Duration,
    seen_calls: Arc<DashSet<String>>,
}

impl FunctionBridge {
    pub fn new(
        registry: FunctionRegistry,
        end_session_function: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            end_session_function: end_session_function.into(),
            timeout,
            seen_calls: Arc::new(DashSet::new()),
        }
    }

    pub fn end_session_function(&self) -> &str {
        &self.end_session_function
    }

    /// Run one request to settlement.
    ///
    /// Returns `None` when a request with the same call ID was already
    /// accepted, so each call ID yields a single result.
    pub async fn execute(&self, request: FunctionCallRequest) -> Option<FunctionOutcome> {
        if !self.seen_calls.insert(request.call_id.clone()) {
            warn!(call_id = %request.call_id, function = %request.name, "Ignoring duplicate function call");
            return None;
        }

        info!(call_id = %request.call_id, function = %request.name, "Executing function call");

        let FunctionCallRequest {
            name,
            call_id,
            arguments,
            ..
        } = request;

        let Some(handler) = self.registry.get(&name) else {
            warn!(function = %name, "Function is not registered");
            return Some(FunctionOutcome {
                result: FunctionResult::failed(&call_id, format!("Unknown function: {name}")),
                error: Some(SessionError::UnknownFunction(name.clone())),
                end_session_confirmed: false,
                name,
            });
        };

        let result = match parse_arguments(&arguments) {
            Ok(args) => self.run(handler, &call_id, args).await,
            Err(e) => FunctionResult::failed(&call_id, e),
        };

        let error = if result.success {
            None
        } else {
            let message = result.error.as_deref().unwrap_or_default();
            warn!(call_id = %call_id, function = %name, error = message, "Function call failed");
            Some(SessionError::FunctionFailed(format!("{name}: {message}")))
        };

        let end_session_confirmed = result.success && name == self.end_session_function;
        Some(FunctionOutcome {
            name,
            result,
            error,
            end_session_confirmed,
        })
    }

    async fn run(&self, handler: FunctionHandler, call_id: &str, args: Value) -> FunctionResult {
        let mut task = tokio::spawn(handler(args));

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(data))) => FunctionResult::ok(call_id, data),
            Ok(Ok(Err(message))) => FunctionResult::failed(call_id, message),
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    format!("Function panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "Function task was cancelled".to_string()
                };
                FunctionResult::failed(call_id, message)
            }
            Err(_) => {
                task.abort();
                FunctionResult::failed(
                    call_id,
                    format!("Function timed out after {}ms", self.timeout.as_millis()),
                )
            }
        }
    }
}

fn parse_arguments(arguments: &str) -> Result<Value, String> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments).map_err(|e| format!("Invalid arguments: {e}"))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (non-string payload)".to_string()
    }
}
