//! Task handler registry.
//!
//! Task kinds are plain strings matched against this table; the coordinator
//! never knows concrete kinds, it only matches advertised type names.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a handler. `retryable` tells the coordinator whether
/// another attempt is worthwhile.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// A transient fault; the coordinator may retry elsewhere.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent fault; retrying cannot help.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// One task kind. Handlers run on a blocking thread, so plain blocking I/O
/// is fine here.
pub trait TaskHandler: Send + Sync {
    fn run(&self, payload: &Value) -> Result<Value, HandlerError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Value) -> Result<Value, HandlerError> + Send + Sync,
{
    fn run(&self, payload: &Value) -> Result<Value, HandlerError> {
        self(payload)
    }
}

/// task_type -> handler table advertised at registration.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("sleep", Arc::new(SleepHandler));
        registry
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn register_fn<F>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(task_type, Arc::new(handler));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Advertised in the `register` message.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Returns `{ "echoed": <payload.msg> }`.
struct EchoHandler;

impl TaskHandler for EchoHandler {
    fn run(&self, payload: &Value) -> Result<Value, HandlerError> {
        let msg = payload.get("msg").cloned().unwrap_or(Value::Null);
        Ok(json!({ "echoed": msg }))
    }
}

/// Sleeps `payload.ms` milliseconds; handy for load and timeout testing.
struct SleepHandler;

impl TaskHandler for SleepHandler {
    fn run(&self, payload: &Value) -> Result<Value, HandlerError> {
        let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!({ "slept_ms": ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_advertised_sorted() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.task_types(), vec!["echo", "sleep"]);
    }

    #[test]
    fn test_echo_handler_roundtrips_msg() {
        let registry = HandlerRegistry::with_builtins();
        let handler = registry.get("echo").unwrap();
        let out = handler.run(&json!({ "msg": "hi" })).unwrap();
        assert_eq!(out, json!({ "echoed": "hi" }));
    }

    #[test]
    fn test_echo_handler_missing_msg() {
        let registry = HandlerRegistry::with_builtins();
        let handler = registry.get("echo").unwrap();
        let out = handler.run(&json!({})).unwrap();
        assert_eq!(out, json!({ "echoed": null }));
    }

    #[test]
    fn test_unknown_type_absent() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.get("transcode").is_none());
    }

    #[test]
    fn test_register_fn_closure() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("double", |payload: &Value| {
            let n = payload.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({ "doubled": n * 2 }))
        });
        let out = registry.get("double").unwrap().run(&json!({ "n": 21 })).unwrap();
        assert_eq!(out, json!({ "doubled": 42 }));
    }

    #[test]
    fn test_handler_error_classes() {
        let transient = HandlerError::transient("net", "connection reset");
        assert!(transient.retryable);
        let fatal = HandlerError::fatal("schema", "bad payload");
        assert!(!fatal.retryable);
    }
}
