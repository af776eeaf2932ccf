//! Automated action registry.
//!
//! Automation steps name actions by string; the engine resolves them
//! through an [`ActionRegistry`] supplied at construction. The
//! in-memory registry maps names to async handler closures.

use crate::model::context::VariableContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors produced while invoking automated actions.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    Unknown(String),

    #[error("action {action} failed: {message}")]
    Failed { action: String, message: String },
}

impl ActionError {
    /// Shorthand for a handler failure.
    pub fn failed(action: impl Into<String>, message: impl Into<String>) -> Self {
        ActionError::Failed {
            action: action.into(),
            message: message.into(),
        }
    }
}

/// Async handler invoked for one action. Receives the action's
/// parameters and a snapshot of the instance variables.
pub type ActionHandler = Arc<
    dyn Fn(Value, VariableContext) -> Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send>>
        + Send
        + Sync,
>;

/// Resolves action names to executable handlers.
#[async_trait]
pub trait ActionRegistry: Send + Sync {
    /// Invoke the named action. `Err` counts as a step failure and is
    /// subject to the step's retry policy.
    async fn invoke(
        &self,
        name: &str,
        params: &Value,
        ctx: &VariableContext,
    ) -> Result<Value, ActionError>;
}

/// Registry backed by an in-memory handler map.
#[derive(Default)]
pub struct InMemoryActionRegistry {
    handlers: RwLock<HashMap<String, ActionHandler>>,
}

impl InMemoryActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name, replacing any previous one.
    pub async fn register(&self, name: impl Into<String>, handler: ActionHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(name.into(), handler);
    }

    /// Register a handler that always succeeds with `Null`. Handy for
    /// wiring up graphs before real handlers exist.
    pub async fn register_noop(&self, name: impl Into<String>) {
        self.register(
            name,
            Arc::new(|_params, _ctx| Box::pin(async { Ok(Value::Null) })),
        )
        .await;
    }
}

#[async_trait]
impl ActionRegistry for InMemoryActionRegistry {
    async fn invoke(
        &self,
        name: &str,
        params: &Value,
        ctx: &VariableContext,
    ) -> Result<Value, ActionError> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(name).cloned()
        };
        match handler {
            Some(handler) => handler(params.clone(), ctx.clone()).await,
            None => Err(ActionError::Unknown(name.to_string())),
        }
    }
}
