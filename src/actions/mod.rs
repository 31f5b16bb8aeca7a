//! Automation action registry
//!
//! Automation rules (owned by an external rules engine) trigger actions by
//! name. Plugins contribute actions through their capability surface; every
//! action is tagged with its owner so a plugin's actions disappear together
//! when it unloads.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde::Serialize;

/// Result of one action execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    /// Successful result carrying `data`
    #[must_use]
    pub const fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed result carrying an error message
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Type-erased, already error-wrapped action handler
pub type ActionHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Public view of a registered action
#[derive(Debug, Clone, Serialize)]
pub struct ActionInfo {
    pub name: String,
    pub owner: String,
}

struct RegisteredAction {
    owner: String,
    handler: ActionHandler,
}

/// Registry of named automation actions
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, RegisteredAction>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under `name`
    ///
    /// A name already held by another owner is refused and the first
    /// registration keeps answering. The same owner registering again
    /// replaces its own handler.
    pub fn register(&self, owner: &str, name: &str, handler: ActionHandler) -> bool {
        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = actions.get(name).filter(|a| a.owner != owner) {
            tracing::warn!(
                action = %name,
                plugin_id = %owner,
                held_by = %existing.owner,
                "automation action name already taken by another plugin"
            );
            return false;
        }

        actions.insert(
            name.to_string(),
            RegisteredAction {
                owner: owner.to_string(),
                handler,
            },
        );
        true
    }

    /// Remove every action `owner` registered
    ///
    /// Returns the number of actions removed.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);
        let before = actions.len();
        actions.retain(|_, a| a.owner != owner);
        before - actions.len()
    }

    /// Run an action by name
    pub async fn execute(&self, name: &str, params: serde_json::Value) -> ActionResult {
        let handler = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|a| Arc::clone(&a.handler));

        match handler {
            Some(handler) => handler(params).await,
            None => ActionResult::failed(format!("unknown action: {name}")),
        }
    }

    /// Registered actions, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<ActionInfo> {
        let mut list: Vec<ActionInfo> = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, a)| ActionInfo {
                name: name.clone(),
                owner: a.owner.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Number of registered actions
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no actions are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
