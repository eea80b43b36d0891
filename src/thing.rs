//! Thing model seam.
//!
//! The broker routes operations to properties and actions but does not
//! author them: this module is the minimal trait boundary a concrete Thing
//! implementation plugs into, not a Thing-authoring framework. It exercises
//! every operation in the executor's dispatch table without reimplementing
//! the Thing/property/action registries the original Python source defines
//! in full.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BrokerError;

/// Arguments passed to an action invocation: positional `__args__` plus
/// keyword arguments, matching the split `action.external_call(*args,
/// **kwargs)` makes in the original source.
#[derive(Debug, Clone, Default)]
pub struct ActionArgs {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: HashMap<String, Value>,
}

/// A single readable/writable property on a Thing.
pub trait Property: Send + Sync {
    /// Current value.
    fn read(&self) -> Result<Value, BrokerError>;
    /// Replace the value.
    fn write(&self, value: Value) -> Result<(), BrokerError>;
    /// Remove the property, if deletion is meaningful for it.
    ///
    /// Most properties don't support deletion; the default mirrors the
    /// Python source raising `NotImplementedError` for `del prop`.
    fn delete(&self) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported("property does not support deletion".into()))
    }
}

/// A synchronous action on a Thing.
pub trait Action: Send + Sync {
    /// Run the action and return its result.
    fn invoke(&self, args: ActionArgs) -> Result<Value, BrokerError>;
}

/// An asynchronous action the Executor must await, matching "if the action
/// is a coroutine, await it" in the original dispatch.
#[async_trait]
pub trait AsyncAction: Send + Sync {
    /// Run the action and return its result.
    async fn invoke(&self, args: ActionArgs) -> Result<Value, BrokerError>;
}

/// A registered action, either synchronous or asynchronous.
pub enum RegisteredAction {
    /// Runs to completion without yielding.
    Sync(Arc<dyn Action>),
    /// Must be awaited by the Executor.
    Async(Arc<dyn AsyncAction>),
}

/// Read-only lookup of a Thing's properties by name.
#[derive(Clone, Default)]
pub struct PropertyRegistry {
    properties: HashMap<String, Arc<dyn Property>>,
}

impl PropertyRegistry {
    /// Build a registry from named properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a property under `name`.
    pub fn insert(&mut self, name: impl Into<String>, property: Arc<dyn Property>) {
        self.properties.insert(name.into(), property);
    }

    /// Look up a property by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Property>> {
        self.properties.get(name)
    }

    /// Names of every registered property, for `readAllProperties`/
    /// `writeAllProperties`.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }
}

/// Read-only lookup of a Thing's actions by name.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<RegisteredAction>>,
}

impl ActionRegistry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under `name`.
    pub fn insert(&mut self, name: impl Into<String>, action: RegisteredAction) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredAction>> {
        self.actions.get(name)
    }
}

/// A runtime object the broker fronts: a `thing-id`, its properties and its
/// actions.
pub trait Thing: Send + Sync {
    /// Stable identifier used as `thing-id` in request frames.
    fn id(&self) -> &str;
    /// This Thing's properties.
    fn properties(&self) -> &PropertyRegistry;
    /// This Thing's actions.
    fn actions(&self) -> &ActionRegistry;

    /// Checked by the Executor after every operation reply is sent. When an
    /// action has set internal state asking the Thing to shut down (a
    /// cooperative request, not a crash), this should flip to `true`; the
    /// Executor then exits its loop instead of waiting for the next request,
    /// having already emitted the final reply.
    fn shutdown_requested(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Counter(Mutex<i64>);

    impl Property for Counter {
        fn read(&self) -> Result<Value, BrokerError> {
            Ok(Value::from(*self.0.lock().unwrap()))
        }

        fn write(&self, value: Value) -> Result<(), BrokerError> {
            let n = value
                .as_i64()
                .ok_or_else(|| BrokerError::UserException("expected integer".into()))?;
            *self.0.lock().unwrap() = n;
            Ok(())
        }
    }

    #[test]
    fn property_read_write_round_trips() {
        let counter = Counter(Mutex::new(0));
        counter.write(Value::from(42)).unwrap();
        assert_eq!(counter.read().unwrap(), Value::from(42));
    }

    #[test]
    fn property_delete_defaults_to_unsupported() {
        let counter = Counter(Mutex::new(0));
        assert!(matches!(counter.delete(), Err(BrokerError::Unsupported(_))));
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = PropertyRegistry::new();
        registry.insert("count", Arc::new(Counter(Mutex::new(1))));
        assert!(registry.get("count").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["count"]);
    }
}
