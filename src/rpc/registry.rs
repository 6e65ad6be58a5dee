//! Action-name → operation-factory table for incoming Calls.

use std::rc::Rc;

use serde_json::Value;
use tracing::debug;

use crate::model::Model;
use crate::rpc::request::Operation;
use crate::support::errors::{HandlerError, RpcErrorCode};
use crate::support::poll::PollResult;

pub type OperationFactory = Box<dyn Fn() -> Box<dyn Operation>>;

/// Hook observing an inbound payload or the outbound confirmation, after
/// the handler's own processing.
pub type PayloadHook = Rc<dyn Fn(&Value)>;

struct RegistryEntry {
    action: &'static str,
    factory: OperationFactory,
    on_request: Option<PayloadHook>,
    on_response: Option<PayloadHook>,
}

/// A freshly constructed handler for one incoming Call, with its hooks.
pub struct DispatchedCall {
    pub operation: Box<dyn Operation>,
    pub on_request: Option<PayloadHook>,
    pub on_response: Option<PayloadHook>,
}

#[derive(Default)]
pub struct OperationRegistry {
    entries: Vec<RegistryEntry>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, action: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.action == action)
    }

    fn find_mut(&mut self, action: &str) -> Option<&mut RegistryEntry> {
        self.entries.iter_mut().find(|e| e.action == action)
    }

    /// Register a factory; replaces any existing entry for the action.
    pub fn register(&mut self, action: &'static str, factory: OperationFactory) {
        self.entries.retain(|e| e.action != action);
        self.entries.push(RegistryEntry {
            action,
            factory,
            on_request: None,
            on_response: None,
        });
        debug!(action, "operation registered");
    }

    pub fn set_on_request(&mut self, action: &str, hook: PayloadHook) {
        if let Some(entry) = self.find_mut(action) {
            entry.on_request = Some(hook);
        } else {
            tracing::error!(action, "cannot attach on_request: not registered");
        }
    }

    pub fn set_on_response(&mut self, action: &str, hook: PayloadHook) {
        if let Some(entry) = self.find_mut(action) {
            entry.on_response = Some(hook);
        } else {
            tracing::error!(action, "cannot attach on_response: not registered");
        }
    }

    pub fn is_registered(&self, action: &str) -> bool {
        self.find(action).is_some()
    }

    /// Construct the handler for an incoming Call. Unknown actions get a
    /// responder pre-bound to a `NotImplemented` CallError.
    pub fn deserialize(&self, action: &str) -> DispatchedCall {
        match self.find(action) {
            Some(entry) => DispatchedCall {
                operation: (entry.factory)(),
                on_request: entry.on_request.clone(),
                on_response: entry.on_response.clone(),
            },
            None => DispatchedCall {
                operation: Box::new(NotImplementedOperation),
                on_request: None,
                on_response: None,
            },
        }
    }

    pub fn registered_actions(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.action).collect()
    }
}

/// Responder for Calls whose action has no registered handler.
struct NotImplementedOperation;

impl Operation for NotImplementedOperation {
    fn operation_type(&self) -> &'static str {
        "NotImplemented"
    }

    fn process_req(&mut self, _model: &mut Model, _payload: &Value) -> Result<(), HandlerError> {
        Ok(())
    }

    fn create_conf(&mut self, _model: &mut Model) -> PollResult<Result<Value, HandlerError>> {
        PollResult::Ready(Err(HandlerError::new(
            RpcErrorCode::NotImplemented,
            "Operation not supported by this charge point",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl Operation for Dummy {
        fn operation_type(&self) -> &'static str {
            "Heartbeat"
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = OperationRegistry::new();
        registry.register("Heartbeat", Box::new(|| Box::new(Dummy)));
        assert!(registry.is_registered("Heartbeat"));
        let call = registry.deserialize("Heartbeat");
        assert_eq!(call.operation.operation_type(), "Heartbeat");
    }

    #[test]
    fn register_replaces() {
        let mut registry = OperationRegistry::new();
        registry.register("Heartbeat", Box::new(|| Box::new(Dummy)));
        registry.register("Heartbeat", Box::new(|| Box::new(Dummy)));
        assert_eq!(registry.registered_actions().len(), 1);
    }

    #[test]
    fn unknown_action_not_implemented() {
        let registry = OperationRegistry::new();
        let call = registry.deserialize("FluxCapacitorStatus");
        assert_eq!(call.operation.operation_type(), "NotImplemented");
    }

    #[test]
    fn action_names_are_case_sensitive() {
        let mut registry = OperationRegistry::new();
        registry.register("Heartbeat", Box::new(|| Box::new(Dummy)));
        assert!(!registry.is_registered("heartbeat"));
    }
}
