// Dispatcher seam between the session core and application code.
//
// The session never inspects application objects; it dispatches string-named
// methods against an opaque target. Exports created for server-side stubs
// carry a `StubHook` so chained calls land on the right object.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::RpcError;

/// A dispatch target for inbound method calls.
///
/// Handlers are synchronous from the session's point of view; an async
/// embedder adapts its handlers into values or errors before they get here.
pub trait RpcTarget: Send + Sync {
    fn call(&self, method: &str, args: &Value) -> Result<Value, RpcError>;
}

type MethodHandler = Box<dyn Fn(&Value) -> Result<Value, RpcError> + Send + Sync>;

/// An `RpcTarget` backed by a name-to-closure method table.
#[derive(Default)]
pub struct MethodTarget {
    methods: HashMap<String, MethodHandler>,
}

impl MethodTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method handler.
    pub fn method<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(handler));
    }
}

impl RpcTarget for MethodTarget {
    fn call(&self, method: &str, args: &Value) -> Result<Value, RpcError> {
        match self.methods.get(method) {
            Some(handler) => handler(args),
            None => Err(RpcError::method(format!("Method not found: {}", method))),
        }
    }
}

/// Capability against which an export entry dispatches calls.
pub trait StubHook: Send + Sync {
    fn call(&self, method: &str, args: &Value) -> Result<Value, RpcError>;
}

/// Adapts an `RpcTarget` into a `StubHook`.
pub struct TargetHook {
    target: Arc<dyn RpcTarget>,
}

impl TargetHook {
    pub fn new(target: Arc<dyn RpcTarget>) -> Arc<dyn StubHook> {
        Arc::new(TargetHook { target })
    }
}

impl StubHook for TargetHook {
    fn call(&self, method: &str, args: &Value) -> Result<Value, RpcError> {
        self.target.call(method, args)
    }
}

/// Stable identity key for a target, used for re-export parity.
pub(crate) fn target_key(target: &Arc<dyn RpcTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}
