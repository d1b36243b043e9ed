use serde_json::{json, Value};
use thiserror::Error;

/// Errors produced by the session core.
///
/// Each variant maps to a `name` used in wire error tuples
/// `["error", name, message, stack?]`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("{0}")]
    ExportNotFound(String),

    #[error("{0}")]
    MethodError(String),

    #[error("value nesting exceeds depth limit")]
    DepthExceeded,

    #[error("{0}")]
    Protocol(String),

    #[error("session aborted: {0}")]
    Aborted(String),
}

impl RpcError {
    pub fn export_not_found() -> Self {
        RpcError::ExportNotFound("Export ID not found".into())
    }

    pub fn method(message: impl Into<String>) -> Self {
        RpcError::MethodError(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol(message.into())
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        RpcError::Aborted(reason.into())
    }

    /// Wire name for this error kind.
    pub fn name(&self) -> &'static str {
        match self {
            RpcError::ExportNotFound(_) => "ExportNotFound",
            RpcError::MethodError(_) => "MethodError",
            RpcError::DepthExceeded => "DepthExceeded",
            RpcError::Protocol(_) => "ProtocolError",
            RpcError::Aborted(_) => "Aborted",
        }
    }

    /// Encode as an `["error", name, message]` tuple.
    pub fn to_wire(&self) -> Value {
        json!(["error", self.name(), self.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tuple_shape() {
        let err = RpcError::method("boom");
        assert_eq!(err.to_wire(), json!(["error", "MethodError", "boom"]));

        let err = RpcError::export_not_found();
        assert_eq!(
            err.to_wire(),
            json!(["error", "ExportNotFound", "Export ID not found"])
        );
    }

    #[test]
    fn names_cover_all_kinds() {
        assert_eq!(RpcError::DepthExceeded.name(), "DepthExceeded");
        assert_eq!(RpcError::protocol("x").name(), "ProtocolError");
        assert_eq!(RpcError::aborted("x").name(), "Aborted");
    }
}
