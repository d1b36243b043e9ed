// Helpers for handlers working with peer-held capabilities.
//
// When the evaluator meets `["export", id]` or `["promise", id]` in
// arguments it hands the handler a marker object; these helpers recognize
// the markers and route calls on them back through the session.

use serde_json::{json, Value};

use crate::error::RpcError;
use crate::protocol::expression::sentinel;
use crate::protocol::session::RpcSession;

/// Build a marker for a peer-held capability.
pub fn client_stub(id: i64) -> Value {
    json!({ sentinel::STUB: id })
}

pub fn is_client_stub(value: &Value) -> bool {
    client_stub_id(value).is_some()
}

pub fn client_stub_id(value: &Value) -> Option<i64> {
    value.get(sentinel::STUB).and_then(Value::as_i64)
}

/// Invoke a method on a peer-held capability. Returns the negative promise
/// export id carrying the eventual result.
pub fn call_client_stub(
    session: &RpcSession,
    stub: &Value,
    method: &str,
    args: Value,
) -> Result<i64, RpcError> {
    let id = client_stub_id(stub).ok_or_else(|| RpcError::method("not a client stub"))?;
    session.call_client_method(id, method, args)
}

/// Read a property path from a peer-held capability.
pub fn client_stub_property(
    session: &RpcSession,
    stub: &Value,
    path: Value,
) -> Result<i64, RpcError> {
    let id = client_stub_id(stub).ok_or_else(|| RpcError::method("not a client stub"))?;
    session.call_client(id, path)
}

pub fn is_client_promise_stub(value: &Value) -> bool {
    client_promise_stub_id(value).is_some()
}

pub fn client_promise_stub_id(value: &Value) -> Option<i64> {
    value.get(sentinel::PROMISE_STUB).and_then(Value::as_i64)
}

/// Produce a `["promise", negId]` expression suitable for embedding in a
/// handler result, linked so the peer's resolution of its promise is
/// forwarded under the new id.
pub fn await_client_promise(session: &RpcSession, value: &Value) -> Result<Value, RpcError> {
    let id =
        client_promise_stub_id(value).ok_or_else(|| RpcError::method("not a client promise"))?;
    Ok(json!(["promise", session.await_client_promise(id)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_recognition() {
        assert!(is_client_stub(&client_stub(5)));
        assert_eq!(client_stub_id(&client_stub(5)), Some(5));
        assert!(!is_client_stub(&json!({"stub": 5})));
        assert!(!is_client_stub(&json!(5)));

        assert!(is_client_promise_stub(&json!({"$promise_stub": 9})));
        assert!(!is_client_promise_stub(&client_stub(9)));
    }

    #[test]
    fn call_on_non_stub_fails() {
        let session = RpcSession::new();
        let err = call_client_stub(&session, &json!({}), "greet", json!([])).unwrap_err();
        assert_eq!(err, RpcError::method("not a client stub"));
    }

    #[test]
    fn await_links_promise() {
        let session = RpcSession::new();
        let out = await_client_promise(&session, &json!({"$promise_stub": 5})).unwrap();
        assert_eq!(out, json!(["promise", -1]));
    }
}
