// Devaluation: rewriting a just-computed result into its wire form.
//
// Handler results are plain JSON except for sentinel objects, which request
// capability and extended-scalar encodings. Capability sentinels allocate
// negative export ids here, with re-export parity: the same underlying
// target always maps to the same id, bumping its remote refcount.

use serde_json::{json, Map, Value};

use crate::error::RpcError;
use crate::hooks::{target_key, RpcTarget, TargetHook};

use super::expression::{self, sentinel, MAX_DEPTH};
use super::session::RpcSession;

use std::sync::Arc;

impl RpcSession {
    /// Rewrite a computed result for embedding in a `resolve` payload.
    pub(crate) fn devalue_result(&self, value: &Value, depth: usize) -> Result<Value, RpcError> {
        if depth > MAX_DEPTH {
            return Err(RpcError::DepthExceeded);
        }

        match value {
            Value::Object(map) => {
                if let Some(expr) = self.devalue_sentinel(map)? {
                    return Ok(expr);
                }
                let mut out = Map::new();
                for (key, val) in map {
                    out.insert(key.clone(), self.devalue_result(val, depth + 1)?);
                }
                Ok(Value::Object(out))
            }

            Value::Array(_) if expression::is_expression(value) => Ok(value.clone()),

            Value::Array(arr) => {
                let mut out = Vec::with_capacity(arr.len());
                for elem in arr {
                    out.push(self.devalue_result(elem, depth + 1)?);
                }
                Ok(Value::Array(out))
            }

            primitive => Ok(primitive.clone()),
        }
    }

    /// Recognize sentinel objects. Returns `Ok(None)` for ordinary data.
    fn devalue_sentinel(&self, map: &Map<String, Value>) -> Result<Option<Value>, RpcError> {
        if let Some(big) = map.get(sentinel::BIGINT).and_then(Value::as_str) {
            return Ok(Some(json!(["bigint", big])));
        }
        if let Some(date) = map.get(sentinel::DATE).filter(|v| v.is_number()) {
            return Ok(Some(json!(["date", date])));
        }
        if let Some(bytes) = map.get(sentinel::BYTES).and_then(Value::as_str) {
            return Ok(Some(json!(["bytes", bytes])));
        }
        if map.get(sentinel::UNDEFINED).and_then(Value::as_bool) == Some(true) {
            return Ok(Some(json!(["undefined"])));
        }
        if let Some(err) = map.get(sentinel::ERROR).and_then(Value::as_object) {
            let name = err.get("name").and_then(Value::as_str).unwrap_or("Error");
            let message = err.get("message").and_then(Value::as_str).unwrap_or("");
            let mut tuple = vec![json!("error"), json!(name), json!(message)];
            if let Some(stack) = err.get("stack").and_then(Value::as_str) {
                tuple.push(json!(stack));
            }
            return Ok(Some(Value::Array(tuple)));
        }

        // A peer-held capability given back to the peer: reference it by
        // the peer's own id.
        if let Some(id) = map.get(sentinel::STUB).and_then(Value::as_i64) {
            return Ok(Some(json!(["import", id])));
        }

        // A peer-held promise embedded in a result: link it to a fresh
        // promise export so the peer's resolve comes back under our id.
        if let Some(id) = map.get(sentinel::PROMISE_STUB).and_then(Value::as_i64) {
            let promise_id = self.await_client_promise(id);
            return Ok(Some(json!(["promise", promise_id])));
        }

        if map.get(sentinel::EXPORT).and_then(Value::as_bool) == Some(true) {
            let target = self
                .root_target()
                .ok_or_else(|| RpcError::method("no root target to export"))?;
            let id = self.export_capability(target);
            return Ok(Some(json!(["export", id])));
        }

        if let Some(key) = map.get(sentinel::EXPORT_TARGET).and_then(Value::as_u64) {
            let target = self
                .state()
                .target_registry
                .get(&(key as usize))
                .cloned()
                .ok_or_else(|| RpcError::method("unknown export target"))?;
            let id = self.export_capability(target);
            return Ok(Some(json!(["export", id])));
        }

        if let Some(promise) = map.get(sentinel::PROMISE) {
            let promise_id = {
                let mut state = self.state();
                let id = state.exporter.allocate_negative();
                state.exporter.ensure(id);
                id
            };
            // A non-boolean payload pre-resolves the promise.
            match promise {
                Value::Bool(true) => {}
                payload => {
                    self.state()
                        .exporter
                        .cache_result(promise_id, payload.clone());
                }
            }
            return Ok(Some(json!(["promise", promise_id])));
        }

        Ok(None)
    }

    /// Allocate (or reuse) a negative export id for a target, keyed by the
    /// target's identity. Reuse bumps the remote refcount.
    pub(crate) fn export_capability(&self, target: Arc<dyn RpcTarget>) -> i64 {
        let key = target_key(&target);
        let mut state = self.state();
        if let Some(&id) = state.reverse_export.get(&key) {
            if state.exporter.contains(id) {
                state.exporter.add_remote_ref(id);
                return id;
            }
        }
        let id = state.exporter.allocate_negative();
        let entry = state.exporter.ensure(id);
        entry.hook = Some(TargetHook::new(target));
        state.reverse_export.insert(key, id);
        id
    }
}
