// Lazy evaluation of inbound value trees.
//
// Evaluation replaces expressions with concrete values: pipeline references
// force (at most once) the operation they point at, extended scalars become
// sentinel objects, and remap programs run against a local variable stack.
// Reserved object keys are stripped here, which is the session's decode
// boundary for peer-controlled payloads.

use serde_json::{json, Map, Value};
use tracing::trace;

use crate::error::RpcError;

use super::expression::{self, MAX_DEPTH, RESERVED_KEYS};
use super::session::RpcSession;

/// A capture named by a remap expression.
#[derive(Debug, Clone, Copy)]
struct Capture {
    /// `["import", id]`: one of our exports, from the peer's side.
    /// `["export", id]` (`is_import == false`): a capability the peer
    /// holds; calls on it go back over the wire.
    is_import: bool,
    id: i64,
}

impl RpcSession {
    /// Evaluate an inbound expression tree to a concrete value.
    pub(crate) fn evaluate(&self, value: &Value, depth: usize) -> Result<Value, RpcError> {
        if depth > MAX_DEPTH {
            return Err(RpcError::DepthExceeded);
        }

        match value {
            Value::Array(arr) => {
                if let Some(tag) = arr.first().and_then(Value::as_str) {
                    match tag {
                        "pipeline" if arr.len() >= 2 && arr[1].is_i64() => {
                            return self.evaluate_pipeline(arr, depth);
                        }
                        "remap" => return self.evaluate_remap(arr, depth),
                        "value" => {
                            if arr.len() != 2 {
                                return Err(RpcError::method("invalid value expression"));
                            }
                            return self.evaluate(&arr[1], depth + 1);
                        }
                        "bigint" if arr.len() >= 2 && arr[1].is_string() => {
                            return Ok(json!({ expression::sentinel::BIGINT: arr[1] }));
                        }
                        "date" if arr.len() >= 2 && arr[1].is_number() => {
                            return Ok(json!({ expression::sentinel::DATE: arr[1] }));
                        }
                        "bytes" if arr.len() >= 2 && arr[1].is_string() => {
                            return Ok(json!({ expression::sentinel::BYTES: arr[1] }));
                        }
                        "undefined" => {
                            return Ok(json!({ expression::sentinel::UNDEFINED: true }));
                        }
                        "error" if expression::is_error_tuple(value) => {
                            let mut err = json!({
                                "name": arr[1],
                                "message": arr[2],
                            });
                            if let Some(stack) = arr.get(3).and_then(Value::as_str) {
                                err["stack"] = json!(stack);
                            }
                            return Ok(json!({ expression::sentinel::ERROR: err }));
                        }
                        "export" if arr.len() == 2 && arr[1].is_i64() => {
                            // A capability the peer holds, from our side.
                            return Ok(json!({ expression::sentinel::STUB: arr[1] }));
                        }
                        "promise" if arr.len() == 2 && arr[1].is_i64() => {
                            return Ok(json!({ expression::sentinel::PROMISE_STUB: arr[1] }));
                        }
                        // Unknown tags (and malformed recognized ones) stay
                        // opaque for forward compatibility.
                        _ => {}
                    }
                }
                let mut out = Vec::with_capacity(arr.len());
                for elem in arr {
                    out.push(self.evaluate(elem, depth + 1)?);
                }
                Ok(Value::Array(out))
            }

            Value::Object(map) => {
                let mut out = Map::new();
                for (key, val) in map {
                    if RESERVED_KEYS.contains(&key.as_str()) {
                        trace!(key = %key, "dropping reserved object key");
                        continue;
                    }
                    out.insert(key.clone(), self.evaluate(val, depth + 1)?);
                }
                Ok(Value::Object(out))
            }

            primitive => Ok(primitive.clone()),
        }
    }

    /// `["pipeline", exportId, path?, args?]`: start from the referenced
    /// export's cached result, or force its pending operation now. A path
    /// traverses into the result; args turn the reference into a dispatch
    /// (only meaningful at push level, where the session stores it as an
    /// operation).
    fn evaluate_pipeline(&self, arr: &[Value], depth: usize) -> Result<Value, RpcError> {
        let id = arr[1].as_i64().expect("checked by caller");

        if let Some(cached) = self.state().exporter.result(id) {
            return traverse_path(cached, arr.get(2));
        }

        let Some((method, args, hook)) = self.state().exporter.operation(id) else {
            return Err(RpcError::method(format!(
                "Pipeline reference to non-existent export: {}",
                id
            )));
        };
        let hook = hook
            .or_else(|| self.root_hook())
            .ok_or_else(|| RpcError::method(format!("Method not found: {}", method)))?;

        // Arguments may themselves contain pipeline references.
        let resolved_args = self.evaluate(&args, depth + 1)?;
        let computed = hook.call(&method, &resolved_args)?;
        self.state().exporter.cache_result(id, computed.clone());

        traverse_path(computed, arr.get(2))
    }

    /// `["remap", baseExportId, basePath, captures, instructions]`.
    fn evaluate_remap(&self, arr: &[Value], depth: usize) -> Result<Value, RpcError> {
        if arr.len() != 5
            || !arr[1].is_i64()
            || !arr[2].is_array()
            || !arr[3].is_array()
            || !arr[4].is_array()
        {
            return Err(RpcError::method("invalid remap expression"));
        }
        let base_id = arr[1].as_i64().expect("checked above");
        let base_path = &arr[2];
        let captures = parse_captures(arr[3].as_array().expect("checked above"))?;
        let instructions = arr[4].as_array().expect("checked above");

        // The base input is best-effort: a dangling base reference leaves
        // the program running against null.
        let input = self
            .evaluate(&json!(["pipeline", base_id, base_path]), depth + 1)
            .unwrap_or(Value::Null);

        let mut variables = vec![input];

        for instr in instructions {
            let instr = instr
                .as_array()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| RpcError::method("invalid remap instruction"))?;
            let tag = instr[0]
                .as_str()
                .ok_or_else(|| RpcError::method("invalid remap instruction"))?;

            let pushed = match tag {
                "value" => {
                    if instr.len() != 2 {
                        return Err(RpcError::method("invalid value instruction"));
                    }
                    self.evaluate(&instr[1], depth + 1)?
                }

                "get" => {
                    if instr.len() != 3 || !instr[1].is_i64() || !instr[2].is_array() {
                        return Err(RpcError::method("invalid get instruction"));
                    }
                    let subject = instr[1].as_i64().expect("checked above");
                    let path = &instr[2];
                    if subject < 0 {
                        let capture = capture_at(&captures, subject)?;
                        if capture.is_import {
                            self.evaluate(&json!(["pipeline", capture.id, path]), depth + 1)?
                        } else {
                            // Property get on a peer-held capability: go
                            // back over the wire and hand out a promise.
                            let promise_id = self.call_client(capture.id, path.clone())?;
                            json!(["promise", promise_id])
                        }
                    } else {
                        traverse_path(variable_at(&variables, subject)?, Some(path))?
                    }
                }

                "pipeline" => {
                    if instr.len() < 3 || !instr[1].is_i64() || !instr[2].is_array() {
                        return Err(RpcError::method("invalid pipeline instruction"));
                    }
                    let subject = instr[1].as_i64().expect("checked above");
                    let path = &instr[2];
                    let args = instr.get(3);
                    if subject < 0 {
                        let capture = capture_at(&captures, subject)?;
                        let resolved_args = match args {
                            Some(args) => self.evaluate(args, depth + 1)?,
                            None => json!([]),
                        };
                        if capture.is_import {
                            let method = path
                                .as_array()
                                .and_then(|p| p.first())
                                .and_then(Value::as_str)
                                .ok_or_else(|| {
                                    RpcError::method("remap pipeline invalid method path")
                                })?;
                            let hook = self.root_hook().ok_or_else(|| {
                                RpcError::method(format!("Method not found: {}", method))
                            })?;
                            hook.call(method, &resolved_args)?
                        } else {
                            let sent_args = args.is_some().then_some(resolved_args);
                            let promise_id =
                                self.call_client_inner(capture.id, path.clone(), sent_args)?;
                            json!(["promise", promise_id])
                        }
                    } else {
                        traverse_path(variable_at(&variables, subject)?, Some(path))?
                    }
                }

                "array" => {
                    if instr.len() != 2 || !instr[1].is_array() {
                        return Err(RpcError::method("invalid array instruction"));
                    }
                    let elems = instr[1].as_array().expect("checked above");
                    let mut out = Vec::with_capacity(elems.len());
                    for elem in elems {
                        out.push(self.evaluate(elem, depth + 1)?);
                    }
                    Value::Array(out)
                }

                "object" => {
                    if instr.len() != 2 || !instr[1].is_array() {
                        return Err(RpcError::method("invalid object instruction"));
                    }
                    let mut out = Map::new();
                    for entry in instr[1].as_array().expect("checked above") {
                        let pair = entry
                            .as_array()
                            .filter(|p| p.len() == 2 && p[0].is_string())
                            .ok_or_else(|| RpcError::method("invalid object entry"))?;
                        let key = pair[0].as_str().expect("checked above");
                        if RESERVED_KEYS.contains(&key) {
                            continue;
                        }
                        out.insert(key.to_string(), self.evaluate(&pair[1], depth + 1)?);
                    }
                    Value::Object(out)
                }

                "remap" => self.evaluate_remap(instr, depth + 1)?,

                other => {
                    return Err(RpcError::method(format!(
                        "unsupported remap instruction tag: {}",
                        other
                    )));
                }
            };

            variables.push(pushed);
        }

        Ok(variables.pop().unwrap_or(Value::Null))
    }
}

fn parse_captures(raw: &[Value]) -> Result<Vec<Capture>, RpcError> {
    raw.iter()
        .map(|cap| {
            let pair = cap
                .as_array()
                .filter(|a| a.len() == 2 && a[0].is_string() && a[1].is_i64())
                .ok_or_else(|| RpcError::method("invalid remap capture"))?;
            let id = pair[1].as_i64().expect("checked above");
            match pair[0].as_str().expect("checked above") {
                "import" => Ok(Capture {
                    is_import: true,
                    id,
                }),
                "export" => Ok(Capture {
                    is_import: false,
                    id,
                }),
                _ => Err(RpcError::method("unknown remap capture tag")),
            }
        })
        .collect()
}

fn capture_at(captures: &[Capture], subject: i64) -> Result<Capture, RpcError> {
    let index = (-subject - 1) as usize;
    captures
        .get(index)
        .copied()
        .ok_or_else(|| RpcError::method("remap capture index out of range"))
}

fn variable_at(variables: &[Value], subject: i64) -> Result<Value, RpcError> {
    variables
        .get(subject as usize)
        .cloned()
        .ok_or_else(|| RpcError::method("remap variable index out of range"))
}

/// Traverse a property path: string keys index objects (missing keys yield
/// null), integer keys index arrays (out of range yields null). Any other
/// combination is an invalid path.
pub(crate) fn traverse_path(value: Value, path: Option<&Value>) -> Result<Value, RpcError> {
    let Some(path) = path.and_then(Value::as_array) else {
        return Ok(value);
    };
    let mut current = value;
    for key in path {
        current = if let (Some(name), true) = (key.as_str(), current.is_object()) {
            current.get(name).cloned().unwrap_or(Value::Null)
        } else if let (Some(index), true) = (key.as_u64(), current.is_array()) {
            current
                .get(index as usize)
                .cloned()
                .unwrap_or(Value::Null)
        } else {
            return Err(RpcError::method("invalid pipeline path"));
        };
    }
    Ok(current)
}
