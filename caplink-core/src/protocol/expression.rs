// Value algebra shared by the evaluator and devaluator.
//
// Payloads are JSON trees with an expression overlay: any array whose first
// element is a recognized tag string is an expression, everything else is
// data. Extended scalars round-trip through the in-memory model as objects
// with `$`-prefixed sentinel keys.

use serde_json::{json, Value};

/// Tags that mark an array as an expression rather than data.
pub const EXPRESSION_TAGS: &[&str] = &[
    "pipeline",
    "remap",
    "import",
    "export",
    "promise",
    "error",
    "bigint",
    "date",
    "bytes",
    "undefined",
    "value",
];

/// Object keys stripped while decoding inbound payloads.
pub const RESERVED_KEYS: &[&str] = &["__proto__", "constructor", "toJSON"];

/// Maximum nesting depth accepted by the evaluator and devaluator.
pub const MAX_DEPTH: usize = 64;

/// Sentinel keys used by the in-memory value model.
pub mod sentinel {
    pub const BIGINT: &str = "$bigint";
    pub const DATE: &str = "$date";
    pub const BYTES: &str = "$bytes";
    pub const UNDEFINED: &str = "$undefined";
    pub const ERROR: &str = "$error";
    /// Peer-held capability (their export, referenced by their id).
    pub const STUB: &str = "$stub";
    /// Peer-held promise awaiting the peer's resolve.
    pub const PROMISE_STUB: &str = "$promise_stub";
    /// Request to export the session's root target.
    pub const EXPORT: &str = "$export";
    /// Request to export a registered sub-target.
    pub const EXPORT_TARGET: &str = "$export_target";
    /// Request to export a promise, optionally pre-resolved.
    pub const PROMISE: &str = "$promise";
}

/// True if the value is an expression array.
pub fn is_expression(value: &Value) -> bool {
    value
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(Value::as_str)
        .map(|tag| EXPRESSION_TAGS.contains(&tag))
        .unwrap_or(false)
}

/// True for a well-formed `["error", name, message, stack?]` tuple.
pub fn is_error_tuple(value: &Value) -> bool {
    match value.as_array() {
        Some(arr) => {
            arr.len() >= 3
                && arr[0].as_str() == Some("error")
                && arr[1].is_string()
                && arr[2].is_string()
        }
        None => false,
    }
}

/// Build an error tuple.
pub fn make_error(name: &str, message: &str) -> Value {
    json!(["error", name, message])
}

/// Apply the array-escape rule to a resolve payload: a plain data array is
/// wrapped in a one-element outer array so it cannot be read as an
/// expression. Expressions pass through unwrapped.
pub fn escape_result(value: Value) -> Value {
    if value.is_array() && !is_expression(&value) {
        json!([value])
    } else {
        value
    }
}

/// Reverse of [`escape_result`], applied when decoding a resolve payload.
pub fn unescape_payload(value: Value) -> Value {
    if is_expression(&value) {
        return value;
    }
    match value {
        Value::Array(mut arr) if arr.len() == 1 && arr[0].is_array() => arr.remove(0),
        other => other,
    }
}

/// Force a value into the error-tuple shape. If `candidate` (typically the
/// output of the redaction hook) is malformed, fall back to `original`, and
/// failing that to a generic tuple. Extra elements are truncated, a
/// non-string stack is dropped.
pub fn sanitize_error(candidate: Value, original: &Value) -> Value {
    for value in [&candidate, original] {
        if !is_error_tuple(value) {
            continue;
        }
        if let Some(arr) = value.as_array() {
            let mut out = vec![arr[0].clone(), arr[1].clone(), arr[2].clone()];
            if let Some(stack) = arr.get(3).and_then(Value::as_str) {
                out.push(json!(stack));
            }
            return Value::Array(out);
        }
    }
    make_error("Error", "")
}

/// Collect peer capability ids (`["export", id]` and `["promise", id]`
/// expressions) referenced anywhere in an argument or capture tree. These
/// are the references the session must release back to the peer once the
/// receiving export completes.
pub fn collect_peer_ids(value: &Value) -> Vec<i64> {
    let mut out = Vec::new();
    walk_peer_ids(value, &mut out);
    out
}

fn walk_peer_ids(value: &Value, out: &mut Vec<i64>) {
    match value {
        Value::Array(arr) => {
            if arr.len() == 2 {
                if let (Some(tag), Some(id)) = (arr[0].as_str(), arr[1].as_i64()) {
                    if tag == "export" || tag == "promise" {
                        out.push(id);
                        return;
                    }
                }
            }
            for elem in arr {
                walk_peer_ids(elem, out);
            }
        }
        Value::Object(map) => {
            for val in map.values() {
                walk_peer_ids(val, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_detection() {
        assert!(is_expression(&json!(["pipeline", 1])));
        assert!(is_expression(&json!(["export", -2])));
        assert!(is_expression(&json!(["undefined"])));
        assert!(!is_expression(&json!(["data", 1])));
        assert!(!is_expression(&json!([1, 2, 3])));
        assert!(!is_expression(&json!("pipeline")));
        assert!(!is_expression(&json!([])));
    }

    #[test]
    fn array_escape_round_trip() {
        let payloads = vec![
            json!([1, 2, 3]),
            json!("plain"),
            json!({"k": [1, 2]}),
            json!([["nested"]]),
            json!(null),
        ];
        for payload in payloads {
            assert_eq!(unescape_payload(escape_result(payload.clone())), payload);
        }
    }

    #[test]
    fn escape_leaves_expressions_alone() {
        let expr = json!(["export", -1]);
        assert_eq!(escape_result(expr.clone()), expr);

        let data = json!(["exportish", -1]);
        assert_eq!(escape_result(data.clone()), json!([data]));
    }

    #[test]
    fn sanitize_enforces_shape() {
        let original = json!(["error", "MethodError", "boom"]);

        // Well-formed candidate passes through.
        let good = json!(["error", "MethodError", "redacted", "STACK"]);
        assert_eq!(sanitize_error(good.clone(), &original), good);

        // Extra elements truncated, non-string stack dropped.
        let noisy = json!(["error", "E", "m", 42, "extra"]);
        assert_eq!(sanitize_error(noisy, &original), json!(["error", "E", "m"]));

        // Garbage falls back to the original tuple.
        assert_eq!(sanitize_error(json!({"nope": 1}), &original), original);

        // Both malformed: generic tuple.
        assert_eq!(
            sanitize_error(json!(42), &json!("also bad")),
            json!(["error", "Error", ""])
        );
    }

    #[test]
    fn peer_id_collection() {
        let args = json!([
            ["export", 5],
            {"inner": ["promise", 7]},
            [["export", 5], "x"],
            ["pipeline", 1, ["id"]],
        ]);
        assert_eq!(collect_peer_ids(&args), vec![5, 7, 5]);
    }
}
