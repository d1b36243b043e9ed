// Wire frame codec.
//
// Frames are JSON arrays `[tag, ...params]`, one per transport message (or
// one per line in batch mode). Parsing is fail-soft: malformed input yields
// `None` and is logged, never an error frame.

use serde_json::{json, Value};
use tracing::debug;

/// A parsed protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `["push", expr]`: registers the next positive export.
    Push(Value),
    /// `["pull", id]`: requests resolution of an export.
    Pull(i64),
    /// `["resolve", id, value]`: the peer resolves our import.
    Resolve(i64, Value),
    /// `["reject", id, errorTuple]`
    Reject(i64, Value),
    /// `["release", id, count]`: decrements a remote refcount.
    Release(i64, i64),
    /// `["abort", payload]`: unilateral termination.
    Abort(Value),
}

impl Frame {
    /// Parse one frame from its wire text. Returns `None` for anything
    /// malformed; the session drops such input silently.
    pub fn parse(text: &str) -> Option<Frame> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "dropping unparseable frame");
                return None;
            }
        };

        let arr = value.as_array()?;
        let tag = arr.first()?.as_str()?;

        let frame = match tag {
            "push" => Frame::Push(arr.get(1)?.clone()),
            "pull" => Frame::Pull(arr.get(1)?.as_i64()?),
            "resolve" => Frame::Resolve(arr.get(1)?.as_i64()?, arr.get(2)?.clone()),
            "reject" => Frame::Reject(arr.get(1)?.as_i64()?, arr.get(2)?.clone()),
            "release" => Frame::Release(arr.get(1)?.as_i64()?, arr.get(2)?.as_i64()?),
            "abort" => Frame::Abort(arr.get(1)?.clone()),
            other => {
                debug!(tag = other, "dropping frame with unknown tag");
                return None;
            }
        };

        Some(frame)
    }

    /// Serialize to compact wire text.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Frame::Push(expr) => json!(["push", expr]),
            Frame::Pull(id) => json!(["pull", id]),
            Frame::Resolve(id, value) => json!(["resolve", id, value]),
            Frame::Reject(id, error) => json!(["reject", id, error]),
            Frame::Release(id, count) => json!(["release", id, count]),
            Frame::Abort(payload) => json!(["abort", payload]),
        };
        arr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_push_pipeline() {
        let frame = Frame::parse(r#"["push",["pipeline",0,["add"],[5,3]]]"#).unwrap();
        match frame {
            Frame::Push(expr) => {
                assert_eq!(expr, json!(["pipeline", 0, ["add"], [5, 3]]));
            }
            other => panic!("expected push, got {:?}", other),
        }
    }

    #[test]
    fn parse_pull_release_abort() {
        assert_eq!(Frame::parse(r#"["pull",1]"#), Some(Frame::Pull(1)));
        assert_eq!(
            Frame::parse(r#"["release",-3,2]"#),
            Some(Frame::Release(-3, 2))
        );
        assert_eq!(
            Frame::parse(r#"["abort","bye"]"#),
            Some(Frame::Abort(json!("bye")))
        );
    }

    #[test]
    fn parse_resolve_reject() {
        assert_eq!(
            Frame::parse(r#"["resolve",1,"Hello"]"#),
            Some(Frame::Resolve(1, json!("Hello")))
        );
        assert_eq!(
            Frame::parse(r#"["reject",2,["error","MethodError","bad"]]"#),
            Some(Frame::Reject(2, json!(["error", "MethodError", "bad"])))
        );
    }

    #[test]
    fn malformed_frames_are_dropped() {
        assert_eq!(Frame::parse("not json"), None);
        assert_eq!(Frame::parse("42"), None);
        assert_eq!(Frame::parse("[]"), None);
        assert_eq!(Frame::parse(r#"["pull"]"#), None);
        assert_eq!(Frame::parse(r#"["pull","x"]"#), None);
        assert_eq!(Frame::parse(r#"["release",1]"#), None);
        assert_eq!(Frame::parse(r#"["nonsense",1]"#), None);
    }

    #[test]
    fn serialize_round_trip() {
        let frames = vec![
            Frame::Push(json!(["pipeline", 0, ["hello"], ["World"]])),
            Frame::Pull(1),
            Frame::Resolve(1, json!({"id": "u1"})),
            Frame::Reject(1, json!(["error", "MethodError", "bad"])),
            Frame::Release(-1, 2),
            Frame::Abort(json!(["error", "Type", "bye"])),
        ];
        for frame in frames {
            assert_eq!(Frame::parse(&frame.serialize()), Some(frame));
        }
    }

    #[test]
    fn serialize_is_compact() {
        assert_eq!(Frame::Pull(7).serialize(), r#"["pull",7]"#);
        assert_eq!(
            Frame::Resolve(1, json!("Hello, World!")).serialize(),
            r#"["resolve",1,"Hello, World!"]"#
        );
    }
}
