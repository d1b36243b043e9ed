// Batch accumulation: one request body in, one response body out.
//
// A batch channel has no persistent connection, so every outbound frame
// (direct replies, server-initiated pushes, forwarded resolutions,
// releases) is collected into one ordered list and shipped back when the
// batch closes.

use std::sync::{Arc, Mutex};

use tracing::debug;

use caplink_core::{RpcSession, RpcTransport};

/// Transport that accumulates outbound frames in memory.
#[derive(Default)]
pub struct BatchTransport {
    frames: Mutex<Vec<String>>,
    abort_reason: Mutex<Option<String>>,
}

impl BatchTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames accumulated so far, leaving the buffer intact.
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    /// Drain the accumulated frames.
    pub fn take_frames(&self) -> Vec<String> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().unwrap().clone()
    }
}

impl RpcTransport for BatchTransport {
    fn send(&self, frame: &str) {
        self.frames.lock().unwrap().push(frame.to_string());
    }

    fn abort(&self, reason: &str) {
        debug!(reason, "batch transport aborted");
        *self.abort_reason.lock().unwrap() = Some(reason.to_string());
    }
}

/// Process a newline-delimited batch body and return every outbound frame
/// in emission order. The session is drained before the batch closes, so
/// queued releases make it into the response.
pub fn process_batch(session: &RpcSession, body: &str) -> Vec<String> {
    let sink = BatchTransport::new();
    session.set_transport(Some(sink.clone() as Arc<dyn RpcTransport>));

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(reply) = session.handle_message(line) {
            sink.send(&reply);
        }
        session.process_tasks();
    }

    session.drain();
    sink.take_frames()
}

#[cfg(test)]
mod tests {
    use super::*;
    use caplink_core::MethodTarget;
    use serde_json::{json, Value};

    fn echo_session() -> RpcSession {
        let mut target = MethodTarget::new();
        target.method("echo", |args: &Value| {
            let name = args
                .as_array()
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(json!(format!("Hello, {}!", name)))
        });
        RpcSession::with_target(Arc::new(target))
    }

    #[test]
    fn replies_come_back_in_order() {
        let session = echo_session();
        let body = concat!(
            r#"["push",["pipeline",0,["echo"],["A"]]]"#,
            "\n",
            r#"["push",["pipeline",0,["echo"],["B"]]]"#,
            "\n",
            r#"["pull",1]"#,
            "\n",
            r#"["pull",2]"#,
        );
        let frames = process_batch(&session, body);
        assert_eq!(
            frames,
            vec![
                r#"["resolve",1,"Hello, A!"]"#.to_string(),
                r#"["resolve",2,"Hello, B!"]"#.to_string(),
            ]
        );
        assert!(session.is_drained());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let session = echo_session();
        let body = "\n\n";
        assert!(process_batch(&session, body).is_empty());
    }
}
