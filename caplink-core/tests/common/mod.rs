// Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use caplink_core::{MethodTarget, RpcTarget, RpcTransport};

/// Transport that records every outbound frame.
#[derive(Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<String>>,
    aborted: Mutex<Option<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| serde_json::from_str(f).expect("transport carries valid JSON"))
            .collect()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.aborted.lock().unwrap().clone()
    }
}

impl RpcTransport for RecordingTransport {
    fn send(&self, frame: &str) {
        self.frames.lock().unwrap().push(frame.to_string());
    }

    fn abort(&self, reason: &str) {
        *self.aborted.lock().unwrap() = Some(reason.to_string());
    }
}

/// Target with the handlers the wire-level scenarios use.
pub fn demo_target() -> Arc<dyn RpcTarget> {
    let mut target = MethodTarget::new();
    target.method("hello", |args| {
        let name = first_str(args);
        Ok(json!(format!("Hello, {}!", name)))
    });
    target.method("makeUser", |_| Ok(json!({"id": "u1"})));
    target.method("getProfile", |args| {
        let id = first_str(args);
        Ok(json!({"id": id, "bio": "ok"}))
    });
    target.method("list", |_| Ok(json!([1, 2, 3])));
    target.method("echo", |args| {
        Ok(args
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .unwrap_or(Value::Null))
    });
    Arc::new(target)
}

pub fn first_str(args: &Value) -> String {
    args.as_array()
        .and_then(|a| a.first())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn parse(frame: &str) -> Value {
    serde_json::from_str(frame).expect("frame is valid JSON")
}
