// Session core: frame ingestion, table mutation, microtask scheduling,
// promise forwarding and the abort protocol.
//
// A session is an exclusive domain. State lives behind one mutex inside an
// `Arc`-cloneable handle so that method handlers may keep a handle and
// re-enter the public API (`call_client`, `export_target`, ...) while a
// pull is being answered. Lock scopes never span a dispatcher call or a
// transport send.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::hooks::{RpcTarget, StubHook, TargetHook};
use crate::transport::RpcTransport;

use super::expression;
use super::tables::{Exporter, Importer};
use super::wire::Frame;

/// Deferred work, drained by `process_tasks`.
pub(crate) enum Microtask {
    /// Execute the pending operation of an export entry.
    Execute(i64),
    /// Send a `release` frame for a peer capability id.
    EmitRelease { id: i64, count: i64 },
}

/// Table state owned by one session.
pub(crate) struct SessionState {
    pub exporter: Exporter,
    pub importer: Importer,
    /// Links our import ids to exported promise ids, so a peer resolution
    /// is forwarded as the resolution of the promise we handed out.
    pub import_to_promise_export: HashMap<i64, i64>,
    /// Capability identity (target address) to export id, for re-export
    /// parity.
    pub reverse_export: HashMap<usize, i64>,
    /// Sub-targets referenced by `$export_target` sentinels.
    pub target_registry: HashMap<usize, Arc<dyn RpcTarget>>,
    pub microtasks: VecDeque<Microtask>,
    pub transport: Option<Arc<dyn RpcTransport>>,
}

impl SessionState {
    fn new() -> Self {
        SessionState {
            exporter: Exporter::new(),
            importer: Importer::new(),
            import_to_promise_export: HashMap::new(),
            reverse_export: HashMap::new(),
            target_registry: HashMap::new(),
            microtasks: VecDeque::new(),
            transport: None,
        }
    }

    fn clear(&mut self) {
        self.exporter.reset();
        self.importer.reset();
        self.import_to_promise_export.clear();
        self.reverse_export.clear();
        self.target_registry.clear();
        self.microtasks.clear();
    }
}

type ErrorHook = Box<dyn Fn(Value) -> Value + Send + Sync>;
type BrokenCallback = Box<dyn Fn(&str) + Send + Sync>;

struct SessionInner {
    target: Mutex<Option<Arc<dyn RpcTarget>>>,
    state: Mutex<SessionState>,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    on_send_error: Mutex<Option<ErrorHook>>,
    on_broken: Mutex<Vec<BrokenCallback>>,
}

/// Table counts, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub imports: usize,
    pub exports: usize,
}

/// One side of a capability RPC conversation.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

impl RpcSession {
    /// Create a session with no root target; calls on export 0 will fail
    /// until `set_target` is used.
    pub fn new() -> Self {
        RpcSession {
            inner: Arc::new(SessionInner {
                target: Mutex::new(None),
                state: Mutex::new(SessionState::new()),
                aborted: AtomicBool::new(false),
                abort_reason: Mutex::new(None),
                on_send_error: Mutex::new(None),
                on_broken: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_target(target: Arc<dyn RpcTarget>) -> Self {
        let session = RpcSession::new();
        session.set_target(target);
        session
    }

    pub fn set_target(&self, target: Arc<dyn RpcTarget>) {
        *lock(&self.inner.target) = Some(target);
    }

    pub fn set_transport(&self, transport: Option<Arc<dyn RpcTransport>>) {
        self.state().transport = transport;
    }

    /// Install the error redaction hook, applied to locally-produced
    /// outbound rejects and abort payloads.
    pub fn set_on_send_error<F>(&self, hook: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        *lock(&self.inner.on_send_error) = Some(Box::new(hook));
    }

    /// Observe session aborts. The callback receives the JSON-stringified
    /// abort payload.
    pub fn register_on_broken<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.inner.on_broken).push(Box::new(callback));
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<String> {
        lock(&self.inner.abort_reason).clone()
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        SessionStats {
            imports: state.importer.len(),
            exports: state.exporter.len(),
        }
    }

    /// Reinitialize all tables (fresh conversation on a reused session).
    pub fn reset(&self) {
        self.state().clear();
    }

    // ------------------------------------------------------------------
    // Frame ingestion

    /// Process one inbound frame, returning the direct reply (if any).
    /// Out-of-band frames (server-initiated pushes, forwarded resolutions,
    /// releases) go through the installed transport. Malformed input is
    /// dropped; after an abort every frame is dropped.
    pub fn handle_message(&self, text: &str) -> Option<String> {
        if self.is_aborted() {
            trace!("dropping frame on aborted session");
            return None;
        }
        let frame = Frame::parse(text)?;
        match frame {
            Frame::Push(expr) => {
                self.handle_push(expr);
                None
            }
            Frame::Pull(id) => Some(self.handle_pull(id)),
            Frame::Resolve(id, value) => self.handle_resolution(id, value, false),
            Frame::Reject(id, error) => self.handle_resolution(id, error, true),
            Frame::Release(id, count) => {
                self.handle_release(id, count);
                None
            }
            Frame::Abort(payload) => {
                let reason =
                    serde_json::to_string(&payload).unwrap_or_else(|_| "\"abort\"".to_string());
                self.mark_aborted(&reason);
                None
            }
        }
    }

    fn handle_push(&self, expr: Value) {
        let id = self.state().exporter.allocate_for_push();
        let tag = expr
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        match tag.as_str() {
            "pipeline" => self.push_pipeline(id, &expr),
            "remap" => self.push_remap(id, expr),
            other => {
                debug!(id, tag = other, "push with unsupported expression");
                self.state().exporter.cache_result(
                    id,
                    RpcError::method("unsupported push expression").to_wire(),
                );
            }
        }
    }

    fn push_pipeline(&self, id: i64, expr: &Value) {
        let arr = expr.as_array().expect("push_pipeline on non-array");
        let subject = arr.get(1).and_then(Value::as_i64);
        let method = arr
            .get(2)
            .and_then(Value::as_array)
            .and_then(|path| path.first())
            .and_then(Value::as_str)
            .map(str::to_string);

        let (Some(subject), Some(method)) = (subject, method) else {
            self.state()
                .exporter
                .cache_result(id, RpcError::method("malformed pipeline push").to_wire());
            return;
        };

        let args = arr.get(3).cloned().unwrap_or_else(|| json!([]));
        let captured = expression::collect_peer_ids(&args);

        let mut state = self.state();
        let hook = if subject == 0 {
            None
        } else {
            state.exporter.hook(subject)
        };
        state.exporter.set_operation(id, method, args, hook);
        for peer_id in captured {
            state.exporter.record_imported_id(id, peer_id);
        }
        state.microtasks.push_back(Microtask::Execute(id));
    }

    fn push_remap(&self, id: i64, expr: Value) {
        let captured = expr
            .as_array()
            .and_then(|arr| arr.get(3))
            .map(expression::collect_peer_ids)
            .unwrap_or_default();
        {
            let mut state = self.state();
            state.exporter.ensure(id);
            for peer_id in captured {
                state.exporter.record_imported_id(id, peer_id);
            }
        }

        // Remap programs run synchronously at push time; any embedded
        // server-to-client call surfaces as a promise expression in the
        // stored result.
        let result = match self.evaluate(&expr, 0) {
            Ok(value) => value,
            Err(err) => err.to_wire(),
        };
        self.state().exporter.cache_result(id, result);
    }

    fn handle_pull(&self, id: i64) -> String {
        self.process_tasks();
        if self.state().exporter.has_operation(id) {
            // Microtasks were cleared or not yet flushed; execute now.
            self.execute_export(id);
        }

        let resolved = self.state().exporter.result(id);
        let frame = match resolved {
            Some(value) if expression::is_error_tuple(&value) => {
                Frame::Reject(id, self.redact(value))
            }
            Some(value) => match self.devalue_result(&value, 0) {
                Ok(payload) => Frame::Resolve(id, expression::escape_result(payload)),
                Err(err) => Frame::Reject(id, self.redact(err.to_wire())),
            },
            None => {
                return Frame::Reject(id, self.redact(RpcError::export_not_found().to_wire()))
                    .serialize();
            }
        };

        // Drain the entry and queue releases for the peer references its
        // arguments captured; they follow the resolve in the stream.
        {
            let mut state = self.state();
            state.exporter.clear_result(id);
            let released = state.exporter.take_imported_ids(id);
            for (peer_id, count) in released {
                state
                    .microtasks
                    .push_back(Microtask::EmitRelease { id: peer_id, count });
            }
        }

        frame.serialize()
    }

    /// Peer resolved or rejected one of our imports: acknowledge with a
    /// release and forward to the linked promise export, if any. Forwarded
    /// payloads pass through unredacted.
    fn handle_resolution(&self, import_id: i64, value: Value, is_reject: bool) -> Option<String> {
        let (count, linked) = {
            let mut state = self.state();
            let count = state.importer.record_resolution(import_id, value.clone());
            let linked = state.import_to_promise_export.remove(&import_id);
            (count, linked)
        };

        let release = Frame::Release(import_id, count).serialize();
        let forwarded = linked.map(|promise_id| {
            if is_reject {
                Frame::Reject(promise_id, value).serialize()
            } else {
                Frame::Resolve(promise_id, value).serialize()
            }
        });

        match self.transport() {
            Some(transport) => {
                transport.send(&release);
                if let Some(frame) = forwarded {
                    transport.send(&frame);
                }
                None
            }
            None => {
                if forwarded.is_some() {
                    debug!(import_id, "no transport; dropping forwarded resolution");
                }
                Some(release)
            }
        }
    }

    fn handle_release(&self, id: i64, count: i64) {
        let mut state = self.state();
        if state.exporter.contains(id) {
            if state.exporter.release(id, count) {
                // Drop stale identity mappings so the capability re-exports
                // under a fresh id next time.
                state.reverse_export.retain(|_, export_id| *export_id != id);
            }
        } else if state.importer.contains(id) {
            state.importer.release_local(id, count);
        } else {
            debug!(id, count, "release for unknown id ignored");
        }
    }

    // ------------------------------------------------------------------
    // Microtasks

    /// Flush queued work: pending export executions and release frames.
    pub fn process_tasks(&self) {
        loop {
            if self.is_aborted() {
                self.state().microtasks.clear();
                return;
            }
            let task = self.state().microtasks.pop_front();
            let Some(task) = task else { break };
            match task {
                Microtask::Execute(id) => self.execute_export(id),
                Microtask::EmitRelease { id, count } => match self.transport() {
                    Some(transport) => transport.send(&Frame::Release(id, count).serialize()),
                    None => trace!(id, count, "no transport; dropping release frame"),
                },
            }
        }
    }

    /// Process tasks until the session is quiescent. Batch embedders call
    /// this before closing a batch.
    pub fn drain(&self) {
        self.process_tasks();
    }

    pub fn is_drained(&self) -> bool {
        self.state().microtasks.is_empty()
    }

    /// Flush pending releases and clear all tables.
    pub fn close(&self) {
        self.process_tasks();
        self.state().clear();
    }

    /// Execute the pending operation of export `id` and cache the outcome
    /// (a value or an error tuple) on the entry. Dispatch happens at most
    /// once; the result is reused by later pipeline references.
    pub(crate) fn execute_export(&self, id: i64) {
        let Some((method, args, hook)) = self.state().exporter.operation(id) else {
            return;
        };
        let hook = hook.or_else(|| self.root_hook());

        let outcome = match hook {
            Some(hook) => self
                .evaluate(&args, 0)
                .and_then(|resolved| hook.call(&method, &resolved)),
            None => Err(RpcError::method(format!("Method not found: {}", method))),
        };

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                debug!(id, method = %method, error = %err, "export execution failed");
                err.to_wire()
            }
        };
        self.state().exporter.cache_result(id, value);
    }

    // ------------------------------------------------------------------
    // Server-initiated calls

    /// Issue a property get on a peer-held capability. Emits `push`+`pull`
    /// on the transport and returns a negative promise export id whose
    /// resolution will be forwarded from the peer.
    pub fn call_client(&self, export_id: i64, path: Value) -> Result<i64, RpcError> {
        self.call_client_inner(export_id, path, None)
    }

    /// Issue a method call on a peer-held capability.
    pub fn call_client_method(
        &self,
        export_id: i64,
        method: &str,
        args: Value,
    ) -> Result<i64, RpcError> {
        self.call_client_inner(export_id, json!([method]), Some(args))
    }

    pub(crate) fn call_client_inner(
        &self,
        export_id: i64,
        path: Value,
        args: Option<Value>,
    ) -> Result<i64, RpcError> {
        let transport = self
            .transport()
            .ok_or_else(|| RpcError::method("client call without transport"))?;

        let (import_id, promise_id) = {
            let mut state = self.state();
            let import_id = state.importer.allocate();
            let promise_id = state.exporter.allocate_negative();
            state.exporter.ensure(promise_id);
            state
                .import_to_promise_export
                .insert(import_id, promise_id);
            (import_id, promise_id)
        };

        let pipeline = match args {
            Some(args) => json!(["pipeline", export_id, path, args]),
            None => json!(["pipeline", export_id, path]),
        };
        transport.send(&Frame::Push(pipeline).serialize());
        transport.send(&Frame::Pull(import_id).serialize());
        trace!(export_id, import_id, promise_id, "client call issued");
        Ok(promise_id)
    }

    /// Link a peer-held promise id to a fresh negative promise export; the
    /// peer's eventual resolve/reject is forwarded under the returned id.
    pub fn await_client_promise(&self, peer_promise_id: i64) -> i64 {
        let mut state = self.state();
        let promise_id = state.exporter.allocate_negative();
        state.exporter.ensure(promise_id);
        state
            .import_to_promise_export
            .insert(peer_promise_id, promise_id);
        promise_id
    }

    /// Register a sub-target for export and return the sentinel to place in
    /// a handler result. Devaluation turns it into `["export", negId]` with
    /// a stable id per target.
    pub fn export_target(&self, target: Arc<dyn RpcTarget>) -> Value {
        let key = crate::hooks::target_key(&target);
        self.state().target_registry.insert(key, target);
        json!({ expression::sentinel::EXPORT_TARGET: key })
    }

    // ------------------------------------------------------------------
    // Abort protocol

    /// Construct an outbound abort frame, applying redaction to error
    /// tuples.
    pub fn build_abort(&self, payload: Value) -> String {
        let payload = if expression::is_error_tuple(&payload) {
            self.redact(payload)
        } else {
            payload
        };
        Frame::Abort(payload).serialize()
    }

    /// Abort the session: emit an abort frame on the transport (when one is
    /// installed) and tear down locally.
    pub fn abort(&self, payload: Value) {
        let frame = self.build_abort(payload.clone());
        if let Some(transport) = self.transport() {
            transport.send(&frame);
        }
        let reason = serde_json::to_string(&payload).unwrap_or_else(|_| "\"abort\"".to_string());
        self.mark_aborted(&reason);
    }

    /// Local teardown: mark terminal, notify observers, clear everything.
    /// All frames received afterwards are dropped.
    pub fn mark_aborted(&self, reason: &str) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "session aborted");
        *lock(&self.inner.abort_reason) = Some(reason.to_string());
        self.state().clear();

        let callbacks = std::mem::take(&mut *lock(&self.inner.on_broken));
        for callback in &callbacks {
            callback(reason);
        }
    }

    // ------------------------------------------------------------------
    // Internals shared with the evaluator / devaluator

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.inner.state)
    }

    pub(crate) fn root_target(&self) -> Option<Arc<dyn RpcTarget>> {
        lock(&self.inner.target).clone()
    }

    pub(crate) fn root_hook(&self) -> Option<Arc<dyn StubHook>> {
        self.root_target().map(TargetHook::new)
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn RpcTransport>> {
        self.state().transport.clone()
    }

    /// Run an error tuple through the redaction hook, then force the result
    /// back into tuple shape in case the hook misbehaved.
    pub(crate) fn redact(&self, tuple: Value) -> Value {
        let hooked = match &*lock(&self.inner.on_send_error) {
            Some(hook) => hook(tuple.clone()),
            None => return expression::sanitize_error(tuple.clone(), &tuple),
        };
        expression::sanitize_error(hooked, &tuple)
    }
}

impl Default for RpcSession {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::MethodTarget;

    fn echo_target() -> Arc<dyn RpcTarget> {
        let mut target = MethodTarget::new();
        target.method("echo", |args| {
            let name = args
                .as_array()
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(json!(format!("Hello, {}!", name)))
        });
        Arc::new(target)
    }

    #[test]
    fn push_then_pull_resolves() {
        let session = RpcSession::with_target(echo_target());
        session.handle_message(r#"["push",["pipeline",0,["echo"],["World"]]]"#);
        let reply = session
            .handle_message(r#"["pull",1]"#)
            .expect("pull must answer");
        assert_eq!(reply, r#"["resolve",1,"Hello, World!"]"#);
    }

    #[test]
    fn pull_of_unknown_id_rejects() {
        let session = RpcSession::with_target(echo_target());
        let reply = session.handle_message(r#"["pull",9]"#).unwrap();
        assert_eq!(
            reply,
            r#"["reject",9,["error","ExportNotFound","Export ID not found"]]"#
        );
    }

    #[test]
    fn second_pull_after_resolve_rejects() {
        let session = RpcSession::with_target(echo_target());
        session.handle_message(r#"["push",["pipeline",0,["echo"],["A"]]]"#);
        session.handle_message(r#"["pull",1]"#).unwrap();
        let reply = session.handle_message(r#"["pull",1]"#).unwrap();
        assert!(reply.contains("ExportNotFound"));
    }

    #[test]
    fn unsupported_push_rejects_with_method_error() {
        let session = RpcSession::with_target(echo_target());
        session.handle_message(r#"["push",["mystery",1,2]]"#);
        let reply = session.handle_message(r#"["pull",1]"#).unwrap();
        assert!(reply.contains("MethodError"));
        assert!(reply.contains("unsupported push expression"));
    }

    #[test]
    fn push_ids_follow_push_order() {
        let session = RpcSession::with_target(echo_target());
        session.handle_message(r#"["push",["pipeline",0,["echo"],["A"]]]"#);
        session.handle_message(r#"["push",["pipeline",0,["echo"],["B"]]]"#);
        assert_eq!(
            session.handle_message(r#"["pull",2]"#).unwrap(),
            r#"["resolve",2,"Hello, B!"]"#
        );
        assert_eq!(
            session.handle_message(r#"["pull",1]"#).unwrap(),
            r#"["resolve",1,"Hello, A!"]"#
        );
    }

    #[test]
    fn stats_track_table_sizes() {
        let session = RpcSession::with_target(echo_target());
        assert_eq!(
            session.stats(),
            SessionStats {
                imports: 0,
                exports: 0
            }
        );
        session.handle_message(r#"["push",["pipeline",0,["echo"],["A"]]]"#);
        assert_eq!(session.stats().exports, 1);
    }

    #[test]
    fn drained_after_pull() {
        let session = RpcSession::with_target(echo_target());
        session.handle_message(r#"["push",["pipeline",0,["echo"],["A"]]]"#);
        assert!(!session.is_drained());
        session.handle_message(r#"["pull",1]"#);
        session.drain();
        assert!(session.is_drained());
    }
}
