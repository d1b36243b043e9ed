// Transport seam. Implementations deliver frame strings to the peer; the
// session stays transport-agnostic.

use std::sync::Arc;

use crate::protocol::session::RpcSession;

/// Delivers outbound frames and propagates aborts. Implementations must
/// serialize sends per session.
pub trait RpcTransport: Send + Sync {
    fn send(&self, frame: &str);
    fn abort(&self, reason: &str);
}

/// Feed one inbound frame through a session: install the transport, send
/// the direct reply (if any), flush microtasks, and propagate a fresh
/// abort to the transport.
pub fn pump_message(session: &RpcSession, transport: &Arc<dyn RpcTransport>, text: &str) {
    session.set_transport(Some(transport.clone()));
    let was_aborted = session.is_aborted();

    if let Some(reply) = session.handle_message(text) {
        transport.send(&reply);
    }
    session.process_tasks();

    if !was_aborted && session.is_aborted() {
        let reason = session.abort_reason().unwrap_or_default();
        transport.abort(&reason);
    }
}
