//! Session state machine for a bidirectional capability RPC protocol.
//!
//! A [`RpcSession`] mediates one duplex conversation over a
//! message-oriented transport. Peers exchange JSON frames
//! (`push`/`pull`/`resolve`/`reject`/`release`/`abort`) whose payloads are
//! JSON trees with an expression overlay: capabilities, promises, extended
//! scalars and deferred `remap` programs. Pushed pipelines are evaluated
//! lazily, so callers can chain on results that do not exist yet and pay a
//! single round trip.
//!
//! The crate deliberately stops at the transport seam: anything that can
//! deliver strings in order ([`RpcTransport`]) can carry a session.

pub mod error;
pub mod hooks;
pub mod protocol;
pub mod stubs;
pub mod transport;

pub use error::RpcError;
pub use hooks::{MethodTarget, RpcTarget, StubHook, TargetHook};
pub use protocol::expression;
pub use protocol::{Frame, RpcSession, SessionStats};
pub use transport::{pump_message, RpcTransport};
