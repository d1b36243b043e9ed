//! Transport adapters for caplink sessions.
//!
//! The session core only needs `send(string)` and `abort(reason)`; this
//! crate supplies the adapters embedders actually reach for: an
//! accumulating transport plus batch processor for HTTP-batch style
//! endpoints, a newline-delimited framing codec for stream transports,
//! and an in-process channel pair for wiring two sessions back-to-back.

pub mod batch;
pub mod channel;
pub mod codec;
pub mod logging;

pub use batch::{process_batch, BatchTransport};
pub use channel::{channel_pair, ChannelTransport};
pub use codec::NewlineDelimitedCodec;
