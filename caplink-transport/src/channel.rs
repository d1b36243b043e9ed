// In-process pair transport.
//
// Two sessions in the same process (tests, demos, worker isolation) talk
// through a pair of mpsc channels; each side's outbound frames become the
// other side's inbound queue.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use tracing::debug;

use caplink_core::RpcTransport;

/// One direction of an in-process pair.
pub struct ChannelTransport {
    tx: Mutex<Sender<String>>,
    abort_reason: Mutex<Option<String>>,
}

impl ChannelTransport {
    pub fn new(tx: Sender<String>) -> Arc<Self> {
        Arc::new(ChannelTransport {
            tx: Mutex::new(tx),
            abort_reason: Mutex::new(None),
        })
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().unwrap().clone()
    }
}

impl RpcTransport for ChannelTransport {
    fn send(&self, frame: &str) {
        // A disconnected peer is equivalent to a closed connection; frames
        // are dropped, the session notices via its own abort path.
        if self.tx.lock().unwrap().send(frame.to_string()).is_err() {
            debug!("channel peer disconnected; frame dropped");
        }
    }

    fn abort(&self, reason: &str) {
        *self.abort_reason.lock().unwrap() = Some(reason.to_string());
    }
}

/// Build a connected pair. Frames sent on the first transport arrive on
/// the second receiver and vice versa.
pub fn channel_pair() -> (
    (Arc<ChannelTransport>, Receiver<String>),
    (Arc<ChannelTransport>, Receiver<String>),
) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (
        (ChannelTransport::new(a_tx), a_rx),
        (ChannelTransport::new(b_tx), b_rx),
    )
}
