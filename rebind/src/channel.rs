//! Private duplex channel between the client and one isolated context.
//!
//! The analog of a paired message channel: two symmetric ports, each sending
//! to the other over an unbounded in-process queue. Payloads are untyped JSON
//! values; each side validates what it receives against its own schema, so an
//! unexpected shape is a protocol error rather than a type error at the seam.

use tokio::sync::mpsc;

/// The channel peer hung up: every port and sender on the other side is gone.
#[derive(Debug, Clone, thiserror::Error)]
#[error("private channel closed")]
pub struct ChannelClosed;

/// One end of a private duplex channel.
pub struct ChannelPort {
    tx: mpsc::UnboundedSender<serde_json::Value>,
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl ChannelPort {
    /// Create a connected pair of ports. Messages posted on one are received
    /// on the other, in post order.
    pub fn pair() -> (ChannelPort, ChannelPort) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelPort { tx: a_tx, rx: b_rx },
            ChannelPort { tx: b_tx, rx: a_rx },
        )
    }

    /// Post a message to the peer.
    pub fn post(&self, message: serde_json::Value) -> Result<(), ChannelClosed> {
        self.tx.send(message).map_err(|_| ChannelClosed)
    }

    /// Receive the next message from the peer. `None` once the peer side is
    /// fully dropped.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }

    /// Split into independently owned halves, so one task can demultiplex
    /// inbound traffic while any number of senders post outbound.
    pub fn split(self) -> (PortSender, PortReceiver) {
        (PortSender { tx: self.tx }, PortReceiver { rx: self.rx })
    }
}

/// Outbound half of a split port.
#[derive(Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl PortSender {
    pub fn post(&self, message: serde_json::Value) -> Result<(), ChannelClosed> {
        self.tx.send(message).map_err(|_| ChannelClosed)
    }
}

/// Inbound half of a split port.
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl PortReceiver {
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}
