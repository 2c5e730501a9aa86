use statelink_proto::{ClientMessage, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The outbound half of a framed transport. The inbound half arrives as
/// [`TransportEvent`]s fed into the session by whoever owns the socket; the
/// socket itself (WebSocket or otherwise) is an external collaborator.
pub trait Transport: Send + Sync {
    fn send(&self, msg: &ClientMessage) -> anyhow::Result<()>;
}

/// What the transport reports upward.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened,
    Closed,
    Message(ServerMessage),
}

/// A loopback transport for tests and embedded servers: envelopes land in a
/// channel, connectivity is a switch.
pub struct InMemoryTransport {
    connected: AtomicBool,
    outbound: async_channel::Sender<ClientMessage>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<InMemoryTransport>, async_channel::Receiver<ClientMessage>) {
        let (tx, rx) = async_channel::unbounded();
        (
            Arc::new(InMemoryTransport {
                connected: AtomicBool::new(true),
                outbound: tx,
            }),
            rx,
        )
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, msg: &ClientMessage) -> anyhow::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            anyhow::bail!("WebSocket not connected");
        }
        self.outbound
            .try_send(msg.clone())
            .map_err(|err| anyhow::anyhow!("transport channel closed: {err}"))
    }
}
