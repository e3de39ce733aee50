//! Seams to the outside world: the datagram send primitive the protocol
//! writes through, and the delivery collaborator completed transfers
//! are handed to.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

/// Datagram send primitive. The protocol never touches a socket
/// directly; tests substitute an in-memory implementation.
pub trait Outbound: Send + Sync {
    fn send_to(&self, data: &[u8], peer: SocketAddr);
}

/// The real thing: write through the host's bound UDP socket. Send
/// errors are logged and swallowed so the dispatcher loop keeps
/// running.
pub struct UdpOutbound {
    socket: Arc<UdpSocket>,
}

impl UdpOutbound {
    pub fn new(socket: Arc<UdpSocket>) -> UdpOutbound {
        UdpOutbound { socket }
    }
}

impl Outbound for UdpOutbound {
    fn send_to(&self, data: &[u8], peer: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, peer) {
            tracing::warn!(%peer, %e, "datagram send failed");
        }
    }
}

/// Receives completed transfers. Persistence and printing are the
/// embedding application's job; `ext` is the file extension without the
/// dot, empty when the sender gave none.
pub trait Delivery: Send + Sync {
    fn deliver_file(&self, peer: SocketAddr, name: &str, ext: &str, data: Vec<u8>);
    fn deliver_msg(&self, peer: SocketAddr, data: Vec<u8>);
}

/// Default collaborator: log the arrival and drop the bytes.
pub struct LogDelivery;

impl Delivery for LogDelivery {
    fn deliver_file(&self, peer: SocketAddr, name: &str, ext: &str, data: Vec<u8>) {
        tracing::info!(%peer, name, ext, len = data.len(), "file received");
    }

    fn deliver_msg(&self, peer: SocketAddr, data: Vec<u8>) {
        tracing::info!(%peer, len = data.len(), "message received");
    }
}
