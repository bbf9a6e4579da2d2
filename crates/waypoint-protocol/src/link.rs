//! The connection contract nodes program against.
//!
//! Registries, dispatch tables and game flows never touch sockets. They hold
//! an `Arc<dyn PacketLink>` and can send packets, kill the link, and ask
//! whether it is still alive. A writer task owned by the server loop drains
//! the outbound side onto the real transport.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use waypoint_transport::ConnectionId;

use crate::Packet;

/// A live, packet-level connection to a peer.
pub trait PacketLink: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn remote_endpoint(&self) -> SocketAddr;

    /// Queues `packet` for delivery. Returns `false` if the link is dead.
    fn send(&self, packet: Packet) -> bool;

    /// Terminates the link. The first reason wins; later calls are no-ops.
    fn kill(&self, reason: &str);

    fn is_alive(&self) -> bool;

    /// Flow-control hook invoked after a packet has been fully handled.
    fn on_after_packet_processed(&self, _packet: &Packet) {}
}

/// What a [`ChannelLink`] hands to its writer.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Packet(Packet),
    Closed { reason: String },
}

/// A [`PacketLink`] backed by an unbounded channel.
///
/// The server loop pairs one with a socket writer; in-process clients and
/// tests read the receiver directly.
pub struct ChannelLink {
    id: ConnectionId,
    remote: SocketAddr,
    alive: AtomicBool,
    kill_reason: OnceLock<String>,
    processed: AtomicU64,
    outbound: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelLink {
    pub fn new(remote: SocketAddr) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        Self::with_id(ConnectionId::next(), remote)
    }

    pub fn with_id(
        id: ConnectionId,
        remote: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Self {
            id,
            remote,
            alive: AtomicBool::new(true),
            kill_reason: OnceLock::new(),
            processed: AtomicU64::new(0),
            outbound: tx,
        };
        (link, rx)
    }

    /// Why the link was killed, if it was.
    pub fn kill_reason(&self) -> Option<&str> {
        self.kill_reason.get().map(String::as_str)
    }

    /// Number of packets reported through `on_after_packet_processed`.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Marks the link dead without a kill reason (peer hung up).
    pub fn mark_closed(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl PacketLink for ChannelLink {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    fn send(&self, packet: Packet) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.outbound.send(LinkEvent::Packet(packet)).is_ok()
    }

    fn kill(&self, reason: &str) {
        if self.kill_reason.set(reason.to_string()).is_err() {
            return;
        }
        self.alive.store(false, Ordering::Release);
        tracing::debug!(conn_id = %self.id, %reason, "link killed");
        let _ = self.outbound.send(LinkEvent::Closed {
            reason: reason.to_string(),
        });
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn on_after_packet_processed(&self, _packet: &Packet) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Payload;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_send_delivers_until_killed() {
        let (link, mut rx) = ChannelLink::new(addr());
        assert!(link.send(Packet::from(Payload::KeepAlive)));
        link.kill("bye");
        assert!(!link.send(Packet::from(Payload::KeepAlive)));

        assert!(matches!(rx.try_recv(), Ok(LinkEvent::Packet(_))));
        assert_eq!(
            rx.try_recv().ok(),
            Some(LinkEvent::Closed { reason: "bye".into() })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_kill_first_reason_wins() {
        let (link, _rx) = ChannelLink::new(addr());
        link.kill("first");
        link.kill("second");
        assert_eq!(link.kill_reason(), Some("first"));
        assert!(!link.is_alive());
    }
}
