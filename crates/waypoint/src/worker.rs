//! Per-connection workers.
//!
//! Every connection, on a node or in a client, is a [`Conduit`]: a link to
//! send through plus the receiver its peer's packets arrive on. A worker
//! task drains the receiver and hands each packet to an [`Inbound`]
//! endpoint, strictly in arrival order. Handlers either run inline on the
//! worker, or the worker feeds a single-consumer serial queue and keeps
//! reading. When the conduit closes the endpoint's teardown runs once.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use waypoint_protocol::{ChannelLink, LinkEvent, Packet, PacketLink};

/// Reason recorded when the inbound side ends without a close event.
pub(crate) const REASON_PEER_GONE: &str = "peer went away";

/// One end of a connection.
pub struct Conduit {
    /// Where this end sends.
    pub link: Arc<ChannelLink>,
    /// What the other end sent.
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Conduit {
    /// Two connected in-process ends. The first end sees `first_remote`
    /// as its peer's address, the second sees `second_remote`.
    pub fn pair(first_remote: SocketAddr, second_remote: SocketAddr) -> (Conduit, Conduit) {
        let (to_second, second_inbound) = ChannelLink::new(first_remote);
        let (to_first, first_inbound) = ChannelLink::new(second_remote);
        (
            Conduit {
                link: Arc::new(to_second),
                inbound: first_inbound,
            },
            Conduit {
                link: Arc::new(to_first),
                inbound: second_inbound,
            },
        )
    }
}

/// The receiving side of a worker.
#[async_trait]
pub(crate) trait Inbound: Send + Sync + 'static {
    fn link(&self) -> &Arc<dyn PacketLink>;

    /// Handles one packet. Never fails: errors are contained by dispatch.
    async fn route(self: Arc<Self>, packet: Packet);

    /// Runs once after the last packet.
    async fn concluded(self: Arc<Self>, reason: String);
}

/// Drives `endpoint` until its conduit closes, then runs its teardown.
pub(crate) async fn run<I: Inbound>(
    endpoint: Arc<I>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    queued: bool,
) {
    let reason = if queued {
        run_queued(Arc::clone(&endpoint), inbound).await
    } else {
        run_inline(Arc::clone(&endpoint), inbound).await
    };
    debug!(conn_id = %endpoint.link().id(), %reason, "connection concluded");
    endpoint.concluded(reason).await;
}

async fn run_inline<I: Inbound>(
    endpoint: Arc<I>,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) -> String {
    loop {
        match inbound.recv().await {
            Some(LinkEvent::Packet(packet)) => {
                trace!(conn_id = %endpoint.link().id(), subtype = ?packet.subtype(), "inbound packet");
                Arc::clone(&endpoint).route(packet).await;
                if !endpoint.link().is_alive() {
                    return "link killed".to_string();
                }
            }
            Some(LinkEvent::Closed { reason }) => return reason,
            None => return REASON_PEER_GONE.to_string(),
        }
    }
}

async fn run_queued<I: Inbound>(
    endpoint: Arc<I>,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) -> String {
    let (queue, mut pending) = mpsc::unbounded_channel::<Packet>();
    let consumer = {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            while let Some(packet) = pending.recv().await {
                if !endpoint.link().is_alive() {
                    break;
                }
                Arc::clone(&endpoint).route(packet).await;
            }
        })
    };

    let reason = loop {
        match inbound.recv().await {
            Some(LinkEvent::Packet(packet)) => {
                if queue.send(packet).is_err() {
                    break "link killed".to_string();
                }
            }
            Some(LinkEvent::Closed { reason }) => break reason,
            None => break REASON_PEER_GONE.to_string(),
        }
    };

    drop(queue);
    let _ = consumer.await;
    reason
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;
    use waypoint_protocol::Payload;

    use super::*;

    struct Recorder {
        link: Arc<dyn PacketLink>,
        seen: Mutex<Vec<Packet>>,
        concluded: Mutex<Option<String>>,
        kill_after: Option<usize>,
        routed: AtomicUsize,
    }

    #[async_trait]
    impl Inbound for Recorder {
        fn link(&self) -> &Arc<dyn PacketLink> {
            &self.link
        }

        async fn route(self: Arc<Self>, packet: Packet) {
            self.seen.lock().await.push(packet);
            let n = self.routed.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.kill_after {
                self.link.kill("enough");
            }
        }

        async fn concluded(self: Arc<Self>, reason: String) {
            *self.concluded.lock().await = Some(reason);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn recorder(link: Arc<ChannelLink>, kill_after: Option<usize>) -> Arc<Recorder> {
        Arc::new(Recorder {
            link,
            seen: Mutex::new(Vec::new()),
            concluded: Mutex::new(None),
            kill_after,
            routed: AtomicUsize::new(0),
        })
    }

    fn chat(text: &str) -> Packet {
        Packet::from(Payload::Chat { text: text.into() })
    }

    #[tokio::test]
    async fn test_run_inline_preserves_order_and_reports_close_reason() {
        let (server, client) = Conduit::pair(addr(1), addr(2));
        let endpoint = recorder(server.link, None);
        client.link.send(chat("a"));
        client.link.send(chat("b"));
        client.link.kill("bye");

        run(Arc::clone(&endpoint), server.inbound, false).await;

        let seen = endpoint.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], chat("a"));
        assert_eq!(seen[1], chat("b"));
        assert_eq!(endpoint.concluded.lock().await.as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn test_run_inline_stops_after_own_link_killed() {
        let (server, client) = Conduit::pair(addr(3), addr(4));
        let endpoint = recorder(server.link, Some(1));
        client.link.send(chat("a"));
        client.link.send(chat("b"));

        run(Arc::clone(&endpoint), server.inbound, false).await;

        assert_eq!(endpoint.seen.lock().await.len(), 1);
        assert_eq!(endpoint.concluded.lock().await.as_deref(), Some("link killed"));
    }

    #[tokio::test]
    async fn test_run_queued_drains_queue_before_teardown() {
        let (server, client) = Conduit::pair(addr(5), addr(6));
        let endpoint = recorder(server.link, None);
        for i in 0..10 {
            client.link.send(chat(&i.to_string()));
        }
        drop(client);

        run(Arc::clone(&endpoint), server.inbound, true).await;

        let texts: Vec<String> = endpoint
            .seen
            .lock()
            .await
            .iter()
            .map(|p| match &p.payload {
                Payload::Chat { text } => text.clone(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(texts, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
        assert_eq!(endpoint.concluded.lock().await.as_deref(), Some(REASON_PEER_GONE));
    }

    #[test]
    fn test_pair_links_see_each_others_address() {
        let (first, second) = Conduit::pair(addr(7), addr(8));
        assert_eq!(first.link.remote_endpoint(), addr(7));
        assert_eq!(second.link.remote_endpoint(), addr(8));
    }
}
