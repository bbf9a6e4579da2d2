//! WebSocket server loop and client connector.
//!
//! Each accepted socket is split into a [`ChannelLink`] the node sends
//! through and an inbound channel fed by a reader task. A writer task
//! encodes outbound packets; when the link is killed it sends a final
//! `Disconnect` carrying the reason and closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, connect_async};
use tracing::{debug, error, info, warn};
use waypoint_protocol::{
    ChannelLink, Codec, JsonCodec, LinkEvent, Packet, PacketLink, Payload, ServerAddress,
};
use waypoint_transport::{
    Connection, ConnectionId, Transport, TransportError, WebSocketConnection, WebSocketTransport,
};

use crate::WaypointError;
use crate::client::Connector;
use crate::node::Node;
use crate::worker::Conduit;

/// Reason recorded when the remote side closes the socket.
const REASON_REMOTE_CLOSED: &str = "remote closed connection";

/// Serves one [`Node`] over WebSocket.
pub struct NodeServer {
    node: Arc<Node>,
    transport: WebSocketTransport,
}

impl NodeServer {
    /// Binds the node's configured `bind_address`.
    pub async fn bind(node: Arc<Node>) -> Result<Self, WaypointError> {
        let transport = WebSocketTransport::bind(&node.config().node.bind_address).await?;
        Ok(Self { node, transport })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Accepts connections until the process ends.
    pub async fn run(mut self) -> Result<(), WaypointError> {
        info!(node = %self.node.name(), addr = ?self.local_addr().ok(), "node server running");
        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    tokio::spawn(serve_connection(Arc::clone(&self.node), conn));
                }
                Err(e) => {
                    error!(node = %self.node.name(), error = %e, "accept failed");
                }
            }
        }
    }
}

async fn serve_connection(node: Arc<Node>, conn: WebSocketConnection) {
    let conn = Arc::new(conn);
    let (link, outbound) = ChannelLink::with_id(conn.id(), conn.remote_addr());
    let link = Arc::new(link);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_frames(Arc::clone(&conn), outbound));
    let conduit = Conduit {
        link: Arc::clone(&link),
        inbound: inbound_rx,
    };
    if let Err(e) = node.accept(conduit).await {
        debug!(conn_id = %conn.id(), error = %e, "connection not accepted");
        let _ = writer.await;
        return;
    }

    read_frames(conn.as_ref(), &link, &inbound_tx).await;
    let _ = writer.await;
}

/// Drains the link's outbound side onto the socket.
async fn write_frames(conn: Arc<WebSocketConnection>, mut outbound: mpsc::UnboundedReceiver<LinkEvent>) {
    let codec = JsonCodec;
    while let Some(event) = outbound.recv().await {
        match event {
            LinkEvent::Packet(packet) => match codec.encode(&packet) {
                Ok(bytes) => {
                    if let Err(e) = conn.send(&bytes).await {
                        debug!(conn_id = %conn.id(), error = %e, "write failed");
                        break;
                    }
                }
                Err(e) => warn!(conn_id = %conn.id(), error = %e, "packet not encodable"),
            },
            LinkEvent::Closed { reason } => {
                if let Ok(bytes) = codec.encode(&Packet::from(Payload::Disconnect { reason })) {
                    let _ = conn.send(&bytes).await;
                }
                let _ = conn.close().await;
                break;
            }
        }
    }
}

/// Decodes frames into the inbound channel until the socket ends. A
/// frame that does not decode kills the link.
async fn read_frames(
    conn: &WebSocketConnection,
    link: &ChannelLink,
    inbound: &mpsc::UnboundedSender<LinkEvent>,
) {
    let codec = JsonCodec;
    let reason = loop {
        match conn.recv().await {
            Ok(Some(bytes)) => match codec.decode::<Packet>(&bytes) {
                Ok(packet) => {
                    if inbound.send(LinkEvent::Packet(packet)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let reason = format!("malformed packet: {e}");
                    warn!(conn_id = %conn.id(), %reason, "protocol violation");
                    link.kill(&reason);
                    break reason;
                }
            },
            Ok(None) => break REASON_REMOTE_CLOSED.to_string(),
            Err(e) => break e.to_string(),
        }
    };
    link.mark_closed();
    let _ = inbound.send(LinkEvent::Closed { reason });
}

/// Connects to servers over WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, server: &ServerAddress) -> Result<Conduit, WaypointError> {
        let (ws, _) = connect_async(server.address.as_str()).await.map_err(|e| {
            TransportError::ConnectionClosed(format!("connect to {} failed: {e}", server.name))
        })?;
        let remote = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => peer_addr(tcp),
            _ => None,
        }
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        let (link, mut outbound) = ChannelLink::with_id(ConnectionId::next(), remote);
        let link = Arc::new(link);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (mut sink, mut stream) = ws.split();
        let name = server.name.clone();

        tokio::spawn(async move {
            let codec = JsonCodec;
            while let Some(event) = outbound.recv().await {
                let LinkEvent::Packet(packet) = event else {
                    let _ = sink.close().await;
                    break;
                };
                match codec.encode(&packet) {
                    Ok(bytes) => {
                        if sink.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(server = %name, error = %e, "packet not encodable"),
                }
            }
        });

        let reader_link = Arc::clone(&link);
        tokio::spawn(async move {
            let codec = JsonCodec;
            let reason = loop {
                let bytes = match stream.next().await {
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Close(_))) | None => break REASON_REMOTE_CLOSED.to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                };
                match codec.decode::<Packet>(&bytes) {
                    Ok(packet) => {
                        if inbound_tx.send(LinkEvent::Packet(packet)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let reason = format!("malformed packet: {e}");
                        reader_link.kill(&reason);
                        break reason;
                    }
                }
            };
            reader_link.mark_closed();
            let _ = inbound_tx.send(LinkEvent::Closed { reason });
        });

        Ok(Conduit {
            link,
            inbound: inbound_rx,
        })
    }
}

fn peer_addr(tcp: &TcpStream) -> Option<SocketAddr> {
    tcp.peer_addr().ok()
}
