//! Registry of live transport-level connections.
//!
//! Connections are indexed by [`ConnectionId`] and by remote endpoint.
//! Server-to-server ("parent") links are also kept in a parent map and
//! their loss is announced to subscribers. Removal touches all three maps
//! in one critical section and only then notifies, so no subscriber can
//! observe a half-removed connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use waypoint_protocol::{ConnectionId, PacketLink};

use crate::{SessionError, SubscriptionId, Subscribers};

/// Kill reason for a connection displaced by a newer one from the same
/// endpoint.
pub const REASON_ENDPOINT_REPLACED: &str = "replaced by a new connection from the same endpoint";

/// Parent-link lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentLinkEvent {
    Added { id: ConnectionId, endpoint: SocketAddr },
    Lost { id: ConnectionId, endpoint: SocketAddr },
}

/// A connection taken out of the registry.
pub struct RemovedConnection {
    pub link: Arc<dyn PacketLink>,
    pub is_parent: bool,
}

struct Tracked {
    link: Arc<dyn PacketLink>,
    is_parent: bool,
}

#[derive(Default)]
struct Maps {
    by_id: HashMap<ConnectionId, Tracked>,
    by_endpoint: HashMap<SocketAddr, ConnectionId>,
    parents: HashMap<ConnectionId, Arc<dyn PacketLink>>,
}

impl Maps {
    fn take(&mut self, id: ConnectionId) -> Option<Tracked> {
        let tracked = self.by_id.remove(&id)?;
        let endpoint = tracked.link.remote_endpoint();
        if self.by_endpoint.get(&endpoint) == Some(&id) {
            self.by_endpoint.remove(&endpoint);
        }
        self.parents.remove(&id);
        Some(tracked)
    }
}

pub struct ConnectionRegistry {
    max_connections: usize,
    maps: Mutex<Maps>,
    parent_events: Subscribers<ParentLinkEvent>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            maps: Mutex::new(Maps::default()),
            parent_events: Subscribers::new(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Starts tracking `link`.
    ///
    /// A live connection from the same endpoint is killed and replaced.
    /// Tracking the same id again only updates `is_parent`.
    ///
    /// # Errors
    /// [`SessionError::CapacityExceeded`] when the registry is full, or
    /// [`SessionError::ConnectionClosed`] if `link` is already dead.
    pub async fn track(&self, link: Arc<dyn PacketLink>, is_parent: bool) -> Result<(), SessionError> {
        let id = link.id();
        let endpoint = link.remote_endpoint();
        if !link.is_alive() {
            return Err(SessionError::ConnectionClosed(endpoint));
        }

        let displaced = {
            let mut maps = self.maps.lock().await;

            let colliding = maps
                .by_endpoint
                .get(&endpoint)
                .copied()
                .filter(|old| *old != id);

            let live = maps.by_id.len() - usize::from(colliding.is_some());
            if !maps.by_id.contains_key(&id) && live >= self.max_connections {
                warn!(%id, %endpoint, max = self.max_connections, "connection refused: at capacity");
                return Err(SessionError::CapacityExceeded {
                    max: self.max_connections,
                });
            }

            let displaced = colliding.and_then(|old| maps.take(old));

            maps.by_endpoint.insert(endpoint, id);
            if is_parent {
                maps.parents.insert(id, Arc::clone(&link));
            } else {
                maps.parents.remove(&id);
            }
            maps.by_id.insert(id, Tracked { link, is_parent });
            displaced
        };

        if let Some(old) = displaced {
            info!(old = %old.link.id(), new = %id, %endpoint, "endpoint collision, replacing connection");
            old.link.kill(REASON_ENDPOINT_REPLACED);
            if old.is_parent {
                self.parent_events
                    .publish(ParentLinkEvent::Lost {
                        id: old.link.id(),
                        endpoint,
                    })
                    .await;
            }
        }
        if is_parent {
            self.parent_events
                .publish(ParentLinkEvent::Added { id, endpoint })
                .await;
        }
        debug!(conn_id = %id, %endpoint, is_parent, "connection tracked");
        Ok(())
    }

    /// Stops tracking `id`. Parent-link subscribers are notified after
    /// every map has been updated.
    pub async fn remove(&self, id: ConnectionId) -> Option<RemovedConnection> {
        let tracked = self.maps.lock().await.take(id)?;
        let endpoint = tracked.link.remote_endpoint();
        debug!(conn_id = %id, %endpoint, is_parent = tracked.is_parent, "connection removed");
        if tracked.is_parent {
            self.parent_events
                .publish(ParentLinkEvent::Lost { id, endpoint })
                .await;
        }
        Some(RemovedConnection {
            link: tracked.link,
            is_parent: tracked.is_parent,
        })
    }

    /// Marks an already-tracked connection as a parent link.
    ///
    /// # Errors
    /// [`SessionError::UnknownConnection`] if `id` is not tracked.
    pub async fn promote_to_parent(&self, id: ConnectionId) -> Result<(), SessionError> {
        let endpoint = {
            let mut maps = self.maps.lock().await;
            let tracked = maps
                .by_id
                .get_mut(&id)
                .ok_or(SessionError::UnknownConnection(id))?;
            if tracked.is_parent {
                return Ok(());
            }
            tracked.is_parent = true;
            let link = Arc::clone(&tracked.link);
            let endpoint = link.remote_endpoint();
            maps.parents.insert(id, link);
            endpoint
        };
        self.parent_events
            .publish(ParentLinkEvent::Added { id, endpoint })
            .await;
        Ok(())
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<dyn PacketLink>> {
        self.maps.lock().await.by_id.get(&id).map(|t| Arc::clone(&t.link))
    }

    pub async fn by_endpoint(&self, endpoint: SocketAddr) -> Option<Arc<dyn PacketLink>> {
        let maps = self.maps.lock().await;
        let id = maps.by_endpoint.get(&endpoint)?;
        maps.by_id.get(id).map(|t| Arc::clone(&t.link))
    }

    /// Every tracked link.
    pub async fn links(&self) -> Vec<Arc<dyn PacketLink>> {
        self.maps
            .lock()
            .await
            .by_id
            .values()
            .map(|t| Arc::clone(&t.link))
            .collect()
    }

    pub async fn parents(&self) -> Vec<Arc<dyn PacketLink>> {
        self.maps.lock().await.parents.values().cloned().collect()
    }

    pub async fn is_parent(&self, id: ConnectionId) -> bool {
        self.maps.lock().await.parents.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.maps.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.maps.lock().await.by_id.is_empty()
    }

    pub async fn subscribe_parent_events(
        &self,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ParentLinkEvent>) {
        self.parent_events.subscribe().await
    }

    pub async fn unsubscribe_parent_events(&self, id: SubscriptionId) -> bool {
        self.parent_events.unsubscribe(id).await
    }
}
