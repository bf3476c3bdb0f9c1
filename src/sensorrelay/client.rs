use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use log::{debug, info, warn};

use crate::error::RelayError;
use crate::protocol::Event;
use crate::sensorrelay::types::ConnectionId;

/// Outbound side of one broker connection
pub trait ClientSender: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Queues an event for this connection. Fails once the transport is gone.
    fn send_event(&self, event: &Event) -> Result<(), RelayError>;

    fn close(&self);
}

/// All live connections plus the set of connections that announced
/// themselves with `client_connect`.
#[derive(Default)]
pub struct ClientRegistry {
    connections: DashMap<ConnectionId, Arc<dyn ClientSender>>,
    known_clients: DashSet<ConnectionId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            known_clients: DashSet::new(),
        }
    }

    pub fn register(&self, sender: Arc<dyn ClientSender>) {
        info!("Registering connection {}", sender.id());
        self.connections.insert(sender.id(), sender);
    }

    /// Forgets a connection entirely, including its client flag
    pub fn unregister(&self, id: ConnectionId) {
        info!("Unregistering connection {}", id);
        self.connections.remove(&id);
        self.known_clients.remove(&id);
    }

    pub fn mark_client(&self, id: ConnectionId) -> bool {
        self.known_clients.insert(id)
    }

    pub fn unmark_client(&self, id: ConnectionId) -> bool {
        self.known_clients.remove(&id).is_some()
    }

    pub fn is_client(&self, id: ConnectionId) -> bool {
        self.known_clients.contains(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<dyn ClientSender>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn client_count(&self) -> usize {
        self.known_clients.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends to each listed connection in order. Returns how many accepted it.
    pub fn send_to(&self, ids: &[ConnectionId], event: &Event) -> usize {
        let mut sent_count = 0;
        for id in ids {
            // Clone out of the map so no shard lock is held while sending.
            let Some(sender) = self.get(*id) else {
                debug!("Connection {} gone before delivery", id);
                continue;
            };
            match sender.send_event(event) {
                Ok(()) => sent_count += 1,
                Err(e) => warn!("Failed to deliver to {}: {}", id, e),
            }
        }
        debug!("Message sent to {}/{} connections", sent_count, ids.len());
        sent_count
    }

    /// Closes every connection in the known client set
    pub fn close_clients(&self) -> usize {
        let ids: Vec<ConnectionId> = self.known_clients.iter().map(|id| *id).collect();
        let mut closed = 0;
        for id in ids {
            if let Some(sender) = self.get(id) {
                sender.close();
                closed += 1;
            }
        }
        info!("Closed {} client connections", closed);
        closed
    }
}
