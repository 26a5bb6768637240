//! Connection registry keyed by peer node id.
//!
//! Connections register on creation and are indexed by peer id once their
//! HELLO arrives. Only inbound duplicates are de-duplicated: the most recent
//! inbound connection for a peer id wins and older ones are queued for close.
//! The node loop drains that queue after every processing step.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::constants::ERR_PEER_REGISTRY_LOCK;
use crate::error::{RelayError, Result};
use crate::transport::{ConnectionId, Direction, PeerEndpoint};

#[derive(Debug, Default)]
struct PeerRegistryInner {
    endpoints: HashMap<ConnectionId, PeerEndpoint>,
    peer_ids: HashMap<ConnectionId, Uuid>,
    /// Peer id -> connections in HELLO order.
    by_peer: HashMap<Uuid, Vec<ConnectionId>>,
    pending_closes: Vec<ConnectionId>,
    retries_by_address: HashMap<SocketAddr, u32>,
}

/// Shared handle to the node's connection registry.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<PeerRegistryInner>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, PeerRegistryInner>> {
        self.inner
            .lock()
            .map_err(|_| RelayError::LockPoisoned(ERR_PEER_REGISTRY_LOCK))
    }

    pub fn register(&self, conn_id: ConnectionId, endpoint: PeerEndpoint) -> Result<()> {
        self.lock()?.endpoints.insert(conn_id, endpoint);
        Ok(())
    }

    /// Associate `conn_id` with `peer_id`.
    ///
    /// Returns the older inbound connections for the same peer id, which are
    /// also queued for close.
    pub fn index_peer(&self, conn_id: ConnectionId, peer_id: Uuid) -> Result<Vec<ConnectionId>> {
        let mut inner = self.lock()?;
        inner.peer_ids.insert(conn_id, peer_id);

        let connections = inner.by_peer.entry(peer_id).or_default();
        connections.retain(|&existing| existing != conn_id);
        connections.push(conn_id);
        let connections = connections.clone();

        let inbound: Vec<ConnectionId> = connections
            .into_iter()
            .filter(|id| {
                inner
                    .endpoints
                    .get(id)
                    .is_some_and(|endpoint| endpoint.direction == Direction::Inbound)
            })
            .collect();

        let duplicates = match inbound.split_last() {
            Some((_newest, older)) => older.to_vec(),
            None => Vec::new(),
        };

        for &duplicate in &duplicates {
            if !inner.pending_closes.contains(&duplicate) {
                inner.pending_closes.push(duplicate);
            }
        }
        if !duplicates.is_empty() {
            debug!(%peer_id, ?duplicates, "Queued duplicate inbound connections for close");
        }
        Ok(duplicates)
    }

    /// Connections that must be closed, in request order.
    pub fn take_close_requests(&self) -> Result<Vec<ConnectionId>> {
        Ok(std::mem::take(&mut self.lock()?.pending_closes))
    }

    pub fn connections_for_peer(&self, peer_id: &Uuid) -> Result<Vec<ConnectionId>> {
        Ok(self
            .lock()?
            .by_peer
            .get(peer_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn peer_id_of(&self, conn_id: ConnectionId) -> Result<Option<Uuid>> {
        Ok(self.lock()?.peer_ids.get(&conn_id).copied())
    }

    pub fn remove(&self, conn_id: ConnectionId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.endpoints.remove(&conn_id);
        inner.pending_closes.retain(|&pending| pending != conn_id);
        if let Some(peer_id) = inner.peer_ids.remove(&conn_id) {
            if let Some(connections) = inner.by_peer.get_mut(&peer_id) {
                connections.retain(|&existing| existing != conn_id);
                if connections.is_empty() {
                    inner.by_peer.remove(&peer_id);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.endpoints.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Count a reconnect attempt to `address`.
    pub fn record_retry(&self, address: SocketAddr) -> Result<u32> {
        let mut inner = self.lock()?;
        let retries = inner.retries_by_address.entry(address).or_insert(0);
        *retries += 1;
        Ok(*retries)
    }

    pub fn reset_retries(&self, address: SocketAddr) -> Result<()> {
        self.lock()?.retries_by_address.remove(&address);
        Ok(())
    }

    pub fn retries(&self, address: SocketAddr) -> Result<u32> {
        Ok(self
            .lock()?
            .retries_by_address
            .get(&address)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16, direction: Direction) -> PeerEndpoint {
        PeerEndpoint {
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            direction,
        }
    }

    #[test]
    fn test_newest_inbound_wins() {
        let registry = PeerRegistry::new();
        let peer = Uuid::from_bytes([1; 16]);
        for id in 1..=3 {
            registry
                .register(ConnectionId(id), endpoint(4000 + id as u16, Direction::Inbound))
                .unwrap();
        }

        assert!(registry.index_peer(ConnectionId(1), peer).unwrap().is_empty());
        assert_eq!(
            registry.index_peer(ConnectionId(2), peer).unwrap(),
            vec![ConnectionId(1)]
        );
        assert_eq!(
            registry.index_peer(ConnectionId(3), peer).unwrap(),
            vec![ConnectionId(1), ConnectionId(2)]
        );
        assert_eq!(
            registry.take_close_requests().unwrap(),
            vec![ConnectionId(1), ConnectionId(2)]
        );
        assert!(registry.take_close_requests().unwrap().is_empty());
    }

    #[test]
    fn test_outbound_never_closed() {
        let registry = PeerRegistry::new();
        let peer = Uuid::from_bytes([2; 16]);
        registry
            .register(ConnectionId(1), endpoint(5000, Direction::Outbound))
            .unwrap();
        registry
            .register(ConnectionId(2), endpoint(5001, Direction::Inbound))
            .unwrap();

        registry.index_peer(ConnectionId(1), peer).unwrap();
        assert!(registry.index_peer(ConnectionId(2), peer).unwrap().is_empty());
        assert_eq!(registry.connections_for_peer(&peer).unwrap().len(), 2);
    }

    #[test]
    fn test_remove_clears_indexes() {
        let registry = PeerRegistry::new();
        let peer = Uuid::from_bytes([3; 16]);
        registry
            .register(ConnectionId(1), endpoint(6000, Direction::Inbound))
            .unwrap();
        registry.index_peer(ConnectionId(1), peer).unwrap();

        registry.remove(ConnectionId(1)).unwrap();
        assert!(registry.is_empty().unwrap());
        assert!(registry.connections_for_peer(&peer).unwrap().is_empty());
        assert_eq!(registry.peer_id_of(ConnectionId(1)).unwrap(), None);
    }

    #[test]
    fn test_retry_counters() {
        let registry = PeerRegistry::new();
        let address = SocketAddr::from(([10, 0, 0, 1], 1809));
        assert_eq!(registry.record_retry(address).unwrap(), 1);
        assert_eq!(registry.record_retry(address).unwrap(), 2);
        registry.reset_retries(address).unwrap();
        assert_eq!(registry.retries(address).unwrap(), 0);
    }
}
