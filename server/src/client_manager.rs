//! Connection management for the presence store service
//!
//! This module tracks every bound client connection and what the service owes it:
//! - Connection lifecycle (hello, disconnect, timeout)
//! - Which player record the connection is allowed to write
//! - Active snapshot subscriptions and their filters
//! - The on-disconnect patch to apply when the connection goes away
//!
//! The manager only stores this bookkeeping; applying disconnect patches to the record book is
//! left to the network layer so that graceful disconnects and timeouts share one code path.

use log::info;
use shared::{PlayerPatch, RecordFilter};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A client connection bound to one player record
#[derive(Debug)]
pub struct Connection {
    /// Unique connection identifier assigned by the service
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// The only record this connection may write
    pub player_id: String,
    /// Last time we received any packet from this connection
    pub last_seen: Instant,
    /// Active subscriptions keyed by the client's token
    pub subscriptions: HashMap<u32, RecordFilter>,
    /// Patch applied to `player_id` when the connection is lost
    pub disconnect_patch: Option<PlayerPatch>,
}

impl Connection {
    pub fn new(id: u32, addr: SocketAddr, player_id: String) -> Self {
        Self {
            id,
            addr,
            player_id,
            last_seen: Instant::now(),
            subscriptions: HashMap::new(),
            disconnect_patch: None,
        }
    }

    /// Returns true if no packets have arrived within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Outcome of binding an address to a player
#[derive(Debug)]
pub enum Admission {
    Accepted {
        connection_id: u32,
        /// Connections removed because they shared the address or the player
        replaced: Vec<Connection>,
    },
    Full,
}

/// Manages all bound connections
///
/// Enforces the capacity limit, one connection per player and one player per address. A hello
/// replaces whatever connection held the same player or the same address.
pub struct ClientManager {
    connections: HashMap<u32, Connection>,
    next_connection_id: u32,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_clients,
        }
    }

    /// Binds `addr` to `player_id`
    ///
    /// Any existing connection from the same address or for the same player is removed first and
    /// handed back in `replaced` so the caller can decide what to do with it. Capacity is checked
    /// after that removal, so reconnecting never fails on a full server.
    pub fn add_client(&mut self, addr: SocketAddr, player_id: &str) -> Admission {
        let mut replaced = Vec::new();
        let stale: Vec<u32> = self
            .connections
            .values()
            .filter(|c| c.addr == addr || c.player_id == player_id)
            .map(|c| c.id)
            .collect();
        for id in stale {
            if let Some(connection) = self.connections.remove(&id) {
                info!(
                    "Connection {} for {} superseded by new hello from {}",
                    connection.id, connection.player_id, addr
                );
                replaced.push(connection);
            }
        }

        if self.connections.len() >= self.max_clients {
            return Admission::Full;
        }

        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        info!(
            "Connection {} bound {} to player {}",
            connection_id, addr, player_id
        );
        self.connections.insert(
            connection_id,
            Connection::new(connection_id, addr, player_id.to_string()),
        );

        Admission::Accepted {
            connection_id,
            replaced,
        }
    }

    /// Removes a connection, returning it so its disconnect patch can be applied
    pub fn remove_client(&mut self, connection_id: u32) -> Option<Connection> {
        let removed = self.connections.remove(&connection_id);
        if let Some(connection) = &removed {
            info!(
                "Connection {} ({}) closed",
                connection.id, connection.player_id
            );
        }
        removed
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.connections
            .values()
            .find(|c| c.addr == addr)
            .map(|c| c.id)
    }

    pub fn find_by_player(&self, player_id: &str) -> Option<u32> {
        self.connections
            .values()
            .find(|c| c.player_id == player_id)
            .map(|c| c.id)
    }

    /// Whether the connection at `addr` owns `player_id`'s record
    pub fn owns(&self, addr: SocketAddr, player_id: &str) -> bool {
        self.connections
            .values()
            .any(|c| c.addr == addr && c.player_id == player_id)
    }

    /// Refreshes liveness for the connection at `addr`, returning its id
    pub fn touch(&mut self, addr: SocketAddr) -> Option<u32> {
        let connection = self.connections.values_mut().find(|c| c.addr == addr)?;
        connection.last_seen = Instant::now();
        Some(connection.id)
    }

    pub fn subscribe(&mut self, connection_id: u32, token: u32, filter: RecordFilter) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.subscriptions.insert(token, filter);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&mut self, connection_id: u32, token: u32) -> bool {
        self.connections
            .get_mut(&connection_id)
            .and_then(|c| c.subscriptions.remove(&token))
            .is_some()
    }

    pub fn set_disconnect_handler(&mut self, connection_id: u32, patch: PlayerPatch) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.disconnect_patch = Some(patch);
                true
            }
            None => false,
        }
    }

    /// Removes and returns every connection silent for longer than `timeout`
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Connection> {
        let timed_out: Vec<u32> = self
            .connections
            .values()
            .filter(|c| c.is_timed_out(timeout))
            .map(|c| c.id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.remove_client(id))
            .collect()
    }

    /// Every active subscription as `(addr, token, filter)`
    pub fn subscriptions(&self) -> Vec<(SocketAddr, u32, RecordFilter)> {
        self.connections
            .values()
            .flat_map(|c| {
                c.subscriptions
                    .iter()
                    .map(move |(token, filter)| (c.addr, *token, filter.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn accept(manager: &mut ClientManager, addr: SocketAddr, player: &str) -> u32 {
        match manager.add_client(addr, player) {
            Admission::Accepted { connection_id, .. } => connection_id,
            Admission::Full => panic!("Expected admission for {}", player),
        }
    }

    #[test]
    fn test_connection_timeout() {
        let mut connection = Connection::new(1, test_addr(), "a".to_string());
        assert!(!connection.is_timed_out(Duration::from_secs(1)));

        connection.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(connection.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_clients_and_ids() {
        let mut manager = ClientManager::new(3);
        assert!(manager.is_empty());

        let first = accept(&mut manager, test_addr(), "a");
        let second = accept(&mut manager, test_addr2(), "b");

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.find_by_player("b"), Some(2));
        assert_eq!(manager.find_client_by_addr(test_addr()), Some(1));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);
        accept(&mut manager, test_addr(), "a");

        assert!(matches!(
            manager.add_client(test_addr2(), "b"),
            Admission::Full
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_rehello_supersedes_previous_connection() {
        let mut manager = ClientManager::new(1);
        let old = accept(&mut manager, test_addr(), "a");
        manager.set_disconnect_handler(old, PlayerPatch::offline());

        match manager.add_client(test_addr2(), "a") {
            Admission::Accepted {
                connection_id,
                replaced,
            } => {
                assert_ne!(connection_id, old);
                assert_eq!(replaced.len(), 1);
                assert_eq!(replaced[0].id, old);
                assert!(replaced[0].disconnect_patch.is_some());
            }
            Admission::Full => panic!("Reconnect must not be rejected"),
        }
        assert_eq!(manager.len(), 1);
        assert!(manager.owns(test_addr2(), "a"));
        assert!(!manager.owns(test_addr(), "a"));
    }

    #[test]
    fn test_new_player_on_same_address_replaces_binding() {
        let mut manager = ClientManager::new(4);
        let old = accept(&mut manager, test_addr(), "a");
        manager.set_disconnect_handler(old, PlayerPatch::offline());

        match manager.add_client(test_addr(), "b") {
            Admission::Accepted { replaced, .. } => {
                assert_eq!(replaced.len(), 1);
                assert_eq!(replaced[0].player_id, "a");
                assert_eq!(replaced[0].disconnect_patch, Some(PlayerPatch::offline()));
            }
            Admission::Full => panic!("Expected admission"),
        }
        assert_eq!(manager.len(), 1);
        assert!(manager.owns(test_addr(), "b"));
    }

    #[test]
    fn test_subscriptions_listing() {
        let mut manager = ClientManager::new(2);
        let id = accept(&mut manager, test_addr(), "a");

        assert!(manager.subscribe(id, 7, RecordFilter::online()));
        assert!(manager.subscribe(id, 8, RecordFilter::default()));
        assert_eq!(manager.subscriptions().len(), 2);

        assert!(manager.unsubscribe(id, 7));
        assert!(!manager.unsubscribe(id, 7));
        let remaining = manager.subscriptions();
        assert_eq!(remaining, vec![(test_addr(), 8, RecordFilter::default())]);

        assert!(!manager.subscribe(999, 1, RecordFilter::online()));
    }

    #[test]
    fn test_check_timeouts_returns_connections() {
        let mut manager = ClientManager::new(2);
        let stale = accept(&mut manager, test_addr(), "a");
        accept(&mut manager, test_addr2(), "b");
        manager.set_disconnect_handler(stale, PlayerPatch::offline());

        if let Some(connection) = manager.connections.get_mut(&stale) {
            connection.last_seen = Instant::now() - Duration::from_secs(10);
        }

        let timed_out = manager.check_timeouts(Duration::from_secs(5));
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].player_id, "a");
        assert_eq!(timed_out[0].disconnect_patch, Some(PlayerPatch::offline()));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_touch_and_remove() {
        let mut manager = ClientManager::new(2);
        let id = accept(&mut manager, test_addr(), "a");

        assert_eq!(manager.touch(test_addr()), Some(id));
        assert_eq!(manager.touch(test_addr2()), None);

        assert!(manager.remove_client(id).is_some());
        assert!(manager.remove_client(id).is_none());
        assert!(manager.is_empty());
    }
}
