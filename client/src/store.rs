//! The presence store as seen by the client, plus an in-process implementation
//!
//! `PresenceStore` is the seam between the sync components and whatever actually holds the
//! player records. [`crate::network::RemoteStore`] talks to the UDP service; [`MemoryStore`]
//! keeps the same semantics in memory for offline play and tests.

use log::{debug, info, warn};
use shared::{
    now_millis, PlayerPatch, PlayerRecord, RecordBook, RecordError, RecordFilter, Snapshot,
    WriteMode,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection is closed")]
    Closed,
    #[error("connection is bound to {bound}, refusing to touch {requested}")]
    NotOwner { bound: String, requested: String },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("invalid record write: {0}")]
    Record(#[from] RecordError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// A live subscription. Snapshots arrive on `snapshots` in the order the store emits them.
#[derive(Debug)]
pub struct Subscription {
    pub token: u32,
    pub snapshots: mpsc::UnboundedReceiver<Snapshot>,
}

pub trait PresenceStore {
    /// Binds this handle to `player_id`. Reconnecting replaces any earlier binding for the same
    /// player without firing its disconnect handler.
    fn connect(&mut self, player_id: &str) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool;

    /// Whether the store dropped this handle's binding and restored it since the last call.
    /// Writes issued in between may be lost, so the caller should publish its state again.
    fn take_rebound(&mut self) -> bool {
        false
    }

    /// Fire-and-forget partial write of `player_id`'s record.
    fn write(&mut self, player_id: &str, patch: PlayerPatch, mode: WriteMode)
        -> Result<(), StoreError>;

    fn subscribe(&mut self, filter: RecordFilter) -> Result<Subscription, StoreError>;

    fn unsubscribe(&mut self, token: u32);

    /// Registers the patch the store applies on its own if this connection is lost.
    fn register_disconnect_handler(
        &mut self,
        player_id: &str,
        patch: PlayerPatch,
    ) -> Result<(), StoreError>;

    /// Graceful close: the store drops the connection and fires its disconnect handler.
    fn close(&mut self);
}

impl<S: PresenceStore + ?Sized> PresenceStore for Box<S> {
    fn connect(&mut self, player_id: &str) -> Result<(), StoreError> {
        (**self).connect(player_id)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn take_rebound(&mut self) -> bool {
        (**self).take_rebound()
    }

    fn write(
        &mut self,
        player_id: &str,
        patch: PlayerPatch,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        (**self).write(player_id, patch, mode)
    }

    fn subscribe(&mut self, filter: RecordFilter) -> Result<Subscription, StoreError> {
        (**self).subscribe(filter)
    }

    fn unsubscribe(&mut self, token: u32) {
        (**self).unsubscribe(token)
    }

    fn register_disconnect_handler(
        &mut self,
        player_id: &str,
        patch: PlayerPatch,
    ) -> Result<(), StoreError> {
        (**self).register_disconnect_handler(player_id, patch)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

struct MemorySubscription {
    filter: RecordFilter,
    seq: u64,
    sender: mpsc::UnboundedSender<Snapshot>,
}

struct MemoryConnectionState {
    player_id: String,
    subscriptions: HashMap<u32, MemorySubscription>,
    disconnect_patch: Option<PlayerPatch>,
}

#[derive(Default)]
struct MemoryInner {
    book: RecordBook,
    connections: HashMap<u64, MemoryConnectionState>,
    next_connection: u64,
    next_token: u32,
}

impl MemoryInner {
    fn apply(
        &mut self,
        player_id: &str,
        patch: &PlayerPatch,
        mode: WriteMode,
    ) -> Result<(), RecordError> {
        self.book.write(player_id, patch, mode, now_millis())?;
        self.publish();
        Ok(())
    }

    /// Pushes the current view to every subscription, dropping ones whose receiver is gone.
    fn publish(&mut self) {
        let book = &self.book;
        for connection in self.connections.values_mut() {
            connection.subscriptions.retain(|token, subscription| {
                subscription.seq += 1;
                let snapshot = Snapshot {
                    token: *token,
                    seq: subscription.seq,
                    records: book.snapshot(&subscription.filter),
                };
                subscription.sender.send(snapshot).is_ok()
            });
        }
    }

    fn fire_handler(&mut self, connection: &MemoryConnectionState) {
        if let Some(patch) = &connection.disconnect_patch {
            info!("Applying disconnect handler for {}", connection.player_id);
            if let Err(e) = self.apply(&connection.player_id, patch, WriteMode::Merge) {
                warn!("Disconnect handler for {} failed: {}", connection.player_id, e);
            }
        }
    }
}

/// In-process presence store shared by any number of [`MemoryConnection`]s.
///
/// Snapshots are delivered synchronously: by the time a write returns, every subscriber's channel
/// already holds the resulting view.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A new, not yet connected handle onto this store.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            store: self.clone(),
            connection_id: None,
            expired: None,
        }
    }

    pub fn record(&self, player_id: &str) -> Option<PlayerRecord> {
        self.lock().book.get(player_id).cloned()
    }

    pub fn snapshot(&self, filter: &RecordFilter) -> Vec<PlayerRecord> {
        self.lock().book.snapshot(filter)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}

/// One client's handle onto a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
    connection_id: Option<u64>,
    /// Binding dropped by [`MemoryConnection::expire`], restored by `take_rebound`
    expired: Option<MemoryConnectionState>,
}

impl MemoryConnection {
    fn bound_player(&self, inner: &MemoryInner) -> Result<String, StoreError> {
        self.connection_id
            .and_then(|id| inner.connections.get(&id))
            .map(|c| c.player_id.clone())
            .ok_or(StoreError::Closed)
    }

    fn check_owner(&self, inner: &MemoryInner, player_id: &str) -> Result<(), StoreError> {
        let bound = self.bound_player(inner)?;
        if bound != player_id {
            return Err(StoreError::NotOwner {
                bound,
                requested: player_id.to_string(),
            });
        }
        Ok(())
    }

    /// Simulates a crash or network loss: the connection vanishes without a graceful close and
    /// the store fires its disconnect handler.
    pub fn drop_connection(&mut self) {
        self.expired = None;
        let Some(id) = self.connection_id.take() else {
            return;
        };
        let mut inner = self.store.lock();
        if let Some(connection) = inner.connections.remove(&id) {
            warn!("Connection for {} dropped", connection.player_id);
            inner.fire_handler(&connection);
        }
    }

    /// Simulates the store timing this handle out while the client keeps running: the handler
    /// fires and calls fail until `take_rebound` restores the binding with its subscriptions.
    pub fn expire(&mut self) {
        let Some(id) = self.connection_id else {
            return;
        };
        let mut inner = self.store.lock();
        if let Some(connection) = inner.connections.remove(&id) {
            warn!("Connection for {} expired", connection.player_id);
            inner.fire_handler(&connection);
            self.expired = Some(connection);
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl PresenceStore for MemoryConnection {
    fn connect(&mut self, player_id: &str) -> Result<(), StoreError> {
        if player_id.is_empty() {
            return Err(StoreError::Handshake("player id must not be empty".to_string()));
        }
        let mut inner = self.store.lock();

        self.expired = None;
        let own = self.connection_id.take();
        let replaced: Vec<u64> = inner
            .connections
            .iter()
            .filter(|(id, connection)| Some(**id) == own || connection.player_id == player_id)
            .map(|(id, _)| *id)
            .collect();
        for id in replaced {
            let Some(connection) = inner.connections.remove(&id) else {
                continue;
            };
            debug!("Replacing memory connection {} for {}", id, connection.player_id);
            // A handle rebinding to someone else leaves its old player behind.
            if connection.player_id != player_id {
                inner.fire_handler(&connection);
            }
        }

        inner.next_connection += 1;
        let id = inner.next_connection;
        inner.connections.insert(
            id,
            MemoryConnectionState {
                player_id: player_id.to_string(),
                subscriptions: HashMap::new(),
                disconnect_patch: None,
            },
        );
        self.connection_id = Some(id);
        info!("Memory store connection {} bound to {}", id, player_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let inner = self.store.lock();
        self.connection_id
            .map_or(false, |id| inner.connections.contains_key(&id))
    }

    fn take_rebound(&mut self) -> bool {
        let Some(connection) = self.expired.take() else {
            return false;
        };
        let mut inner = self.store.lock();
        if inner
            .connections
            .values()
            .any(|c| c.player_id == connection.player_id)
        {
            debug!("{} is bound elsewhere, not restoring", connection.player_id);
            self.connection_id = None;
            return false;
        }

        inner.next_connection += 1;
        let id = inner.next_connection;
        info!("Memory store connection {} restored for {}", id, connection.player_id);
        inner.connections.insert(id, connection);
        self.connection_id = Some(id);
        inner.publish();
        true
    }

    fn write(
        &mut self,
        player_id: &str,
        patch: PlayerPatch,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        self.check_owner(&inner, player_id)?;
        inner.apply(player_id, &patch, mode)?;
        Ok(())
    }

    fn subscribe(&mut self, filter: RecordFilter) -> Result<Subscription, StoreError> {
        let mut inner = self.store.lock();
        let id = self.connection_id.ok_or(StoreError::Closed)?;

        inner.next_token += 1;
        let token = inner.next_token;
        let (sender, snapshots) = mpsc::unbounded_channel();

        let initial = Snapshot {
            token,
            seq: 1,
            records: inner.book.snapshot(&filter),
        };
        let connection = inner.connections.get_mut(&id).ok_or(StoreError::Closed)?;
        // The receiver is still in hand, so this cannot fail.
        let _ = sender.send(initial);
        connection.subscriptions.insert(
            token,
            MemorySubscription {
                filter,
                seq: 1,
                sender,
            },
        );
        Ok(Subscription { token, snapshots })
    }

    fn unsubscribe(&mut self, token: u32) {
        let mut inner = self.store.lock();
        if let Some(connection) = self
            .connection_id
            .and_then(|id| inner.connections.get_mut(&id))
        {
            connection.subscriptions.remove(&token);
        }
    }

    fn register_disconnect_handler(
        &mut self,
        player_id: &str,
        patch: PlayerPatch,
    ) -> Result<(), StoreError> {
        patch.validate(player_id)?;
        let mut inner = self.store.lock();
        self.check_owner(&inner, player_id)?;
        let id = self.connection_id.ok_or(StoreError::Closed)?;
        if let Some(connection) = inner.connections.get_mut(&id) {
            connection.disconnect_patch = Some(patch);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.expired = None;
        let Some(id) = self.connection_id.take() else {
            return;
        };
        let mut inner = self.store.lock();
        if let Some(connection) = inner.connections.remove(&id) {
            info!("Memory store connection {} closed", id);
            inner.fire_handler(&connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Facing, Position};

    fn online_at(x: f32, y: f32) -> PlayerPatch {
        PlayerPatch::motion(Position::new(x, y), Facing::Front)
            .with_online(true)
            .with_avatar("tom")
    }

    fn drain(subscription: &mut Subscription) -> Vec<Snapshot> {
        let mut snapshots = Vec::new();
        while let Ok(snapshot) = subscription.snapshots.try_recv() {
            snapshots.push(snapshot);
        }
        snapshots
    }

    #[test]
    fn test_subscribe_delivers_initial_and_followup_snapshots() {
        let store = MemoryStore::new();
        let mut alice = store.connection();
        let mut bob = store.connection();
        alice.connect("alice").unwrap();
        bob.connect("bob").unwrap();

        alice
            .write("alice", online_at(1.0, 2.0), WriteMode::Merge)
            .unwrap();
        let mut subscription = bob.subscribe(RecordFilter::online()).unwrap();
        bob.write("bob", online_at(3.0, 4.0), WriteMode::Merge)
            .unwrap();

        let snapshots = drain(&mut subscription);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].seq, 1);
        assert_eq!(snapshots[0].records.len(), 1);
        assert_eq!(snapshots[1].seq, 2);
        assert_eq!(snapshots[1].records.len(), 2);
    }

    #[test]
    fn test_writes_to_foreign_record_are_refused() {
        let store = MemoryStore::new();
        let mut alice = store.connection();
        alice.connect("alice").unwrap();

        let result = alice.write("bob", online_at(0.0, 0.0), WriteMode::Merge);
        assert!(matches!(result, Err(StoreError::NotOwner { .. })));
        assert!(store.record("bob").is_none());
    }

    #[test]
    fn test_unconnected_handle_is_closed() {
        let store = MemoryStore::new();
        let mut handle = store.connection();
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.write("x", PlayerPatch::offline(), WriteMode::Merge),
            Err(StoreError::Closed)
        ));
        assert!(handle.subscribe(RecordFilter::online()).is_err());
    }

    #[test]
    fn test_drop_connection_fires_handler_and_notifies() {
        let store = MemoryStore::new();
        let mut alice = store.connection();
        let mut bob = store.connection();
        alice.connect("alice").unwrap();
        bob.connect("bob").unwrap();

        alice
            .write("alice", online_at(1.0, 2.0), WriteMode::Merge)
            .unwrap();
        alice
            .register_disconnect_handler("alice", PlayerPatch::offline())
            .unwrap();
        let mut subscription = bob.subscribe(RecordFilter::online()).unwrap();
        drain(&mut subscription);

        alice.drop_connection();

        assert!(!alice.is_connected());
        assert_eq!(store.record("alice").and_then(|r| r.online), Some(false));
        let snapshots = drain(&mut subscription);
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].records.is_empty());
    }

    #[test]
    fn test_reconnect_supersedes_without_firing_handler() {
        let store = MemoryStore::new();
        let mut first = store.connection();
        first.connect("alice").unwrap();
        first
            .write("alice", online_at(1.0, 2.0), WriteMode::Merge)
            .unwrap();
        first
            .register_disconnect_handler("alice", PlayerPatch::offline())
            .unwrap();

        let mut second = store.connection();
        second.connect("alice").unwrap();

        assert_eq!(store.connection_count(), 1);
        assert!(!first.is_connected());
        assert_eq!(store.record("alice").and_then(|r| r.online), Some(true));
    }

    #[test]
    fn test_rebinding_to_another_player_fires_old_handler() {
        let store = MemoryStore::new();
        let mut handle = store.connection();
        handle.connect("alice").unwrap();
        handle
            .write("alice", online_at(1.0, 2.0), WriteMode::Merge)
            .unwrap();
        handle
            .register_disconnect_handler("alice", PlayerPatch::offline())
            .unwrap();

        handle.connect("bob").unwrap();

        assert_eq!(store.connection_count(), 1);
        assert_eq!(store.record("alice").and_then(|r| r.online), Some(false));
    }

    #[test]
    fn test_expired_binding_is_restored_with_subscriptions() {
        let store = MemoryStore::new();
        let mut alice = store.connection();
        alice.connect("alice").unwrap();
        alice
            .register_disconnect_handler("alice", PlayerPatch::offline())
            .unwrap();
        alice
            .write("alice", online_at(1.0, 2.0), WriteMode::Merge)
            .unwrap();
        let mut subscription = alice.subscribe(RecordFilter::default()).unwrap();
        drain(&mut subscription);

        alice.expire();
        assert_eq!(store.record("alice").and_then(|r| r.online), Some(false));
        assert!(!alice.is_connected());
        assert!(matches!(
            alice.write("alice", online_at(3.0, 3.0), WriteMode::Merge),
            Err(StoreError::Closed)
        ));

        assert!(alice.take_rebound());
        assert!(!alice.take_rebound());
        assert!(alice.is_connected());
        drain(&mut subscription);
        alice
            .write("alice", online_at(4.0, 4.0), WriteMode::Merge)
            .unwrap();
        let snapshots = drain(&mut subscription);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].records[0].online, Some(true));

        // The handler came back with the binding.
        alice.drop_connection();
        assert_eq!(store.record("alice").and_then(|r| r.online), Some(false));
    }

    #[test]
    fn test_close_fires_handler_once() {
        let store = MemoryStore::new();
        let mut alice = store.connection();
        alice.connect("alice").unwrap();
        alice
            .write("alice", online_at(1.0, 2.0), WriteMode::Merge)
            .unwrap();
        alice
            .register_disconnect_handler("alice", PlayerPatch::offline())
            .unwrap();

        alice.close();
        alice.close();

        assert_eq!(store.record("alice").and_then(|r| r.online), Some(false));
        assert_eq!(store.connection_count(), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = MemoryStore::new();
        let mut alice = store.connection();
        alice.connect("alice").unwrap();
        let mut subscription = alice.subscribe(RecordFilter::default()).unwrap();
        alice.unsubscribe(subscription.token);
        drain(&mut subscription);

        alice
            .write("alice", online_at(1.0, 2.0), WriteMode::Merge)
            .unwrap();
        assert!(drain(&mut subscription).is_empty());
    }

    #[test]
    fn test_boxed_store_forwards_calls() {
        let store = MemoryStore::new();
        let mut boxed: Box<dyn PresenceStore> = Box::new(store.connection());
        boxed.connect("alice").unwrap();
        boxed
            .write("alice", online_at(7.0, 8.0), WriteMode::Merge)
            .unwrap();
        assert!(boxed.is_connected());
        assert_eq!(
            store.record("alice").and_then(|r| r.position),
            Some(Position::new(7.0, 8.0))
        );
    }
}
