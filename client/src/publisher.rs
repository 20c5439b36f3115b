//! Throttled publishing of the local player's state to the presence store

use crate::store::PresenceStore;
use log::{debug, warn};
use shared::{CapabilityFlags, Facing, PlayerPatch, Position, WriteMode};
use std::time::{Duration, Instant};

/// Trailing-edge throttle holding at most one pending value.
///
/// The first offer opens a window; [`Throttle::poll`] releases the pending value once the window
/// has elapsed. Offers made while the window is open replace (or, via
/// [`Throttle::pending_mut`], amend) the pending value, so a burst yields exactly one release
/// carrying the latest data. The clock is always passed in.
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    pending: Option<T>,
    window_opened: Option<Instant>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            window_opened: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn offer(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        if self.window_opened.is_none() {
            self.window_opened = Some(now);
        }
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref()
    }

    pub fn pending_mut(&mut self) -> Option<&mut T> {
        self.pending.as_mut()
    }

    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let opened = self.window_opened?;
        if now.saturating_duration_since(opened) < self.interval {
            return None;
        }
        self.window_opened = None;
        self.pending.take()
    }

    /// Releases the pending value immediately.
    pub fn flush(&mut self) -> Option<T> {
        self.window_opened = None;
        self.pending.take()
    }

    pub fn clear(&mut self) {
        self.window_opened = None;
        self.pending = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub writes: u64,
    pub coalesced: u64,
    pub rejected_invalid: u64,
    pub failed: u64,
}

/// Pushes local position, facing and capability changes to the store under one throttle.
pub struct StatePublisher {
    player_id: String,
    throttle: Throttle<PlayerPatch>,
    last_motion: Option<(Position, Facing)>,
    stats: PublisherStats,
}

impl StatePublisher {
    pub fn new(player_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            player_id: player_id.into(),
            throttle: Throttle::new(interval),
            last_motion: None,
            stats: PublisherStats::default(),
        }
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    pub fn pending(&self) -> Option<&PlayerPatch> {
        self.throttle.pending()
    }

    /// Queues a patch, merging it into whatever is already waiting. Non-finite patches are
    /// logged and dropped.
    pub fn submit(&mut self, patch: PlayerPatch, now: Instant) -> bool {
        if !patch.is_finite() {
            warn!("Refusing to publish non-finite state for {}", self.player_id);
            self.stats.rejected_invalid += 1;
            return false;
        }
        if patch.is_empty() {
            return false;
        }

        match self.throttle.pending_mut() {
            Some(pending) => {
                pending.merge(patch);
                self.stats.coalesced += 1;
            }
            None => self.throttle.offer(patch, now),
        }
        true
    }

    /// Queues position and facing unless they match what is pending, or what was last written
    /// when nothing is pending.
    pub fn publish_motion(&mut self, position: Position, facing: Facing, now: Instant) -> bool {
        let pending = self
            .throttle
            .pending()
            .and_then(|patch| patch.position.zip(patch.facing));
        if pending.or(self.last_motion) == Some((position, facing)) {
            return false;
        }
        self.submit(PlayerPatch::motion(position, facing), now)
    }

    pub fn set_capabilities(&mut self, flags: CapabilityFlags, now: Instant) -> bool {
        self.submit(PlayerPatch::capabilities(flags), now)
    }

    /// Remembers motion that reached the store by another path, so it is not re-sent.
    pub fn mark_published(&mut self, position: Position, facing: Facing) {
        self.last_motion = Some((position, facing));
    }

    /// Writes the pending patch if its window has elapsed. Returns whether a write was issued.
    pub fn poll<S: PresenceStore + ?Sized>(&mut self, store: &mut S, now: Instant) -> bool {
        match self.throttle.poll(now) {
            Some(patch) => {
                self.write(store, patch);
                true
            }
            None => false,
        }
    }

    /// Writes the pending patch right away, ignoring the throttle.
    pub fn flush<S: PresenceStore + ?Sized>(&mut self, store: &mut S) -> bool {
        match self.throttle.flush() {
            Some(patch) => {
                self.write(store, patch);
                true
            }
            None => false,
        }
    }

    /// Forgets pending and remembered state, keeping the counters.
    pub fn reset(&mut self) {
        self.throttle.clear();
        self.last_motion = None;
    }

    fn write<S: PresenceStore + ?Sized>(&mut self, store: &mut S, patch: PlayerPatch) {
        let motion = patch.position.zip(patch.facing);
        match store.write(&self.player_id, patch, WriteMode::Merge) {
            Ok(()) => {
                self.stats.writes += 1;
                if motion.is_some() {
                    self.last_motion = motion;
                }
            }
            Err(e) => {
                // The next change supersedes this one; nothing is retried.
                debug!("Store write for {} failed: {}", self.player_id, e);
                self.stats.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError, Subscription};
    use shared::{RecordFilter, PUBLISH_INTERVAL};

    /// Records writes instead of storing them.
    #[derive(Default)]
    struct RecordingStore {
        writes: Vec<PlayerPatch>,
        fail: bool,
    }

    impl PresenceStore for RecordingStore {
        fn connect(&mut self, _player_id: &str) -> Result<(), StoreError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn write(
            &mut self,
            _player_id: &str,
            patch: PlayerPatch,
            _mode: WriteMode,
        ) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Closed);
            }
            self.writes.push(patch);
            Ok(())
        }

        fn subscribe(&mut self, _filter: RecordFilter) -> Result<Subscription, StoreError> {
            Err(StoreError::Closed)
        }

        fn unsubscribe(&mut self, _token: u32) {}

        fn register_disconnect_handler(
            &mut self,
            _player_id: &str,
            _patch: PlayerPatch,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_throttle_releases_once_per_window() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(100));

        throttle.offer(1, start);
        throttle.offer(2, start + Duration::from_millis(30));
        throttle.offer(3, start + Duration::from_millis(60));

        assert_eq!(throttle.poll(start + Duration::from_millis(90)), None);
        assert_eq!(throttle.poll(start + Duration::from_millis(100)), Some(3));
        assert_eq!(throttle.poll(start + Duration::from_millis(250)), None);
    }

    #[test]
    fn test_throttle_new_window_after_release() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(100));

        throttle.offer("a", start);
        assert_eq!(throttle.poll(start + Duration::from_millis(100)), Some("a"));

        let later = start + Duration::from_millis(500);
        throttle.offer("b", later);
        assert_eq!(throttle.poll(later + Duration::from_millis(50)), None);
        assert_eq!(throttle.flush(), Some("b"));
        assert_eq!(throttle.flush(), None);
    }

    #[test]
    fn test_burst_within_window_writes_last_values_once() {
        let start = Instant::now();
        let mut store = RecordingStore::default();
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);

        for i in 0..10 {
            let t = start + Duration::from_millis(i * 5);
            publisher.publish_motion(Position::new(i as f32, 0.0), Facing::Right, t);
            publisher.poll(&mut store, t);
        }
        publisher.poll(&mut store, start + PUBLISH_INTERVAL);

        assert_eq!(store.writes.len(), 1);
        assert_eq!(store.writes[0].position, Some(Position::new(9.0, 0.0)));
        assert_eq!(store.writes[0].facing, Some(Facing::Right));
        assert_eq!(publisher.stats().writes, 1);
        assert_eq!(publisher.stats().coalesced, 9);
    }

    #[test]
    fn test_scheduled_write_carries_simulated_values() {
        let now = Instant::now();
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);
        publisher.publish_motion(Position::new(102.5, 100.0), Facing::Right, now);

        let pending = publisher.pending().unwrap();
        assert_eq!(pending.position, Some(Position::new(102.5, 100.0)));
        assert_eq!(pending.facing, Some(Facing::Right));
    }

    #[test]
    fn test_capabilities_merge_with_motion() {
        let start = Instant::now();
        let mut store = RecordingStore::default();
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);

        publisher.publish_motion(Position::new(1.0, 2.0), Facing::Back, start);
        publisher.set_capabilities(
            CapabilityFlags {
                mic_on: true,
                camera_on: false,
            },
            start,
        );
        publisher.poll(&mut store, start + PUBLISH_INTERVAL);

        assert_eq!(store.writes.len(), 1);
        assert_eq!(store.writes[0].position, Some(Position::new(1.0, 2.0)));
        assert_eq!(store.writes[0].mic_on, Some(true));
        assert_eq!(store.writes[0].camera_on, Some(false));
    }

    #[test]
    fn test_non_finite_motion_is_dropped() {
        let now = Instant::now();
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);

        assert!(!publisher.publish_motion(Position::new(f32::NAN, 0.0), Facing::Front, now));
        assert!(publisher.pending().is_none());
        assert_eq!(publisher.stats().rejected_invalid, 1);
    }

    #[test]
    fn test_unchanged_motion_is_not_requeued() {
        let now = Instant::now();
        let mut store = RecordingStore::default();
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);

        assert!(publisher.publish_motion(Position::new(5.0, 5.0), Facing::Left, now));
        publisher.flush(&mut store);
        assert!(!publisher.publish_motion(Position::new(5.0, 5.0), Facing::Left, now));
        assert!(publisher.pending().is_none());

        publisher.reset();
        assert!(publisher.publish_motion(Position::new(5.0, 5.0), Facing::Left, now));
    }

    #[test]
    fn test_failed_write_is_not_retried() {
        let start = Instant::now();
        let mut store = RecordingStore {
            fail: true,
            ..RecordingStore::default()
        };
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);

        publisher.publish_motion(Position::new(1.0, 1.0), Facing::Front, start);
        assert!(publisher.poll(&mut store, start + PUBLISH_INTERVAL));
        assert!(!publisher.poll(&mut store, start + PUBLISH_INTERVAL * 3));
        assert_eq!(publisher.stats().failed, 1);
        assert!(publisher.pending().is_none());
    }

    #[test]
    fn test_motion_lost_to_failed_write_is_queued_again() {
        let start = Instant::now();
        let mut store = RecordingStore {
            fail: true,
            ..RecordingStore::default()
        };
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);
        let resting = Position::new(8.0, 8.0);

        publisher.publish_motion(resting, Facing::Left, start);
        publisher.poll(&mut store, start + PUBLISH_INTERVAL);
        assert_eq!(publisher.stats().failed, 1);

        // The player stopped moving; the same state still has to reach the store.
        store.fail = false;
        let later = start + PUBLISH_INTERVAL * 2;
        assert!(publisher.publish_motion(resting, Facing::Left, later));
        assert!(publisher.poll(&mut store, later + PUBLISH_INTERVAL));
        assert_eq!(store.writes.len(), 1);
        assert_eq!(store.writes[0].position, Some(resting));

        assert!(!publisher.publish_motion(resting, Facing::Left, later + PUBLISH_INTERVAL * 2));
    }

    #[test]
    fn test_publishes_into_memory_store() {
        let store = MemoryStore::new();
        let mut connection = store.connection();
        connection.connect("me").unwrap();
        let mut publisher = StatePublisher::new("me", PUBLISH_INTERVAL);

        let now = Instant::now();
        publisher.publish_motion(Position::new(3.0, 4.0), Facing::Left, now);
        publisher.flush(&mut connection);

        let record = store.record("me").unwrap();
        assert_eq!(record.position, Some(Position::new(3.0, 4.0)));
        assert_eq!(record.facing, Some(Facing::Left));
    }
}
