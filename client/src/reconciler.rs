//! Applies presence snapshots to the local scene
//!
//! Every snapshot is treated as the authoritative set of remote players: entities for ids that
//! disappeared are destroyed, new ids are spawned once their sprite sheet is available, and
//! existing ones are moved to the reported position. Remote motion is never predicted or
//! interpolated.

use log::{debug, warn};
use shared::{find_avatar, PlayerRecord, PlayerState, Position, RecordError, Snapshot};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("no sprite sheet for avatar {0}")]
    UnknownAvatar(String),
    #[error("loading sheet for {avatar} failed: {reason}")]
    LoadFailed { avatar: String, reason: String },
}

/// A loaded character sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpriteSheet {
    pub avatar_id: String,
    pub tint: [u8; 3],
}

impl SpriteSheet {
    /// Sheet for a catalog avatar.
    pub fn for_avatar(avatar_id: &str) -> Result<Self, AssetError> {
        find_avatar(avatar_id)
            .map(|avatar| Self {
                avatar_id: avatar.id.to_string(),
                tint: avatar.tint,
            })
            .ok_or_else(|| AssetError::UnknownAvatar(avatar_id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLoad {
    Ready(SpriteSheet),
    /// Still loading; ask again on a later tick.
    Pending,
    Failed(AssetError),
}

pub trait AssetLoader {
    fn load(&mut self, avatar_id: &str) -> AssetLoad;
}

/// Receives the create/update/destroy operations for remote entities.
pub trait SceneSink {
    fn spawn(&mut self, state: &PlayerState, sheet: &SpriteSheet);
    fn update(&mut self, state: &PlayerState);
    fn despawn(&mut self, id: &str);
}

#[derive(Debug)]
struct CachedSheet {
    sheet: SpriteSheet,
    users: usize,
}

/// Sprite sheets keyed by avatar id, counted per entity using them.
#[derive(Debug, Default)]
pub struct AssetCache {
    sheets: HashMap<String, CachedSheet>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a reference on the sheet for `avatar_id`, loading it if needed.
    pub fn acquire<L: AssetLoader + ?Sized>(
        &mut self,
        avatar_id: &str,
        loader: &mut L,
    ) -> AssetLoad {
        if let Some(cached) = self.sheets.get_mut(avatar_id) {
            cached.users += 1;
            return AssetLoad::Ready(cached.sheet.clone());
        }

        let load = loader.load(avatar_id);
        if let AssetLoad::Ready(sheet) = &load {
            self.sheets.insert(
                avatar_id.to_string(),
                CachedSheet {
                    sheet: sheet.clone(),
                    users: 1,
                },
            );
        }
        load
    }

    /// Drops one reference; the sheet is evicted with its last user.
    pub fn release(&mut self, avatar_id: &str) {
        if let Some(cached) = self.sheets.get_mut(avatar_id) {
            cached.users = cached.users.saturating_sub(1);
            if cached.users == 0 {
                debug!("Evicting sprite sheet {}", avatar_id);
                self.sheets.remove(avatar_id);
            }
        }
    }

    pub fn users(&self, avatar_id: &str) -> usize {
        self.sheets.get(avatar_id).map_or(0, |c| c.users)
    }

    pub fn contains(&self, avatar_id: &str) -> bool {
        self.sheets.contains_key(avatar_id)
    }

    pub fn len(&self) -> usize {
        self.sheets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
    }
}

/// What one snapshot did to the scene.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub spawned: Vec<String>,
    pub updated: Vec<String>,
    pub despawned: Vec<String>,
    /// Present but waiting for a sprite sheet
    pub deferred: Vec<String>,
    pub skipped: Vec<(String, RecordError)>,
    /// The local player's own record, if the snapshot carried it
    pub own: Option<PlayerRecord>,
    /// The snapshot was older than one already applied and was ignored
    pub stale: bool,
}

#[derive(Debug)]
struct Deferred {
    state: PlayerState,
    failed: bool,
}

pub struct RemoteReconciler {
    local_id: String,
    entities: HashMap<String, PlayerState>,
    deferred: HashMap<String, Deferred>,
    cache: AssetCache,
    last_applied: Option<(u32, u64)>,
}

impl RemoteReconciler {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entities: HashMap::new(),
            deferred: HashMap::new(),
            cache: AssetCache::new(),
            last_applied: None,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn entities(&self) -> &HashMap<String, PlayerState> {
        &self.entities
    }

    pub fn entity(&self, id: &str) -> Option<&PlayerState> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    /// Positions of every spawned remote entity.
    pub fn positions(&self) -> impl Iterator<Item = (&str, Position)> + '_ {
        self.entities
            .iter()
            .map(|(id, state)| (id.as_str(), state.position))
    }

    /// Forgets the last applied sequence so a fresh subscription starts clean.
    pub fn reset_sequence(&mut self) {
        self.last_applied = None;
    }

    fn is_stale(&self, snapshot: &Snapshot) -> bool {
        matches!(
            self.last_applied,
            Some((token, seq)) if token == snapshot.token && snapshot.seq <= seq
        )
    }

    fn destroy<K: SceneSink + ?Sized>(&mut self, id: &str, sink: &mut K) -> bool {
        match self.entities.remove(id) {
            Some(state) => {
                sink.despawn(id);
                self.cache.release(&state.avatar_id);
                true
            }
            None => false,
        }
    }

    /// Spawns `state` if its sheet is available, otherwise parks it until a later tick.
    fn try_spawn<K, L>(&mut self, state: PlayerState, sink: &mut K, loader: &mut L) -> bool
    where
        K: SceneSink + ?Sized,
        L: AssetLoader + ?Sized,
    {
        match self.cache.acquire(&state.avatar_id, loader) {
            AssetLoad::Ready(sheet) => {
                sink.spawn(&state, &sheet);
                self.deferred.remove(&state.id);
                self.entities.insert(state.id.clone(), state);
                true
            }
            AssetLoad::Pending => {
                debug!("Sheet {} for {} still loading", state.avatar_id, state.id);
                self.deferred.insert(
                    state.id.clone(),
                    Deferred {
                        state,
                        failed: false,
                    },
                );
                false
            }
            AssetLoad::Failed(e) => {
                let already_failed = self.deferred.get(&state.id).map_or(false, |d| d.failed);
                if already_failed {
                    debug!("Sheet for {} still failing: {}", state.id, e);
                } else {
                    warn!("Deferring {}: {}", state.id, e);
                }
                self.deferred
                    .insert(state.id.clone(), Deferred { state, failed: true });
                false
            }
        }
    }

    /// Applies one snapshot.
    pub fn apply<K, L>(
        &mut self,
        snapshot: &Snapshot,
        sink: &mut K,
        loader: &mut L,
    ) -> ReconcileReport
    where
        K: SceneSink + ?Sized,
        L: AssetLoader + ?Sized,
    {
        let mut report = ReconcileReport::default();

        if self.is_stale(snapshot) {
            debug!(
                "Ignoring stale snapshot {} (token {})",
                snapshot.seq, snapshot.token
            );
            report.stale = true;
            return report;
        }
        self.last_applied = Some((snapshot.token, snapshot.seq));

        let mut present: HashMap<&str, &PlayerRecord> = HashMap::new();
        for record in &snapshot.records {
            if record.id == self.local_id {
                report.own = Some(record.clone());
            } else if record.is_online() {
                present.insert(record.id.as_str(), record);
            }
        }

        let gone: Vec<String> = self
            .entities
            .keys()
            .filter(|id| !present.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if self.destroy(&id, sink) {
                report.despawned.push(id);
            }
        }
        self.deferred
            .retain(|id, _| present.contains_key(id.as_str()));

        let mut ids: Vec<&str> = present.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let record = present[id];
            let state = match PlayerState::try_from(record) {
                Ok(state) => state,
                Err(e) => {
                    // Keep whatever we had; the next snapshot may be complete.
                    warn!("Skipping record {}: {}", id, e);
                    report.skipped.push((id.to_string(), e));
                    continue;
                }
            };

            let avatar_changed = self
                .entities
                .get(id)
                .map(|existing| existing.avatar_id != state.avatar_id);

            match avatar_changed {
                Some(false) => {
                    let changed = self
                        .entities
                        .get(id)
                        .map_or(false, |existing| existing.visibly_differs(&state));
                    if changed {
                        sink.update(&state);
                        self.entities.insert(id.to_string(), state);
                        report.updated.push(id.to_string());
                    }
                }
                Some(true) => {
                    self.destroy(id, sink);
                    report.despawned.push(id.to_string());
                    if self.try_spawn(state, sink, loader) {
                        report.spawned.push(id.to_string());
                    } else {
                        report.deferred.push(id.to_string());
                    }
                }
                None => {
                    if self.try_spawn(state, sink, loader) {
                        report.spawned.push(id.to_string());
                    } else {
                        report.deferred.push(id.to_string());
                    }
                }
            }
        }

        report
    }

    /// Retries entities whose sheets were pending or failed. Returns the ids spawned.
    pub fn retry_pending<K, L>(&mut self, sink: &mut K, loader: &mut L) -> Vec<String>
    where
        K: SceneSink + ?Sized,
        L: AssetLoader + ?Sized,
    {
        let waiting: Vec<PlayerState> = self
            .deferred
            .values()
            .map(|deferred| deferred.state.clone())
            .collect();

        let mut spawned = Vec::new();
        for state in waiting {
            let id = state.id.clone();
            if self.try_spawn(state, sink, loader) {
                spawned.push(id);
            }
        }
        spawned
    }

    /// Destroys every entity and drops all pending work. Returns how many entities were removed.
    pub fn clear<K: SceneSink + ?Sized>(&mut self, sink: &mut K) -> usize {
        let ids: Vec<String> = self.entities.keys().cloned().collect();
        let count = ids.len();
        for id in ids {
            self.destroy(&id, sink);
        }
        self.deferred.clear();
        self.last_applied = None;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Facing;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Spawn(String),
        Update(String, Position),
        Despawn(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<Call>,
    }

    impl SceneSink for RecordingSink {
        fn spawn(&mut self, state: &PlayerState, _sheet: &SpriteSheet) {
            self.calls.push(Call::Spawn(state.id.clone()));
        }

        fn update(&mut self, state: &PlayerState) {
            self.calls.push(Call::Update(state.id.clone(), state.position));
        }

        fn despawn(&mut self, id: &str) {
            self.calls.push(Call::Despawn(id.to_string()));
        }
    }

    #[derive(Default)]
    struct TestLoader {
        pending: HashSet<String>,
        failing: HashSet<String>,
        loads: usize,
    }

    impl AssetLoader for TestLoader {
        fn load(&mut self, avatar_id: &str) -> AssetLoad {
            self.loads += 1;
            if self.pending.contains(avatar_id) {
                AssetLoad::Pending
            } else if self.failing.contains(avatar_id) {
                AssetLoad::Failed(AssetError::LoadFailed {
                    avatar: avatar_id.to_string(),
                    reason: "404".to_string(),
                })
            } else {
                match SpriteSheet::for_avatar(avatar_id) {
                    Ok(sheet) => AssetLoad::Ready(sheet),
                    Err(e) => AssetLoad::Failed(e),
                }
            }
        }
    }

    fn record(id: &str, avatar: &str, x: f32, y: f32) -> PlayerRecord {
        let mut record = PlayerRecord::new(id);
        record.avatar_id = Some(avatar.to_string());
        record.position = Some(Position::new(x, y));
        record.facing = Some(Facing::Front);
        record.online = Some(true);
        record
    }

    fn snapshot(seq: u64, records: Vec<PlayerRecord>) -> Snapshot {
        Snapshot {
            token: 1,
            seq,
            records,
        }
    }

    #[test]
    fn test_spawn_update_and_despawn() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        let report = reconciler.apply(
            &snapshot(1, vec![record("b", "tom", 50.0, 50.0)]),
            &mut sink,
            &mut loader,
        );
        assert_eq!(report.spawned, vec!["b".to_string()]);

        reconciler.apply(
            &snapshot(2, vec![record("b", "tom", 60.0, 50.0)]),
            &mut sink,
            &mut loader,
        );
        reconciler.apply(&snapshot(3, vec![]), &mut sink, &mut loader);
        reconciler.apply(&snapshot(4, vec![]), &mut sink, &mut loader);

        assert_eq!(
            sink.calls,
            vec![
                Call::Spawn("b".to_string()),
                Call::Update("b".to_string(), Position::new(60.0, 50.0)),
                Call::Despawn("b".to_string()),
            ]
        );
        assert!(reconciler.is_empty());
        assert!(reconciler.cache().is_empty());
    }

    #[test]
    fn test_back_to_back_snapshots_leave_no_entity() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        reconciler.apply(
            &snapshot(1, vec![record("b", "alex", 50.0, 50.0)]),
            &mut sink,
            &mut loader,
        );
        reconciler.apply(&snapshot(2, vec![]), &mut sink, &mut loader);

        assert!(reconciler.entity("b").is_none());
    }

    #[test]
    fn test_same_snapshot_twice_is_idempotent() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();
        let records = vec![
            record("b", "alex", 50.0, 50.0),
            record("c", "ana", 70.0, 90.0),
        ];

        reconciler.apply(&snapshot(1, records.clone()), &mut sink, &mut loader);
        let calls_after_first = sink.calls.len();
        let entities_after_first = reconciler.entities().clone();

        let replay = reconciler.apply(&snapshot(1, records.clone()), &mut sink, &mut loader);
        assert!(replay.stale);

        let resent = reconciler.apply(&snapshot(2, records), &mut sink, &mut loader);
        assert!(resent.updated.is_empty());
        assert_eq!(sink.calls.len(), calls_after_first);
        assert_eq!(reconciler.entities(), &entities_after_first);
    }

    #[test]
    fn test_stale_sequence_is_ignored() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        reconciler.apply(
            &snapshot(5, vec![record("b", "alex", 1.0, 1.0)]),
            &mut sink,
            &mut loader,
        );
        let report = reconciler.apply(&snapshot(4, vec![]), &mut sink, &mut loader);

        assert!(report.stale);
        assert!(reconciler.entity("b").is_some());

        // A new subscription token starts a fresh sequence.
        let fresh = Snapshot {
            token: 2,
            seq: 1,
            records: vec![],
        };
        let report = reconciler.apply(&fresh, &mut sink, &mut loader);
        assert!(!report.stale);
        assert!(reconciler.is_empty());
    }

    #[test]
    fn test_own_record_is_reported_not_spawned() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        let report = reconciler.apply(
            &snapshot(1, vec![record("me", "colt", 10.0, 10.0)]),
            &mut sink,
            &mut loader,
        );

        assert!(sink.calls.is_empty());
        assert_eq!(report.own.map(|r| r.id), Some("me".to_string()));
    }

    #[test]
    fn test_malformed_record_is_skipped_and_retried() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        let mut broken = record("b", "alex", 0.0, 0.0);
        broken.position = None;
        let report = reconciler.apply(
            &snapshot(1, vec![broken, record("c", "ana", 5.0, 5.0)]),
            &mut sink,
            &mut loader,
        );

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.spawned, vec!["c".to_string()]);

        let report = reconciler.apply(
            &snapshot(
                2,
                vec![record("b", "alex", 3.0, 3.0), record("c", "ana", 5.0, 5.0)],
            ),
            &mut sink,
            &mut loader,
        );
        assert_eq!(report.spawned, vec!["b".to_string()]);
    }

    #[test]
    fn test_malformed_update_keeps_existing_entity() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        reconciler.apply(
            &snapshot(1, vec![record("b", "alex", 8.0, 8.0)]),
            &mut sink,
            &mut loader,
        );
        let mut broken = record("b", "alex", 0.0, 0.0);
        broken.position = Some(Position::new(f32::NAN, 1.0));
        let report = reconciler.apply(&snapshot(2, vec![broken]), &mut sink, &mut loader);

        assert!(report.despawned.is_empty());
        assert_eq!(
            reconciler.entity("b").map(|s| s.position),
            Some(Position::new(8.0, 8.0))
        );
    }

    #[test]
    fn test_offline_records_count_as_absent() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        reconciler.apply(
            &snapshot(1, vec![record("b", "alex", 8.0, 8.0)]),
            &mut sink,
            &mut loader,
        );
        let mut offline = record("b", "alex", 8.0, 8.0);
        offline.online = Some(false);
        let report = reconciler.apply(&snapshot(2, vec![offline]), &mut sink, &mut loader);

        assert_eq!(report.despawned, vec!["b".to_string()]);
    }

    #[test]
    fn test_pending_asset_defers_spawn() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();
        loader.pending.insert("ester".to_string());

        let report = reconciler.apply(
            &snapshot(1, vec![record("b", "ester", 8.0, 8.0)]),
            &mut sink,
            &mut loader,
        );
        assert_eq!(report.deferred, vec!["b".to_string()]);
        assert!(sink.calls.is_empty());
        assert_eq!(reconciler.pending_count(), 1);

        assert!(reconciler.retry_pending(&mut sink, &mut loader).is_empty());

        loader.pending.clear();
        let spawned = reconciler.retry_pending(&mut sink, &mut loader);
        assert_eq!(spawned, vec!["b".to_string()]);
        assert_eq!(sink.calls, vec![Call::Spawn("b".to_string())]);
        assert_eq!(reconciler.pending_count(), 0);
    }

    #[test]
    fn test_failed_asset_is_retried_later() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();
        loader.failing.insert("tom".to_string());

        reconciler.apply(
            &snapshot(1, vec![record("b", "tom", 8.0, 8.0)]),
            &mut sink,
            &mut loader,
        );
        assert!(reconciler.is_empty());

        loader.failing.clear();
        reconciler.apply(
            &snapshot(2, vec![record("b", "tom", 9.0, 8.0)]),
            &mut sink,
            &mut loader,
        );
        assert_eq!(
            reconciler.entity("b").map(|s| s.position),
            Some(Position::new(9.0, 8.0))
        );
    }

    #[test]
    fn test_deferred_entity_dropped_when_player_leaves() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();
        loader.pending.insert("tom".to_string());

        reconciler.apply(
            &snapshot(1, vec![record("b", "tom", 8.0, 8.0)]),
            &mut sink,
            &mut loader,
        );
        reconciler.apply(&snapshot(2, vec![]), &mut sink, &mut loader);

        loader.pending.clear();
        assert!(reconciler.retry_pending(&mut sink, &mut loader).is_empty());
        assert!(sink.calls.is_empty());
    }

    #[test]
    fn test_asset_cache_shares_and_evicts() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        reconciler.apply(
            &snapshot(
                1,
                vec![record("b", "tom", 1.0, 1.0), record("c", "tom", 2.0, 2.0)],
            ),
            &mut sink,
            &mut loader,
        );
        assert_eq!(loader.loads, 1);
        assert_eq!(reconciler.cache().users("tom"), 2);

        reconciler.apply(
            &snapshot(2, vec![record("c", "tom", 2.0, 2.0)]),
            &mut sink,
            &mut loader,
        );
        assert_eq!(reconciler.cache().users("tom"), 1);

        reconciler.apply(&snapshot(3, vec![]), &mut sink, &mut loader);
        assert!(!reconciler.cache().contains("tom"));
    }

    #[test]
    fn test_avatar_change_recreates_entity() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        reconciler.apply(
            &snapshot(1, vec![record("b", "tom", 1.0, 1.0)]),
            &mut sink,
            &mut loader,
        );
        reconciler.apply(
            &snapshot(2, vec![record("b", "ana", 1.0, 1.0)]),
            &mut sink,
            &mut loader,
        );

        assert_eq!(
            sink.calls,
            vec![
                Call::Spawn("b".to_string()),
                Call::Despawn("b".to_string()),
                Call::Spawn("b".to_string()),
            ]
        );
        assert!(!reconciler.cache().contains("tom"));
        assert!(reconciler.cache().contains("ana"));
    }

    #[test]
    fn test_clear_destroys_everything() {
        let mut reconciler = RemoteReconciler::new("me");
        let mut sink = RecordingSink::default();
        let mut loader = TestLoader::default();

        reconciler.apply(
            &snapshot(
                1,
                vec![record("b", "tom", 1.0, 1.0), record("c", "ana", 2.0, 2.0)],
            ),
            &mut sink,
            &mut loader,
        );
        assert_eq!(reconciler.clear(&mut sink), 2);
        assert!(reconciler.is_empty());
        assert!(reconciler.cache().is_empty());
        assert_eq!(
            sink.calls
                .iter()
                .filter(|c| matches!(c, Call::Despawn(_)))
                .count(),
            2
        );
    }
}
