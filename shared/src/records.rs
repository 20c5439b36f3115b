//! Player documents as held by the presence store, partial writes against them, and the
//! last-writer-wins record book both store implementations are built on.

use crate::{
    find_avatar, Facing, Position, DEFAULT_DISPLAY_NAME, MAX_DISPLAY_NAME_LEN, MAX_PHOTO_URL_LEN,
    MAX_PLAYER_ID_LEN,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record id is empty")]
    EmptyId,
    #[error("record {0} has no position")]
    MissingPosition(String),
    #[error("record {0} has a non-finite position")]
    NonFinitePosition(String),
    #[error("record {0} has no avatar")]
    MissingAvatar(String),
    #[error("patch for {0} carries non-finite values")]
    NonFinitePatch(String),
    #[error("{field} of {id} is longer than {limit} bytes")]
    FieldTooLong {
        id: String,
        field: &'static str,
        limit: usize,
    },
    #[error("patch for {0} names unknown avatar {1}")]
    UnknownAvatar(String, String),
}

/// The stored document for one player. Everything except the key is optional because the store
/// only ever receives partial writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub avatar_id: Option<String>,
    pub photo_url: Option<String>,
    pub position: Option<Position>,
    pub facing: Option<Facing>,
    pub online: Option<bool>,
    /// Unix millis, assigned by the store on every accepted write.
    pub last_active_at: Option<u64>,
    pub mic_on: Option<bool>,
    pub camera_on: Option<bool>,
}

impl PlayerRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            avatar_id: None,
            photo_url: None,
            position: None,
            facing: None,
            online: None,
            last_active_at: None,
            mic_on: None,
            camera_on: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online == Some(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub mic_on: bool,
    pub camera_on: bool,
}

/// Validated view of a [`PlayerRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub id: String,
    pub display_name: String,
    pub avatar_id: String,
    pub position: Position,
    pub facing: Facing,
    pub online: bool,
    pub last_active_at: u64,
    pub capabilities: CapabilityFlags,
}

impl PlayerState {
    pub fn new(id: impl Into<String>, avatar_id: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            avatar_id: avatar_id.into(),
            position,
            facing: Facing::Front,
            online: true,
            last_active_at: 0,
            capabilities: CapabilityFlags::default(),
        }
    }

    /// True when anything a remote viewer can see differs from `other`.
    pub fn visibly_differs(&self, other: &PlayerState) -> bool {
        self.position != other.position
            || self.facing != other.facing
            || self.display_name != other.display_name
            || self.avatar_id != other.avatar_id
            || self.capabilities != other.capabilities
    }
}

impl TryFrom<&PlayerRecord> for PlayerState {
    type Error = RecordError;

    fn try_from(record: &PlayerRecord) -> Result<Self, Self::Error> {
        if record.id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        let position = record
            .position
            .ok_or_else(|| RecordError::MissingPosition(record.id.clone()))?;
        if !position.is_finite() {
            return Err(RecordError::NonFinitePosition(record.id.clone()));
        }
        let avatar_id = record
            .avatar_id
            .clone()
            .ok_or_else(|| RecordError::MissingAvatar(record.id.clone()))?;

        Ok(Self {
            id: record.id.clone(),
            display_name: record
                .display_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()),
            avatar_id,
            position,
            facing: record.facing.unwrap_or_default(),
            online: record.is_online(),
            last_active_at: record.last_active_at.unwrap_or(0),
            capabilities: CapabilityFlags {
                mic_on: record.mic_on.unwrap_or(false),
                camera_on: record.camera_on.unwrap_or(false),
            },
        })
    }
}

/// How a write combines with the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Every field present in the patch overwrites the stored value.
    Merge,
    /// Only fields the stored document does not have yet are set.
    FillMissing,
}

/// A partial record. `None` means "leave unchanged".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerPatch {
    pub display_name: Option<String>,
    pub avatar_id: Option<String>,
    pub photo_url: Option<String>,
    pub position: Option<Position>,
    pub facing: Option<Facing>,
    pub online: Option<bool>,
    pub mic_on: Option<bool>,
    pub camera_on: Option<bool>,
}

impl PlayerPatch {
    pub fn offline() -> Self {
        Self {
            online: Some(false),
            ..Self::default()
        }
    }

    pub fn motion(position: Position, facing: Facing) -> Self {
        Self {
            position: Some(position),
            facing: Some(facing),
            ..Self::default()
        }
    }

    pub fn capabilities(flags: CapabilityFlags) -> Self {
        Self {
            mic_on: Some(flags.mic_on),
            camera_on: Some(flags.camera_on),
            ..Self::default()
        }
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }

    pub fn with_avatar(mut self, avatar_id: impl Into<String>) -> Self {
        self.avatar_id = Some(avatar_id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_photo_url(mut self, url: Option<String>) -> Self {
        self.photo_url = url;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn is_finite(&self) -> bool {
        self.position.map_or(true, |position| position.is_finite())
    }

    /// Checks everything a store refuses to persist for `player_id`.
    pub fn validate(&self, player_id: &str) -> Result<(), RecordError> {
        if !self.is_finite() {
            return Err(RecordError::NonFinitePatch(player_id.to_string()));
        }
        let limits = [
            ("display_name", &self.display_name, MAX_DISPLAY_NAME_LEN),
            ("photo_url", &self.photo_url, MAX_PHOTO_URL_LEN),
        ];
        for (field, value, limit) in limits {
            if value.as_ref().is_some_and(|v| v.len() > limit) {
                return Err(RecordError::FieldTooLong {
                    id: player_id.to_string(),
                    field,
                    limit,
                });
            }
        }
        if let Some(avatar_id) = &self.avatar_id {
            if find_avatar(avatar_id).is_none() {
                return Err(RecordError::UnknownAvatar(
                    player_id.to_string(),
                    avatar_id.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Folds a newer patch into this one; fields set in `newer` win.
    pub fn merge(&mut self, newer: PlayerPatch) {
        fn take<T>(slot: &mut Option<T>, newer: Option<T>) {
            if newer.is_some() {
                *slot = newer;
            }
        }
        take(&mut self.display_name, newer.display_name);
        take(&mut self.avatar_id, newer.avatar_id);
        take(&mut self.photo_url, newer.photo_url);
        take(&mut self.position, newer.position);
        take(&mut self.facing, newer.facing);
        take(&mut self.online, newer.online);
        take(&mut self.mic_on, newer.mic_on);
        take(&mut self.camera_on, newer.camera_on);
    }

    pub fn apply_to(&self, record: &mut PlayerRecord, mode: WriteMode) {
        fn put<T: Clone>(slot: &mut Option<T>, value: &Option<T>, mode: WriteMode) {
            let Some(value) = value else { return };
            if mode == WriteMode::Merge || slot.is_none() {
                *slot = Some(value.clone());
            }
        }
        put(&mut record.display_name, &self.display_name, mode);
        put(&mut record.avatar_id, &self.avatar_id, mode);
        put(&mut record.photo_url, &self.photo_url, mode);
        put(&mut record.position, &self.position, mode);
        put(&mut record.facing, &self.facing, mode);
        put(&mut record.online, &self.online, mode);
        put(&mut record.mic_on, &self.mic_on, mode);
        put(&mut record.camera_on, &self.camera_on, mode);
    }
}

/// Subscription predicate. Serializable so it can cross the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub online: Option<bool>,
    pub exclude_id: Option<String>,
}

impl RecordFilter {
    pub fn online() -> Self {
        Self {
            online: Some(true),
            exclude_id: None,
        }
    }

    pub fn excluding(mut self, id: impl Into<String>) -> Self {
        self.exclude_id = Some(id.into());
        self
    }

    pub fn matches(&self, record: &PlayerRecord) -> bool {
        if let Some(online) = self.online {
            if record.online.unwrap_or(false) != online {
                return false;
            }
        }
        self.exclude_id.as_deref() != Some(record.id.as_str())
    }
}

/// Last-writer-wins document collection keyed by player id.
///
/// Writes are applied in arrival order; each accepted write stamps `last_active_at` with the
/// caller-supplied store time and bumps the revision so pushers can tell when to re-send.
#[derive(Debug, Default, Clone)]
pub struct RecordBook {
    records: BTreeMap<String, PlayerRecord>,
    revision: u64,
}

impl RecordBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(
        &mut self,
        player_id: &str,
        patch: &PlayerPatch,
        mode: WriteMode,
        now_ms: u64,
    ) -> Result<(), RecordError> {
        if player_id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        if player_id.len() > MAX_PLAYER_ID_LEN {
            return Err(RecordError::FieldTooLong {
                id: player_id.chars().take(16).collect(),
                field: "id",
                limit: MAX_PLAYER_ID_LEN,
            });
        }
        patch.validate(player_id)?;

        let record = self
            .records
            .entry(player_id.to_string())
            .or_insert_with(|| PlayerRecord::new(player_id));
        patch.apply_to(record, mode);
        record.last_active_at = Some(now_ms);
        self.revision += 1;
        Ok(())
    }

    pub fn get(&self, player_id: &str) -> Option<&PlayerRecord> {
        self.records.get(player_id)
    }

    /// Matching records ordered by id.
    pub fn snapshot(&self, filter: &RecordFilter) -> Vec<PlayerRecord> {
        self.records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.records.values().filter(|r| r.is_online()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record(id: &str) -> PlayerRecord {
        let mut record = PlayerRecord::new(id);
        record.avatar_id = Some("tom".to_string());
        record.position = Some(Position::new(10.0, 20.0));
        record.online = Some(true);
        record
    }

    #[test]
    fn test_state_from_complete_record() {
        let mut record = full_record("a");
        record.display_name = Some("Alice".to_string());
        record.facing = Some(Facing::Left);
        record.mic_on = Some(true);

        let state = PlayerState::try_from(&record).unwrap();
        assert_eq!(state.id, "a");
        assert_eq!(state.display_name, "Alice");
        assert_eq!(state.facing, Facing::Left);
        assert!(state.online);
        assert!(state.capabilities.mic_on);
        assert!(!state.capabilities.camera_on);
    }

    #[test]
    fn test_state_defaults_for_optional_fields() {
        let record = full_record("b");
        let state = PlayerState::try_from(&record).unwrap();
        assert_eq!(state.display_name, DEFAULT_DISPLAY_NAME);
        assert_eq!(state.facing, Facing::Front);
        assert_eq!(state.last_active_at, 0);
    }

    #[test]
    fn test_state_rejects_malformed_records() {
        let mut missing_position = full_record("c");
        missing_position.position = None;
        assert_eq!(
            PlayerState::try_from(&missing_position),
            Err(RecordError::MissingPosition("c".to_string()))
        );

        let mut nan_position = full_record("d");
        nan_position.position = Some(Position::new(f32::NAN, 1.0));
        assert_eq!(
            PlayerState::try_from(&nan_position),
            Err(RecordError::NonFinitePosition("d".to_string()))
        );

        let mut missing_avatar = full_record("e");
        missing_avatar.avatar_id = None;
        assert!(PlayerState::try_from(&missing_avatar).is_err());

        assert_eq!(
            PlayerState::try_from(&PlayerRecord::new("")),
            Err(RecordError::EmptyId)
        );
    }

    #[test]
    fn test_patch_merge_newer_wins() {
        let mut older = PlayerPatch::motion(Position::new(1.0, 1.0), Facing::Left);
        older.mic_on = Some(true);
        older.merge(PlayerPatch::motion(Position::new(2.0, 3.0), Facing::Back));

        assert_eq!(older.position, Some(Position::new(2.0, 3.0)));
        assert_eq!(older.facing, Some(Facing::Back));
        assert_eq!(older.mic_on, Some(true));
    }

    #[test]
    fn test_patch_finite_check() {
        assert!(PlayerPatch::offline().is_finite());
        assert!(PlayerPatch::motion(Position::new(1.0, 2.0), Facing::Front).is_finite());
        assert!(!PlayerPatch::motion(Position::new(f32::INFINITY, 2.0), Facing::Front).is_finite());
    }

    #[test]
    fn test_fill_missing_keeps_existing_fields() {
        let mut record = full_record("f");
        let seed = PlayerPatch::default()
            .with_avatar("alex")
            .with_display_name("Fresh");
        seed.apply_to(&mut record, WriteMode::FillMissing);

        assert_eq!(record.avatar_id.as_deref(), Some("tom"));
        assert_eq!(record.display_name.as_deref(), Some("Fresh"));
    }

    #[test]
    fn test_filter_online_and_exclusion() {
        let online = full_record("g");
        let mut offline = full_record("h");
        offline.online = Some(false);
        let unknown = PlayerRecord::new("i");

        let filter = RecordFilter::online();
        assert!(filter.matches(&online));
        assert!(!filter.matches(&offline));
        assert!(!filter.matches(&unknown));

        let excluding = RecordFilter::online().excluding("g");
        assert!(!excluding.matches(&online));
        assert!(RecordFilter::default().matches(&offline));
    }

    #[test]
    fn test_record_book_write_and_snapshot() {
        let mut book = RecordBook::new();
        let patch = PlayerPatch::motion(Position::new(5.0, 6.0), Facing::Right)
            .with_online(true)
            .with_avatar("colt");

        book.write("b", &patch, WriteMode::Merge, 1_000).unwrap();
        book.write("a", &patch, WriteMode::Merge, 1_001).unwrap();
        book.write("c", &PlayerPatch::offline(), WriteMode::Merge, 1_002)
            .unwrap();

        let snapshot = book.snapshot(&RecordFilter::online());
        let ids: Vec<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(book.get("a").and_then(|r| r.last_active_at), Some(1_001));
        assert_eq!(book.revision(), 3);
        assert_eq!(book.len(), 3);
        assert_eq!(book.online_count(), 2);
    }

    #[test]
    fn test_record_book_last_writer_wins_per_field() {
        let mut book = RecordBook::new();
        book.write(
            "a",
            &PlayerPatch::motion(Position::new(1.0, 1.0), Facing::Front).with_online(true),
            WriteMode::Merge,
            1,
        )
        .unwrap();
        book.write(
            "a",
            &PlayerPatch::default().with_display_name("Ann"),
            WriteMode::Merge,
            2,
        )
        .unwrap();
        book.write(
            "a",
            &PlayerPatch::motion(Position::new(9.0, 9.0), Facing::Back),
            WriteMode::Merge,
            3,
        )
        .unwrap();

        let record = book.get("a").unwrap();
        assert_eq!(record.position, Some(Position::new(9.0, 9.0)));
        assert_eq!(record.facing, Some(Facing::Back));
        assert_eq!(record.display_name.as_deref(), Some("Ann"));
        assert_eq!(record.online, Some(true));
        assert_eq!(record.last_active_at, Some(3));
    }

    #[test]
    fn test_record_book_rejects_invalid_writes() {
        let mut book = RecordBook::new();
        let bad = PlayerPatch::motion(Position::new(f32::NAN, 0.0), Facing::Front);

        assert_eq!(
            book.write("a", &bad, WriteMode::Merge, 1),
            Err(RecordError::NonFinitePatch("a".to_string()))
        );
        assert_eq!(
            book.write("", &PlayerPatch::offline(), WriteMode::Merge, 1),
            Err(RecordError::EmptyId)
        );
        assert!(book.is_empty());
        assert_eq!(book.revision(), 0);
    }

    #[test]
    fn test_record_book_rejects_oversized_fields() {
        let mut book = RecordBook::new();
        let long_name = PlayerPatch::default().with_display_name("x".repeat(40_000));
        let long_url =
            PlayerPatch::default().with_photo_url(Some("u".repeat(MAX_PHOTO_URL_LEN + 1)));

        assert!(matches!(
            book.write("a", &long_name, WriteMode::Merge, 1),
            Err(RecordError::FieldTooLong {
                field: "display_name",
                ..
            })
        ));
        assert!(matches!(
            book.write("a", &long_url, WriteMode::FillMissing, 1),
            Err(RecordError::FieldTooLong {
                field: "photo_url",
                ..
            })
        ));
        let long_id = "i".repeat(MAX_PLAYER_ID_LEN + 1);
        assert!(matches!(
            book.write(&long_id, &PlayerPatch::offline(), WriteMode::Merge, 1),
            Err(RecordError::FieldTooLong { field: "id", .. })
        ));
        assert!(book.is_empty());

        let at_limit =
            PlayerPatch::default().with_display_name("n".repeat(MAX_DISPLAY_NAME_LEN));
        book.write("a", &at_limit, WriteMode::Merge, 2).unwrap();
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_record_book_rejects_unknown_avatar() {
        let mut book = RecordBook::new();
        let colt = PlayerPatch::default().with_avatar("colt");
        let dragon = PlayerPatch::default().with_avatar("dragon");
        book.write("a", &colt, WriteMode::Merge, 1).unwrap();

        assert_eq!(
            book.write("a", &dragon, WriteMode::Merge, 2),
            Err(RecordError::UnknownAvatar(
                "a".to_string(),
                "dragon".to_string()
            ))
        );
        assert_eq!(
            book.get("a").and_then(|r| r.avatar_id.as_deref()),
            Some("colt")
        );
        assert_eq!(book.revision(), 1);
    }
}
