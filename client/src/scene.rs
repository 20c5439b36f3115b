//! Drawable state for remote players and the loader that produces their sprite sheets

use crate::reconciler::{AssetLoad, AssetLoader, SceneSink, SpriteSheet};
use log::debug;
use shared::PlayerState;
use std::collections::{BTreeMap, HashMap};

/// One remote player as the renderer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneEntity {
    pub state: PlayerState,
    pub sheet: SpriteSheet,
}

/// The remote half of the scene, kept in id order so drawing is stable.
#[derive(Debug, Default)]
pub struct SceneEntities {
    entities: BTreeMap<String, SceneEntity>,
}

impl SceneEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&SceneEntity> {
        self.entities.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SceneEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl SceneSink for SceneEntities {
    fn spawn(&mut self, state: &PlayerState, sheet: &SpriteSheet) {
        debug!("Spawning {} as {}", state.id, sheet.avatar_id);
        self.entities.insert(
            state.id.clone(),
            SceneEntity {
                state: state.clone(),
                sheet: sheet.clone(),
            },
        );
    }

    fn update(&mut self, state: &PlayerState) {
        if let Some(entity) = self.entities.get_mut(&state.id) {
            entity.state = state.clone();
        }
    }

    fn despawn(&mut self, id: &str) {
        debug!("Despawning {}", id);
        self.entities.remove(id);
    }
}

/// Builds sheets from the avatar catalog tints. A configurable number of polls pass before a
/// sheet becomes ready, standing in for a real asynchronous fetch.
#[derive(Debug, Default)]
pub struct PaletteLoader {
    load_frames: u32,
    in_flight: HashMap<String, u32>,
}

impl PaletteLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_frames(load_frames: u32) -> Self {
        Self {
            load_frames,
            in_flight: HashMap::new(),
        }
    }
}

impl AssetLoader for PaletteLoader {
    fn load(&mut self, avatar_id: &str) -> AssetLoad {
        let sheet = match SpriteSheet::for_avatar(avatar_id) {
            Ok(sheet) => sheet,
            Err(e) => return AssetLoad::Failed(e),
        };
        if self.load_frames == 0 {
            return AssetLoad::Ready(sheet);
        }

        let waited = self.in_flight.entry(avatar_id.to_string()).or_insert(0);
        *waited += 1;
        if *waited > self.load_frames {
            self.in_flight.remove(avatar_id);
            AssetLoad::Ready(sheet)
        } else {
            AssetLoad::Pending
        }
    }
}
