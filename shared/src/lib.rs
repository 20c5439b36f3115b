//! Types shared by the presence store service and the sync client: canonical world constants,
//! the record schema, the UDP wire protocol and the static office map.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod records;
pub mod tilemap;

pub use records::{
    CapabilityFlags, PlayerPatch, PlayerRecord, PlayerState, RecordBook, RecordError, RecordFilter,
    WriteMode,
};
pub use tilemap::{Footprint, Tile, TileMap, Zone};

pub const PROTOCOL_VERSION: u32 = 1;

pub const TILE_SIZE: f32 = 16.0;
pub const MAP_WIDTH_TILES: usize = 40;
pub const MAP_HEIGHT_TILES: usize = 30;

/// World units per reference frame (60 Hz).
pub const PLAYER_SPEED: f32 = 1.5;
pub const REFERENCE_FRAME_RATE: f32 = 60.0;
pub const MAX_FRAME_SCALE: f32 = 3.0;

pub const FOOTPRINT_HALF_WIDTH: f32 = 4.0;
pub const FOOTPRINT_HALF_HEIGHT: f32 = 4.0;

pub const SPAWN_X: f32 = 150.0;
pub const SPAWN_Y: f32 = 440.0;

pub const NPC_CHAT_RANGE: f32 = 50.0;
pub const PEER_INTERACT_RANGE: f32 = 80.0;

pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest datagram either side will try to decode.
pub const MAX_DATAGRAM: usize = 65_507;

/// Byte limits on the free-text fields a record may carry.
pub const MAX_PLAYER_ID_LEN: usize = 64;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_PHOTO_URL_LEN: usize = 256;

pub const DEFAULT_DISPLAY_NAME: &str = "Player";

/// World coordinates of an entity's anchor point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn spawn() -> Self {
        Self::new(SPAWN_X, SPAWN_Y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn distance_to(&self, other: &Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Facing {
    #[default]
    Front,
    Back,
    Left,
    Right,
}

impl Facing {
    /// Derives the facing from a movement vector, preferring the vertical axis on ties.
    /// Returns `None` for a zero vector so callers can keep the previous facing.
    pub fn from_vector(dx: f32, dy: f32) -> Option<Self> {
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        if dy.abs() >= dx.abs() {
            Some(if dy < 0.0 { Facing::Back } else { Facing::Front })
        } else {
            Some(if dx < 0.0 { Facing::Left } else { Facing::Right })
        }
    }
}

/// A selectable character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Avatar {
    pub id: &'static str,
    pub name: &'static str,
    pub tint: [u8; 3],
}

pub static AVATARS: [Avatar; 6] = [
    Avatar {
        id: "alex",
        name: "Alex",
        tint: [66, 135, 245],
    },
    Avatar {
        id: "ana",
        name: "Ana",
        tint: [230, 90, 160],
    },
    Avatar {
        id: "ardley",
        name: "Ardley",
        tint: [120, 200, 80],
    },
    Avatar {
        id: "colt",
        name: "Colt",
        tint: [240, 170, 40],
    },
    Avatar {
        id: "ester",
        name: "Ester",
        tint: [150, 100, 220],
    },
    Avatar {
        id: "tom",
        name: "Tom",
        tint: [60, 200, 200],
    },
];

pub fn find_avatar(id: &str) -> Option<&'static Avatar> {
    AVATARS.iter().find(|avatar| avatar.id == id)
}

/// The avatar after `id` in catalog order, wrapping around.
pub fn next_avatar(id: &str) -> &'static Avatar {
    let index = AVATARS
        .iter()
        .position(|avatar| avatar.id == id)
        .map(|i| (i + 1) % AVATARS.len())
        .unwrap_or(0);
    &AVATARS[index]
}

/// The scripted non-player character players can talk to.
#[derive(Debug, Clone, PartialEq)]
pub struct Npc {
    pub id: &'static str,
    pub name: &'static str,
    pub avatar_id: &'static str,
    pub position: Position,
    pub facing: Facing,
}

impl Npc {
    pub fn quest_giver() -> Self {
        Self {
            id: "npc-quest-giver",
            name: "Quest Giver",
            avatar_id: "ana",
            position: Position::new(200.0, 120.0),
            facing: Facing::Front,
        }
    }
}

/// One pushed view of the records matching a subscription.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Snapshot {
    pub token: u32,
    /// Increases by one for every snapshot pushed on this subscription.
    pub seq: u64,
    pub records: Vec<PlayerRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Hello {
        protocol_version: u32,
        player_id: String,
    },
    Write {
        player_id: String,
        patch: PlayerPatch,
        mode: WriteMode,
    },
    Subscribe {
        token: u32,
        filter: RecordFilter,
    },
    Unsubscribe {
        token: u32,
    },
    RegisterDisconnect {
        player_id: String,
        patch: PlayerPatch,
    },
    Heartbeat {
        timestamp: u64,
    },
    Disconnect,

    Welcome {
        server_time: u64,
    },
    Snapshot(Snapshot),
    Rejected {
        reason: String,
    },
    /// The sender's address is not bound to a player. `superseded` is set when the same player
    /// said hello from another address, so the old client should stop instead of re-binding.
    Unbound {
        superseded: bool,
    },
}

/// Milliseconds since the unix epoch, saturating at zero for clocks set before it.
pub fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
