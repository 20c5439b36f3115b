//! Local movement simulation: input direction, speed scaling and tile collision

use log::warn;
use shared::{
    Facing, Footprint, Position, TileMap, MAX_FRAME_SCALE, PLAYER_SPEED, REFERENCE_FRAME_RATE,
};

/// Held-down direction for one frame. Components are usually -1, 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoveInput {
    pub x: f32,
    pub y: f32,
}

impl MoveInput {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn from_keys(up: bool, down: bool, left: bool, right: bool) -> Self {
        let axis = |negative: bool, positive: bool| match (negative, positive) {
            (true, false) => -1.0,
            (false, true) => 1.0,
            _ => 0.0,
        };
        Self::new(axis(left, right), axis(up, down))
    }

    pub fn is_idle(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }

    /// Unit-length direction, or zero for idle or garbage input.
    pub fn normalized(&self) -> (f32, f32) {
        if !self.x.is_finite() || !self.y.is_finite() {
            return (0.0, 0.0);
        }
        let length = (self.x * self.x + self.y * self.y).sqrt();
        if length == 0.0 {
            (0.0, 0.0)
        } else {
            (self.x / length, self.y / length)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementConfig {
    /// World units per reference frame
    pub speed: f32,
    pub footprint: Footprint,
    pub max_frame_scale: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            speed: PLAYER_SPEED,
            footprint: Footprint::default(),
            max_frame_scale: MAX_FRAME_SCALE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveOutcome {
    pub position: Position,
    pub facing: Facing,
    pub moved: bool,
    /// The previous position was non-finite and got replaced before stepping
    pub healed: bool,
}

pub struct MovementSimulator {
    map: TileMap,
    config: MovementConfig,
    fallback: Position,
    last_good: Option<Position>,
}

impl MovementSimulator {
    pub fn new(map: TileMap, config: MovementConfig, fallback: Position) -> Self {
        Self {
            map,
            config,
            fallback,
            last_good: None,
        }
    }

    /// Converts a frame duration in seconds into a multiple of the reference frame.
    pub fn frame_scale(dt_secs: f32) -> f32 {
        dt_secs * REFERENCE_FRAME_RATE
    }

    pub fn map(&self) -> &TileMap {
        &self.map
    }

    pub fn config(&self) -> &MovementConfig {
        &self.config
    }

    /// Records a validated position to heal back to. Non-finite values are ignored.
    pub fn set_last_good(&mut self, position: Position) {
        if position.is_finite() {
            self.last_good = Some(position);
        }
    }

    pub fn last_good(&self) -> Option<Position> {
        self.last_good
    }

    fn heal(&self) -> Position {
        match self.last_good {
            Some(position) if position.is_finite() => position,
            _ => self.fallback,
        }
    }

    fn sanitize_scale(&self, frame_scale: f32) -> f32 {
        if frame_scale.is_finite() {
            frame_scale.clamp(0.0, self.config.max_frame_scale)
        } else {
            1.0
        }
    }

    /// Advances one frame.
    ///
    /// Each axis is tried on its own against the footprint at the candidate position, x first,
    /// so pushing diagonally into a wall slides along it. Facing follows the input even when
    /// both axes are blocked.
    pub fn step(
        &mut self,
        previous: Position,
        facing: Facing,
        input: MoveInput,
        frame_scale: f32,
    ) -> MoveOutcome {
        let mut healed = false;
        let mut position = previous;
        if !position.is_finite() {
            position = self.heal();
            healed = true;
            warn!(
                "Non-finite local position ({}, {}), reset to ({}, {})",
                previous.x, previous.y, position.x, position.y
            );
        }

        let (nx, ny) = input.normalized();
        let facing = Facing::from_vector(nx, ny).unwrap_or(facing);
        let distance = self.config.speed * self.sanitize_scale(frame_scale);
        let start = position;

        let dx = nx * distance;
        if dx != 0.0 {
            let candidate = Position::new(position.x + dx, position.y);
            if candidate.is_finite() && !self.map.is_blocked(candidate, &self.config.footprint) {
                position = candidate;
            }
        }

        let dy = ny * distance;
        if dy != 0.0 {
            let candidate = Position::new(position.x, position.y + dy);
            if candidate.is_finite() && !self.map.is_blocked(candidate, &self.config.footprint) {
                position = candidate;
            }
        }

        self.last_good = Some(position);

        MoveOutcome {
            position,
            facing,
            moved: position != start,
            healed,
        }
    }
}
