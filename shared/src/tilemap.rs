//! Static tile grid of the office: walkability for collision and named zones for proximity.

use crate::{Position, FOOTPRINT_HALF_HEIGHT, FOOTPRINT_HALF_WIDTH, TILE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tile {
    Grass,
    Wall,
    Floor,
    Desk,
}

impl Tile {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '.' => Some(Tile::Grass),
            '#' => Some(Tile::Wall),
            '_' => Some(Tile::Floor),
            'D' => Some(Tile::Desk),
            _ => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Tile::Wall | Tile::Desk)
    }
}

/// Named rectangle of tiles, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: String,
    pub min_col: usize,
    pub min_row: usize,
    pub max_col: usize,
    pub max_row: usize,
}

impl Zone {
    pub fn new(id: impl Into<String>, min: (usize, usize), max: (usize, usize)) -> Self {
        Self {
            id: id.into(),
            min_col: min.0,
            min_row: min.1,
            max_col: max.0,
            max_row: max.1,
        }
    }

    pub fn contains_tile(&self, col: usize, row: usize) -> bool {
        (self.min_col..=self.max_col).contains(&col) && (self.min_row..=self.max_row).contains(&row)
    }
}

/// Collision box of a moving entity, centred on its position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Footprint {
    pub half_width: f32,
    pub half_height: f32,
}

impl Default for Footprint {
    fn default() -> Self {
        Self {
            half_width: FOOTPRINT_HALF_WIDTH,
            half_height: FOOTPRINT_HALF_HEIGHT,
        }
    }
}

impl Footprint {
    pub fn corners(&self, at: Position) -> [Position; 4] {
        let left = at.x - self.half_width;
        let right = at.x + self.half_width;
        let top = at.y - self.half_height;
        let bottom = at.y + self.half_height;
        [
            Position::new(left, top),
            Position::new(right, top),
            Position::new(left, bottom),
            Position::new(right, bottom),
        ]
    }
}

const OFFICE_LAYOUT: [&str; 30] = [
    "########################################",
    "#......................................#",
    "#....##############################....#",
    "#....#____________________________#....#",
    "#....#____________________________#....#",
    "#....#_####_###__#_#####_#####____#....#",
    "#....#_#DD#_#DD__#_#DD_#_#___#____#....#",
    "#....#______#____#_#_____#___#____#....#",
    "#....#_#__#_######_#___#_____#____#....#",
    "#....#_____________###########____#....#",
    "#....#____________________________#....#",
    "#....#__###########################....#",
    "#.....__...............................#",
    "#.....__...............................#",
    "######__################################",
    "#______________________________________#",
    "#______________________________________#",
    "######__################################",
    "#......................................#",
    "#......................................#",
    "#....#############__###############....#",
    "#....#____________________________#....#",
    "#....#____________________________#....#",
    "#....#____________________________#....#",
    "#....##############################....#",
    "#......................................#",
    "#......................................#",
    "#......................................#",
    "#......................................#",
    "########################################",
];

#[derive(Debug, Clone, PartialEq)]
pub struct TileMap {
    width: usize,
    height: usize,
    tiles: Vec<Tile>,
    zones: Vec<Zone>,
}

impl TileMap {
    /// Parses rows of `.` grass, `#` wall, `_` floor and `D` desk. Rows must share one width.
    pub fn parse(rows: &[&str]) -> Option<Self> {
        let height = rows.len();
        let width = rows.first()?.chars().count();
        let mut tiles = Vec::with_capacity(width * height);
        for row in rows {
            if row.chars().count() != width {
                return None;
            }
            for c in row.chars() {
                tiles.push(Tile::from_char(c)?);
            }
        }
        Some(Self {
            width,
            height,
            tiles,
            zones: Vec::new(),
        })
    }

    /// A walkable map with no obstructions besides its bounds.
    pub fn open(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            tiles: vec![Tile::Floor; width * height],
            zones: Vec::new(),
        }
    }

    /// The bundled office map with its two meeting rooms as zones.
    pub fn office() -> Self {
        let mut map = Self::parse(&OFFICE_LAYOUT).unwrap_or_else(|| {
            Self::open(crate::MAP_WIDTH_TILES, crate::MAP_HEIGHT_TILES)
        });
        map.zones.push(Zone::new("north-office", (6, 3), (33, 10)));
        map.zones.push(Zone::new("south-office", (6, 21), (33, 23)));
        map
    }

    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zones.push(zone);
        self
    }

    pub fn set_tile(&mut self, col: usize, row: usize, tile: Tile) {
        if col < self.width && row < self.height {
            self.tiles[row * self.width + col] = tile;
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn world_width(&self) -> f32 {
        self.width as f32 * TILE_SIZE
    }

    pub fn world_height(&self) -> f32 {
        self.height as f32 * TILE_SIZE
    }

    pub fn tile(&self, col: usize, row: usize) -> Option<Tile> {
        if col < self.width && row < self.height {
            Some(self.tiles[row * self.width + col])
        } else {
            None
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Tile coordinates containing a world point, or `None` outside the map.
    pub fn tile_at(&self, point: Position) -> Option<(usize, usize)> {
        if !point.is_finite() {
            return None;
        }
        let col = (point.x / TILE_SIZE).floor();
        let row = (point.y / TILE_SIZE).floor();
        if col < 0.0 || row < 0.0 || col >= self.width as f32 || row >= self.height as f32 {
            return None;
        }
        Some((col as usize, row as usize))
    }

    /// Out-of-bounds points count as blocked.
    pub fn is_point_blocked(&self, point: Position) -> bool {
        match self.tile_at(point) {
            Some((col, row)) => self.tile(col, row).map_or(true, |tile| tile.is_blocked()),
            None => true,
        }
    }

    /// True if any corner of `footprint` placed at `at` lands on a blocked tile.
    pub fn is_blocked(&self, at: Position, footprint: &Footprint) -> bool {
        footprint
            .corners(at)
            .iter()
            .any(|corner| self.is_point_blocked(*corner))
    }

    pub fn zone_at(&self, point: Position) -> Option<&str> {
        let (col, row) = self.tile_at(point)?;
        self.zones
            .iter()
            .find(|zone| zone.contains_tile(col, row))
            .map(|zone| zone.id.as_str())
    }
}
