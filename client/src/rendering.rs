use crate::scene::SceneEntities;
use crate::session::{GamePhase, LocalPlayer};
use macroquad::prelude::*;
use shared::{
    find_avatar, Facing, Npc, Position, Tile, TileMap, FOOTPRINT_HALF_HEIGHT,
    FOOTPRINT_HALF_WIDTH, NPC_CHAT_RANGE, TILE_SIZE,
};

/// Everything the overlay shows besides the world itself
#[derive(Debug, Clone)]
pub struct UiConfig {
    pub phase: GamePhase,
    pub connected: bool,
    pub offline_mode: bool,
    pub fake_ping_ms: u64,
    pub player_count: usize,
    pub near_npc: bool,
    pub near_peers: usize,
    pub chat_draft: Option<String>,
    pub dialogue: Option<String>,
    pub waiting_for_reply: bool,
}

pub struct Renderer {
    width: f32,
    height: f32,
}

impl Renderer {
    pub fn new(width: usize, height: usize) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Renderer {
            width: width as f32,
            height: height as f32,
        })
    }

    /// World-to-screen scale that fits the whole map in the window.
    fn scale(&self, map: &TileMap) -> f32 {
        let width = if screen_width() > 0.0 { screen_width() } else { self.width };
        let height = if screen_height() > 0.0 { screen_height() } else { self.height };
        (width / map.world_width()).min(height / map.world_height())
    }

    pub fn render(
        &mut self,
        map: &TileMap,
        npc: &Npc,
        scene: &SceneEntities,
        local: &LocalPlayer,
        config: &UiConfig,
    ) {
        clear_background(Color::from_rgba(26, 26, 26, 255));
        let scale = self.scale(map);

        self.draw_map(map, scale);
        self.draw_npc(npc, config.near_npc, scale);

        for entity in scene.iter() {
            let color = tint(&entity.sheet.tint);
            self.draw_avatar(entity.state.position, entity.state.facing, color, false, scale);
            self.draw_name(&entity.state.display_name, entity.state.position, scale);
            self.draw_capabilities(
                entity.state.position,
                entity.state.capabilities.mic_on,
                entity.state.capabilities.camera_on,
                scale,
            );
        }

        if config.phase == GamePhase::Playing {
            let color = find_avatar(&local.avatar_id)
                .map(|avatar| tint(&avatar.tint))
                .unwrap_or(GREEN);
            self.draw_avatar(local.position, local.facing, color, true, scale);
            self.draw_name(&local.display_name, local.position, scale);
        }

        self.draw_dialogue(config);
        self.draw_ui(local, config);

        if config.phase == GamePhase::Lobby {
            self.draw_lobby(local);
        }
    }

    fn draw_map(&mut self, map: &TileMap, scale: f32) {
        let size = TILE_SIZE * scale;
        for row in 0..map.height() {
            for col in 0..map.width() {
                let color = match map.tile(col, row) {
                    Some(Tile::Grass) => Color::from_rgba(70, 120, 60, 255),
                    Some(Tile::Floor) => Color::from_rgba(150, 130, 100, 255),
                    Some(Tile::Wall) => Color::from_rgba(68, 68, 68, 255),
                    Some(Tile::Desk) => Color::from_rgba(110, 70, 40, 255),
                    None => continue,
                };
                draw_rectangle(col as f32 * size, row as f32 * size, size, size, color);
            }
        }

        for zone in map.zones() {
            let x = zone.min_col as f32 * size;
            let y = zone.min_row as f32 * size;
            let w = (zone.max_col + 1 - zone.min_col) as f32 * size;
            let h = (zone.max_row + 1 - zone.min_row) as f32 * size;
            draw_rectangle_lines(x, y, w, h, 1.0, Color::from_rgba(255, 255, 255, 60));
            draw_text(&zone.id, x + 3.0, y + 12.0, 14.0, Color::from_rgba(255, 255, 255, 120));
        }
    }

    fn draw_npc(&mut self, npc: &Npc, near: bool, scale: f32) {
        let color = find_avatar(npc.avatar_id)
            .map(|avatar| tint(&avatar.tint))
            .unwrap_or(MAGENTA);
        self.draw_avatar(npc.position, npc.facing, color, false, scale);
        self.draw_name(npc.name, npc.position, scale);

        let range_color = if near { YELLOW } else { Color::from_rgba(255, 255, 255, 40) };
        draw_circle_lines(
            npc.position.x * scale,
            npc.position.y * scale,
            NPC_CHAT_RANGE * scale,
            1.0,
            range_color,
        );
    }

    fn draw_avatar(
        &mut self,
        at: Position,
        facing: Facing,
        color: Color,
        is_local: bool,
        scale: f32,
    ) {
        let w = FOOTPRINT_HALF_WIDTH * 2.0 * scale;
        let h = FOOTPRINT_HALF_HEIGHT * 2.0 * scale;
        let x = (at.x - FOOTPRINT_HALF_WIDTH) * scale;
        let y = (at.y - FOOTPRINT_HALF_HEIGHT) * scale;

        draw_rectangle(x, y, w, h, color);
        let outline = if is_local { WHITE } else { Color::from_rgba(0, 0, 0, 160) };
        draw_rectangle_lines(x, y, w, h, 2.0, outline);

        self.draw_facing(at, facing, scale);
    }

    fn draw_facing(&mut self, at: Position, facing: Facing, scale: f32) {
        let (dx, dy) = match facing {
            Facing::Front => (0.0, 1.0),
            Facing::Back => (0.0, -1.0),
            Facing::Left => (-1.0, 0.0),
            Facing::Right => (1.0, 0.0),
        };
        let center_x = at.x * scale;
        let center_y = at.y * scale;
        let reach = (FOOTPRINT_HALF_WIDTH + 4.0) * scale;
        let end_x = center_x + dx * reach;
        let end_y = center_y + dy * reach;

        draw_line(center_x, center_y, end_x, end_y, 2.0, YELLOW);
        self.draw_arrow_head(center_x, center_y, end_x, end_y);
    }

    fn draw_arrow_head(&mut self, x0: f32, y0: f32, x1: f32, y1: f32) {
        let dx = x1 - x0;
        let dy = y1 - y0;
        let length = (dx * dx + dy * dy).sqrt();

        if length < 5.0 {
            return;
        }

        let arrow_size = 5.0;
        let nx = dx / length;
        let ny = dy / length;

        let base_x = x1 - nx * arrow_size;
        let base_y = y1 - ny * arrow_size;
        let half = arrow_size / 2.0;

        draw_line(x1, y1, base_x - ny * half, base_y + nx * half, 1.0, YELLOW);
        draw_line(x1, y1, base_x + ny * half, base_y - nx * half, 1.0, YELLOW);
    }

    fn draw_name(&mut self, name: &str, at: Position, scale: f32) {
        let font_size = 14.0;
        let dims = measure_text(name, None, font_size as u16, 1.0);
        let x = at.x * scale - dims.width / 2.0;
        let y = (at.y - FOOTPRINT_HALF_HEIGHT) * scale - 6.0;
        draw_text(name, x, y, font_size, WHITE);
    }

    fn draw_capabilities(&mut self, at: Position, mic_on: bool, camera_on: bool, scale: f32) {
        let x = (at.x + FOOTPRINT_HALF_WIDTH) * scale + 2.0;
        let y = (at.y - FOOTPRINT_HALF_HEIGHT) * scale;
        if mic_on {
            draw_circle(x + 3.0, y + 3.0, 3.0, GREEN);
        }
        if camera_on {
            draw_rectangle(x, y + 8.0, 6.0, 5.0, Color::from_rgba(0, 170, 255, 255));
        }
    }

    fn draw_dialogue(&mut self, config: &UiConfig) {
        let text = if let Some(draft) = &config.chat_draft {
            format!("You: {}_", draft)
        } else if config.waiting_for_reply {
            "...".to_string()
        } else if let Some(line) = &config.dialogue {
            line.clone()
        } else if config.near_npc && config.phase == GamePhase::Playing {
            "Press T to talk".to_string()
        } else {
            return;
        };

        let box_height = 48.0;
        let y = screen_height() - box_height - 10.0;
        let width = screen_width() - 20.0;
        draw_rectangle(10.0, y, width, box_height, Color::from_rgba(0, 0, 0, 200));
        draw_rectangle_lines(10.0, y, width, box_height, 1.0, WHITE);
        draw_text(&text, 20.0, y + 28.0, 18.0, WHITE);
    }

    fn draw_ui(&mut self, local: &LocalPlayer, config: &UiConfig) {
        let y_start = 10.0;
        let indicator_size = 12.0;
        let spacing = 35.0;

        let features = [
            ("MIC", local.capabilities.mic_on),
            ("CAM", local.capabilities.camera_on),
            ("NPC", config.near_npc),
        ];

        for (i, (label, enabled)) in features.iter().enumerate() {
            let x = 10.0 + (i as f32) * spacing;
            let color = if *enabled { GREEN } else { RED };

            draw_rectangle(x, y_start, indicator_size, indicator_size, color);
            draw_rectangle_lines(x, y_start, indicator_size, indicator_size, 1.0, WHITE);

            draw_text(label, x, y_start + indicator_size + 12.0, 12.0, WHITE);
        }

        let connection_color = if config.connected { GREEN } else { RED };
        draw_rectangle(10.0, y_start + 35.0, 8.0, 8.0, connection_color);
        let connection_label = if config.offline_mode { "OFFLINE" } else { "CON" };
        draw_text(connection_label, 20.0, y_start + 35.0 + 8.0, 12.0, WHITE);

        let ping_y = y_start + 50.0;
        let ping_bars = ((config.fake_ping_ms / 20).min(10)) as i32;

        for i in 0..10i32 {
            let bar_color = if i < ping_bars {
                if config.fake_ping_ms < 50 {
                    GREEN
                } else if config.fake_ping_ms < 100 {
                    YELLOW
                } else {
                    RED
                }
            } else {
                Color::from_rgba(51, 51, 51, 255)
            };

            draw_rectangle(10.0 + (i as f32) * 3.0, ping_y, 2.0, 8.0, bar_color);
        }

        let ping_text = format!("+{}ms", config.fake_ping_ms);
        draw_text(&ping_text, 45.0, ping_y + 8.0, 12.0, WHITE);

        let player_y = ping_y + 15.0;
        for i in 0..(config.player_count.min(8)) {
            draw_rectangle(
                10.0 + (i as f32) * 4.0,
                player_y,
                3.0,
                3.0,
                Color::from_rgba(0, 170, 255, 255),
            );
        }
        let player_text = format!(
            "{} players, {} nearby",
            config.player_count, config.near_peers
        );
        draw_text(&player_text, 45.0, player_y + 3.0, 12.0, WHITE);
    }

    fn draw_lobby(&mut self, local: &LocalPlayer) {
        let width = screen_width();
        let height = screen_height();
        draw_rectangle(0.0, 0.0, width, height, Color::from_rgba(0, 0, 0, 150));

        let name = find_avatar(&local.avatar_id).map_or("?", |avatar| avatar.name);
        let lines = [
            format!("Welcome, {}", local.display_name),
            format!("Character: {} (C to change)", name),
            "Press Enter to join the office".to_string(),
        ];
        for (i, line) in lines.iter().enumerate() {
            let dims = measure_text(line, None, 24, 1.0);
            draw_text(
                line,
                (width - dims.width) / 2.0,
                height / 2.0 - 30.0 + i as f32 * 30.0,
                24.0,
                WHITE,
            );
        }
    }
}

fn tint(rgb: &[u8; 3]) -> Color {
    Color::from_rgba(rgb[0], rgb[1], rgb[2], 255)
}
