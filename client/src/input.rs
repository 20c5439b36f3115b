//! Keyboard sampling with press-edge detection

use crate::movement::MoveInput;
use macroquad::prelude::*;

/// Raw key state for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySample {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub enter: bool,
    pub mic: bool,
    pub camera: bool,
    pub talk: bool,
    pub cycle_avatar: bool,
    pub quit: bool,
}

/// Reads the current keyboard state (WASD or arrows to move).
pub fn sample_keys() -> KeySample {
    KeySample {
        up: is_key_down(KeyCode::W) || is_key_down(KeyCode::Up),
        down: is_key_down(KeyCode::S) || is_key_down(KeyCode::Down),
        left: is_key_down(KeyCode::A) || is_key_down(KeyCode::Left),
        right: is_key_down(KeyCode::D) || is_key_down(KeyCode::Right),
        enter: is_key_down(KeyCode::Enter),
        mic: is_key_down(KeyCode::M),
        camera: is_key_down(KeyCode::V),
        talk: is_key_down(KeyCode::T),
        cycle_avatar: is_key_down(KeyCode::C),
        quit: is_key_down(KeyCode::Escape),
    }
}

/// One-shot actions triggered this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Controls {
    pub enter_world: bool,
    pub toggle_mic: bool,
    pub toggle_camera: bool,
    pub talk: bool,
    pub cycle_avatar: bool,
    pub quit: bool,
}

/// Turns held keys into movement and key presses into one-shot controls
#[derive(Default)]
pub struct InputManager {
    previous: KeySample,
}

impl InputManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Movement follows held keys; controls fire only on the frame a key goes down.
    pub fn update(&mut self, keys: KeySample) -> (Controls, MoveInput) {
        let pressed = |now: bool, before: bool| now && !before;
        let previous = self.previous;

        let controls = Controls {
            enter_world: pressed(keys.enter, previous.enter),
            toggle_mic: pressed(keys.mic, previous.mic),
            toggle_camera: pressed(keys.camera, previous.camera),
            talk: pressed(keys.talk, previous.talk),
            cycle_avatar: pressed(keys.cycle_avatar, previous.cycle_avatar),
            quit: pressed(keys.quit, previous.quit),
        };
        self.previous = keys;

        let movement = MoveInput::from_keys(keys.up, keys.down, keys.left, keys.right);
        (controls, movement)
    }

    /// Forgets held keys, e.g. when text entry takes over the keyboard.
    pub fn reset(&mut self) {
        self.previous = KeySample::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controls_fire_on_press_edge_only() {
        let mut input = InputManager::new();
        let held = KeySample {
            mic: true,
            ..KeySample::default()
        };

        let (first, _) = input.update(held);
        let (second, _) = input.update(held);
        input.update(KeySample::default());
        let (third, _) = input.update(held);

        assert!(first.toggle_mic);
        assert!(!second.toggle_mic);
        assert!(third.toggle_mic);
    }

    #[test]
    fn test_movement_follows_held_keys() {
        let mut input = InputManager::new();
        let keys = KeySample {
            up: true,
            right: true,
            ..KeySample::default()
        };

        let (_, first) = input.update(keys);
        let (_, second) = input.update(keys);
        assert_eq!(first, MoveInput::new(1.0, -1.0));
        assert_eq!(second, first);
    }

    #[test]
    fn test_reset_rearms_controls() {
        let mut input = InputManager::new();
        let keys = KeySample {
            talk: true,
            ..KeySample::default()
        };
        input.update(keys);
        input.reset();
        let (controls, _) = input.update(keys);
        assert!(controls.talk);
    }
}
