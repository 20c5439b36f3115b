//! The owning driver: wires identity, store, simulator, publisher, reconciler, proximity and
//! dialogue together behind `start()`, `tick()` and `stop()`.

use crate::dialogue::{
    ConverseInput, DialogueBackend, DialogueBridge, DialogueError, DialogueLine,
};
use crate::identity::{Identity, IdentityError};
use crate::movement::{MoveInput, MovementConfig, MovementSimulator};
use crate::proximity::{ProximityConfig, ProximityEvaluator, ProximityEvent};
use crate::publisher::{PublisherStats, StatePublisher};
use crate::reconciler::{AssetLoader, RemoteReconciler, SceneSink};
use crate::store::{PresenceStore, StoreError, Subscription};
use log::{debug, info, warn};
use shared::{
    find_avatar, CapabilityFlags, Facing, Npc, PlayerPatch, PlayerRecord, Position, RecordFilter,
    Snapshot, TileMap, WriteMode, PUBLISH_INTERVAL,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    /// Connected and visible, picking a character
    Lobby,
    Playing,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub map: TileMap,
    pub spawn: Position,
    pub npc: Npc,
    pub publish_interval: Duration,
    pub movement: MovementConfig,
    pub proximity: ProximityConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            map: TileMap::office(),
            spawn: Position::spawn(),
            npc: Npc::quest_giver(),
            publish_interval: PUBLISH_INTERVAL,
            movement: MovementConfig::default(),
            proximity: ProximityConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyStarted,
    #[error("session is not running")]
    NotStarted,
    #[error("unknown avatar {0}")]
    UnknownAvatar(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Dialogue(#[from] DialogueError),
}

/// The local player's own view of itself. Only the simulator moves it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPlayer {
    pub id: String,
    pub display_name: String,
    pub avatar_id: String,
    pub photo_url: Option<String>,
    pub position: Position,
    pub facing: Facing,
    pub capabilities: CapabilityFlags,
}

/// Everything a tick needs from the outside world.
#[derive(Debug, Clone, Copy)]
pub struct FrameInput {
    pub now: Instant,
    /// Elapsed time as a multiple of the reference frame
    pub frame_scale: f32,
    pub movement: MoveInput,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub snapshots: usize,
    pub spawned: Vec<String>,
    pub despawned: Vec<String>,
    pub skipped: usize,
    pub moved: bool,
    pub healed: bool,
    pub published: bool,
    /// The store lost and restored the binding, and the full local state was written again
    pub reannounced: bool,
    pub proximity: Vec<ProximityEvent>,
    pub dialogue: Option<DialogueLine>,
}

pub struct Session<S: PresenceStore, K: SceneSink, L: AssetLoader> {
    store: S,
    scene: K,
    loader: L,
    local: LocalPlayer,
    spawn: Position,
    npc: Npc,
    phase: GamePhase,
    simulator: MovementSimulator,
    publisher: StatePublisher,
    reconciler: RemoteReconciler,
    proximity: ProximityEvaluator,
    dialogue: DialogueBridge,
    subscription: Option<Subscription>,
    profile_adopted: bool,
    running: bool,
}

impl<S: PresenceStore, K: SceneSink, L: AssetLoader> Session<S, K, L> {
    pub fn new(
        identity: Identity,
        avatar_id: &str,
        store: S,
        scene: K,
        loader: L,
        backend: Arc<dyn DialogueBackend>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        if identity.id.is_empty() {
            return Err(IdentityError::EmptyId.into());
        }
        let avatar = find_avatar(avatar_id)
            .ok_or_else(|| SessionError::UnknownAvatar(avatar_id.to_string()))?;

        let SessionConfig {
            map,
            spawn,
            npc,
            publish_interval,
            movement,
            proximity,
        } = config;

        Ok(Self {
            store,
            scene,
            loader,
            local: LocalPlayer {
                id: identity.id.clone(),
                display_name: identity.display_name,
                avatar_id: avatar.id.to_string(),
                photo_url: identity.photo_url,
                position: spawn,
                facing: Facing::Front,
                capabilities: CapabilityFlags::default(),
            },
            spawn,
            npc,
            phase: GamePhase::Lobby,
            simulator: MovementSimulator::new(map, movement, spawn),
            publisher: StatePublisher::new(identity.id.clone(), publish_interval),
            reconciler: RemoteReconciler::new(identity.id),
            proximity: ProximityEvaluator::new(proximity),
            dialogue: DialogueBridge::new(backend),
            subscription: None,
            profile_adopted: false,
            running: false,
        })
    }

    pub fn local(&self) -> &LocalPlayer {
        &self.local
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn scene(&self) -> &K {
        &self.scene
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn map(&self) -> &TileMap {
        self.simulator.map()
    }

    pub fn npc(&self) -> &Npc {
        &self.npc
    }

    pub fn reconciler(&self) -> &RemoteReconciler {
        &self.reconciler
    }

    pub fn proximity(&self) -> &ProximityEvaluator {
        &self.proximity
    }

    pub fn publisher_stats(&self) -> PublisherStats {
        self.publisher.stats()
    }

    pub fn is_talking(&self) -> bool {
        self.dialogue.is_busy()
    }

    /// Connects and makes the player visible: disconnect handler first, then the profile seed,
    /// then the revive at spawn, then the subscription.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.running {
            return Err(SessionError::AlreadyStarted);
        }

        if let Err(e) = self.open() {
            warn!("Session start for {} failed: {}", self.local.id, e);
            self.subscription = None;
            self.store.close();
            return Err(e);
        }

        self.running = true;
        info!(
            "Session started for {} ({}) as {}",
            self.local.id, self.local.display_name, self.local.avatar_id
        );
        Ok(())
    }

    fn open(&mut self) -> Result<(), SessionError> {
        let id = self.local.id.clone();
        self.store.connect(&id)?;
        self.store
            .register_disconnect_handler(&id, PlayerPatch::offline())?;

        self.local.position = self.spawn;
        self.local.facing = Facing::Front;
        self.simulator.set_last_good(self.spawn);

        self.publisher.reset();
        self.announce()?;

        self.reconciler.reset_sequence();
        self.subscription = Some(self.store.subscribe(RecordFilter::online())?);
        self.profile_adopted = false;
        Ok(())
    }

    /// Seeds the profile without overwriting a stored one, then marks the player online at its
    /// current position with its current capabilities.
    fn announce(&mut self) -> Result<(), StoreError> {
        let id = self.local.id.clone();
        let profile = PlayerPatch::default()
            .with_display_name(self.local.display_name.clone())
            .with_avatar(self.local.avatar_id.clone())
            .with_photo_url(self.local.photo_url.clone());
        self.store.write(&id, profile, WriteMode::FillMissing)?;

        let (position, facing) = (self.local.position, self.local.facing);
        let mut revive = PlayerPatch::motion(position, facing).with_online(true);
        revive.merge(PlayerPatch::capabilities(self.local.capabilities));
        self.store.write(&id, revive, WriteMode::Merge)?;

        self.publisher.mark_published(position, facing);
        Ok(())
    }

    pub fn enter_world(&mut self) -> Result<(), SessionError> {
        if !self.running {
            return Err(SessionError::NotStarted);
        }
        if self.phase != GamePhase::Playing {
            info!("{} entered the world", self.local.id);
            self.phase = GamePhase::Playing;
        }
        Ok(())
    }

    /// Switches character; while running the change is published like any other update.
    pub fn select_avatar(&mut self, avatar_id: &str, now: Instant) -> Result<(), SessionError> {
        let avatar = find_avatar(avatar_id)
            .ok_or_else(|| SessionError::UnknownAvatar(avatar_id.to_string()))?;
        self.local.avatar_id = avatar.id.to_string();
        // An explicit choice beats whatever the store remembered.
        self.profile_adopted = true;
        if self.running {
            self.publisher
                .submit(PlayerPatch::default().with_avatar(avatar.id), now);
        }
        Ok(())
    }

    pub fn set_mic(&mut self, on: bool, now: Instant) {
        self.local.capabilities.mic_on = on;
        if self.running {
            self.publisher.set_capabilities(self.local.capabilities, now);
        }
    }

    pub fn set_camera(&mut self, on: bool, now: Instant) {
        self.local.capabilities.camera_on = on;
        if self.running {
            self.publisher.set_capabilities(self.local.capabilities, now);
        }
    }

    /// Sends one line to the NPC. The reply shows up in a later [`TickReport`].
    pub fn talk(&mut self, input: ConverseInput) -> Result<(), SessionError> {
        if !self.running {
            return Err(SessionError::NotStarted);
        }
        self.dialogue.request(input, self.proximity.is_near_npc())?;
        Ok(())
    }

    fn drain_snapshots(&mut self) -> Vec<Snapshot> {
        let mut snapshots = Vec::new();
        let mut closed = false;
        if let Some(subscription) = self.subscription.as_mut() {
            loop {
                match subscription.snapshots.try_recv() {
                    Ok(snapshot) => snapshots.push(snapshot),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            warn!("Presence subscription for {} closed", self.local.id);
            self.subscription = None;
        }
        snapshots
    }

    /// Takes the stored profile once, so a returning player keeps their character.
    fn adopt_profile(&mut self, own: &PlayerRecord) {
        if self.profile_adopted {
            return;
        }
        if let Some(avatar) = own.avatar_id.as_deref().and_then(find_avatar) {
            if avatar.id != self.local.avatar_id {
                debug!("Adopting stored avatar {} for {}", avatar.id, self.local.id);
                self.local.avatar_id = avatar.id.to_string();
            }
        }
        if let Some(name) = own.display_name.as_ref().filter(|n| !n.is_empty()) {
            self.local.display_name = name.clone();
        }
        self.profile_adopted = true;
    }

    /// One frame. Never fails; problems are logged and show up as missing or stale entities.
    pub fn tick(&mut self, input: FrameInput) -> TickReport {
        let mut report = TickReport::default();
        if !self.running {
            return report;
        }

        if self.store.take_rebound() {
            info!("Store binding for {} restored, announcing again", self.local.id);
            match self.announce() {
                Ok(()) => report.reannounced = true,
                Err(e) => warn!("Could not announce {} again: {}", self.local.id, e),
            }
        }

        for snapshot in self.drain_snapshots() {
            report.snapshots += 1;
            let result = self
                .reconciler
                .apply(&snapshot, &mut self.scene, &mut self.loader);
            report.spawned.extend(result.spawned);
            report.despawned.extend(result.despawned);
            report.skipped += result.skipped.len();
            if let Some(own) = result.own {
                self.adopt_profile(&own);
            }
        }
        report
            .spawned
            .extend(self.reconciler.retry_pending(&mut self.scene, &mut self.loader));

        if self.phase == GamePhase::Playing {
            let outcome = self.simulator.step(
                self.local.position,
                self.local.facing,
                input.movement,
                input.frame_scale,
            );
            self.local.position = outcome.position;
            self.local.facing = outcome.facing;
            report.moved = outcome.moved;
            report.healed = outcome.healed;

            self.publisher
                .publish_motion(outcome.position, outcome.facing, input.now);

            report.proximity = self.proximity.evaluate(
                self.simulator.map(),
                self.local.position,
                self.npc.position,
                self.reconciler.positions(),
            );
        }

        report.published = self.publisher.poll(&mut self.store, input.now);
        report.dialogue = self.dialogue.poll();
        report
    }

    /// Tears down in reverse start order. Safe to call more than once.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        if let Some(subscription) = self.subscription.take() {
            self.store.unsubscribe(subscription.token);
        }
        let removed = self.reconciler.clear(&mut self.scene);
        self.proximity.reset();
        self.dialogue.cancel();

        self.publisher.flush(&mut self.store);
        if let Err(e) = self
            .store
            .write(&self.local.id, PlayerPatch::offline(), WriteMode::Merge)
        {
            warn!(
                "Final offline write for {} failed, leaving it to the disconnect handler: {}",
                self.local.id, e
            );
        }
        self.store.close();
        self.publisher.reset();
        self.phase = GamePhase::Lobby;

        info!(
            "Session for {} stopped, {} remote entities released",
            self.local.id, removed
        );
    }
}

impl<S: PresenceStore, K: SceneSink, L: AssetLoader> Drop for Session<S, K, L> {
    fn drop(&mut self) {
        self.stop();
    }
}
