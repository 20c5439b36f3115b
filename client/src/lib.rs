//! # Presence Sync Client
//!
//! Client side of the virtual office: the local player is simulated here, its state is pushed
//! to a presence store, and every other online player is mirrored into the local scene from the
//! store's snapshots.
//!
//! ## Architecture Overview
//!
//! ### Local authority, remote snapshots
//! Only the movement simulator moves the local player. Remote players are never predicted or
//! interpolated; each snapshot is applied as the authoritative set of positions. The store echoes
//! the local record back, but the reconciler never applies it to the local player.
//!
//! ### Single writer per record
//! A client only ever writes its own record. That keeps the store free of locking and reduces
//! consistency to "everyone eventually sees my latest write".
//!
//! ### Frame-driven, never blocking
//! `Session::tick` runs once per frame and never waits on I/O. Writes are fire-and-forget,
//! snapshots are drained from a channel, dialogue replies are polled and sprite sheets that are
//! still loading defer their entity to a later tick.
//!
//! ## Module Organization
//!
//! - `store`: the `PresenceStore` trait and the in-process `MemoryStore`
//! - `network`: `RemoteStore`, the UDP implementation talking to the presence service
//! - `identity`: identity sources and avatar choice
//! - `movement`: input normalization, speed scaling and tile collision
//! - `publisher`: trailing-edge throttled writes of local state
//! - `reconciler`: snapshot diffing, the sprite sheet cache and scene operations
//! - `proximity`: edge-triggered NPC and peer eligibility
//! - `dialogue`: the bridge to the NPC's conversational backend
//! - `session`: the driver owning everything above, with `start`, `tick` and `stop`
//! - `scene`, `input`, `rendering`: the macroquad-facing edges
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::dialogue::ScriptedBackend;
//! use client::identity::{IdentitySource, StaticIdentity};
//! use client::movement::MoveInput;
//! use client::scene::{PaletteLoader, SceneEntities};
//! use client::session::{FrameInput, Session, SessionConfig};
//! use client::store::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::new();
//!     let identity = StaticIdentity::new("user-1", "Ada").authenticate()?;
//!     let mut session = Session::new(
//!         identity,
//!         "alex",
//!         store.connection(),
//!         SceneEntities::new(),
//!         PaletteLoader::new(),
//!         Arc::new(ScriptedBackend::new()),
//!         SessionConfig::default(),
//!     )?;
//!
//!     session.start()?;
//!     session.enter_world()?;
//!     session.tick(FrameInput {
//!         now: Instant::now(),
//!         frame_scale: 1.0,
//!         movement: MoveInput::new(1.0, 0.0),
//!     });
//!     session.stop();
//!     Ok(())
//! }
//! ```

pub mod dialogue;
pub mod identity;
pub mod input;
pub mod movement;
pub mod network;
pub mod proximity;
pub mod publisher;
pub mod reconciler;
pub mod rendering;
pub mod scene;
pub mod session;
pub mod store;
