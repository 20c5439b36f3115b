//! # Presence Store Service
//!
//! A small UDP service holding one document per player and pushing filtered views of them to
//! subscribers. It plays the role of the hosted realtime database that sync clients write their
//! position, facing and capability flags into.
//!
//! ## Semantics
//!
//! ### Last writer wins
//! Writes are partial patches applied in arrival order; every field present in a patch overwrites
//! the stored value. The service stamps `last_active_at` on every accepted write.
//!
//! ### Single writer per record
//! A connection is bound to exactly one player id by its `Hello`. Writes and disconnect handlers
//! for any other id are rejected.
//!
//! ### Disconnect handlers
//! A client may register a patch to apply when its connection goes away. The patch fires on a
//! graceful `Disconnect` and when the timeout checker finds the connection silent. A second
//! `Hello` for the same player replaces the old connection without firing its handler.
//!
//! ### Snapshots
//! `Subscribe` answers immediately with the current filtered view, then the service pushes a new
//! view on every tick in which the record book changed. Sequence numbers increase per
//! subscription so clients can drop reordered datagrams.
//!
//! ## Module Organization
//!
//! - `client_manager`: connection binding, liveness, subscriptions and disconnect patches
//! - `network`: socket tasks, packet handling and the service loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new("127.0.0.1:8080", ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod network;
