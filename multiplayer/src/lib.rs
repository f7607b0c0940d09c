//! # Scene-tree RPC multiplayer
//!
//! Peers call named procedures on each other's node trees. A call names its
//! target node by path; once the receiving peer has acknowledged a path, the
//! sender replaces it with a small cache id.
//!
//! ## Architecture
//!
//! ### Single coordinator
//! One task ([`network::MultiplayerApi::run`]) owns the connected-peer set and
//! both sides of the path cache. Transport tasks hand it events through a
//! bounded queue; procedure bodies and application code talk to it through a
//! [`network::MultiplayerHandle`]. Nothing else touches protocol state, so
//! none of it is locked.
//!
//! ### Star topology
//! Clients only talk to the server (peer 1). Every application packet carries
//! its original source and a signed routing target, and the server relays it
//! to the selected clients (see [`relay`]). Join/leave gossip and path cache
//! handshakes travel on the reserved config channel.
//!
//! ### Detached handlers
//! Each incoming call runs on its own blocking task behind a supervisor that
//! logs errors and panics, so one bad handler cannot stall the coordinator.
//!
//! ## Module Organization
//!
//! - [`tree`]: the node directory calls are addressed to
//! - [`path_cache`]: path ↔ cache id bookkeeping for both directions
//! - [`rpc`]: command dispatch and procedure registration
//! - [`relay`]: server-side routing decisions
//! - [`network`]: the coordinator
//! - [`transport`]: the event/request boundary and the bundled UDP host
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use multiplayer::config::MultiplayerConfig;
//! use multiplayer::network::MultiplayerApi;
//! use multiplayer::rpc::dynamic_method;
//! use multiplayer::tree::SceneTree;
//! use log::info;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api = MultiplayerApi::listen("127.0.0.1:8080", SceneTree::new(), MultiplayerConfig::default()).await?;
//!
//!     api.register_method(
//!         "/root/Chat",
//!         "say",
//!         dynamic_method(|ctx, args| {
//!             info!("peer {} says {:?}", ctx.source, args);
//!             Ok(())
//!         }),
//!     )?;
//!
//!     api.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod network;
pub mod path_cache;
pub mod relay;
pub mod rpc;
pub mod transport;
pub mod tree;

pub use config::MultiplayerConfig;
pub use error::RpcError;
pub use network::{MultiplayerApi, MultiplayerEvent, MultiplayerHandle};
pub use tree::SceneTree;
