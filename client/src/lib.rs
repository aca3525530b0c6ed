//! # Peer Mesh Client Library
//!
//! This library lets every player in a room hold a direct data channel to
//! every other player. The signaling server only introduces peers to each
//! other; once a link is negotiated, game state flows peer to peer.
//!
//! ## Architecture Overview
//!
//! ### Mesh Manager
//! [`mesh::PeerMesh`] owns one link per remote room member. It follows the
//! room snapshots the server pushes: entering a room starts the mesh, leaving
//! it (or the game ending) tears everything down before the call returns.
//!
//! ### One-Sided Initiation
//! A member already in the room offers to each newcomer; the newcomer only
//! answers. Two peers therefore never offer to each other at the same time
//! and no tie-breaking is needed.
//!
//! ### Ordered Negotiation
//! Each link generation runs its own negotiation task that executes the
//! mesh's commands in arrival order. Network candidates that arrive before
//! the remote description is applied wait in a per-peer buffer and are
//! applied in order right after it.
//!
//! ## Module Organization
//!
//! ### Signaling (`signaling`)
//! The [`signaling::SignalingChannel`] seam plus two implementations: the TCP
//! client of the signaling server and an in-process hub.
//!
//! ### Transport (`transport`)
//! The [`transport::Transport`] / [`transport::PeerLink`] /
//! [`transport::DataChannel`] seam plus an in-process loopback network and,
//! with the `webrtc-transport` feature, a WebRTC implementation.
//!
//! ### Negotiation (`negotiator`, `candidate_buffer`)
//! The per-link state machine and the early candidate buffer.
//!
//! ### Health (`health`)
//! Periodic round-trip and loss sampling per peer, with a coarse quality
//! rating.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{MeshConfig, PeerMesh, TcpSignaling};
//! use client::transport::webrtc::WebRtcTransport;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::default();
//! let signaling = Arc::new(TcpSignaling::connect("127.0.0.1:8080").await?);
//! let transport = Arc::new(WebRtcTransport::new(&config)?);
//! let mesh = PeerMesh::new(signaling.clone(), transport, config);
//!
//! mesh.set_state_update_callback(|state| println!("peer state: {}", state));
//! signaling.create_room("arena", "Alice")?;
//!
//! mesh.broadcast_game_state(&serde_json::json!({ "x": 1.0, "y": 2.0 }));
//! # Ok(())
//! # }
//! ```

pub mod candidate_buffer;
pub mod config;
pub mod error;
pub mod health;
pub mod mesh;
pub mod negotiator;
pub mod room;
pub mod signaling;
pub mod transport;

pub use config::MeshConfig;
pub use error::{LinkError, SignalingError};
pub use health::{ConnectionQuality, PeerStats};
pub use mesh::{PeerMesh, WeakPeerMesh};
pub use negotiator::{LinkState, Role};
pub use signaling::{OutboundSignal, SignalEvent, SignalingChannel, TcpSignaling};
