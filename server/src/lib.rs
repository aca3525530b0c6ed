//! # Signaling Server Library
//!
//! This library provides the rendezvous point that lets game clients find each
//! other and form a full peer-to-peer mesh. It never carries game traffic: once
//! two clients have exchanged session descriptions and network candidates
//! through it, they talk over a direct data channel.
//!
//! ## Core Responsibilities
//!
//! ### Room Lobby
//! Clients list, create, join and leave rooms. Each room has a capacity, a
//! master (the creator, then the first remaining member) and a started flag
//! that only the master may flip.
//!
//! ### Mesh Bootstrapping
//! When a player joins, every member already present is told to initiate a
//! link towards the newcomer. The newcomer only answers. This one-sided rule
//! keeps two peers from offering to each other at the same time.
//!
//! ### Negotiation Relay
//! Offers, answers and candidates are forwarded to their target session,
//! re-stamped with the sender's identity so a client cannot impersonate
//! another one.
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! Every TCP session runs a reader task and a writer task. Readers push
//! [`network::SessionEvent`]s into one channel which the server loop drains in
//! order. All room mutations happen on that loop, so notifications for one
//! room are emitted in the order the mutations happened.
//!
//! ### Framing
//! Messages are bincode-encoded [`shared::ClientMessage`] and
//! [`shared::ServerMessage`] values behind a big-endian length prefix.
//!
//! ## Module Organization
//!
//! ### Room Manager Module (`room_manager`)
//! Pure room bookkeeping: creation, capacity, master election, deletion of
//! empty rooms and the started flag.
//!
//! ### Network Module (`network`)
//! Session handling, the event loop and the relay.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Rooms hold at most four players
//!     let mut server = Server::bind("127.0.0.1:8080", 4).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod room_manager;
