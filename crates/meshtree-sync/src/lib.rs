//! # Meshtree Sync
//!
//! Signed UDP datagram protocol for mirroring a peer's content tree.
//!
//! ## Overview
//!
//! Every node runs one [`SyncEngine`] on one socket. The engine's receive
//! loop answers peers' requests from the local tree and routes replies to
//! whichever local task is waiting for them. Requests are retried with
//! exponential backoff since UDP may lose any datagram.
//!
//! ## Key Properties
//!
//! - **Authenticated**: handshake and root datagrams are signed with P-256
//! - **Verified content**: every fetched node is checked against its hash
//! - **Resumable**: fetched nodes are persisted, so a pass can be repeated
//! - **Incremental**: only nodes missing from the local view are fetched
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshtree_core::{Keypair, LocalTree, DEFAULT_MAX_ARITY};
//! use meshtree_store::MemoryStore;
//! use meshtree_sync::{EngineConfig, NoDirectory, SyncEngine};
//!
//! async fn example() -> meshtree_sync::Result<()> {
//!     let socket = tokio::net::UdpSocket::bind("0.0.0.0:8443").await?;
//!     let tree = LocalTree::build(&[], DEFAULT_MAX_ARITY)?;
//!     let engine = Arc::new(SyncEngine::new(
//!         socket,
//!         Keypair::generate(),
//!         Arc::new(tree),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(NoDirectory),
//!         EngineConfig::default(),
//!     ));
//!     tokio::spawn(Arc::clone(&engine).run());
//!
//!     let report = engine.reconcile("192.0.2.7:8443".parse().unwrap()).await?;
//!     println!("fetched {} nodes", report.fetched);
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- Hello ------------------>|
//!   |<------- HelloReply --------------|
//!   |-------- RootRequest ------------>|
//!   |<------- Root --------------------|
//!   |-------- GetDatum(root) --------->|
//!   |<------- Datum -------------------|
//!   |-------- GetDatum(child) -------->|
//!   |<------- Datum / NoDatum ---------|
//!   |               ...                |
//! ```

pub mod config;
pub mod datagram;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod receiver;
pub mod registry;
pub mod session;
pub mod signing;
pub mod transport;

pub use config::{EngineConfig, UnknownPeerPolicy};
pub use datagram::{Body, Datagram, DatagramId, DatagramKind, Header, HelloBody, HEADER_LEN};
pub use engine::{DatumReply, KeyDirectory, NoDirectory, PeerKey, SyncEngine};
pub use error::{FrameError, Result, SyncError};
pub use reconcile::ReconcileReport;
pub use receiver::{Disposition, DropReason};
pub use registry::{PendingRegistry, Routing, Ticket};
pub use session::{FetchBuffer, InboundSessions, OutboundSessions, RootUpdate, SessionState};
pub use transport::{memory::MemoryNetwork, memory::MemorySocket, DatagramSocket};
