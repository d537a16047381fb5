//! # Meshtree
//!
//! Peer-to-peer synchronisation of Merkle content trees over signed UDP
//! datagrams.
//!
//! ## Overview
//!
//! Each node holds a set of short messages, arranged as the leaves of a
//! content-addressed tree. Peers discover one another through a bootstrap
//! source, handshake, and pull each other's trees node by node, verifying
//! every node against its hash before accepting it.
//!
//! ## Key Concepts
//!
//! - **Message**: a dated UTF-8 body, optionally replying to another message.
//! - **Content tree**: leaves are messages, internal nodes list child hashes.
//! - **Root hash**: a peer's announcement of everything it currently holds.
//! - **Reconciliation**: fetching exactly the nodes a local view lacks.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshtree::{Keypair, Node, NodeConfig};
//! use meshtree::store::SqliteStore;
//!
//! async fn example() -> meshtree::Result<()> {
//!     let store = SqliteStore::open("meshtree.db")?;
//!     let socket = tokio::net::UdpSocket::bind("0.0.0.0:8443")
//!         .await
//!         .map_err(meshtree::sync::SyncError::from)?;
//!
//!     let node = Node::new(socket, Keypair::generate(), store, NodeConfig::default()).await?;
//!     node.start();
//!
//!     let report = node.sync_with("192.0.2.7:8443".parse().unwrap()).await?;
//!     println!("fetched {} nodes, complete: {}", report.fetched, report.complete);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `meshtree::core` - Hashes, keys, messages and trees
//! - `meshtree::store` - Storage abstraction and SQLite
//! - `meshtree::sync` - Datagram protocol and reconciliation

pub mod directory;
pub mod error;
pub mod node;

// Re-export component crates
pub use meshtree_core as core;
pub use meshtree_store as store;
pub use meshtree_sync as sync;

pub use directory::{Bootstrap, PeerDirectory, PeerRecord, StaticBootstrap};
pub use error::{NodeError, Result};
pub use node::{HandshakeReport, Node, NodeConfig, TreeConfig};

// Re-export commonly used types
pub use meshtree_core::{Keypair, LocalTree, Message, PublicKey, Sha256Hash};
pub use meshtree_sync::{EngineConfig, ReconcileReport, UnknownPeerPolicy};
