//! # Meshtree Store
//!
//! Storage abstraction for meshtree. Provides a trait-based interface for
//! persisting local messages and verified remote tree nodes, with SQLite and
//! in-memory implementations.
//!
//! ## Key Types
//!
//! - [`NodeStore`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`InsertResult`] - Result of an insert
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshtree_store::{NodeStore, SqliteStore};
//! use meshtree_core::Message;
//!
//! async fn example() {
//!     let store = SqliteStore::open("meshtree.db").unwrap();
//!
//!     let msg = Message::new("hello", None).unwrap();
//!     store.insert_message(&msg).await.unwrap();
//!     let all = store.list_messages().await.unwrap();
//!     assert!(all.contains(&msg));
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent inserts**: inserting the same message or node twice returns `AlreadyExists`
//! - **Verify before write**: remote nodes are hash-checked on insert
//! - **Resumable reconciliation**: fetched nodes and the last root per peer survive restarts

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{InsertResult, NodeStore, StoredNode};
