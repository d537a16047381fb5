//! # Meshtree Testkit
//!
//! Testing utilities for meshtree.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: exact wire encodings and tree root hashes that any
//!   compatible implementation must reproduce
//! - **Generators**: Proptest strategies for messages, hashes and datagrams
//! - **Fixtures**: engines wired together over an in-memory network
//!
//! ## Golden Vectors
//!
//! ```rust
//! use meshtree_testkit::vectors::verify_all_vectors;
//!
//! for (name, matches, actual) in verify_all_vectors() {
//!     assert!(matches, "{}: {}", name, actual);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use meshtree_testkit::generators::messages;
//!
//! proptest! {
//!     #[test]
//!     fn root_is_deterministic(msgs in messages(50)) {
//!         let a = LocalTree::build(&msgs, 32).unwrap();
//!         let b = LocalTree::build(&msgs, 32).unwrap();
//!         prop_assert_eq!(a.root_hash(), b.root_hash());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use meshtree_testkit::fixtures::TestPair;
//!
//! # async fn example() {
//! let pair = TestPair::new(5).await;
//! let report = pair.alice.engine.reconcile(pair.bob.addr).await.unwrap();
//! assert!(report.complete);
//! # }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{init_tracing, keypair, MemoryEngine, TestPair, TestPeer};
pub use vectors::{tree_vectors, verify_all_vectors, wire_vectors, TreeVector, WireVector};
