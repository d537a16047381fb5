//! SQLite implementation of the NodeStore trait.
//!
//! This is the primary storage backend for meshtree. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use meshtree_core::{verify_node, Message, Sha256Hash};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{now_millis, InsertResult, NodeStore, StoredNode};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }
}

// Helper to read a 32-byte hash column
fn hash_from_blob(bytes: Vec<u8>, column: usize) -> rusqlite::Result<Sha256Hash> {
    Sha256Hash::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::InvalidColumnType(column, "hash".into(), rusqlite::types::Type::Blob)
    })
}

// Helper to convert a row to StoredNode
fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredNode> {
    let hash: Vec<u8> = row.get(0)?;
    let payload: Vec<u8> = row.get(1)?;
    Ok(StoredNode {
        hash: hash_from_blob(hash, 0)?,
        raw: Bytes::from(payload),
        source: row.get(2)?,
        fetched_at: row.get(3)?,
    })
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn insert_message(&self, message: &Message) -> Result<InsertResult> {
        let payload = message.encode();
        let hash = Sha256Hash::hash(&payload);

        self.blocking(move |conn| {
            // Same payload means same hash, so a repeat is ignored
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages (hash, payload, created_at) VALUES (?1, ?2, ?3)",
                params![hash.as_bytes().as_slice(), payload, now_millis()],
            )?;
            Ok(if inserted == 0 {
                InsertResult::AlreadyExists
            } else {
                InsertResult::Inserted
            })
        })
        .await
    }

    async fn list_messages(&self) -> Result<Vec<Message>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM messages ORDER BY seq")?;
            let payloads = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            // Decode back into messages
            payloads
                .iter()
                .map(|p| Message::decode(p).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn message_count(&self) -> Result<usize> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn insert_node(
        &self,
        hash: &Sha256Hash,
        raw: &[u8],
        source: &str,
    ) -> Result<InsertResult> {
        // Verify before touching the database
        let node = verify_node(hash, raw)?;
        let source = source.to_owned();

        self.blocking(move |conn| {
            // Insert the node, keeping the first source on repeats
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO nodes (hash, node_type, payload, source, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    node.hash.as_bytes().as_slice(),
                    node.payload.kind().type_byte() as i64,
                    node.raw.as_ref(),
                    source,
                    now_millis(),
                ],
            )?;
            if inserted == 0 {
                return Ok(InsertResult::AlreadyExists);
            }
            debug!(hash = %node.hash, source = %source, "stored remote node");
            Ok(InsertResult::Inserted)
        })
        .await
    }

    async fn get_node(&self, hash: &Sha256Hash) -> Result<Option<StoredNode>> {
        let hash = *hash;
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT hash, payload, source, fetched_at FROM nodes WHERE hash = ?1",
                params![hash.as_bytes().as_slice()],
                row_to_node,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn node_count(&self) -> Result<usize> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn set_remote_root(&self, peer: &str, root: &Sha256Hash) -> Result<()> {
        let peer = peer.to_owned();
        let root = *root;
        self.blocking(move |conn| {
            // Upsert the peer's root
            conn.execute(
                "INSERT INTO remote_roots (peer, root, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(peer) DO UPDATE SET root = excluded.root, updated_at = excluded.updated_at",
                params![peer, root.as_bytes().as_slice(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_remote_root(&self, peer: &str) -> Result<Option<Sha256Hash>> {
        let peer = peer.to_owned();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT root FROM remote_roots WHERE peer = ?1",
                params![peer],
                |row| hash_from_blob(row.get(0)?, 0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }
}
