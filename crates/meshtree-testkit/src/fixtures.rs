//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: engines wired together over an
//! in-memory network, with their receive loops running.

use std::net::SocketAddr;
use std::sync::{Arc, Once};

use meshtree_core::{sample_messages, Keypair, LocalTree, Message, DEFAULT_MAX_ARITY};
use meshtree_store::MemoryStore;
use meshtree_sync::{
    EngineConfig, KeyDirectory, MemoryNetwork, MemorySocket, NoDirectory, SyncEngine,
};
use tracing_subscriber::EnvFilter;

/// Engine over the in-memory network and store.
pub type MemoryEngine = SyncEngine<MemoryStore, MemorySocket>;

static TRACING: Once = Once::new();

/// Install a tracing subscriber for tests, once per process.
///
/// Honours `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic keypair for party `index`.
pub fn keypair(index: u8) -> Keypair {
    let mut seed = [0x11u8; 32];
    seed[0] = index.wrapping_add(1);
    Keypair::from_seed(&seed).expect("seed is a valid scalar")
}

/// One engine plus the handles tests need.
pub struct TestPeer {
    pub engine: Arc<MemoryEngine>,
    pub addr: SocketAddr,
    pub keypair: Keypair,
}

impl TestPeer {
    /// Start an engine serving `messages`, with its receive loop running.
    pub async fn spawn(
        network: &Arc<MemoryNetwork>,
        index: u8,
        messages: &[Message],
        directory: Arc<dyn KeyDirectory>,
        config: EngineConfig,
    ) -> Self {
        let keypair = keypair(index);
        let tree = LocalTree::build(messages, DEFAULT_MAX_ARITY).expect("valid arity");
        let socket = network.bind_any().await;
        let engine = Arc::new(SyncEngine::new(
            socket,
            keypair.clone(),
            Arc::new(tree),
            Arc::new(MemoryStore::new()),
            directory,
            config,
        ));
        let addr = engine.local_addr().expect("memory sockets know their address");
        tokio::spawn(Arc::clone(&engine).run());
        Self {
            engine,
            addr,
            keypair,
        }
    }
}

/// Two engines on one network: `alice` pulls from `bob` in most tests.
pub struct TestPair {
    pub network: Arc<MemoryNetwork>,
    pub alice: TestPeer,
    pub bob: TestPeer,
}

impl TestPair {
    /// Alice holds no messages; Bob holds `bob_messages` sample messages.
    pub async fn new(bob_messages: usize) -> Self {
        Self::with_messages(&[], &sample_messages(bob_messages)).await
    }

    pub async fn with_messages(alice: &[Message], bob: &[Message]) -> Self {
        init_tracing();
        let network = MemoryNetwork::new();
        let alice = TestPeer::spawn(
            &network,
            0,
            alice,
            Arc::new(NoDirectory),
            EngineConfig::default().with_name("alice"),
        )
        .await;
        let bob = TestPeer::spawn(
            &network,
            1,
            bob,
            Arc::new(NoDirectory),
            EngineConfig::default().with_name("bob"),
        )
        .await;
        Self {
            network,
            alice,
            bob,
        }
    }
}
