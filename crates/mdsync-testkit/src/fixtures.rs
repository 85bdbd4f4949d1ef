//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use mdsync::core::{
    CustomerRecord, EntityData, EntityRef, MasterDataEvent, ProductRecord, Topic,
};
use mdsync::events::{MemoryBroker, MemoryCache};
use mdsync::store::MemoryStore;
use mdsync::sync::MemoryRemote;
use mdsync::{BuiltinHandlers, SyncCore, SyncCoreConfig};

/// A service wired to in-memory collaborators the test can poke at.
pub struct TestHarness {
    pub core: SyncCore<MemoryStore>,
    pub remote: Arc<MemoryRemote>,
    pub broker: Arc<MemoryBroker>,
    pub cache: Arc<MemoryCache>,
}

impl TestHarness {
    /// Default config with zero retry backoff, so retries are claimable
    /// within the same drain pass.
    pub fn new() -> Self {
        let mut config = SyncCoreConfig::default();
        config.queue.retry_backoff_ms = 0;
        Self::with_config(config, MemoryRemote::new())
    }

    pub fn with_config(config: SyncCoreConfig, remote: MemoryRemote) -> Self {
        let remote = Arc::new(remote);
        let broker = Arc::new(MemoryBroker::default());
        let core = match SyncCore::in_memory(config, remote.clone(), broker.clone()) {
            Ok(core) => core,
            Err(e) => panic!("invalid harness config: {e}"),
        };
        Self {
            core,
            remote,
            broker,
            cache: Arc::new(MemoryCache::new()),
        }
    }

    /// Register the built-in handlers against the harness cache and start.
    pub async fn start_with_builtins(&self) -> BuiltinHandlers {
        let handlers = self
            .core
            .install_builtin_handlers(self.cache.clone())
            .await
            .unwrap_or_else(|e| panic!("install handlers: {e}"));
        self.core
            .start()
            .await
            .unwrap_or_else(|e| panic!("start: {e}"));
        handlers
    }

    /// Every event published to `topic`, decoded, in order.
    pub async fn events(&self, topic: Topic) -> Vec<MasterDataEvent> {
        self.broker
            .published(topic)
            .await
            .iter()
            .map(|bytes| {
                MasterDataEvent::from_bytes(bytes)
                    .unwrap_or_else(|e| panic!("undecodable event on {topic}: {e}"))
            })
            .collect()
    }

    pub fn go_offline(&self) {
        self.remote.set_online(false);
    }

    pub fn go_online(&self) {
        self.remote.set_online(true);
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn product_ref(id: impl Into<String>) -> EntityRef {
    EntityRef::new("product", id)
}

pub fn customer_ref(id: impl Into<String>) -> EntityRef {
    EntityRef::new("customer", id)
}

/// A product payload with just a price.
pub fn product(price: f64) -> EntityData {
    EntityData::from(ProductRecord::default().with_price(price))
}

pub fn customer(name: &str) -> EntityData {
    EntityData::from(CustomerRecord {
        name: Some(name.to_string()),
        ..CustomerRecord::default()
    })
}

/// Install a fmt subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
