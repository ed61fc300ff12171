use std::sync::Arc;

use compile::{CompiledCache, Compiler};
use host::assets::{AssetError, AssetSandbox};
use host::backend::{BroadcastBus, MemoryTtlCache, RedisTtlCache, StoreError, TtlCache};
use host::http_proxy::HttpProxy;
use host::{Bridge, HostServices};
use pool::WorkerPool;

use crate::config::RuntimeConfig;
use crate::dispatch::{AuthPolicy, Dispatcher};
use crate::store::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to open storage: {0}")]
    Store(#[from] StoreError),
    #[error("failed to start host runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("failed to configure assets: {0}")]
    Assets(#[from] AssetError),
}

/// Everything needed to serve function invocations, wired from config.
pub struct RuntimeEngine {
    dispatcher: Arc<Dispatcher>,
    events: BroadcastBus,
}

impl RuntimeEngine {
    pub async fn start(config: &RuntimeConfig) -> Result<Self, EngineError> {
        let store = Arc::new(SqliteStore::open(&config.sqlite_path())?);
        Self::with_store(config, store).await
    }

    /// Wire the engine around an already opened store.
    pub async fn with_store(
        config: &RuntimeConfig,
        store: Arc<SqliteStore>,
    ) -> Result<Self, EngineError> {
        let bridge = Bridge::current_or_owned()?;
        let events = BroadcastBus::new(256);

        let cache: Arc<dyn TtlCache> = match config.redis_url() {
            Some(url) => match RedisTtlCache::connect(url, bridge.clone()).await {
                Ok(cache) => Arc::new(cache),
                Err(err) => {
                    tracing::warn!("redis unavailable, using in-memory cache: {}", err);
                    Arc::new(MemoryTtlCache::new())
                }
            },
            None => Arc::new(MemoryTtlCache::new()),
        };

        let mut assets = AssetSandbox::new(config.user_asset_root(), config.bundled_asset_root());
        if let Some(base) = config.remote_asset_base() {
            assets = assets.with_remote(base, config.http_timeout(), bridge.clone())?;
        }

        let services = Arc::new(HostServices {
            kv: store.clone(),
            cache,
            events: Some(Arc::new(events.clone())),
            config: store.clone(),
            accounts: store.clone(),
            assets,
            http: HttpProxy::new(config.http_timeout(), config.user_agent(), bridge.clone()),
        });

        let pool_config = config.pool_config();
        tracing::info!(
            "starting {} fn workers, execution budget {}ms",
            pool_config.num_workers,
            pool_config.execution_timeout_ms
        );
        let pool = Arc::new(WorkerPool::new(pool_config, services, bridge));
        let compiler = Compiler::new(Arc::new(CompiledCache::new()));
        let auth = AuthPolicy::new(config.api_tokens(), config.session_tokens());

        let dispatcher = Arc::new(Dispatcher::new(store, compiler, pool, auth));
        if let Err(err) = dispatcher.ensure_builtins() {
            tracing::warn!("built-in provisioning deferred: {}", err);
        }

        Ok(Self { dispatcher, events })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Events published by guests through `broadcast`.
    pub fn events(&self) -> &BroadcastBus {
        &self.events
    }
}
