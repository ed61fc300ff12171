use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{StoreError, TtlCache};
use crate::bridge::Bridge;

/// TTL cache backed by a redis server through a shared connection manager.
pub struct RedisTtlCache {
    connection: ConnectionManager,
    bridge: Bridge,
}

impl RedisTtlCache {
    pub async fn connect(url: &str, bridge: Bridge) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let connection = client.get_connection_manager().await.map_err(backend)?;
        tracing::info!("redis cache connected: {}", redact(url));
        Ok(Self { connection, bridge })
    }
}

impl TtlCache for RedisTtlCache {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        let key = key.to_string();
        self.bridge
            .run(async move { connection.get::<_, Option<String>>(key).await })
            .map_err(backend)?
            .map_err(backend)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let (key, value) = (key.to_string(), value.to_string());
        let seconds = ttl.as_secs().max(1);
        self.bridge
            .run(async move { connection.set_ex::<_, _, ()>(key, value, seconds).await })
            .map_err(backend)?
            .map_err(backend)
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let key = key.to_string();
        self.bridge
            .run(async move { connection.del::<_, ()>(key).await })
            .map_err(backend)?
            .map_err(backend)
    }
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Strip credentials before logging a connection url.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}
