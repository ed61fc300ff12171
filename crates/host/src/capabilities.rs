use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use deno_core::v8;
use serde::{Deserialize, Serialize};

use crate::assets::{
    AssetData, AssetError, AssetSandbox, Encoding, decode_for_read, encode_for_write,
};
use crate::backend::{
    AccountSource, Audience, ConfigSource, DEFAULT_CACHE_TTL, EVENT_PREFIX, EventBus, KvStore,
    MAX_CACHE_TTL, StoreError, TtlCache,
};
use crate::bridge;
use crate::context::ResponseMeta;
use crate::http_proxy::{HttpFailure, HttpProxy, HttpReply, HttpRequest};
use crate::{config_lookup, value::GuestValue};

/// Process-wide collaborators shared by every invocation.
pub struct HostServices {
    pub kv: Arc<dyn KvStore>,
    pub cache: Arc<dyn TtlCache>,
    pub events: Option<Arc<dyn EventBus>>,
    pub config: Arc<dyn ConfigSource>,
    pub accounts: Arc<dyn AccountSource>,
    pub assets: AssetSandbox,
    pub http: HttpProxy,
}

/// Why the isolate was force-stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    Timeout,
    Thrown { status: u16, message: String },
}

/// First-writer-wins record of the interrupt cause, shared between the
/// watchdog and the guest's `throws`.
#[derive(Debug, Clone, Default)]
pub struct InterruptSlot(Arc<Mutex<Option<Interrupt>>>);

impl InterruptSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cause` unless another interrupt got there first.
    pub fn raise(&self, cause: Interrupt) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(cause);
        true
    }

    pub fn get(&self) -> Option<Interrupt> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A failed host call as the guest sees it: a rejected promise carrying
/// `message`, `status` and for HTTP errors the `response`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostFault {
    pub message: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl HostFault {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status,
            response: None,
        }
    }
}

impl From<StoreError> for HostFault {
    fn from(err: StoreError) -> Self {
        HostFault::new(err.status(), err.to_string())
    }
}

impl From<AssetError> for HostFault {
    fn from(err: AssetError) -> Self {
        HostFault::new(err.status(), err.to_string())
    }
}

impl From<HttpFailure> for HostFault {
    fn from(err: HttpFailure) -> Self {
        Self {
            message: err.message,
            status: 500,
            response: err
                .response
                .and_then(|reply| serde_json::to_value(reply).ok()),
        }
    }
}

pub type HostResult<T> = Result<T, HostFault>;

/// `writeAsset` / `readAsset` options after the shim normalised them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetOptions {
    pub encoding: Option<String>,
    pub flag: Option<String>,
}

/// Everything one invocation may touch. Built once per call, stored in the
/// isolate's op state and taken back out when the call finishes.
pub struct Capabilities {
    namespace: String,
    services: Arc<HostServices>,
    interrupt: InterruptSlot,
    isolate: Option<v8::IsolateHandle>,
    deadline: Option<Instant>,
    pub meta: ResponseMeta,
}

impl Capabilities {
    pub fn new(
        namespace: impl Into<String>,
        services: Arc<HostServices>,
        interrupt: InterruptSlot,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            services,
            interrupt,
            isolate: None,
            deadline: None,
            meta: ResponseMeta::default(),
        }
    }

    /// Handle used by `throws` to stop the running isolate.
    pub fn with_isolate(mut self, isolate: v8::IsolateHandle) -> Self {
        self.isolate = Some(isolate);
        self
    }

    /// End of the execution budget. Cache, HTTP and remote asset calls give
    /// up once it passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn bounded<R>(&self, call: impl FnOnce() -> R) -> R {
        bridge::with_deadline(self.deadline, call)
    }

    fn cache_key(&self, key: &str) -> String {
        format!("fn:{}:{}", self.namespace, key)
    }

    pub fn cache_get(&self, key: &str) -> HostResult<Option<GuestValue>> {
        let raw = self.bounded(|| self.services.cache.get(&self.cache_key(key)))?;
        // undecodable entries read as a miss
        Ok(raw.and_then(|raw| {
            serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .map(GuestValue::from)
        }))
    }

    pub fn cache_set(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl_seconds: f64,
    ) -> HostResult<()> {
        let ttl = cache_ttl(ttl_seconds);
        let encoded = encode_value(value)?;
        Ok(self.bounded(|| self.services.cache.set(&self.cache_key(key), &encoded, ttl))?)
    }

    pub fn cache_del(&self, key: &str) -> HostResult<()> {
        Ok(self.bounded(|| self.services.cache.del(&self.cache_key(key)))?)
    }

    pub fn db_get(&self, key: &str) -> HostResult<Option<GuestValue>> {
        Ok(self.services.kv.get(&self.namespace, key)?.map(|raw| decode_stored(&raw)))
    }

    pub fn db_find(&self, key: Option<&str>) -> HostResult<GuestValue> {
        let records = self.services.kv.find(&self.namespace, key)?;
        Ok(GuestValue::List(
            records
                .into_iter()
                .map(|record| {
                    GuestValue::Map(vec![
                        ("key".to_string(), GuestValue::String(record.key)),
                        ("value".to_string(), decode_stored(&record.value)),
                        (
                            "createdAt".to_string(),
                            GuestValue::String(record.created_at.to_rfc3339()),
                        ),
                    ])
                })
                .collect(),
        ))
    }

    pub fn db_write(&self, mode: DbWrite, key: &str, value: &serde_json::Value) -> HostResult<()> {
        let encoded = encode_value(value)?;
        let kv = &self.services.kv;
        match mode {
            DbWrite::Set => kv.set(&self.namespace, key, &encoded)?,
            DbWrite::Insert => kv.insert(&self.namespace, key, &encoded)?,
            DbWrite::Update => kv.update(&self.namespace, key, &encoded)?,
        }
        Ok(())
    }

    pub fn db_del(&self, key: &str) -> HostResult<()> {
        self.services.kv.del(&self.namespace, key)?;
        Ok(())
    }

    pub fn http(&self, request: HttpRequest) -> HostResult<HttpReply> {
        Ok(self.bounded(|| self.services.http.request(request))?)
    }

    pub fn config_get(&self, key: &str) -> HostResult<Option<GuestValue>> {
        let document = self.services.config.document()?;
        Ok(config_lookup::lookup(&document, key).map(GuestValue::from))
    }

    pub fn master(&self) -> HostResult<Option<GuestValue>> {
        let account = self.services.accounts.master()?;
        Ok(account
            .and_then(|account| serde_json::to_value(account).ok())
            .map(GuestValue::from))
    }

    /// Publish to both audiences. A missing bus makes this a no-op.
    pub fn broadcast(&self, event: &str, payload: serde_json::Value) {
        let Some(bus) = &self.services.events else {
            return;
        };
        let name = format!("{}{}", EVENT_PREFIX, event);
        bus.publish(Audience::Public, &name, payload.clone());
        bus.publish(Audience::Admin, &name, payload);
    }

    pub fn write_asset(
        &self,
        path: &str,
        data: AssetData,
        options: &AssetOptions,
    ) -> HostResult<()> {
        let encoding = match options.encoding.as_deref() {
            None => Encoding::Utf8,
            some => Encoding::parse(some)?,
        };
        let bytes = encode_for_write(data, encoding)?;
        self.services.assets.write(path, &bytes, options.flag.as_deref())?;
        Ok(())
    }

    pub fn read_asset(&self, path: &str, options: &AssetOptions) -> HostResult<AssetData> {
        let encoding = Encoding::parse(options.encoding.as_deref())?;
        let bytes = self.bounded(|| self.services.assets.read(path))?;
        Ok(decode_for_read(bytes, encoding))
    }

    pub fn log(&self, level: &str, message: &str) {
        stdio::guest(&self.namespace, stdio::GuestLevel::parse(level), message);
    }

    /// Abort the guest with `status`/`message`. Not catchable by guest code.
    pub fn throws(&self, status: u16, message: String) {
        let status = if (100..=599).contains(&status) { status } else { 500 };
        self.interrupt.raise(Interrupt::Thrown { status, message });
        if let Some(isolate) = &self.isolate {
            isolate.terminate_execution();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbWrite {
    Set,
    Insert,
    Update,
}

fn encode_value(value: &serde_json::Value) -> HostResult<String> {
    serde_json::to_string(value).map_err(|err| HostFault::new(400, err.to_string()))
}

/// Seconds from the guest to a cache expiry. Zero, negative and NaN mean the
/// default; anything longer, infinity included, is capped.
fn cache_ttl(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return DEFAULT_CACHE_TTL;
    }
    Duration::try_from_secs_f64(seconds)
        .map(|ttl| ttl.min(MAX_CACHE_TTL))
        .unwrap_or(MAX_CACHE_TTL)
}

/// Stored values are JSON text; anything else comes back as the raw string.
fn decode_stored(raw: &str) -> GuestValue {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(GuestValue::from)
        .unwrap_or_else(|_| GuestValue::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BroadcastBus, MasterAccount, MemoryKvStore, MemoryTtlCache, StaticAccounts, StaticConfig,
    };
    use crate::bridge::Bridge;
    use serde_json::json;

    fn services(dir: &std::path::Path, bus: Option<BroadcastBus>) -> Arc<HostServices> {
        let bridge = Bridge::current_or_owned().expect("bridge");
        Arc::new(HostServices {
            kv: Arc::new(MemoryKvStore::new()),
            cache: Arc::new(MemoryTtlCache::new()),
            events: bus.map(|bus| Arc::new(bus) as Arc<dyn EventBus>),
            config: Arc::new(StaticConfig(json!({ "site_title": "Blog" }))),
            accounts: Arc::new(StaticAccounts(Some(MasterAccount {
                id: "u1".into(),
                username: "owner".into(),
                name: "Owner".into(),
                avatar: None,
                introduce: None,
                mail: None,
                url: None,
                created_at: chrono::Utc::now(),
            }))),
            assets: AssetSandbox::new(dir.join("user"), dir.join("bundled")),
            http: HttpProxy::new(Duration::from_secs(5), "fn-test", bridge),
        })
    }

    #[test]
    fn storage_is_scoped_by_namespace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shared = services(dir.path(), None);
        let a = Capabilities::new("blog/a", Arc::clone(&shared), InterruptSlot::new());
        let b = Capabilities::new("blog/b", shared, InterruptSlot::new());

        a.db_write(DbWrite::Insert, "k", &json!({ "v": 1 })).expect("insert");
        let err = a.db_write(DbWrite::Insert, "k", &json!({ "v": 1 })).expect_err("conflict");
        assert_eq!(err.status, 409);
        a.db_write(DbWrite::Set, "k", &json!({ "v": 2 })).expect("set");
        assert_eq!(a.db_get("k").expect("get"), Some(GuestValue::from(json!({ "v": 2 }))));
        assert_eq!(b.db_get("k").expect("get"), None);

        a.cache_set("c", &json!("hit"), 0.0).expect("cache set");
        assert_eq!(a.cache_get("c").expect("cache get"), Some(GuestValue::from("hit")));
        assert_eq!(b.cache_get("c").expect("cache get"), None);
    }

    #[test]
    fn cache_ttl_is_defaulted_and_capped() {
        assert_eq!(cache_ttl(0.0), DEFAULT_CACHE_TTL);
        assert_eq!(cache_ttl(-5.0), DEFAULT_CACHE_TTL);
        assert_eq!(cache_ttl(f64::NAN), DEFAULT_CACHE_TTL);
        assert_eq!(cache_ttl(1.5), Duration::from_millis(1500));
        assert_eq!(cache_ttl(1e300), MAX_CACHE_TTL);
        assert_eq!(cache_ttl(f64::INFINITY), MAX_CACHE_TTL);

        let dir = tempfile::tempdir().expect("tempdir");
        let caps = Capabilities::new("blog/a", services(dir.path(), None), InterruptSlot::new());
        caps.cache_set("huge", &json!(1), 1e300).expect("huge ttl is capped");
        assert_eq!(caps.cache_get("huge").expect("cache get"), Some(GuestValue::from(json!(1))));
    }

    #[test]
    fn config_and_master_lookups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let caps = Capabilities::new("blog/a", services(dir.path(), None), InterruptSlot::new());
        assert_eq!(caps.config_get("siteTitle").expect("config"), Some(GuestValue::from("Blog")));
        assert_eq!(caps.config_get("nope").expect("config"), None);
        let master = caps.master().expect("master").expect("present");
        assert_eq!(master.get("username").and_then(GuestValue::as_str), Some("owner"));
    }

    #[test]
    fn broadcast_reaches_both_audiences() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();
        let services = services(dir.path(), Some(bus));
        let caps = Capabilities::new("blog/a", services, InterruptSlot::new());
        caps.broadcast("ping", json!(1));
        let first = rx.try_recv().expect("public");
        let second = rx.try_recv().expect("admin");
        assert_eq!(first.audience, Audience::Public);
        assert_eq!(second.audience, Audience::Admin);
        assert_eq!(first.event, "fn#ping");
    }

    #[test]
    fn first_interrupt_wins() {
        let slot = InterruptSlot::new();
        assert!(slot.raise(Interrupt::Timeout));
        assert!(!slot.raise(Interrupt::Thrown {
            status: 400,
            message: "late".into()
        }));
        assert_eq!(slot.get(), Some(Interrupt::Timeout));
    }

    #[test]
    fn throws_clamps_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let slot = InterruptSlot::new();
        let caps = Capabilities::new("blog/a", services(dir.path(), None), slot.clone());
        caps.throws(42, "bad".into());
        assert_eq!(
            slot.get(),
            Some(Interrupt::Thrown {
                status: 500,
                message: "bad".into()
            })
        );
    }
}
