//! Shared fixtures: recording collaborators and an in-process test plugin.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use trellis_core::{Error, Result};
use trellis_plugin::host::{
    CacheStore, ConfigSource, Database, DbRow, DbValue, EventSink, HostFacade, HttpFetcher,
    Mailer, Translator,
};
use trellis_plugin::manager::PluginManager;
use trellis_plugin_api::host::{CallContext, HostApi, HttpResponse};
use trellis_plugin_api::registration::Registration;
use trellis_plugin_api::Plugin;

/// Database that records queries and serves one canned row.
#[derive(Default)]
pub struct RecordingDb {
    pub queries: Mutex<Vec<String>>,
    pub execs: Mutex<Vec<String>>,
}

#[async_trait]
impl Database for RecordingDb {
    async fn query(&self, query: &str, _args: &[Value]) -> Result<Vec<DbRow>> {
        self.queries.lock().push(query.to_string());
        let mut row = DbRow::new();
        row.insert("value".to_string(), DbValue::Json(Value::from(1)));
        Ok(vec![row])
    }

    async fn exec(&self, query: &str, _args: &[Value]) -> Result<u64> {
        self.execs.lock().push(query.to_string());
        Ok(1)
    }
}

/// Cache that records the exact keys the backend observes.
#[derive(Default)]
pub struct MemoryCache {
    pub entries: Mutex<HashMap<String, Vec<u8>>>,
    pub seen_keys: Mutex<Vec<String>>,
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.seen_keys.lock().push(key.to_string());
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, _ttl_secs: u64) -> Result<()> {
        self.seen_keys.lock().push(key.to_string());
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.seen_keys.lock().push(key.to_string());
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// HTTP client that records URLs and answers 200.
#[derive(Default)]
pub struct RecordingHttp {
    pub requests: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpFetcher for RecordingHttp {
    async fn fetch(
        &self,
        _method: &str,
        url: &str,
        _headers: &HashMap<String, String>,
        _body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        self.requests.lock().push(url.to_string());
        Ok(HttpResponse {
            status: 200,
            body: b"ok".to_vec(),
        })
    }
}

/// Mailer that records recipient lists.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &[String], _subject: &str, _body: &str, _html: bool) -> Result<()> {
        self.sent.lock().push(to.to_vec());
        Ok(())
    }
}

/// Static configuration map.
pub struct MapConfig(pub HashMap<String, String>);

#[async_trait]
impl ConfigSource for MapConfig {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.0.get(key).cloned())
    }
}

/// Translator prefixing every known key with `t:`.
pub struct PrefixTranslator;

impl Translator for PrefixTranslator {
    fn translate(&self, key: &str, _args: &[Value]) -> Option<String> {
        Some(format!("t:{key}"))
    }
}

/// Event sink recording event types.
#[derive(Default)]
pub struct RecordingEvents {
    pub published: Mutex<Vec<String>>,
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, event_type: &str, _data: Value) -> Result<()> {
        self.published.lock().push(event_type.to_string());
        Ok(())
    }
}

/// All the recording collaborators plus the facade over them.
pub struct TestHost {
    pub db: Arc<RecordingDb>,
    pub cache: Arc<MemoryCache>,
    pub http: Arc<RecordingHttp>,
    pub mailer: Arc<RecordingMailer>,
    pub events: Arc<RecordingEvents>,
    pub facade: Arc<HostFacade>,
}

#[must_use]
pub fn test_host() -> TestHost {
    let db = Arc::new(RecordingDb::default());
    let cache = Arc::new(MemoryCache::default());
    let http = Arc::new(RecordingHttp::default());
    let mailer = Arc::new(RecordingMailer::default());
    let events = Arc::new(RecordingEvents::default());

    let mut config = HashMap::new();
    config.insert("site_title".to_string(), "Trellis".to_string());
    config.insert("smtp_password".to_string(), "hunter2".to_string());

    let facade = HostFacade::builder()
        .database("main", Arc::clone(&db) as Arc<dyn Database>)
        .cache(Arc::clone(&cache) as Arc<dyn CacheStore>)
        .http(Arc::clone(&http) as Arc<dyn HttpFetcher>)
        .mailer(Arc::clone(&mailer) as Arc<dyn Mailer>)
        .config(Arc::new(MapConfig(config)))
        .translator(Arc::new(PrefixTranslator))
        .events(Arc::clone(&events) as Arc<dyn EventSink>)
        .build();

    TestHost {
        db,
        cache,
        http,
        mailer,
        events,
        facade,
    }
}

#[must_use]
pub fn test_manager(host: &TestHost) -> Arc<PluginManager> {
    PluginManager::new(trellis_core::HOST_VERSION, Arc::clone(&host.facade))
}

/// In-process plugin with a lifecycle journal and a few fixed functions.
pub struct TestPlugin {
    registration: Registration,
    pub journal: Arc<Mutex<Vec<String>>>,
    pub host: Mutex<Option<Arc<dyn HostApi>>>,
    pub fail_init: bool,
}

impl TestPlugin {
    #[must_use]
    pub fn new(registration: Registration) -> Arc<Self> {
        Arc::new(Self {
            registration,
            journal: Arc::new(Mutex::new(Vec::new())),
            host: Mutex::new(None),
            fail_init: false,
        })
    }

    #[must_use]
    pub fn with_journal(registration: Registration, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            registration,
            journal,
            host: Mutex::new(None),
            fail_init: false,
        })
    }

    #[must_use]
    pub fn failing_init(registration: Registration) -> Arc<Self> {
        Arc::new(Self {
            registration,
            journal: Arc::new(Mutex::new(Vec::new())),
            host: Mutex::new(None),
            fail_init: true,
        })
    }

    fn name(&self) -> &str {
        &self.registration.name
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    async fn registration(&self) -> Result<Registration> {
        Ok(self.registration.clone())
    }

    async fn init(&self, host: Arc<dyn HostApi>) -> Result<()> {
        if self.fail_init {
            return Err(Error::plugin(format!("{} refuses to start", self.name())));
        }
        self.journal.lock().push(format!("init:{}", self.name()));
        *self.host.lock() = Some(host);
        Ok(())
    }

    async fn call(&self, ctx: &CallContext, function: &str, args: Value) -> Result<Value> {
        self.journal
            .lock()
            .push(format!("call:{}:{function}", self.name()));
        match function {
            "ping" => Ok(Value::String("pong".to_string())),
            "echo" => Ok(args),
            "whoami" => Ok(Value::String(self.name().to_string())),
            // Recursive self/peer call through the sandboxed host API.
            "chain" => {
                let host = self
                    .host
                    .lock()
                    .clone()
                    .ok_or_else(|| Error::internal("not initialized"))?;
                let target = args
                    .get("target")
                    .and_then(Value::as_str)
                    .unwrap_or_else(|| self.name())
                    .to_string();
                host.call_plugin(ctx, &target, "chain", args.clone()).await
            }
            // One forwarded call: args name the target and function.
            "relay" => {
                let host = self
                    .host
                    .lock()
                    .clone()
                    .ok_or_else(|| Error::internal("not initialized"))?;
                let target = args
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::bad_input("relay needs a target"))?
                    .to_string();
                let function = args
                    .get("function")
                    .and_then(Value::as_str)
                    .unwrap_or("ping")
                    .to_string();
                host.call_plugin(ctx, &target, &function, Value::Null).await
            }
            "query" => {
                let host = self
                    .host
                    .lock()
                    .clone()
                    .ok_or_else(|| Error::internal("not initialized"))?;
                let rows = host.db_query(ctx, "SELECT 1", &[]).await?;
                Ok(serde_json::to_value(rows)?)
            }
            "log" => {
                let host = self
                    .host
                    .lock()
                    .clone()
                    .ok_or_else(|| Error::internal("not initialized"))?;
                host.log(
                    trellis_plugin_api::LogLevel::Info,
                    "hello from plugin",
                    BTreeMap::new(),
                );
                Ok(Value::Null)
            }
            other => Err(Error::bad_input(format!("unknown function: {other}"))),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.journal.lock().push(format!("shutdown:{}", self.name()));
        Ok(())
    }
}

/// Install a subscriber so `RUST_LOG` surfaces runtime logs during tests.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// A minimal valid registration.
#[must_use]
pub fn registration(name: &str) -> Registration {
    Registration {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        ..Registration::default()
    }
}

fn wat_escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}

fn length_prefixed(json: &str) -> Vec<u8> {
    let mut blob = (json.len() as u32).to_le_bytes().to_vec();
    blob.extend_from_slice(json.as_bytes());
    blob
}

/// A guest module in text format following the runtime's conventions:
/// bump allocator, `registration` export, and a `ping` handler answering
/// with the given reply string.
#[must_use]
pub fn wat_fixture(name: &str, reply: &str) -> String {
    let registration = format!(r#"{{"name":"{name}","version":"1.0.0"}}"#);
    let reg_blob = wat_escape(&length_prefixed(&registration));
    let reply_json = format!(r#""{reply}""#);
    let reply_blob = wat_escape(&length_prefixed(&reply_json));

    format!(
        r#"(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 8192))
  (data (i32.const 8) "{reg_blob}")
  (data (i32.const 4096) "{reply_blob}")
  (func (export "allocate") (param i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get 0)))
    (local.get $ptr))
  (func (export "deallocate") (param i32 i32))
  (func (export "registration") (result i32) (i32.const 8))
  (func (export "ping") (param i32 i32) (result i32) (i32.const 4096))
)
"#
    )
}
