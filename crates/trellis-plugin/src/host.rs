//! The concrete host facade and the collaborator seams behind it.
//!
//! The facade implements [`HostApi`] over a set of named interfaces the
//! deployment provides: databases, a cache store, an HTTP client, a mailer,
//! a configuration source, a translator, and an event sink. It owns no
//! state beyond those handles. Enforcement does not happen here; the
//! sandbox wraps the facade per plugin.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use trellis_core::{Error, Result};
use trellis_plugin_api::host::{CallContext, HostApi, HttpResponse, LogLevel, Row};

use crate::logring;

/// A database column value as a backend produces it.
#[derive(Debug, Clone)]
pub enum DbValue {
    /// An ordinary JSON-representable value.
    Json(Value),
    /// A binary column; the facade coerces it to a string.
    Bytes(Vec<u8>),
}

/// A row as a backend produces it.
pub type DbRow = BTreeMap<String, DbValue>;

/// A SQL backend. Implementations must use parameterized queries; the
/// sandbox's table parsing is defense in depth, not a substitute.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run a read query.
    async fn query(&self, query: &str, args: &[Value]) -> Result<Vec<DbRow>>;

    /// Run a statement, returning the affected row count.
    async fn exec(&self, query: &str, args: &[Value]) -> Result<u64>;
}

/// A cache backend.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch an entry; a miss is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store an entry; `ttl_secs` of zero means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()>;

    /// Remove an entry.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// An outbound HTTP client. Implementations carry the shared timeout.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Issue a request.
    async fn fetch(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse>;
}

/// An email provider.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one message.
    async fn send(&self, to: &[String], subject: &str, body: &str, html: bool) -> Result<()>;
}

/// A configuration source.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Look up a key.
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// A message translator.
pub trait Translator: Send + Sync {
    /// Translate a key; `None` when the key is unknown.
    fn translate(&self, key: &str, args: &[Value]) -> Option<String>;
}

/// An event bus sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event_type: &str, data: Value) -> Result<()>;
}

/// Dispatch into the plugin registry; implemented by the manager.
#[async_trait]
pub trait PluginCaller: Send + Sync {
    /// Invoke `function` on plugin `name` on behalf of `ctx.caller`.
    async fn route(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value>;
}

/// Split an optional `@name:` backend prefix off a query.
///
/// The `@:` form is not a prefix and passes through verbatim, as does a
/// lone `@name` with no colon.
fn split_backend(query: &str) -> (Option<&str>, &str) {
    if let Some(rest) = query.strip_prefix('@') {
        if let Some((name, remainder)) = rest.split_once(':') {
            if !name.is_empty() {
                return (Some(name), remainder);
            }
        }
    }
    (None, query)
}

fn coerce_row(row: DbRow) -> Row {
    row.into_iter()
        .map(|(column, value)| {
            let value = match value {
                DbValue::Json(v) => v,
                DbValue::Bytes(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
            };
            (column, value)
        })
        .collect()
}

/// The concrete capability surface, composed from collaborators.
pub struct HostFacade {
    databases: HashMap<String, Arc<dyn Database>>,
    default_database: String,
    cache: Arc<dyn CacheStore>,
    http: Arc<dyn HttpFetcher>,
    mailer: Arc<dyn Mailer>,
    config: Arc<dyn ConfigSource>,
    translator: Arc<dyn Translator>,
    events: Arc<dyn EventSink>,
    plugin_caller: RwLock<Option<Weak<dyn PluginCaller>>>,
}

impl HostFacade {
    /// Start building a facade.
    #[must_use]
    pub fn builder() -> HostFacadeBuilder {
        HostFacadeBuilder::default()
    }

    /// Attach the plugin dispatcher after construction. The facade holds a
    /// weak reference so the manager and facade can reference each other
    /// without leaking.
    pub fn attach_plugin_caller(&self, caller: &Arc<dyn PluginCaller>) {
        *self.plugin_caller.write() = Some(Arc::downgrade(caller));
    }

    fn database(&self, name: Option<&str>) -> Result<Arc<dyn Database>> {
        if self.databases.is_empty() {
            return Err(Error::backend("no databases configured"));
        }
        let name = name.unwrap_or(&self.default_database);
        self.databases
            .get(name)
            .cloned()
            .ok_or_else(|| Error::backend(format!("unknown database backend: {name}")))
    }
}

/// Builder for [`HostFacade`].
#[derive(Default)]
pub struct HostFacadeBuilder {
    databases: HashMap<String, Arc<dyn Database>>,
    default_database: Option<String>,
    cache: Option<Arc<dyn CacheStore>>,
    http: Option<Arc<dyn HttpFetcher>>,
    mailer: Option<Arc<dyn Mailer>>,
    config: Option<Arc<dyn ConfigSource>>,
    translator: Option<Arc<dyn Translator>>,
    events: Option<Arc<dyn EventSink>>,
}

impl HostFacadeBuilder {
    /// Register a named database. The first one registered becomes the
    /// default unless [`Self::default_database`] names another.
    #[must_use]
    pub fn database(mut self, name: impl Into<String>, db: Arc<dyn Database>) -> Self {
        let name = name.into();
        if self.default_database.is_none() {
            self.default_database = Some(name.clone());
        }
        self.databases.insert(name, db);
        self
    }

    /// Name the default backend for unprefixed queries.
    #[must_use]
    pub fn default_database(mut self, name: impl Into<String>) -> Self {
        self.default_database = Some(name.into());
        self
    }

    /// Set the cache backend.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the HTTP client.
    #[must_use]
    pub fn http(mut self, http: Arc<dyn HttpFetcher>) -> Self {
        self.http = Some(http);
        self
    }

    /// Set the email provider.
    #[must_use]
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Set the configuration source.
    #[must_use]
    pub fn config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the translator.
    #[must_use]
    pub fn translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Set the event sink.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Finish, filling unset collaborators with inert defaults.
    #[must_use]
    pub fn build(self) -> Arc<HostFacade> {
        Arc::new(HostFacade {
            databases: self.databases,
            default_database: self.default_database.unwrap_or_else(|| "default".to_string()),
            cache: self.cache.unwrap_or_else(|| Arc::new(NullCache)),
            http: self.http.unwrap_or_else(|| Arc::new(NullHttp)),
            mailer: self.mailer.unwrap_or_else(|| Arc::new(NullMailer)),
            config: self.config.unwrap_or_else(|| Arc::new(NullConfig)),
            translator: self.translator.unwrap_or_else(|| Arc::new(NullTranslator)),
            events: self.events.unwrap_or_else(|| Arc::new(NullEvents)),
            plugin_caller: RwLock::new(None),
        })
    }
}

#[async_trait]
impl HostApi for HostFacade {
    async fn db_query(&self, _ctx: &CallContext, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        let (backend, query) = split_backend(query);
        let db = self.database(backend)?;
        let rows = db.query(query, args).await?;
        Ok(rows.into_iter().map(coerce_row).collect())
    }

    async fn db_exec(&self, _ctx: &CallContext, query: &str, args: &[Value]) -> Result<u64> {
        let (backend, query) = split_backend(query);
        let db = self.database(backend)?;
        db.exec(query, args).await
    }

    async fn cache_get(&self, _ctx: &CallContext, key: &str) -> Result<Option<Vec<u8>>> {
        self.cache.get(key).await
    }

    async fn cache_set(
        &self,
        _ctx: &CallContext,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<()> {
        self.cache.set(key, value, ttl_secs).await
    }

    async fn cache_delete(&self, _ctx: &CallContext, key: &str) -> Result<()> {
        self.cache.delete(key).await
    }

    async fn http_request(
        &self,
        _ctx: &CallContext,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        self.http.fetch(method, url, headers, body).await
    }

    async fn send_email(
        &self,
        _ctx: &CallContext,
        to: &[String],
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<()> {
        self.mailer.send(to, subject, body, html).await
    }

    fn log(&self, level: LogLevel, message: &str, fields: BTreeMap<String, Value>) {
        let plugin = fields
            .get("plugin")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let rendered = serde_json::to_string(&fields).unwrap_or_default();
        match level {
            LogLevel::Debug => tracing::debug!(%plugin, fields = %rendered, "{message}"),
            LogLevel::Info => tracing::info!(%plugin, fields = %rendered, "{message}"),
            LogLevel::Warn => tracing::warn!(%plugin, fields = %rendered, "{message}"),
            LogLevel::Error => tracing::error!(%plugin, fields = %rendered, "{message}"),
        }
        logring::global().record(plugin, level, message, fields);
    }

    async fn config_get(&self, _ctx: &CallContext, key: &str) -> Result<Option<String>> {
        self.config.get(key).await
    }

    async fn translate(&self, key: &str, args: &[Value]) -> String {
        self.translator
            .translate(key, args)
            .unwrap_or_else(|| key.to_string())
    }

    async fn call_plugin(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let caller = self
            .plugin_caller
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::internal("no plugin dispatcher attached"))?;
        caller.route(ctx, name, function, args).await
    }

    async fn publish_event(&self, _ctx: &CallContext, event_type: &str, data: Value) -> Result<()> {
        self.events.publish(event_type, data).await
    }
}

// Inert defaults so a partially wired deployment fails politely per call
// instead of at startup.

struct NullCache;

#[async_trait]
impl CacheStore for NullCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl_secs: u64) -> Result<()> {
        Err(Error::backend("no cache configured"))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(Error::backend("no cache configured"))
    }
}

struct NullHttp;

#[async_trait]
impl HttpFetcher for NullHttp {
    async fn fetch(
        &self,
        _method: &str,
        _url: &str,
        _headers: &HashMap<String, String>,
        _body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        Err(Error::backend("no http client configured"))
    }
}

struct NullMailer;

#[async_trait]
impl Mailer for NullMailer {
    async fn send(&self, _to: &[String], _subject: &str, _body: &str, _html: bool) -> Result<()> {
        Err(Error::backend("no mailer configured"))
    }
}

struct NullConfig;

#[async_trait]
impl ConfigSource for NullConfig {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

struct NullTranslator;

impl Translator for NullTranslator {
    fn translate(&self, _key: &str, _args: &[Value]) -> Option<String> {
        None
    }
}

struct NullEvents;

#[async_trait]
impl EventSink for NullEvents {
    async fn publish(&self, _event_type: &str, _data: Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_prefix_parsing() {
        assert_eq!(split_backend("SELECT 1"), (None, "SELECT 1"));
        assert_eq!(
            split_backend("@analytics:SELECT 1"),
            (Some("analytics"), "SELECT 1")
        );
        // The `@:` form is not a prefix.
        assert_eq!(split_backend("@:SELECT 1"), (None, "@:SELECT 1"));
        // No colon, no prefix.
        assert_eq!(split_backend("@analytics"), (None, "@analytics"));
    }

    #[test]
    fn binary_values_coerce_to_strings() {
        let mut row = DbRow::new();
        row.insert("blob".to_string(), DbValue::Bytes(b"hello".to_vec()));
        row.insert("n".to_string(), DbValue::Json(Value::from(3)));

        let coerced = coerce_row(row);
        assert_eq!(coerced["blob"], Value::String("hello".to_string()));
        assert_eq!(coerced["n"], Value::from(3));
    }

    struct OneRow;

    #[async_trait]
    impl Database for OneRow {
        async fn query(&self, _query: &str, _args: &[Value]) -> Result<Vec<DbRow>> {
            let mut row = DbRow::new();
            row.insert("x".to_string(), DbValue::Json(Value::from(1)));
            Ok(vec![row])
        }

        async fn exec(&self, _query: &str, _args: &[Value]) -> Result<u64> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn unknown_backend_is_distinct_from_none_configured() {
        let ctx = CallContext::root();

        let empty = HostFacade::builder().build();
        let err = empty.db_query(&ctx, "SELECT 1", &[]).await.unwrap_err();
        assert!(err.to_string().contains("no databases configured"));

        let facade = HostFacade::builder()
            .database("main", Arc::new(OneRow))
            .build();
        let err = facade
            .db_query(&ctx, "@missing:SELECT 1", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown database backend"));

        let rows = facade.db_query(&ctx, "SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn translate_falls_back_to_the_key() {
        let facade = HostFacade::builder().build();
        assert_eq!(facade.translate("greeting.hello", &[]).await, "greeting.hello");
    }
}
