//! Per-plugin capability enforcement.
//!
//! One [`Sandbox`] wraps the host facade for each plugin and applies up to
//! four stages, in order: status-and-permission check, scope match,
//! rate-limit token draw, delegation with accounting. `log` and `translate`
//! are always allowed; everything else consults the plugin's
//! [`ResourcePolicy`], which can be swapped atomically while calls are in
//! flight (an in-flight call keeps the policy it started with).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use trellis_core::{Error, Result};
use trellis_plugin_api::host::{CallContext, HostApi, HttpResponse, LogLevel, MAX_CALL_DEPTH, Row};
use trellis_plugin_api::policy::{AccessLevel, PermissionType, PolicyStatus, ResourcePolicy};

use crate::host::HostFacade;
use crate::limiter::SlidingWindow;
use crate::usage::{UsageCounters, UsageSnapshot};

/// DDL keywords refused without `db:write`.
const DDL_KEYWORDS: [&str; 6] = ["DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE"];

/// Substrings marking a config key as sensitive when no explicit scope is
/// granted.
const SENSITIVE_CONFIG_SUBSTRINGS: [&str; 17] = [
    "password",
    "passwd",
    "secret",
    "token",
    "credential",
    "private_key",
    "api_key",
    "apikey",
    "access_key",
    "signing",
    "aws_",
    "gcp_",
    "azure_",
    "smtp_",
    "imap_",
    "database_url",
    "dsn",
];

/// Case-sensitive `*` wildcard match; callers fold case first.
fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut pi, mut vi) = (0_usize, 0_usize);
    let mut star: Option<usize> = None;
    let mut mark = 0_usize;

    while vi < value.len() {
        if pi < pattern.len() && pattern[pi] != '*' && pattern[pi] == value[vi] {
            pi += 1;
            vi += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            mark = vi;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            vi = mark;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// First DDL keyword appearing as a whole word in the query, if any.
fn contains_ddl(query: &str) -> Option<&'static str> {
    for token in query.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if token.is_empty() {
            continue;
        }
        let upper = token.to_ascii_uppercase();
        if let Some(kw) = DDL_KEYWORDS.iter().find(|kw| **kw == upper) {
            return Some(kw);
        }
    }
    None
}

/// Extract table names from SQL-shaped queries, case-folded.
///
/// Recognizes FROM / JOIN / INTO / UPDATE / DELETE FROM / CREATE|DROP|ALTER
/// TABLE / TRUNCATE shapes, including comma-separated FROM lists. This is
/// defense in depth, not a SQL parser; the backend must still enforce
/// parameterized queries.
fn extract_tables(query: &str) -> Vec<String> {
    fn clean(token: &str) -> Option<String> {
        let trimmed = token
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == ';' || c == ')')
            .trim();
        if trimmed.is_empty() || trimmed.starts_with('(') {
            return None;
        }
        Some(trimmed.to_ascii_lowercase())
    }

    let tokens: Vec<&str> = query.split_whitespace().collect();
    let mut tables = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let word = tokens[i].to_ascii_lowercase();
        let captures = match word.as_str() {
            "from" | "join" | "into" | "update" => true,
            "table" => true,
            "truncate" => {
                // TRUNCATE TABLE t is handled by the "table" arm.
                tokens
                    .get(i + 1)
                    .is_none_or(|next| !next.eq_ignore_ascii_case("table"))
            }
            _ => false,
        };
        if captures {
            let mut j = i + 1;
            while j < tokens.len() {
                let raw = tokens[j];
                if let Some(table) = clean(raw.trim_end_matches(',')) {
                    tables.push(table);
                }
                // A trailing comma continues a FROM list.
                if raw.ends_with(',') {
                    j += 1;
                } else {
                    break;
                }
            }
            i = j;
        }
        i += 1;
    }
    tables
}

/// Whether `host` matches the scope patterns, case-insensitively.
///
/// A bare pattern matches that host exactly; a leading `*.` matches the
/// parent host and any subdomain. An empty scope allows any host.
fn host_allowed(patterns: &[&str], host: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let host = host.to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        if let Some(suffix) = pattern.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            host == pattern
        }
    })
}

/// Whether `address` matches the scope: exact address or `@domain` suffix.
/// An empty scope allows any recipient.
fn email_allowed(patterns: &[&str], address: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let address = address.to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        if pattern.starts_with('@') {
            address.ends_with(&pattern)
        } else {
            address == pattern
        }
    })
}

/// Whether `key` may be read: explicit scope wins; without one, keys
/// containing a known-sensitive substring are refused.
fn config_key_allowed(patterns: &[&str], key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    if !patterns.is_empty() {
        return patterns
            .iter()
            .any(|pattern| glob_match(&pattern.to_ascii_lowercase(), &key));
    }
    !SENSITIVE_CONFIG_SUBSTRINGS
        .iter()
        .any(|needle| key.contains(needle))
}

struct Limiters {
    db: SlidingWindow,
    http: SlidingWindow,
    calls: SlidingWindow,
}

impl Limiters {
    fn for_policy(policy: &ResourcePolicy) -> Self {
        Self {
            db: SlidingWindow::per_minute(policy.max_db_per_minute),
            http: SlidingWindow::per_minute(policy.max_http_per_minute),
            calls: SlidingWindow::per_second(policy.max_calls_per_second),
        }
    }
}

/// The per-plugin gate between a plugin and the host facade.
pub struct Sandbox {
    plugin_name: String,
    facade: Arc<HostFacade>,
    policy: RwLock<Arc<ResourcePolicy>>,
    limiters: RwLock<Arc<Limiters>>,
    usage: Arc<UsageCounters>,
}

impl Sandbox {
    /// A sandbox for `plugin_name` enforcing `policy` in front of `facade`.
    #[must_use]
    pub fn new(plugin_name: impl Into<String>, facade: Arc<HostFacade>, policy: ResourcePolicy) -> Arc<Self> {
        let limiters = Limiters::for_policy(&policy);
        Arc::new(Self {
            plugin_name: plugin_name.into(),
            facade,
            policy: RwLock::new(Arc::new(policy)),
            limiters: RwLock::new(Arc::new(limiters)),
            usage: Arc::new(UsageCounters::new()),
        })
    }

    /// The plugin this sandbox belongs to.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// The policy currently in force.
    #[must_use]
    pub fn policy(&self) -> Arc<ResourcePolicy> {
        Arc::clone(&self.policy.read())
    }

    /// Swap the policy. In-flight calls keep the policy they started with;
    /// the limiters are rebuilt and old token windows decay with the old
    /// limiter.
    pub fn set_policy(&self, policy: ResourcePolicy) {
        let limiters = Limiters::for_policy(&policy);
        *self.limiters.write() = Arc::new(limiters);
        *self.policy.write() = Arc::new(policy);
    }

    /// Current usage snapshot.
    #[must_use]
    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    fn limiters(&self) -> Arc<Limiters> {
        Arc::clone(&self.limiters.read())
    }

    /// Stage 1: status and permission.
    fn check(&self, kind: PermissionType, access: AccessLevel) -> Result<Arc<ResourcePolicy>> {
        let policy = self.policy();
        if policy.status == PolicyStatus::Blocked {
            return Err(Error::permission_denied(format!(
                "plugin '{}' is blocked",
                self.plugin_name
            )));
        }
        if !policy.grants(kind, access) {
            return Err(Error::permission_denied(format!(
                "plugin '{}' lacks permission {}",
                self.plugin_name,
                permission_label(kind, access)
            )));
        }
        Ok(policy)
    }

    /// Stage 2 for database calls: DDL refusal and table allowlist.
    fn guard_db(&self, policy: &ResourcePolicy, query: &str) -> Result<()> {
        if !policy.grants(PermissionType::Db, AccessLevel::Write) {
            if let Some(keyword) = contains_ddl(query) {
                return Err(Error::permission_denied(format!(
                    "plugin '{}': {keyword} requires db:write",
                    self.plugin_name
                )));
            }
        }
        let scope = policy.scope_for(PermissionType::Db);
        if scope.is_empty() {
            return Ok(());
        }
        for table in extract_tables(query) {
            let allowed = scope
                .iter()
                .any(|pattern| glob_match(&pattern.to_ascii_lowercase(), &table));
            if !allowed {
                return Err(Error::permission_denied(format!(
                    "plugin '{}': table '{table}' is not in the allowlist",
                    self.plugin_name
                )));
            }
        }
        Ok(())
    }

    fn namespaced_key(&self, key: &str) -> String {
        format!("plugin:{}:{key}", self.plugin_name)
    }

    fn note_err<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.usage.record_error();
        }
        result
    }

    async fn db_query_checked(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<Vec<Row>> {
        let policy = self.check(PermissionType::Db, AccessLevel::Read)?;
        self.guard_db(&policy, query)?;
        if !self.limiters().db.allow() {
            return Err(Error::rate_limited(format!(
                "db queries for plugin '{}'",
                self.plugin_name
            )));
        }
        self.usage.record_query();
        self.facade.db_query(ctx, query, args).await
    }

    async fn db_exec_checked(
        &self,
        ctx: &CallContext,
        query: &str,
        args: &[Value],
    ) -> Result<u64> {
        let policy = self.check(PermissionType::Db, AccessLevel::Write)?;
        self.guard_db(&policy, query)?;
        if !self.limiters().db.allow() {
            return Err(Error::rate_limited(format!(
                "db statements for plugin '{}'",
                self.plugin_name
            )));
        }
        self.usage.record_exec();
        self.facade.db_exec(ctx, query, args).await
    }

    async fn http_checked(
        &self,
        ctx: &CallContext,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let policy = self.check(PermissionType::Http, AccessLevel::Read)?;
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::bad_input(format!("malformed url '{url}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::bad_input(format!("url '{url}' has no host")))?;
        let scope = policy.scope_for(PermissionType::Http);
        if !host_allowed(&scope, host) {
            return Err(Error::permission_denied(format!(
                "plugin '{}': host '{host}' is not in scope",
                self.plugin_name
            )));
        }
        if !self.limiters().http.allow() {
            return Err(Error::rate_limited(format!(
                "http requests for plugin '{}'",
                self.plugin_name
            )));
        }
        self.usage.record_http();
        self.facade.http_request(ctx, method, url, headers, body).await
    }

    async fn email_checked(
        &self,
        ctx: &CallContext,
        to: &[String],
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<()> {
        let policy = self.check(PermissionType::Email, AccessLevel::Write)?;
        let scope = policy.scope_for(PermissionType::Email);
        for recipient in to {
            if !email_allowed(&scope, recipient) {
                return Err(Error::permission_denied(format!(
                    "plugin '{}': recipient '{recipient}' is not in scope",
                    self.plugin_name
                )));
            }
        }
        self.usage.record_email();
        self.facade.send_email(ctx, to, subject, body, html).await
    }

    async fn config_checked(&self, ctx: &CallContext, key: &str) -> Result<Option<String>> {
        let policy = self.check(PermissionType::Config, AccessLevel::Read)?;
        let scope = policy.scope_for(PermissionType::Config);
        if !config_key_allowed(&scope, key) {
            return Err(Error::permission_denied(format!(
                "plugin '{}': config key '{key}' is restricted",
                self.plugin_name
            )));
        }
        self.facade.config_get(ctx, key).await
    }

    async fn call_plugin_checked(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let policy = self.check(PermissionType::PluginCall, AccessLevel::Read)?;
        if ctx.depth >= MAX_CALL_DEPTH {
            return Err(Error::CallDepthExceeded {
                source_plugin: self.plugin_name.clone(),
                target: name.to_string(),
                depth: ctx.depth,
            });
        }
        let scope = policy.scope_for(PermissionType::PluginCall);
        let allowed = scope.iter().any(|entry| *entry == "*" || *entry == name);
        if !allowed {
            return Err(Error::permission_denied(format!(
                "plugin '{}' may not call plugin '{name}'",
                self.plugin_name
            )));
        }
        if !self.limiters().calls.allow() {
            return Err(Error::rate_limited(format!(
                "plugin calls for plugin '{}'",
                self.plugin_name
            )));
        }
        self.usage.record_plugin_call();
        let hopped = ctx.hop(self.plugin_name.clone());
        self.facade.call_plugin(&hopped, name, function, args).await
    }
}

fn permission_label(kind: PermissionType, access: AccessLevel) -> String {
    let kind = match kind {
        PermissionType::Db => "db",
        PermissionType::Cache => "cache",
        PermissionType::Http => "http",
        PermissionType::Email => "email",
        PermissionType::Config => "config",
        PermissionType::PluginCall => "plugin_call",
    };
    if matches!(access, AccessLevel::ReadWrite) {
        kind.to_string()
    } else {
        let access = match access {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::ReadWrite => "readwrite",
        };
        format!("{kind}:{access}")
    }
}

#[async_trait]
impl HostApi for Sandbox {
    async fn db_query(&self, ctx: &CallContext, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        let result = self.db_query_checked(ctx, query, args).await;
        self.note_err(result)
    }

    async fn db_exec(&self, ctx: &CallContext, query: &str, args: &[Value]) -> Result<u64> {
        let result = self.db_exec_checked(ctx, query, args).await;
        self.note_err(result)
    }

    async fn cache_get(&self, ctx: &CallContext, key: &str) -> Result<Option<Vec<u8>>> {
        let result = match self.check(PermissionType::Cache, AccessLevel::Read) {
            Ok(_) => {
                self.usage.record_cache_op();
                self.facade.cache_get(ctx, &self.namespaced_key(key)).await
            }
            Err(e) => Err(e),
        };
        self.note_err(result)
    }

    async fn cache_set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<()> {
        let result = match self.check(PermissionType::Cache, AccessLevel::Write) {
            Ok(_) => {
                self.usage.record_cache_op();
                self.facade
                    .cache_set(ctx, &self.namespaced_key(key), value, ttl_secs)
                    .await
            }
            Err(e) => Err(e),
        };
        self.note_err(result)
    }

    async fn cache_delete(&self, ctx: &CallContext, key: &str) -> Result<()> {
        let result = match self.check(PermissionType::Cache, AccessLevel::Write) {
            Ok(_) => {
                self.usage.record_cache_op();
                self.facade.cache_delete(ctx, &self.namespaced_key(key)).await
            }
            Err(e) => Err(e),
        };
        self.note_err(result)
    }

    async fn http_request(
        &self,
        ctx: &CallContext,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let result = self.http_checked(ctx, method, url, headers, body).await;
        self.note_err(result)
    }

    async fn send_email(
        &self,
        ctx: &CallContext,
        to: &[String],
        subject: &str,
        body: &str,
        html: bool,
    ) -> Result<()> {
        let result = self.email_checked(ctx, to, subject, body, html).await;
        self.note_err(result)
    }

    fn log(&self, level: LogLevel, message: &str, mut fields: BTreeMap<String, Value>) {
        // Stamp the plugin name so the ring can filter even when the plugin
        // forgot to.
        fields.insert(
            "plugin".to_string(),
            Value::String(self.plugin_name.clone()),
        );
        self.facade.log(level, message, fields);
    }

    async fn config_get(&self, ctx: &CallContext, key: &str) -> Result<Option<String>> {
        let result = self.config_checked(ctx, key).await;
        self.note_err(result)
    }

    async fn translate(&self, key: &str, args: &[Value]) -> String {
        self.facade.translate(key, args).await
    }

    async fn call_plugin(
        &self,
        ctx: &CallContext,
        name: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let result = self.call_plugin_checked(ctx, name, function, args).await;
        self.note_err(result)
    }

    async fn publish_event(&self, ctx: &CallContext, event_type: &str, data: Value) -> Result<()> {
        let result = if self.policy().status == PolicyStatus::Blocked {
            Err(Error::permission_denied(format!(
                "plugin '{}' is blocked",
                self.plugin_name
            )))
        } else {
            self.usage.record_event();
            self.facade.publish_event(ctx, event_type, data).await
        };
        self.note_err(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("user_*", "user_profile"));
        assert!(glob_match("user_*", "user_"));
        assert!(!glob_match("user_*", "users"));
        assert!(glob_match("*_log", "audit_log"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "ab"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn ddl_detection_is_whole_word() {
        assert_eq!(contains_ddl("DROP TABLE users"), Some("DROP"));
        assert_eq!(contains_ddl("drop table users"), Some("DROP"));
        assert_eq!(contains_ddl("SELECT * FROM dropped_items"), None);
        assert_eq!(contains_ddl("SELECT created_at FROM t"), None);
        assert_eq!(contains_ddl("TRUNCATE audit"), Some("TRUNCATE"));
        assert_eq!(contains_ddl("SELECT 1"), None);
    }

    #[test]
    fn table_extraction() {
        assert_eq!(extract_tables("SELECT * FROM users"), vec!["users"]);
        assert_eq!(
            extract_tables("SELECT * FROM users JOIN ticket ON users.id = ticket.uid"),
            vec!["users", "ticket"]
        );
        assert_eq!(
            extract_tables("SELECT * FROM a, b WHERE a.id = b.id"),
            vec!["a", "b"]
        );
        assert_eq!(extract_tables("INSERT INTO audit_log VALUES (1)"), vec!["audit_log"]);
        assert_eq!(extract_tables("UPDATE ticket SET x = 1"), vec!["ticket"]);
        assert_eq!(extract_tables("DELETE FROM sessions"), vec!["sessions"]);
        assert_eq!(extract_tables("CREATE TABLE widgets (id int)"), vec!["widgets"]);
        assert_eq!(extract_tables("TRUNCATE TABLE audit"), vec!["audit"]);
        assert_eq!(extract_tables("TRUNCATE audit"), vec!["audit"]);
        assert_eq!(extract_tables("SELECT * FROM \"Users\""), vec!["users"]);
    }

    #[test]
    fn host_patterns() {
        let scope = ["*.example.com", "api.other.test"];
        assert!(host_allowed(&scope, "api.example.com"));
        assert!(host_allowed(&scope, "example.com"));
        assert!(host_allowed(&scope, "deep.sub.example.com"));
        assert!(host_allowed(&scope, "API.EXAMPLE.COM"));
        assert!(host_allowed(&scope, "api.other.test"));
        assert!(!host_allowed(&scope, "other.test"));
        assert!(!host_allowed(&scope, "evil.test"));
        assert!(!host_allowed(&scope, "notexample.com"));
        assert!(host_allowed(&[], "anything.at.all"));
    }

    #[test]
    fn email_patterns() {
        let scope = ["ops@corp.test", "@example.com"];
        assert!(email_allowed(&scope, "ops@corp.test"));
        assert!(email_allowed(&scope, "anyone@example.com"));
        assert!(email_allowed(&scope, "Anyone@Example.COM"));
        assert!(!email_allowed(&scope, "other@corp.test"));
        assert!(!email_allowed(&scope, "anyone@notexample.com"));
        assert!(email_allowed(&[], "anyone@anywhere.test"));
    }

    #[test]
    fn sensitive_config_keys_without_scope() {
        assert!(config_key_allowed(&[], "site_title"));
        assert!(config_key_allowed(&[], "items_per_page"));
        assert!(!config_key_allowed(&[], "database_password"));
        assert!(!config_key_allowed(&[], "SMTP_HOST"));
        assert!(!config_key_allowed(&[], "aws_region"));
        assert!(!config_key_allowed(&[], "session_secret"));
        assert!(!config_key_allowed(&[], "oauth_token_url"));
    }

    #[test]
    fn explicit_config_scope_wins() {
        let scope = ["mail_*"];
        assert!(config_key_allowed(&scope, "mail_from"));
        assert!(!config_key_allowed(&scope, "site_title"));
        // Scope can deliberately expose a key the heuristic would refuse.
        let scope = ["smtp_host"];
        assert!(config_key_allowed(&scope, "smtp_host"));
        assert!(!config_key_allowed(&scope, "smtp_password"));
    }

    #[test]
    fn permission_labels_read_naturally() {
        assert_eq!(
            permission_label(PermissionType::Db, AccessLevel::Write),
            "db:write"
        );
        assert_eq!(
            permission_label(PermissionType::Http, AccessLevel::ReadWrite),
            "http"
        );
    }
}
