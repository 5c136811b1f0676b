//! Configuration types for usenetdav
//!
//! Configuration layers the same way the teacher's `config::Config` does:
//! nested sub-config structs, each with a `Default` impl and per-field
//! `#[serde(default = "...")]` fallbacks so a partially-specified config
//! (loaded from the key/value config table, or overlaid with `USENETDAV_*`
//! environment variables) still produces sane values for anything omitted.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a [`crate::server::VirtualUsenetServer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Candidate NNTP providers, in configured priority order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Connection pooling and admission-control tuning.
    #[serde(default)]
    pub pool: PoolConfig,

    /// On-demand streaming reader tuning.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// History archival and hard-delete retention.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// WebDAV credential configuration (hashed, never stored plaintext).
    #[serde(default)]
    pub webdav: WebdavConfig,

    /// Path to the SQLite metadata database file.
    #[serde(default = "default_database_path")]
    pub database_path: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            pool: PoolConfig::default(),
            streaming: StreamingConfig::default(),
            retention: RetentionConfig::default(),
            webdav: WebdavConfig::default(),
            database_path: default_database_path(),
        }
    }
}

impl Config {
    /// Overlay `USENETDAV_*` environment variables onto `self`.
    ///
    /// Mirrors the teacher's env-var convention but scoped to the handful
    /// of settings an operator is likely to override outside the config
    /// table: the database path and the webdav credential hash inputs.
    pub fn apply_env_overlay(mut self) -> Self {
        if let Ok(path) = std::env::var("USENETDAV_DATABASE_PATH") {
            self.database_path = path.into();
        }
        if let Ok(user) = std::env::var("USENETDAV_WEBDAV_USERNAME") {
            self.webdav.username = user;
        }
        if let Ok(pass) = std::env::var("USENETDAV_WEBDAV_PASSWORD") {
            self.webdav.password_hash = WebdavConfig::hash_password(&pass, &self.webdav.salt);
        }
        self
    }

    /// Validate cross-field invariants that a single field's `Default`
    /// can't express: at least one provider, a sane streaming reserve
    /// fraction, and a non-empty webdav username.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::Config {
                message: "at least one provider must be configured".into(),
                key: Some("providers".into()),
            });
        }
        if !(0.0..=1.0).contains(&self.pool.streaming_reserve_fraction) {
            return Err(Error::Config {
                message: "streaming_reserve_fraction must be in [0.0, 1.0]".into(),
                key: Some("pool.streaming_reserve_fraction".into()),
            });
        }
        if self.webdav.username.is_empty() {
            return Err(Error::Config {
                message: "webdav username must not be empty".into(),
                key: Some("webdav.username".into()),
            });
        }
        Ok(())
    }
}

/// The role a provider plays in failover ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    /// Tried first, in priority order.
    Primary,
    /// Only tried once every primary has failed for a given article.
    Backup,
}

/// A single configured NNTP provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Server hostname (e.g. "news.example.com").
    pub host: String,
    /// Server port (typically 119 plain, 563 TLS).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use TLS.
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Authentication username, if the provider requires it.
    #[serde(default)]
    pub username: Option<String>,
    /// Authentication password, if the provider requires it.
    #[serde(default)]
    pub password: Option<String>,
    /// Maximum simultaneous connections to this provider.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Lower values are tried first among providers of the same role.
    #[serde(default)]
    pub priority: i32,
    /// Whether this provider is a primary or a failover backup.
    #[serde(default = "default_role")]
    pub role: ProviderRole,
}

fn default_port() -> u16 {
    563
}
fn default_tls() -> bool {
    true
}
fn default_max_connections() -> usize {
    10
}
fn default_role() -> ProviderRole {
    ProviderRole::Primary
}

impl From<ProviderConfig> for nntp_rs::ServerConfig {
    fn from(config: ProviderConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host,
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: false,
            username: config.username.unwrap_or_default(),
            password: config.password.unwrap_or_default(),
        }
    }
}

/// Connection-pool and admission-control tuning, shared across all providers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Fraction of a provider's `max_connections` reserved so `Streaming`
    /// leases can always obtain a slot even when `Queue` work saturates
    /// the pool. Computed per-provider as `ceil(max * streaming_reserve_fraction)`.
    #[serde(default = "default_streaming_reserve_fraction")]
    pub streaming_reserve_fraction: f64,

    /// How long an idle pooled connection is kept before being dropped.
    #[serde(default = "default_idle_timeout", with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Bytes transferred on a connection before it is recycled, bounding
    /// the blast radius of a provider silently degrading mid-session.
    #[serde(default = "default_max_bytes_per_connection")]
    pub max_bytes_per_connection: u64,

    /// Connection attempts before a provider is marked unhealthy.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// How long an unhealthy provider is skipped before being retried.
    #[serde(default = "default_unhealthy_cooldown", with = "duration_serde")]
    pub unhealthy_cooldown: Duration,

    /// Per-article fetch timeout.
    #[serde(default = "default_article_timeout", with = "duration_serde")]
    pub article_timeout: Duration,

    /// How long a caller waits for a pool lease before `PoolExhausted`.
    #[serde(default = "default_acquire_timeout", with = "duration_serde")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            streaming_reserve_fraction: default_streaming_reserve_fraction(),
            idle_timeout: default_idle_timeout(),
            max_bytes_per_connection: default_max_bytes_per_connection(),
            connect_retries: default_connect_retries(),
            unhealthy_cooldown: default_unhealthy_cooldown(),
            article_timeout: default_article_timeout(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

fn default_streaming_reserve_fraction() -> f64 {
    0.2
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_max_bytes_per_connection() -> u64 {
    10 * 1024 * 1024 * 1024
}
fn default_connect_retries() -> u32 {
    3
}
fn default_unhealthy_cooldown() -> Duration {
    Duration::from_secs(60)
}
fn default_article_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

/// On-demand streaming reader tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Maximum number of segments prefetched concurrently ahead of the
    /// reader's current offset.
    #[serde(default = "default_streaming_prefetch")]
    pub prefetch: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            prefetch: default_streaming_prefetch(),
        }
    }
}

fn default_streaming_prefetch() -> usize {
    4
}

/// History archival and hard-delete retention.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Hours an archived history item is kept before hard deletion.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// Interval between retention sweeps.
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_retention_hours() -> i64 {
    24
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

/// WebDAV credential configuration.
///
/// The password is never stored in plaintext: only a salted SHA-256 hash
/// is kept, the same discipline the teacher applies to its own cached
/// credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebdavConfig {
    /// WebDAV basic-auth username.
    #[serde(default = "default_webdav_username")]
    pub username: String,
    /// Per-installation salt mixed into the password hash.
    #[serde(default = "default_salt")]
    pub salt: String,
    /// Salted SHA-256 hash of the WebDAV password, hex-encoded.
    #[serde(default)]
    pub password_hash: String,
}

impl Default for WebdavConfig {
    fn default() -> Self {
        Self {
            username: default_webdav_username(),
            salt: default_salt(),
            password_hash: String::new(),
        }
    }
}

fn default_webdav_username() -> String {
    "usenetdav".to_string()
}
fn default_salt() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl WebdavConfig {
    /// Hash a plaintext password with the configured salt.
    pub fn hash_password(password: &str, salt: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Check a plaintext password against the stored hash.
    pub fn verify_password(&self, password: &str) -> bool {
        !self.password_hash.is_empty()
            && Self::hash_password(password, &self.salt) == self.password_hash
    }
}

fn default_database_path() -> std::path::PathBuf {
    std::path::PathBuf::from("./usenetdav.db")
}

/// `serde(with = "duration_serde")` helper: (de)serializes a [`Duration`]
/// as whole seconds, matching the teacher's own `duration_serde` module.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_provider() -> ProviderConfig {
        ProviderConfig {
            host: "news.example.com".into(),
            port: default_port(),
            tls: true,
            username: Some("user".into()),
            password: Some("pass".into()),
            max_connections: 10,
            priority: 0,
            role: ProviderRole::Primary,
        }
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let restored: Config = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.pool.streaming_reserve_fraction, 0.2);
        assert_eq!(restored.retention.retention_hours, 24);
    }

    #[test]
    fn validate_rejects_empty_providers() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string().contains("provider"), true);
    }

    #[test]
    fn validate_accepts_minimal_valid_config() {
        let mut config = Config::default();
        config.providers.push(sample_provider());
        config.webdav.username = "admin".into();
        config.validate().expect("should be valid");
    }

    #[test]
    fn provider_config_converts_to_nntp_rs_server_config() {
        let provider = sample_provider();
        let server: nntp_rs::ServerConfig = provider.into();
        assert_eq!(server.host, "news.example.com");
        assert_eq!(server.port, 563);
        assert!(server.tls);
    }

    #[test]
    fn webdav_password_hash_round_trips() {
        let mut webdav = WebdavConfig::default();
        webdav.password_hash = WebdavConfig::hash_password("hunter2", &webdav.salt);
        assert!(webdav.verify_password("hunter2"));
        assert!(!webdav.verify_password("wrong"));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let json = r#"{"providers": [{"host": "news.example.com"}]}"#;
        let config: Config = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.providers[0].port, 563);
        assert_eq!(config.providers[0].max_connections, 10);
        assert_eq!(config.pool.streaming_reserve_fraction, 0.2);
    }

    #[test]
    fn env_overlay_applies_database_path() {
        // SAFETY: test runs single-threaded within this process's env var scope.
        unsafe {
            std::env::set_var("USENETDAV_DATABASE_PATH", "/tmp/usenetdav-test.db");
        }
        let config = Config::default().apply_env_overlay();
        assert_eq!(
            config.database_path,
            std::path::PathBuf::from("/tmp/usenetdav-test.db")
        );
        unsafe {
            std::env::remove_var("USENETDAV_DATABASE_PATH");
        }
    }
}
