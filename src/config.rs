//! Store connection configuration.
//!
//! Connection details come from the environment the same way every host
//! process expects them:
//!
//! | Variable          | Default     |
//! |-------------------|-------------|
//! | `REDIS_HOST`      | `127.0.0.1` |
//! | `REDIS_PORT`      | `6379`      |
//! | `REDIS_PASSWORD`  | none        |
//! | `REDIS_DB`        | `0`         |
//! | `APP_NAME`        | empty       |
//! | `REDIS_POOL_SIZE` | `16`        |
//!
//! `APP_NAME` becomes the key namespace so that several applications can
//! share one store without seeing each other's queues.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default store host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default store port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Default time allowed to open a new connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host name or address.
    pub host: String,
    /// Store TCP port.
    pub port: u16,
    /// Optional password (`AUTH`).
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
    /// Prefix isolating this application's keys.
    #[serde(default)]
    pub namespace: String,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
    /// Time allowed to open a new connection.
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: None,
            db: 0,
            namespace: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// Empty values count as unset. A database index or port that does not
    /// parse falls back to its default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            host: get("REDIS_HOST").unwrap_or(defaults.host),
            port: get("REDIS_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            password: get("REDIS_PASSWORD"),
            db: get("REDIS_DB")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            namespace: get("APP_NAME").unwrap_or_default(),
            pool_size: get("REDIS_POOL_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.pool_size),
            connect_timeout: defaults.connect_timeout,
        }
    }

    /// Sets the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the database index.
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Sets the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Renders the connection URL understood by the redis client.
    ///
    /// The password is percent-encoded and IPv6 hosts are bracketed.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.url_host(),
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.url_host(), self.port, self.db),
        }
    }

    /// Same as [`redis_url`](Self::redis_url) with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        match self.password {
            Some(_) => format!("redis://:***@{}:{}/{}", self.url_host(), self.port, self.db),
            None => self.redis_url(),
        }
    }

    fn url_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}
