use std::time::Duration;

use serde::Deserialize;

/// Runtime mode, read from `NODE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "development" => Environment::Development,
            _ => Environment::Production,
        }
    }

    pub fn is_development(self) -> bool {
        self == Environment::Development
    }
}

/// Fixed driver parameters plus where to connect.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub url: Option<String>,
    pub default_db: String,
    pub max_pool_size: u32,
    pub server_selection_timeout: Duration,
    pub socket_timeout: Duration,
    pub ipv4_only: bool,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub heartbeat_interval: Duration,
    pub debug: bool,
}

impl DbSettings {
    pub const MAX_RETRIES: u32 = 5;
    pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            default_db: "coursehub".into(),
            max_pool_size: 10,
            server_selection_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(45),
            ipv4_only: true,
            max_retries: Self::MAX_RETRIES,
            retry_interval: Self::RETRY_INTERVAL,
            heartbeat_interval: Duration::from_secs(10),
            debug: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub client_url: Option<String>,
    pub body_limit: usize,
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            environment,
            client_url: None,
            body_limit: 10 * 1024,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbSettings,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_env_value(std::env::var("NODE_ENV").ok().as_deref());

        let mut db = DbSettings::new(
            std::env::var("MONGO_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        );
        if let Ok(name) = std::env::var("MONGO_DB") {
            db.default_db = name;
        }
        db.heartbeat_interval = Duration::from_secs(
            std::env::var("DB_HEARTBEAT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(10),
        );
        db.debug = environment.is_development();

        let mut server = ServerConfig::new(environment);
        server.host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        server.port = match std::env::var("PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| anyhow::anyhow!("invalid PORT {v:?}: {e}"))?,
            Err(_) => 5000,
        };
        server.client_url = std::env::var("CLIENT_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Self { db, server })
    }
}
