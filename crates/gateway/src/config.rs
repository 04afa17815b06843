// Gateway configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "huntart_local_development_jwt_secret_must_be_32_chars";
const DEFAULT_READ_FLUSH_MS: u64 = 1000;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Which broadcast backend fans messages out to chat groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastBackend {
    /// Process-local maps. Single-node deployments and tests.
    Memory,
    /// Postgres LISTEN/NOTIFY with a shared membership table; required when
    /// more than one gateway process serves connections.
    Postgres,
}

/// Connection pool limits for the PostgreSQL stores.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

/// Core gateway configuration.
///
/// Constructed via [`GatewayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to verify access credentials.
    pub jwt_secret: String,
    /// PostgreSQL connection string. Absent means in-memory stores.
    pub database_url: Option<String>,
    /// Pool limits, only consulted when `database_url` is set.
    pub db: DbSettings,
    /// Broadcast backend selection.
    pub broadcast_backend: BroadcastBackend,
    /// Read-receipt flush interval.
    pub read_flush_interval: Duration,
    /// Log filter directive (e.g. `info`, `huntart_gateway=debug`).
    pub log_filter: String,
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HUNTART_GATEWAY_HOST` | `0.0.0.0` |
    /// | `HUNTART_GATEWAY_PORT` | `8080` |
    /// | `HUNTART_GATEWAY_JWT_SECRET` | dev-only placeholder |
    /// | `HUNTART_GATEWAY_DATABASE_URL` | *(none)* |
    /// | `HUNTART_GATEWAY_DB_MIN_CONNECTIONS` | `2` |
    /// | `HUNTART_GATEWAY_DB_MAX_CONNECTIONS` | `20` |
    /// | `HUNTART_GATEWAY_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `HUNTART_GATEWAY_BROADCAST` | `memory` |
    /// | `HUNTART_GATEWAY_READ_FLUSH_MS` | `1000` |
    /// | `HUNTART_GATEWAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("HUNTART_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("HUNTART_GATEWAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("HUNTART_GATEWAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("HUNTART_GATEWAY_DATABASE_URL").ok();

        let defaults = DbSettings::default();
        let db = DbSettings {
            min_connections: env("HUNTART_GATEWAY_DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_connections),
            max_connections: env("HUNTART_GATEWAY_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: env("HUNTART_GATEWAY_DB_ACQUIRE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        };

        let broadcast_backend = match env("HUNTART_GATEWAY_BROADCAST").as_deref() {
            Ok("postgres") => BroadcastBackend::Postgres,
            _ => BroadcastBackend::Memory,
        };

        let read_flush_interval = Duration::from_millis(
            env("HUNTART_GATEWAY_READ_FLUSH_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_READ_FLUSH_MS),
        );

        let log_filter = env("HUNTART_GATEWAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            db,
            broadcast_backend,
            read_flush_interval,
            log_filter,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = GatewayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.broadcast_backend, BroadcastBackend::Memory);
        assert_eq!(cfg.read_flush_interval, Duration::from_millis(1000));
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_HOST", "127.0.0.1");
        m.insert("HUNTART_GATEWAY_PORT", "3000");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn postgres_broadcast_backend() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_BROADCAST", "postgres");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.broadcast_backend, BroadcastBackend::Postgres);
    }

    #[test]
    fn unknown_broadcast_backend_falls_back_to_memory() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_BROADCAST", "kafka");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.broadcast_backend, BroadcastBackend::Memory);
    }

    #[test]
    fn read_flush_interval_override() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_READ_FLUSH_MS", "250");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.read_flush_interval, Duration::from_millis(250));
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_PORT", "not_a_number");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn db_settings_default_without_env_vars() {
        let cfg = GatewayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.db.min_connections, 2);
        assert_eq!(cfg.db.max_connections, 20);
        assert_eq!(cfg.db.acquire_timeout, Duration::from_secs(10));
    }

    #[test]
    fn db_settings_override() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_DB_MIN_CONNECTIONS", "1");
        m.insert("HUNTART_GATEWAY_DB_MAX_CONNECTIONS", "50");
        m.insert("HUNTART_GATEWAY_DB_ACQUIRE_TIMEOUT_SECS", "3");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.db.min_connections, 1);
        assert_eq!(cfg.db.max_connections, 50);
        assert_eq!(cfg.db.acquire_timeout, Duration::from_secs(3));
    }

    #[test]
    fn database_url_from_env() {
        let mut m = HashMap::new();
        m.insert("HUNTART_GATEWAY_DATABASE_URL", "postgres://u:p@host/huntart?sslmode=require");
        let cfg = GatewayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.as_deref().unwrap().contains("huntart"));
    }
}
