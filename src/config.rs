use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 1800;

/// Server configuration, loaded once at startup from the environment and
/// held immutably for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite database path.
    pub database: PathBuf,
    pub presence_ttl_seconds: u64,
    /// Shared secret for the signed proxy auth context. Proxy mode is
    /// disabled when unset.
    pub internal_auth_secret: Option<String>,
}

/// CLI overrides applied on top of the environment.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<PathBuf>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env(overrides: ConfigOverrides) -> Result<Self> {
        let database = overrides
            .database
            .or_else(|| env_var("BEADHUB_DATABASE_URL").map(PathBuf::from))
            .or_else(|| env_var("DATABASE_URL").map(PathBuf::from))
            .ok_or_else(|| Error::Config("DATABASE_URL is required".to_string()))?;

        let host = overrides
            .host
            .or_else(|| env_var("HOST"))
            .unwrap_or_else(default_host);

        let port = match overrides.port {
            Some(p) => p,
            None => match env_var("PORT") {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid PORT: {raw}")))?,
                None => default_port(),
            },
        };

        let presence_ttl_seconds = match env_var("PRESENCE_TTL_SECONDS") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid PRESENCE_TTL_SECONDS: {raw}")))?,
            None => DEFAULT_PRESENCE_TTL_SECONDS,
        };

        // SESSION_SECRET_KEY is the fallback for embedded proxy deployments
        // that sign X-BH-Auth with the session secret.
        let internal_auth_secret = env_var("BEADHUB_INTERNAL_AUTH_SECRET")
            .or_else(|| env_var("INTERNAL_AUTH_SECRET"))
            .or_else(|| env_var("SESSION_SECRET_KEY"));

        Ok(Self {
            host,
            port,
            database,
            presence_ttl_seconds,
            internal_auth_secret,
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid host/port: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_parses() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 9999,
            database: PathBuf::from(":memory:"),
            presence_ttl_seconds: DEFAULT_PRESENCE_TTL_SECONDS,
            internal_auth_secret: None,
        };
        assert_eq!(config.socket_addr().unwrap().port(), 9999);
    }

    #[test]
    fn bad_host_is_config_error() {
        let config = Config {
            host: "not a host".to_string(),
            port: 1,
            database: PathBuf::from(":memory:"),
            presence_ttl_seconds: DEFAULT_PRESENCE_TTL_SECONDS,
            internal_auth_secret: None,
        };
        assert!(config.socket_addr().is_err());
    }
}
