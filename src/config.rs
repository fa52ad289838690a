use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::auth::Credentials;

/// Server settings, read from `PARKD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Session user allowed to create, resize and delete lots.
    pub admin_user: String,
    pub admin_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "parkd".into(),
            admin_user: "admin".into(),
            admin_password: "parkd-admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults; unparseable numbers are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "PARKD_PORT").unwrap_or(defaults.port),
            bind: lookup("PARKD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("PARKD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("PARKD_PASSWORD").unwrap_or(defaults.password),
            admin_user: lookup("PARKD_ADMIN_USER").unwrap_or(defaults.admin_user),
            admin_password: lookup("PARKD_ADMIN_PASSWORD").unwrap_or(defaults.admin_password),
            max_connections: parsed(&lookup, "PARKD_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "PARKD_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "PARKD_METRICS_PORT"),
            tls_cert: lookup("PARKD_TLS_CERT"),
            tls_key: lookup("PARKD_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            password: self.password.clone(),
            admin_user: self.admin_user.clone(),
            admin_password: self.admin_password.clone(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}
