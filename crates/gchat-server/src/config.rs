//! Server configuration loaded from `GCHAT_*` environment variables.
//!
//! Every setting has a default so the server starts with no configuration
//! for local development. Unparseable values fall back with a warning.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use gchat_api::rate_limit::RateLimitConfig;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!("unknown environment {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Env: `GCHAT_HOST`, `GCHAT_PORT`. Default: `0.0.0.0:4000`
    pub addr: SocketAddr,
    /// Env: `GCHAT_DB_PATH`. Default: `gchat.db`
    pub db_path: PathBuf,
    /// Deadline for a single store call.
    /// Env: `GCHAT_DB_TIMEOUT_SECS`. Default: 5
    pub db_timeout: Duration,
    /// Env: `GCHAT_ENVIRONMENT`. Default: development
    pub environment: Environment,
    /// Space separated. Env: `GCHAT_CORS_TRUSTED_ORIGINS`
    pub cors_trusted_origins: Vec<String>,
    /// Env: `GCHAT_LIMITER_ENABLED`, `GCHAT_LIMITER_RPS`, `GCHAT_LIMITER_BURST`
    pub limiter: RateLimitConfig,
    /// Env: `GCHAT_MAILER_SENDER`
    pub mailer_sender: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4000),
            db_path: PathBuf::from("gchat.db"),
            db_timeout: Duration::from_secs(5),
            environment: Environment::Development,
            cors_trusted_origins: Vec::new(),
            limiter: RateLimitConfig::default(),
            mailer_sender: "gchat <no-reply@gchat.local>".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; keys carry the `GCHAT_` prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let mut host = config.addr.ip();
        parse_into(&lookup, "GCHAT_HOST", &mut host);
        let mut port = config.addr.port();
        parse_into(&lookup, "GCHAT_PORT", &mut port);
        config.addr = SocketAddr::new(host, port);

        if let Some(path) = lookup("GCHAT_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        let mut timeout_secs = config.db_timeout.as_secs();
        parse_into(&lookup, "GCHAT_DB_TIMEOUT_SECS", &mut timeout_secs);
        config.db_timeout = Duration::from_secs(timeout_secs.max(1));

        parse_into(&lookup, "GCHAT_ENVIRONMENT", &mut config.environment);

        if let Some(origins) = lookup("GCHAT_CORS_TRUSTED_ORIGINS") {
            config.cors_trusted_origins = origins.split_whitespace().map(str::to_string).collect();
        }

        if let Some(val) = lookup("GCHAT_LIMITER_ENABLED") {
            config.limiter.enabled = val != "false" && val != "0";
        }
        parse_into(&lookup, "GCHAT_LIMITER_RPS", &mut config.limiter.rps);
        parse_into(&lookup, "GCHAT_LIMITER_BURST", &mut config.limiter.burst);

        if let Some(sender) = lookup("GCHAT_MAILER_SENDER") {
            config.mailer_sender = sender;
        }

        config
    }
}

fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(e) => warn!(key, value = %raw, error = %e, "Invalid setting, using default"),
    }
}
