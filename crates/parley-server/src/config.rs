use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Secrets that ship in sample configs and must never sign real tokens.
const PLACEHOLDER_SECRETS: &[&str] = &["", "change-me", "dev-secret-change-me", "secret"];

/// Server settings, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub token_ttl: chrono::TimeDelta,
    /// How long a user stays online after their last connection drops.
    pub presence_grace: Duration,
    /// Outbound events buffered per connection before it loses a subscription.
    pub subscriber_queue: usize,
    pub lock_timeout: Duration,
    pub store_timeout: Duration,
    pub write_attempts: u32,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = get("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&get, "PARLEY_PORT", 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let dev_mode = get("PARLEY_DEV_MODE").is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let jwt_secret = get("PARLEY_JWT_SECRET").unwrap_or_default();
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) && !dev_mode {
            bail!("PARLEY_JWT_SECRET must be set to a real secret (or set PARLEY_DEV_MODE=1)");
        }
        let jwt_secret = if jwt_secret.is_empty() {
            "dev-secret-change-me".to_string()
        } else {
            jwt_secret
        };

        Ok(Self {
            addr,
            db_path: PathBuf::from(get("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into())),
            jwt_secret,
            token_ttl: chrono::TimeDelta::hours(parse_or(&get, "PARLEY_TOKEN_TTL_HOURS", 720)?),
            presence_grace: Duration::from_secs(parse_or(&get, "PARLEY_PRESENCE_GRACE_SECS", 10)?),
            subscriber_queue: parse_or(&get, "PARLEY_SUBSCRIBER_QUEUE", 256)?,
            lock_timeout: Duration::from_millis(parse_or(&get, "PARLEY_LOCK_TIMEOUT_MS", 5000)?),
            store_timeout: Duration::from_millis(parse_or(&get, "PARLEY_STORE_TIMEOUT_MS", 5000)?),
            write_attempts: parse_or(&get, "PARLEY_WRITE_RETRIES", 3)?,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}
