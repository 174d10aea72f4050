use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use tandem_crypto::keys::key_from_base64;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

/// Process configuration, read from `TANDEM_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// `memory://` selects the in-process store (single process only).
    pub redis_url: String,
    pub jwt_secret: String,
    /// AES-256 key for message bodies at rest. Plaintext storage when unset.
    pub message_key: Option<[u8; 32]>,
    pub pairing_interval: Duration,
    pub match_timeout: Option<Duration>,
    pub flush_batch: usize,
    pub flush_interval: Duration,
    pub presence_ttl: Duration,
    pub name_cache_ttl: Duration,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let message_key = match std::env::var("TANDEM_MESSAGE_KEY") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(key_from_base64(&raw).context("TANDEM_MESSAGE_KEY is not a base64 32-byte key")?)
            }
            _ => None,
        };

        let match_timeout_secs: u64 = parse_var("TANDEM_MATCH_TIMEOUT_SECS", 0)?;

        Ok(Self {
            host: var_or("TANDEM_HOST", "0.0.0.0"),
            port: parse_var("TANDEM_PORT", 3000)?,
            db_path: var_or("TANDEM_DB_PATH", "tandem.db"),
            redis_url: var_or("TANDEM_REDIS_URL", "memory://"),
            jwt_secret: var_or("TANDEM_JWT_SECRET", DEV_JWT_SECRET),
            message_key,
            pairing_interval: Duration::from_millis(parse_var("TANDEM_PAIRING_INTERVAL_MS", 500)?),
            match_timeout: (match_timeout_secs > 0).then(|| Duration::from_secs(match_timeout_secs)),
            flush_batch: parse_var("TANDEM_FLUSH_BATCH", 100)?,
            flush_interval: Duration::from_millis(parse_var("TANDEM_FLUSH_INTERVAL_MS", 2000)?),
            presence_ttl: Duration::from_secs(parse_var("TANDEM_PRESENCE_TTL_SECS", 180)?),
            name_cache_ttl: Duration::from_secs(parse_var("TANDEM_NAME_CACHE_TTL_SECS", 60)?),
        })
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis_url.starts_with("memory://")
    }
}
