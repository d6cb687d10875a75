use std::time::Duration;

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a whole number of seconds, got {value:?}")]
    InvalidSeconds { name: &'static str, value: String },
    #[error("{name} must be greater than zero")]
    ZeroTimeout { name: &'static str },
    #[error("{name} must be a whole number of bytes, got {value:?}")]
    InvalidBytes { name: &'static str, value: String },
}

/// Runtime settings, read from `PRODUCT_EXTRACTOR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub insecure_ssl: bool,
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            insecure_ssl: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind: lookup("PRODUCT_EXTRACTOR_BIND").unwrap_or(defaults.bind),
            timeout: seconds(&lookup, "PRODUCT_EXTRACTOR_TIMEOUT_SECS")?
                .unwrap_or(defaults.timeout),
            connect_timeout: seconds(&lookup, "PRODUCT_EXTRACTOR_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.connect_timeout),
            user_agent: lookup("PRODUCT_EXTRACTOR_USER_AGENT")
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or(defaults.user_agent),
            insecure_ssl: lookup("PRODUCT_EXTRACTOR_INSECURE_SSL").as_deref() == Some("1"),
            max_body_bytes: byte_count(&lookup, "PRODUCT_EXTRACTOR_MAX_BODY_BYTES")?
                .unwrap_or(defaults.max_body_bytes),
        })
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidSeconds {
        name,
        value: raw.clone(),
    })?;
    if secs == 0 {
        return Err(ConfigError::ZeroTimeout { name });
    }
    Ok(Some(Duration::from_secs(secs)))
}

fn byte_count(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<usize>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<usize>() {
        Ok(bytes) if bytes > 0 => Ok(Some(bytes)),
        _ => Err(ConfigError::InvalidBytes {
            name,
            value: raw.clone(),
        }),
    }
}
