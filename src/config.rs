use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::debug;

/// Pagination bounds for item listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 1000,
        }
    }
}

impl PageLimits {
    /// Requested page size, defaulted and capped.
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .min(self.max_page_size)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { key: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, reason } => write!(f, "invalid {key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub pages: PageLimits,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults; set but
    /// unparsable keys are errors rather than silently defaulted.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let pages = PageLimits {
            default_page_size: parse_or(&lookup, "RENTD_DEFAULT_PAGE_SIZE", PageLimits::default().default_page_size)?,
            max_page_size: parse_or(&lookup, "RENTD_MAX_PAGE_SIZE", PageLimits::default().max_page_size)?,
        };
        if pages.default_page_size == 0 || pages.max_page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "RENTD_DEFAULT_PAGE_SIZE",
                reason: "page sizes must be positive".into(),
            });
        }
        if pages.default_page_size > pages.max_page_size {
            return Err(ConfigError::Invalid {
                key: "RENTD_DEFAULT_PAGE_SIZE",
                reason: format!(
                    "default page size {} exceeds max page size {}",
                    pages.default_page_size, pages.max_page_size
                ),
            });
        }

        let max_connections: usize = parse_or(&lookup, "RENTD_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "RENTD_MAX_CONNECTIONS",
                reason: "must be positive".into(),
            });
        }

        let tls_cert = lookup("RENTD_TLS_CERT");
        let tls_key = lookup("RENTD_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Invalid {
                key: "RENTD_TLS_CERT",
                reason: "both RENTD_TLS_CERT and RENTD_TLS_KEY must be set, or neither".into(),
            });
        }

        Ok(Self {
            port: parse_or(&lookup, "RENTD_PORT", 5433)?,
            bind: lookup("RENTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("RENTD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("RENTD_PASSWORD").unwrap_or_else(|| "rentd".into()),
            max_connections,
            compact_threshold: parse_or(&lookup, "RENTD_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&lookup, "RENTD_METRICS_PORT")?,
            tls_cert,
            tls_key,
            pages,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: format!("{raw:?}: {e}"),
            }),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match parse_opt(lookup, key)? {
        Some(value) => Ok(value),
        None => {
            debug!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}
