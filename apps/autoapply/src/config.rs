use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cache::{StorePolicy, DEFAULT_CACHE_VERSION};
use crate::store::{self, LocalStore, API_BASE_KEY};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_PROXY_PORT: u16 = 8787;
/// Loopback only; the proxy forwards arbitrary same-origin paths upstream.
pub const DEFAULT_PROXY_BIND: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Client configuration loaded from environment variables (and `.env`).
///
/// Everything has a default; a set-but-malformed value is a startup error.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit `AUTOAPPLY_API_BASE_URL`. `None` defers to the stored
    /// override, see [`Config::resolve_api_base`].
    pub api_base_url: Option<String>,
    pub data_dir: PathBuf,
    pub timeout: Duration,
    pub max_retries: u32,
    pub proxy: ProxyConfig,
    pub rust_log: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Defaults to the resolved API base URL.
    pub upstream: Option<String>,
    /// Origin browsers use to reach the proxy.
    pub public_origin: String,
    pub cache_version: String,
    pub store_policy: StorePolicy,
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let port = parse_env("PROXY_PORT", DEFAULT_PROXY_PORT)?;
        let store_policy = match optional_env("PROXY_STORE_POLICY") {
            Some(raw) => raw
                .parse::<StorePolicy>()
                .map_err(anyhow::Error::msg)
                .context("PROXY_STORE_POLICY is invalid")?,
            None => StorePolicy::default(),
        };

        Ok(Config {
            api_base_url: optional_env("AUTOAPPLY_API_BASE_URL")
                .map(|url| normalize_base_url(&url))
                .transpose()
                .context("AUTOAPPLY_API_BASE_URL is invalid")?,
            data_dir: optional_env("AUTOAPPLY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            timeout: Duration::from_millis(parse_env("AUTOAPPLY_TIMEOUT_MS", 20_000u64)?),
            max_retries: parse_env("AUTOAPPLY_MAX_RETRIES", 1u32)?,
            proxy: ProxyConfig {
                bind: parse_bind(optional_env("PROXY_BIND"))?,
                port,
                upstream: optional_env("PROXY_UPSTREAM")
                    .map(|url| normalize_base_url(&url))
                    .transpose()
                    .context("PROXY_UPSTREAM is invalid")?,
                public_origin: optional_env("PROXY_PUBLIC_ORIGIN")
                    .unwrap_or_else(|| format!("http://localhost:{port}")),
                cache_version: optional_env("PROXY_CACHE_VERSION")
                    .unwrap_or_else(|| DEFAULT_CACHE_VERSION.to_string()),
                store_policy,
            },
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Environment first, then the override persisted under
    /// `maa_api_base_url`, then the local default.
    pub fn resolve_api_base(&self, local: &dyn LocalStore) -> Result<String> {
        if let Some(url) = &self.api_base_url {
            return Ok(url.clone());
        }
        let stored: Option<String> =
            store::load(local, API_BASE_KEY).context("Failed to read stored API base URL")?;
        match stored.filter(|s| !s.trim().is_empty()) {
            Some(url) => normalize_base_url(&url).context("Stored API base URL is invalid"),
            None => Ok(DEFAULT_API_BASE_URL.to_string()),
        }
    }
}

/// Trims whitespace and trailing slashes; rejects anything but http(s).
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        bail!("'{raw}' is not an http(s) URL");
    }
    reqwest::Url::parse(trimmed).with_context(|| format!("'{raw}' is not a valid URL"))?;
    Ok(trimmed.to_string())
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("autoapply"))
        .unwrap_or_else(|| PathBuf::from(".autoapply"))
}

fn parse_bind(raw: Option<String>) -> Result<IpAddr> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<IpAddr>()
            .with_context(|| format!("PROXY_BIND must be an IP address, got '{raw}'")),
        None => Ok(DEFAULT_PROXY_BIND),
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn config(api_base_url: Option<&str>) -> Config {
        Config {
            api_base_url: api_base_url.map(str::to_string),
            data_dir: PathBuf::from(".autoapply"),
            timeout: Duration::from_secs(20),
            max_retries: 1,
            proxy: ProxyConfig {
                bind: DEFAULT_PROXY_BIND,
                port: DEFAULT_PROXY_PORT,
                upstream: None,
                public_origin: "http://localhost:8787".into(),
                cache_version: DEFAULT_CACHE_VERSION.into(),
                store_policy: StorePolicy::WriteThrough,
            },
            rust_log: "info".into(),
        }
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url(" https://api.example.com/// ").unwrap(), "https://api.example.com");
        assert!(normalize_base_url("ftp://x").is_err());
        assert!(normalize_base_url("api.example.com").is_err());
    }

    #[test]
    fn test_api_base_precedence() {
        let local = Arc::new(MemoryStore::default());
        assert_eq!(config(None).resolve_api_base(local.as_ref()).unwrap(), DEFAULT_API_BASE_URL);

        local.set(API_BASE_KEY, &json!("https://stored.example.com/")).unwrap();
        assert_eq!(
            config(None).resolve_api_base(local.as_ref()).unwrap(),
            "https://stored.example.com"
        );
        assert_eq!(
            config(Some("https://env.example.com")).resolve_api_base(local.as_ref()).unwrap(),
            "https://env.example.com"
        );
    }

    #[test]
    fn test_blank_stored_override_is_ignored() {
        let local = MemoryStore::default();
        local.set(API_BASE_KEY, &json!("  ")).unwrap();
        assert_eq!(config(None).resolve_api_base(&local).unwrap(), DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_proxy_listens_on_loopback_unless_overridden() {
        let proxy = config(None).proxy;
        assert!(proxy.listen_addr().ip().is_loopback());
        assert_eq!(proxy.listen_addr().to_string(), "127.0.0.1:8787");

        assert_eq!(parse_bind(None).unwrap(), DEFAULT_PROXY_BIND);
        assert_eq!(parse_bind(Some(" 0.0.0.0 ".into())).unwrap(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(parse_bind(Some("::1".into())).unwrap().to_string(), "::1");
        assert!(parse_bind(Some("localhost".into())).is_err());
    }
}
