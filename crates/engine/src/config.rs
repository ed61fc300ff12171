use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pool::{PoolConfig, SchedulerStrategy};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct RuntimeConfig {
    pub server: Option<ServerConfig>,
    pub pool: Option<PoolSection>,
    pub storage: Option<StorageConfig>,
    pub cache: Option<CacheConfig>,
    pub assets: Option<AssetsConfig>,
    pub auth: Option<AuthConfig>,
    pub http: Option<HttpConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Route prefixes the function endpoints are mounted under.
    pub prefixes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PoolSection {
    pub workers: Option<usize>,
    pub execution_timeout_ms: Option<u64>,
    pub queue_timeout_ms: Option<u64>,
    pub scheduler: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssetsConfig {
    pub user_root: Option<String>,
    pub bundled_root: Option<String>,
    pub remote_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    /// Accepted as `Authorization: Bearer` or `?token=`.
    pub api_tokens: Option<Vec<String>>,
    /// Accepted as the `session` cookie.
    pub session_tokens: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HttpConfig {
    pub timeout_ms: Option<u64>,
    pub user_agent: Option<String>,
}

pub const DEFAULT_PORT: u16 = 2333;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl RuntimeConfig {
    pub fn load() -> Self {
        let path = match Self::find_config_path() {
            Some(path) => path,
            None => return Self::default(),
        };

        match Self::from_file(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(err) => {
                tracing::warn!("{}", err);
                Self::default()
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<RuntimeConfig>(contents)
    }

    pub fn listen_addr(&self) -> String {
        let server = self.server.as_ref();
        let host = server
            .and_then(|config| config.host.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let port = server.and_then(|config| config.port).unwrap_or(DEFAULT_PORT);
        format!("{}:{}", host, port)
    }

    pub fn prefixes(&self) -> Vec<String> {
        let configured = self
            .server
            .as_ref()
            .and_then(|config| config.prefixes.clone())
            .unwrap_or_default();
        let prefixes: Vec<String> = configured
            .iter()
            .map(|prefix| format!("/{}", prefix.trim_matches('/')))
            .filter(|prefix| prefix != "/")
            .collect();
        if prefixes.is_empty() {
            vec!["/fn".to_string(), "/serverless".to_string()]
        } else {
            prefixes
        }
    }

    /// Pool settings: defaults, then `[pool]`, then `FN_*` overrides.
    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default();
        if let Some(section) = &self.pool {
            if let Some(workers) = section.workers.filter(|n| *n > 0) {
                config.num_workers = workers;
            }
            if let Some(ms) = section.execution_timeout_ms.filter(|ms| *ms > 0) {
                config.execution_timeout_ms = ms;
            }
            if let Some(ms) = section.queue_timeout_ms {
                config.queue_timeout_ms = ms;
            }
            if let Some(strategy) = section
                .scheduler
                .as_deref()
                .and_then(SchedulerStrategy::parse)
            {
                config.scheduler_strategy = strategy;
            }
        }
        config.with_env()
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|config| config.sqlite_path.as_deref())
            .map(expand_home_path)
            .unwrap_or_else(|| data_dir().join("snippet.db"))
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.cache
            .as_ref()
            .and_then(|config| config.redis_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn user_asset_root(&self) -> PathBuf {
        self.assets
            .as_ref()
            .and_then(|config| config.user_root.as_deref())
            .map(expand_home_path)
            .unwrap_or_else(|| data_dir().join("assets"))
    }

    pub fn bundled_asset_root(&self) -> PathBuf {
        self.assets
            .as_ref()
            .and_then(|config| config.bundled_root.as_deref())
            .map(expand_home_path)
            .unwrap_or_else(|| data_dir().join("bundled-assets"))
    }

    pub fn remote_asset_base(&self) -> Option<url::Url> {
        let raw = self.assets.as_ref()?.remote_base_url.as_deref()?;
        // join() only appends below a base that ends with a slash
        let raw = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{}/", raw)
        };
        match url::Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::warn!("Ignoring invalid assets.remote_base_url {}: {}", raw, err);
                None
            }
        }
    }

    pub fn api_tokens(&self) -> HashSet<String> {
        token_set(self.auth.as_ref().and_then(|auth| auth.api_tokens.as_ref()))
    }

    pub fn session_tokens(&self) -> HashSet<String> {
        token_set(self.auth.as_ref().and_then(|auth| auth.session_tokens.as_ref()))
    }

    pub fn http_timeout(&self) -> Duration {
        let ms = self
            .http
            .as_ref()
            .and_then(|config| config.timeout_ms)
            .filter(|ms| *ms > 0)
            .unwrap_or(10_000);
        Duration::from_millis(ms)
    }

    pub fn user_agent(&self) -> String {
        self.http
            .as_ref()
            .and_then(|config| config.user_agent.clone())
            .unwrap_or_else(|| format!("snippetd/{}", env!("CARGO_PKG_VERSION")))
    }

    fn find_config_path() -> Option<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(path) = std::env::var("SNIPPET_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("SNIPPET_CONFIG set but file not found: {}", path.display());
        }

        candidates.push(PathBuf::from("snippet.toml"));
        candidates.push(PathBuf::from("config.toml"));

        if let Some(path) = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        {
            candidates.push(path.join("snippet").join("config.toml"));
        }

        candidates.push(PathBuf::from("/etc/snippet/config.toml"));

        candidates.into_iter().find(|path| path.exists())
    }
}

fn token_set(tokens: Option<&Vec<String>>) -> HashSet<String> {
    tokens
        .into_iter()
        .flatten()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".snippet"))
        .unwrap_or_else(|| PathBuf::from(".snippet"))
}

fn expand_home_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }

    Path::new(path).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = RuntimeConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:2333");
        assert_eq!(config.prefixes(), vec!["/fn", "/serverless"]);
        assert!(config.redis_url().is_none());
        assert!(config.remote_asset_base().is_none());
        assert!(config.api_tokens().is_empty());
        assert_eq!(config.http_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parses_all_sections() {
        let config = RuntimeConfig::parse(
            r#"
            [server]
            port = 8080
            prefixes = ["fn/", "/lambda"]

            [pool]
            workers = 3
            execution_timeout_ms = 5000
            scheduler = "hash"

            [storage]
            sqlite_path = "/tmp/fn.db"

            [cache]
            redis_url = "redis://127.0.0.1/"

            [assets]
            remote_base_url = "https://cdn.example.com/assets"

            [auth]
            api_tokens = ["abc", " "]
            session_tokens = ["sess"]

            [http]
            timeout_ms = 2500
            user_agent = "custom"
            "#,
        )
        .expect("parse");

        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.prefixes(), vec!["/fn", "/lambda"]);
        assert_eq!(config.sqlite_path(), PathBuf::from("/tmp/fn.db"));
        assert_eq!(config.redis_url(), Some("redis://127.0.0.1/"));
        assert_eq!(
            config.remote_asset_base().map(|url| url.to_string()),
            Some("https://cdn.example.com/assets/".to_string())
        );
        assert_eq!(config.api_tokens().len(), 1);
        assert!(config.session_tokens().contains("sess"));
        assert_eq!(config.http_timeout(), Duration::from_millis(2500));
        assert_eq!(config.user_agent(), "custom");

        let section = config.pool.as_ref().expect("pool section");
        assert_eq!(section.workers, Some(3));
        assert_eq!(section.scheduler.as_deref(), Some("hash"));
    }

    #[test]
    fn from_file_reports_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snippet.toml");
        std::fs::write(&path, "[server]\nport = 9000\n").expect("write");
        let config = RuntimeConfig::from_file(&path).expect("load");
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");

        std::fs::write(&path, "[server\n").expect("write");
        let err = RuntimeConfig::from_file(&path).expect_err("malformed");
        assert!(err.to_string().contains("snippet.toml"));

        let err = RuntimeConfig::from_file(&dir.path().join("missing.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(RuntimeConfig::parse("[server\nport = 1").is_err());
    }
}
