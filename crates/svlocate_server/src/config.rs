use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use svcorpus::fetch::{FetchConfig, REDACTED};
use svcorpus::manifest::ManifestMode;
use svcorpus::preprocess::Profile;
use svcorpus::sentinel::SentinelPolicy;
use svcorpus::CorpusConfig;

/// Holds all configuration for the svlocate server.
#[derive(Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub metrics_listen_addr: SocketAddr,
    /// Root under which `sv/`, `sv/features/` and `uploads/` live.
    pub data_dir: PathBuf,
    pub engine_binary: PathBuf,
    pub streetview_url: String,
    pub streetview_key: String,
    pub profile: Profile,
    pub sentinel_policy: SentinelPolicy,
    pub manifest_mode: ManifestMode,
    pub fetch_timeout: Duration,
    pub run_deadline: Option<Duration>,
    pub max_concurrent_fetches: usize,
    pub point_concurrency: usize,
    pub upload_limit_bytes: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("metrics_listen_addr", &self.metrics_listen_addr)
            .field("data_dir", &self.data_dir)
            .field("engine_binary", &self.engine_binary)
            .field("streetview_url", &self.streetview_url)
            .field("streetview_key", &REDACTED)
            .field("profile", &self.profile)
            .field("sentinel_policy", &self.sentinel_policy)
            .field("manifest_mode", &self.manifest_mode)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("run_deadline", &self.run_deadline)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("point_concurrency", &self.point_concurrency)
            .field("upload_limit_bytes", &self.upload_limit_bytes)
            .finish()
    }
}

fn var_or<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
        .with_context(|| format!("Failed to parse {name}"))
}

impl Config {
    /// Parses configuration from `SVLOCATE_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let run_deadline = match std::env::var("SVLOCATE_RUN_DEADLINE_SECS") {
            Ok(secs) => Some(Duration::from_secs(
                secs.parse().context("Failed to parse SVLOCATE_RUN_DEADLINE_SECS")?,
            )),
            Err(_) => None,
        };

        Ok(Self {
            listen_addr: var_or("SVLOCATE_LISTEN_ADDR", "0.0.0.0:8080")?,
            metrics_listen_addr: var_or("SVLOCATE_METRICS_LISTEN_ADDR", "0.0.0.0:9091")?,
            data_dir: var_or("SVLOCATE_DATA_DIR", ".")?,
            engine_binary: std::env::var("SVLOCATE_ENGINE_BINARY")
                .context("SVLOCATE_ENGINE_BINARY must be set (path to the feature toolkit)")?
                .into(),
            streetview_url: std::env::var("SVLOCATE_STREETVIEW_URL")
                .unwrap_or_else(|_| FetchConfig::default().base_url),
            streetview_key: std::env::var("SVLOCATE_STREETVIEW_KEY")
                .context("SVLOCATE_STREETVIEW_KEY must be set")?,
            profile: var_or("SVLOCATE_PROFILE", "standard")?,
            sentinel_policy: var_or("SVLOCATE_SENTINEL_POLICY", "abort_point")?,
            manifest_mode: var_or("SVLOCATE_MANIFEST_MODE", "tiles")?,
            fetch_timeout: Duration::from_millis(var_or("SVLOCATE_FETCH_TIMEOUT_MS", "15000")?),
            run_deadline,
            max_concurrent_fetches: var_or("SVLOCATE_MAX_CONCURRENT_FETCHES", "8")?,
            point_concurrency: var_or("SVLOCATE_POINT_CONCURRENCY", "4")?,
            upload_limit_bytes: var_or("SVLOCATE_UPLOAD_LIMIT_BYTES", "16777216")?,
        })
    }

    pub fn corpus_config(&self) -> CorpusConfig {
        CorpusConfig {
            sentinel_policy: self.sentinel_policy,
            manifest_mode: self.manifest_mode,
            query_budget: self.profile.budget(),
            fetch_timeout: self.fetch_timeout,
            run_deadline: self.run_deadline,
            max_concurrent_fetches: self.max_concurrent_fetches,
            point_concurrency: self.point_concurrency,
            ..CorpusConfig::with_root(&self.data_dir)
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            base_url: self.streetview_url.clone(),
            api_key: self.streetview_key.clone(),
            timeout: self.fetch_timeout,
            ..FetchConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_config_hides_the_api_key() {
        std::env::set_var("SVLOCATE_ENGINE_BINARY", "/opt/engine");
        std::env::set_var("SVLOCATE_STREETVIEW_KEY", "SECRET-KEY-123");
        let config = Config::from_env().unwrap();
        assert_eq!(config.fetch_config().api_key, "SECRET-KEY-123");

        let printed = format!("{config:?}");
        assert!(!printed.contains("SECRET-KEY-123"), "{printed}");
        assert!(printed.contains("streetview_key"));
    }
}
