pub mod cache;
pub mod clouds;
pub mod config;
pub mod constants;
pub mod geo;
pub mod processor;
pub mod selector;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::types::{MirrorsError, NetErr};
use cache::Cache;
use config::ServiceConfig;
use constants::{HTTP_CONNECT_TIMEOUT_SECS, HTTP_TIMEOUT_SECS, USER_AGENT};
use geo::GeoResolver;
use store::Store;

const TARGET: &str = "mirrorlist::app";

/// Process-wide singletons: configuration slot, offline geo databases,
/// shared cache, mirror store and the HTTP client. Initialized once at
/// startup, torn down at shutdown.
#[derive(Debug)]
pub struct App {
    /// Current service configuration; replaced by each update cycle
    config: RwLock<Arc<ServiceConfig>>,
    config_root: PathBuf,
    pub geo: Arc<GeoResolver>,
    pub cache: Cache,
    pub store: Store,
    pub client: reqwest::Client,
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var_os(name)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

impl App {
    /// Load configuration and open every singleton resource.
    pub async fn init() -> Result<Self, MirrorsError> {
        let config_root = env_path("CONFIG_ROOT", ".");
        let config_path = config_root.join("config.yml");
        let config = config::load_service_config(&config_path)
            .await
            .map_err(MirrorsError::Config)?;
        tracing::info!(
            target: TARGET,
            "Loaded service config from {} ({} repos, versions {:?})",
            config_path.display(),
            config.repos.len(),
            config.versions,
        );

        let geo = GeoResolver::open(
            &env_path("GEOIP_PATH", "GeoLite2-City.mmdb"),
            &env_path("ASN_PATH", "GeoLite2-ASN.mmdb"),
            &env_path("CONTINENT_PATH", "continents.csv"),
        )
        .map_err(MirrorsError::Geo)?;

        let redis_uri =
            std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis_uri_ro = std::env::var("REDIS_URI_RO").ok();
        let cache = Cache::connect(&redis_uri, redis_uri_ro.as_deref())
            .await
            .map_err(MirrorsError::Network)?;

        let sqlite_path = std::env::var("SQLITE_PATH").unwrap_or_else(|_| "mirrors.db".to_string());
        let store = Store::open(&sqlite_path, Some(cache.clone()))
            .await
            .map_err(MirrorsError::Store)?;

        Ok(App {
            config: RwLock::new(Arc::new(config)),
            config_root,
            geo: Arc::new(geo),
            cache,
            store,
            client: create_client()?,
        })
    }

    pub async fn service_config(&self) -> Arc<ServiceConfig> {
        self.config.read().await.clone()
    }

    pub async fn replace_config(&self, config: Arc<ServiceConfig>) {
        *self.config.write().await = config;
    }

    pub fn service_config_path(&self) -> PathBuf {
        self.config_root.join("config.yml")
    }

    pub fn mirrors_dir(&self, config: &ServiceConfig) -> PathBuf {
        self.config_root.join(&config.mirrors_dir)
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }
}

/// The one HTTP client every probe and feed fetch goes through. Idle
/// connections are dropped immediately so thousands of probed hosts do
/// not accumulate open sockets.
pub(crate) fn create_client() -> Result<reqwest::Client, MirrorsError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(0)
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|err| MirrorsError::Network(NetErr::Reqwest(err)))
}

/// Join a base URL and a relative path with exactly one slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
