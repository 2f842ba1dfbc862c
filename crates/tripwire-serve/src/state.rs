//! Application state and configuration.

use std::sync::Arc;
use std::time::Duration;

use tripwire_core::{DEFAULT_ATTACK_INDEX, ElasticConfig, ElasticEngine, IndexEngine};

use crate::cache::new_cache;
use crate::query::QueryFacade;

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:4000").
    pub bind_addr: String,

    /// Elasticsearch base URL.
    pub elasticsearch_url: String,

    /// Optional Elasticsearch basic-auth credentials.
    pub elasticsearch_username: Option<String>,
    pub elasticsearch_password: Option<String>,

    /// Index holding attack events.
    pub index: String,

    /// Upper bound on a single engine query.
    pub query_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `TRIPWIRE_BIND_ADDR`: Server bind address (default: "0.0.0.0:4000")
    /// - `ELASTICSEARCH_URL`: Elasticsearch URL (default: "http://localhost:9200")
    /// - `ELASTICSEARCH_USERNAME` / `ELASTICSEARCH_PASSWORD`: basic auth
    /// - `TRIPWIRE_INDEX`: Index name (default: "attacks")
    /// - `TRIPWIRE_QUERY_TIMEOUT_SECS`: Query timeout (default: 5)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("TRIPWIRE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string());

        let elasticsearch_url = std::env::var("ELASTICSEARCH_URL")
            .unwrap_or_else(|_| "http://localhost:9200".to_string());

        let elasticsearch_username = std::env::var("ELASTICSEARCH_USERNAME").ok();
        let elasticsearch_password = std::env::var("ELASTICSEARCH_PASSWORD").ok();

        let index =
            std::env::var("TRIPWIRE_INDEX").unwrap_or_else(|_| DEFAULT_ATTACK_INDEX.to_string());
        if index.trim().is_empty() {
            anyhow::bail!("TRIPWIRE_INDEX must not be empty");
        }

        let query_timeout = match std::env::var("TRIPWIRE_QUERY_TIMEOUT_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    anyhow::anyhow!("TRIPWIRE_QUERY_TIMEOUT_SECS must be a whole number of seconds")
                })?;
                Duration::from_secs(secs.max(1))
            }
            Err(_) => Duration::from_secs(5),
        };

        tracing::info!(
            bind_addr = %bind_addr,
            elasticsearch_url = %elasticsearch_url,
            index = %index,
            query_timeout = ?query_timeout,
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            elasticsearch_url,
            elasticsearch_username,
            elasticsearch_password,
            index,
            query_timeout,
        })
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Query facade over the attack index.
    pub queries: QueryFacade,

    /// Application configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Create application state backed by Elasticsearch.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let engine = ElasticEngine::new(ElasticConfig {
            url: config.elasticsearch_url.clone(),
            timeout: config.query_timeout,
            username: config.elasticsearch_username.clone(),
            password: config.elasticsearch_password.clone(),
        })?;
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Create application state over any engine.
    pub fn with_engine(config: Config, engine: Arc<dyn IndexEngine>) -> Self {
        let queries = QueryFacade::new(
            engine,
            config.index.clone(),
            new_cache(),
            config.query_timeout,
        );
        Self {
            queries,
            config: Arc::new(config),
        }
    }
}
