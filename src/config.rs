use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Discord epoch (2015-01-01T00:00:00Z); no message can be older than this.
pub const DISCORD_EPOCH_SECS: i64 = 1_420_070_400;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub prefix: String,
    pub database_url: String,
    pub db_pool_size: usize,
    pub sync_interval: Duration,
    pub chunk_size: usize,
    pub worker_count: usize,
    pub embedding_url: String,
    pub embedding_timeout_secs: u64,
    pub embedding_max_retries: u32,
    pub embedding_backoff_secs: f64,
    pub vector_db_url: String,
    pub vector_db_metric: String,
    pub status_syncing: String,
    pub status_warning: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let config = Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            prefix: env::var("BOT_PREFIX").unwrap_or_else(|_| "?".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/faqdex.db".to_string()),
            db_pool_size: env::var("DB_POOL_SIZE")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .unwrap_or(4),
            sync_interval: match env::var("SYNC_INTERVAL") {
                Ok(raw) => humantime::parse_duration(&raw)
                    .map_err(|e| anyhow::anyhow!("SYNC_INTERVAL '{}' is invalid: {}", raw, e))?,
                Err(_) => Duration::from_secs(60 * 60),
            },
            chunk_size: env::var("CHUNK_SIZE")
                .unwrap_or_else(|_| "128".to_string())
                .parse()
                .unwrap_or(128),
            worker_count: env::var("WORKER_COUNT")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or_else(default_worker_count),
            embedding_url: env::var("EMBEDDING_URL")
                .unwrap_or_else(|_| "http://api:80/embed".to_string()),
            embedding_timeout_secs: env::var("EMBEDDING_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            embedding_max_retries: env::var("EMBEDDING_MAX_RETRIES")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .unwrap_or(8),
            embedding_backoff_secs: env::var("EMBEDDING_BACKOFF_SECS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1.0),
            vector_db_url: env::var("VECTOR_DB_URL")
                .unwrap_or_else(|_| "http://db:8000".to_string()),
            vector_db_metric: env::var("VECTOR_DB_METRIC")
                .unwrap_or_else(|_| "cosine".to_string()),
            status_syncing: env::var("STATUS_SYNCING").unwrap_or_else(|_| "🔄".to_string()),
            status_warning: env::var("STATUS_WARNING").unwrap_or_else(|_| "⚠".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.db_pool_size == 0 {
            anyhow::bail!("DB_POOL_SIZE must be at least 1");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("CHUNK_SIZE must be at least 1");
        }
        if self.worker_count == 0 {
            anyhow::bail!("WORKER_COUNT must be at least 1");
        }
        if !self.embedding_backoff_secs.is_finite() || self.embedding_backoff_secs < 0.0 {
            anyhow::bail!("EMBEDDING_BACKOFF_SECS must be a non-negative number of seconds");
        }
        if self.sync_interval.is_zero() {
            anyhow::bail!("SYNC_INTERVAL must be positive");
        }
        Ok(())
    }

    /// Rate-limit retry policy for embedding calls.
    pub fn embedding_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::rate_limit(self.embedding_max_retries)
            .with_factor(
                Duration::try_from_secs_f64(self.embedding_backoff_secs).unwrap_or(Duration::ZERO),
            )
    }
}

/// Same sizing rule as a default thread pool executor: `min(32, cpus + 4)`.
fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus + 4).min(32)
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("prefix", &self.prefix)
            .field("database_url", &self.database_url)
            .field("db_pool_size", &self.db_pool_size)
            .field("sync_interval", &humantime::format_duration(self.sync_interval).to_string())
            .field("chunk_size", &self.chunk_size)
            .field("worker_count", &self.worker_count)
            .field("embedding_url", &self.embedding_url)
            .field("embedding_timeout_secs", &self.embedding_timeout_secs)
            .field("embedding_max_retries", &self.embedding_max_retries)
            .field("embedding_backoff_secs", &self.embedding_backoff_secs)
            .field("vector_db_url", &self.vector_db_url)
            .field("vector_db_metric", &self.vector_db_metric)
            .finish()
    }
}
