use sqlx::{migrate::MigrateDatabase, postgres::PgPoolOptions, PgPool, Postgres};
use std::time::Duration;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
}

impl PoolConfig {
    /// Create config from `DB_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let count = |key: &str, fallback: u32| {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(fallback)
        };

        Self {
            max_connections: count("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: count("DB_MIN_CONNECTIONS", defaults.min_connections),
            acquire_timeout: env_secs("DB_ACQUIRE_TIMEOUT").unwrap_or(defaults.acquire_timeout),
            idle_timeout: env_secs("DB_IDLE_TIMEOUT").unwrap_or(defaults.idle_timeout),
            max_lifetime: env_secs("DB_MAX_LIFETIME").unwrap_or(defaults.max_lifetime),
        }
    }
}

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let config = PoolConfig::from_env();

    if !Postgres::database_exists(database_url).await? {
        Postgres::create_database(database_url).await?;
        tracing::info!("Database created successfully");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    tracing::info!(
        "Database pool created: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check database health
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
