//! 数据库连接池
//!
//! 计费事务持有一个连接直到提交，过期 Worker 的批量停用另占一个，
//! 因此连接池至少需要两个连接。

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{Result, SalonError};

/// 连接池最少连接数
pub const MIN_POOL_SIZE: u32 = 2;

/// 连接池占用快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

impl PoolStats {
    pub fn in_use(&self) -> u32 {
        self.size.saturating_sub(self.idle as u32)
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    application_name: String,
}

impl Database {
    /// 建立连接池
    ///
    /// `application_name` 写入 `pg_stat_activity`，便于定位持锁的计费会话
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig, application_name: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)?.application_name(application_name);
        let pool = pool_options(config)?.connect_with(options).await?;

        info!(
            max_connections = config.max_connections,
            acquire_timeout_seconds = config.acquire_timeout_seconds,
            "数据库连接池已建立"
        );

        Ok(Self {
            pool,
            application_name: application_name.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// 上报连接池占用，计费事务排队时 in_use 会贴近上限
    pub fn record_pool_metrics(&self) {
        let stats = self.stats();
        metrics::gauge!("db_pool_connections", "application" => self.application_name.clone())
            .set(stats.size as f64);
        metrics::gauge!("db_pool_connections_in_use", "application" => self.application_name.clone())
            .set(stats.in_use() as f64);
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(SalonError::from)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

/// 校验池容量并生成连接池参数
fn pool_options(config: &DatabaseConfig) -> Result<PgPoolOptions> {
    if config.max_connections < MIN_POOL_SIZE {
        return Err(SalonError::Validation(format!(
            "max_connections 至少为 {}: {}",
            MIN_POOL_SIZE, config.max_connections
        )));
    }
    if config.min_connections > config.max_connections {
        return Err(SalonError::Validation(format!(
            "min_connections ({}) 大于 max_connections ({})",
            config.min_connections, config.max_connections
        )));
    }
    if config.acquire_timeout_seconds == 0 {
        return Err(SalonError::Validation(
            "acquire_timeout_seconds 必须大于 0".to_string(),
        ));
    }

    Ok(PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds)))
}
