//! 套餐过期处理 Worker
//!
//! 定期将已过有效期的套餐标记为停用。套餐的可用性判断本身已包含有效期，
//! 停用只是让列表与报表反映真实状态。
//!
//! PostgreSQL 实现使用 `FOR UPDATE SKIP LOCKED`，多实例部署不会重复处理，
//! 也不会阻塞正在抵扣的事务。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use salon_shared::config::BillingConfig;
use salon_shared::observability::metrics;
use tracing::{error, info};

use crate::error::Result;
use crate::repository::PackageStore;

const WORKER_NAME: &str = "expire_worker";

/// 过期处理 Worker
pub struct ExpireWorker {
    store: Arc<dyn PackageStore>,
    poll_interval: Duration,
    /// 每批处理的最大记录数
    batch_size: i64,
}

impl ExpireWorker {
    pub fn new(store: Arc<dyn PackageStore>, poll_interval: Duration, batch_size: i64) -> Self {
        Self {
            store,
            poll_interval,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn PackageStore>, config: &BillingConfig) -> Self {
        Self::new(
            store,
            Duration::from_secs(config.expire_poll_interval_secs),
            config.expire_batch_size,
        )
    }

    /// 主循环：持续处理直到任务被取消
    pub async fn run(&self) {
        info!(
            poll_interval = ?self.poll_interval,
            batch_size = self.batch_size,
            "ExpireWorker 已启动"
        );

        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "处理过期套餐出错");
            }

            metrics::set_worker_last_run(WORKER_NAME);

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// 处理一轮：分批停用，直到某批不足 batch_size
    pub async fn run_once(&self) -> Result<u64> {
        let now = Utc::now();
        let mut total = 0u64;

        loop {
            let count = self
                .store
                .deactivate_expired_grants(now, self.batch_size)
                .await?;
            total += count;

            if count < self.batch_size as u64 {
                break;
            }
        }

        if total > 0 {
            metrics::record_grant_expiration(total);
            info!(count = total, "已停用过期套餐");
        }

        Ok(total)
    }
}
