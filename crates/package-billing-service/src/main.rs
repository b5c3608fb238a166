//! 套餐计费后台进程
//!
//! 运行过期处理 Worker，并暴露 Prometheus 指标端点。

use std::sync::Arc;
use std::time::Duration;

use package_billing::{ExpireWorker, PgPackageStore};
use salon_shared::{config::AppConfig, database::Database, observability};
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "package-billing-service";
const POOL_REPORT_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match AppConfig::load(SERVICE_NAME) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败，使用默认配置: {}", e);
            AppConfig::default()
        }
    };

    let _guard = observability::init(&config.observability).await?;

    info!(
        environment = %config.environment,
        lock_timeout_ms = config.billing.lock_timeout_ms,
        "Starting {}",
        config.service_name
    );

    let db = Database::connect(&config.database, &config.service_name).await?;
    if let Err(e) = db.health_check().await {
        warn!(error = %e, "数据库健康检查失败");
    }

    let store = Arc::new(PgPackageStore::new(
        db.pool().clone(),
        Duration::from_millis(config.billing.lock_timeout_ms),
    ));
    let worker = ExpireWorker::from_config(store, &config.billing);

    tokio::select! {
        _ = worker.run() => {}
        _ = report_pool_usage(&db) => {}
        _ = shutdown_signal() => {}
    }

    db.close().await;
    info!("Worker shutdown complete");

    Ok(())
}

/// 周期上报连接池占用
async fn report_pool_usage(db: &Database) {
    let mut ticker = tokio::time::interval(POOL_REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        db.record_pool_metrics();
    }
}

/// 监听关闭信号
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
