//! PgPackageStore 集成测试
//!
//! 行锁、锁超时和唯一索引只能在真实 PostgreSQL 上验证。
//!
//! ## 运行方式
//!
//! ```bash
//! psql $DATABASE_URL -f schema/package_billing.sql
//! DATABASE_URL=postgres://... cargo test --test pg_store_test -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use package_billing::dto::ApplyBenefitRequest;
use package_billing::{
    BillingTransaction, GrantBenefit, NewPackageGrant, PackageBillingService, PackageStore,
    PgPackageStore, ReversalReason,
};
use rust_decimal_macros::dec;
use salon_shared::config::DatabaseConfig;
use salon_shared::database::{Database, MIN_POOL_SIZE};
use salon_shared::test_utils::{test_customer_id, test_database_config, test_invoice_id};
use sqlx::PgPool;

const FACIAL: i64 = 101;

async fn setup() -> (PgPool, Arc<PgPackageStore>) {
    setup_with_pool_size(test_database_config().max_connections).await
}

async fn setup_with_pool_size(max_connections: u32) -> (PgPool, Arc<PgPackageStore>) {
    let config = DatabaseConfig {
        max_connections,
        min_connections: 1,
        acquire_timeout_seconds: 3,
        ..test_database_config()
    };
    let db = Database::connect(&config, "package-billing-test")
        .await
        .expect("数据库连接失败");
    let pool = db.pool().clone();
    let store = Arc::new(PgPackageStore::new(pool.clone(), Duration::from_millis(500)));
    (pool, store)
}

/// 插入测试模板，返回模板 ID
async fn seed_template(pool: &PgPool) -> i64 {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO package_templates (name, kind, is_membership, service_ids, validity_days,
                                       session_count, price, is_active)
        VALUES ('集成测试赠送卡', 'free', FALSE, $1, 90, 3, 300, TRUE)
        RETURNING id
        "#,
    )
    .bind(vec![FACIAL])
    .fetch_one(pool)
    .await
    .expect("插入测试模板失败")
}

async fn seed_grant(store: &PgPackageStore, customer_id: i64, template_id: i64) -> i64 {
    let now = Utc::now();
    store
        .create_grant(&NewPackageGrant {
            customer_id,
            template_id,
            package_name: "集成测试赠送卡".to_string(),
            service_id: None,
            valid_from: now - chrono::Duration::days(1),
            valid_to: now + chrono::Duration::days(30),
            benefit: GrantBenefit::free(3),
        })
        .await
        .expect("创建套餐失败")
        .id
}

#[tokio::test]
#[ignore = "需要 PostgreSQL"]
async fn test_apply_and_reverse_round_trip() {
    let (pool, store) = setup().await;
    let template_id = seed_template(&pool).await;
    let customer_id = test_customer_id();
    let grant_id = seed_grant(&store, customer_id, template_id).await;
    let service = PackageBillingService::new(store.clone());
    let invoice_id = test_invoice_id();

    let request = ApplyBenefitRequest::new(customer_id, FACIAL, dec!(120), invoice_id, 1);
    let first = service.apply_package_benefit(request.clone()).await;
    assert!(first.applied, "{}", first.message);

    let retry = service.apply_package_benefit(request).await;
    assert!(retry.duplicate);
    assert_eq!(retry.usage_record_id, first.usage_record_id);

    let usage_id = first.usage_record_id.unwrap();
    let reversal = service
        .reverse_package_usage(usage_id, ReversalReason::Refund, None)
        .await;
    assert!(reversal.success, "{}", reversal.message);

    let again = service
        .reverse_package_usage(usage_id, ReversalReason::Refund, None)
        .await;
    assert_eq!(again.error_code.as_deref(), Some("ALREADY_REVERSED"));

    let grant = store.get_grant(grant_id).await.unwrap().unwrap();
    assert_eq!(grant.benefit.remaining_count(), Some(3));
    assert_eq!(store.list_usage_by_invoice(invoice_id).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "需要 PostgreSQL"]
async fn test_held_row_lock_times_out() {
    let (pool, store) = setup().await;
    let template_id = seed_template(&pool).await;
    let grant_id = seed_grant(&store, test_customer_id(), template_id).await;

    let mut holder = store.begin().await.unwrap();
    holder.lock_grant(grant_id).await.unwrap();

    let mut waiter = store.begin().await.unwrap();
    let err = waiter.lock_grant(grant_id).await.unwrap_err();
    assert_eq!(err.error_code(), "LOCK_TIMEOUT");
    assert!(err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "需要 PostgreSQL"]
async fn test_concurrent_lines_respect_capacity() {
    let (pool, store) = setup().await;
    let template_id = seed_template(&pool).await;
    let customer_id = test_customer_id();
    let grant_id = seed_grant(&store, customer_id, template_id).await;
    let service = Arc::new(PackageBillingService::new(store.clone()));
    let invoice_id = test_invoice_id();

    let handles: Vec<_> = (1..=8)
        .map(|line| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .apply_package_benefit(ApplyBenefitRequest::new(
                        customer_id,
                        FACIAL,
                        dec!(100),
                        invoice_id,
                        line,
                    ))
                    .await
            })
        })
        .collect();

    let applied = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| r.as_ref().map(|r| r.applied).unwrap_or(false))
        .count();
    assert!(applied <= 3);

    let grant = store.get_grant(grant_id).await.unwrap().unwrap();
    assert_eq!(grant.benefit.remaining_count(), Some(3 - applied as i32));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "需要 PostgreSQL"]
async fn test_lines_beyond_pool_size_all_apply() {
    let pool_size = MIN_POOL_SIZE;
    let (pool, store) = setup_with_pool_size(pool_size).await;
    let template_id = seed_template(&pool).await;
    let customer_id = test_customer_id();
    let grant_id = seed_grant(&store, customer_id, template_id).await;
    let service = Arc::new(PackageBillingService::new(store.clone()));
    let invoice_id = test_invoice_id();

    // 行数比连接数多一个，三次赠送次数正好用完
    let lines = pool_size as i64 + 1;
    let handles: Vec<_> = (1..=lines)
        .map(|line| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .apply_package_benefit(ApplyBenefitRequest::new(
                        customer_id,
                        FACIAL,
                        dec!(100),
                        invoice_id,
                        line,
                    ))
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        let result = result.unwrap();
        assert!(result.success, "{:?}: {}", result.error_code, result.message);
        assert!(result.applied);
    }

    let grant = store.get_grant(grant_id).await.unwrap().unwrap();
    assert_eq!(grant.benefit.remaining_count(), Some(3 - lines as i32));
}
