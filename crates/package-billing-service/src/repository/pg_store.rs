//! PostgreSQL 套餐存储
//!
//! 套餐行锁使用 `SELECT ... FOR UPDATE`，锁等待上限通过事务级 `lock_timeout` 控制。
//! 幂等键与冲正引用均有唯一索引，并发重试由数据库兜底。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::debug;

use super::traits::{BillingTransaction, PackageStore};
use crate::error::{BillingError, Result};
use crate::models::{
    BenefitKind, GrantBenefit, NewPackageGrant, NewPackageUsage, PackageGrant, PackageTemplate,
    PackageUsage,
};

/// PostgreSQL 锁等待超时的 SQLSTATE
const LOCK_NOT_AVAILABLE: &str = "55P03";

const GRANT_COLUMNS: &str = r#"
    id, customer_id, template_id, package_name, service_id, benefit_kind,
    valid_from, valid_to, is_active,
    total_allocated, used_count, remaining_count, discount_percentage,
    balance_total, balance_used, balance_remaining,
    created_at, updated_at
"#;

const TEMPLATE_COLUMNS: &str = r#"
    id, name, kind, is_membership, service_ids, validity_days,
    session_count, discount_percentage, prepaid_amount, price, is_active, created_at
"#;

const USAGE_COLUMNS: &str = r#"
    id, customer_id, grant_id, invoice_id, invoice_line_id, service_id, idempotency_key,
    benefit_kind, transaction_type, qty_deducted, amount_deducted, discount_applied,
    original_price, final_price, package_name, remaining_count_after,
    balance_remaining_after, staff_override, reversal_reference_id, applied_by, notes,
    created_at
"#;

/// 套餐表行
#[derive(Debug, sqlx::FromRow)]
struct PackageGrantRow {
    id: i64,
    customer_id: i64,
    template_id: i64,
    package_name: String,
    service_id: Option<i64>,
    benefit_kind: BenefitKind,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
    is_active: bool,
    total_allocated: Option<i32>,
    used_count: Option<i32>,
    remaining_count: Option<i32>,
    discount_percentage: Option<Decimal>,
    balance_total: Option<Decimal>,
    balance_used: Option<Decimal>,
    balance_remaining: Option<Decimal>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PackageGrantRow> for PackageGrant {
    type Error = BillingError;

    fn try_from(row: PackageGrantRow) -> Result<Self> {
        let id = row.id;
        let missing =
            move |field: &str| BillingError::Internal(format!("套餐 {} 缺少字段 {}", id, field));

        let benefit = match row.benefit_kind {
            BenefitKind::Unlimited => GrantBenefit::Unlimited,
            BenefitKind::Free => GrantBenefit::Free {
                total_allocated: row.total_allocated.ok_or_else(|| missing("total_allocated"))?,
                used_count: row.used_count.ok_or_else(|| missing("used_count"))?,
                remaining_count: row.remaining_count.ok_or_else(|| missing("remaining_count"))?,
            },
            BenefitKind::Discount => GrantBenefit::Discount {
                total_allocated: row.total_allocated.ok_or_else(|| missing("total_allocated"))?,
                used_count: row.used_count.ok_or_else(|| missing("used_count"))?,
                remaining_count: row.remaining_count.ok_or_else(|| missing("remaining_count"))?,
                discount_percentage: row
                    .discount_percentage
                    .ok_or_else(|| missing("discount_percentage"))?,
            },
            BenefitKind::Prepaid => GrantBenefit::Prepaid {
                balance_total: row.balance_total.ok_or_else(|| missing("balance_total"))?,
                balance_used: row.balance_used.ok_or_else(|| missing("balance_used"))?,
                balance_remaining: row
                    .balance_remaining
                    .ok_or_else(|| missing("balance_remaining"))?,
            },
        };

        Ok(PackageGrant {
            id: row.id,
            customer_id: row.customer_id,
            template_id: row.template_id,
            package_name: row.package_name,
            service_id: row.service_id,
            valid_from: row.valid_from,
            valid_to: row.valid_to,
            is_active: row.is_active,
            benefit,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 余量字段的列值
#[derive(Default)]
struct CapacityColumns {
    total_allocated: Option<i32>,
    used_count: Option<i32>,
    remaining_count: Option<i32>,
    discount_percentage: Option<Decimal>,
    balance_total: Option<Decimal>,
    balance_used: Option<Decimal>,
    balance_remaining: Option<Decimal>,
}

impl From<&GrantBenefit> for CapacityColumns {
    fn from(benefit: &GrantBenefit) -> Self {
        match benefit {
            GrantBenefit::Unlimited => Self::default(),
            GrantBenefit::Free {
                total_allocated,
                used_count,
                remaining_count,
            } => Self {
                total_allocated: Some(*total_allocated),
                used_count: Some(*used_count),
                remaining_count: Some(*remaining_count),
                ..Default::default()
            },
            GrantBenefit::Discount {
                total_allocated,
                used_count,
                remaining_count,
                discount_percentage,
            } => Self {
                total_allocated: Some(*total_allocated),
                used_count: Some(*used_count),
                remaining_count: Some(*remaining_count),
                discount_percentage: Some(*discount_percentage),
                ..Default::default()
            },
            GrantBenefit::Prepaid {
                balance_total,
                balance_used,
                balance_remaining,
            } => Self {
                balance_total: Some(*balance_total),
                balance_used: Some(*balance_used),
                balance_remaining: Some(*balance_remaining),
                ..Default::default()
            },
        }
    }
}

/// 将唯一约束冲突映射为幂等键冲突
fn map_insert_error(err: sqlx::Error, key: &str) -> BillingError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            BillingError::DuplicateIdempotencyKey(key.to_string())
        }
        _ => BillingError::Database(err),
    }
}

fn map_lock_error(err: sqlx::Error, grant_id: i64) -> BillingError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
            BillingError::LockTimeout(grant_id)
        }
        _ => BillingError::Database(err),
    }
}

/// PostgreSQL 套餐存储
#[derive(Clone)]
pub struct PgPackageStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgPackageStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    // ==================== 事务内操作 ====================

    /// 在事务中锁定套餐行
    pub async fn lock_grant_in_tx(conn: &mut PgConnection, grant_id: i64) -> Result<PackageGrant> {
        let sql = format!(
            "SELECT {} FROM package_grants WHERE id = $1 FOR UPDATE",
            GRANT_COLUMNS
        );
        let row = sqlx::query_as::<_, PackageGrantRow>(&sql)
            .bind(grant_id)
            .fetch_optional(conn)
            .await
            .map_err(|e| map_lock_error(e, grant_id))?
            .ok_or(BillingError::GrantNotFound(grant_id))?;

        row.try_into()
    }

    /// 在事务中写回套餐余量
    pub async fn update_grant_in_tx(conn: &mut PgConnection, grant: &PackageGrant) -> Result<()> {
        let cols = CapacityColumns::from(&grant.benefit);
        sqlx::query(
            r#"
            UPDATE package_grants
            SET is_active = $2,
                used_count = $3,
                remaining_count = $4,
                balance_used = $5,
                balance_remaining = $6,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(grant.id)
        .bind(grant.is_active)
        .bind(cols.used_count)
        .bind(cols.remaining_count)
        .bind(cols.balance_used)
        .bind(cols.balance_remaining)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// 在事务中写入使用记录
    pub async fn insert_usage_in_tx(
        conn: &mut PgConnection,
        usage: &NewPackageUsage,
    ) -> Result<PackageUsage> {
        let sql = format!(
            r#"
            INSERT INTO package_usage_history (
                customer_id, grant_id, invoice_id, invoice_line_id, service_id, idempotency_key,
                benefit_kind, transaction_type, qty_deducted, amount_deducted, discount_applied,
                original_price, final_price, package_name, remaining_count_after,
                balance_remaining_after, staff_override, reversal_reference_id, applied_by, notes,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, NOW())
            RETURNING {}
            "#,
            USAGE_COLUMNS
        );

        sqlx::query_as::<_, PackageUsage>(&sql)
            .bind(usage.customer_id)
            .bind(usage.grant_id)
            .bind(usage.invoice_id)
            .bind(usage.invoice_line_id)
            .bind(usage.service_id)
            .bind(&usage.idempotency_key)
            .bind(usage.benefit_kind)
            .bind(usage.transaction_type)
            .bind(usage.qty_deducted)
            .bind(usage.amount_deducted)
            .bind(usage.discount_applied)
            .bind(usage.original_price)
            .bind(usage.final_price)
            .bind(&usage.package_name)
            .bind(usage.remaining_count_after)
            .bind(usage.balance_remaining_after)
            .bind(usage.staff_override)
            .bind(usage.reversal_reference_id)
            .bind(usage.applied_by)
            .bind(&usage.notes)
            .fetch_one(conn)
            .await
            .map_err(|e| map_insert_error(e, &usage.idempotency_key))
    }

    async fn find_usage_by_key_on(
        conn: &mut PgConnection,
        key: &str,
    ) -> Result<Option<PackageUsage>> {
        let sql = format!(
            "SELECT {} FROM package_usage_history WHERE idempotency_key = $1",
            USAGE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PackageUsage>(&sql)
            .bind(key)
            .fetch_optional(conn)
            .await?)
    }

    async fn get_usage_on(conn: &mut PgConnection, usage_id: i64) -> Result<Option<PackageUsage>> {
        let sql = format!(
            "SELECT {} FROM package_usage_history WHERE id = $1",
            USAGE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PackageUsage>(&sql)
            .bind(usage_id)
            .fetch_optional(conn)
            .await?)
    }
}

#[async_trait]
impl PackageStore for PgPackageStore {
    async fn begin(&self) -> Result<Box<dyn BillingTransaction>> {
        let mut tx = self.pool.begin().await?;

        // SET 不支持参数绑定，毫秒数为整数
        let set_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&set_timeout).execute(&mut *tx).await?;

        Ok(Box::new(PgBillingTransaction { tx: Some(tx) }))
    }

    async fn list_customer_grants(&self, customer_id: i64) -> Result<Vec<PackageGrant>> {
        let sql = format!(
            "SELECT {} FROM package_grants WHERE customer_id = $1 ORDER BY valid_to ASC, id ASC",
            GRANT_COLUMNS
        );
        let rows = sqlx::query_as::<_, PackageGrantRow>(&sql)
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(PackageGrant::try_from).collect()
    }

    async fn get_grant(&self, grant_id: i64) -> Result<Option<PackageGrant>> {
        let sql = format!("SELECT {} FROM package_grants WHERE id = $1", GRANT_COLUMNS);
        let row = sqlx::query_as::<_, PackageGrantRow>(&sql)
            .bind(grant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(PackageGrant::try_from).transpose()
    }

    async fn create_grant(&self, grant: &NewPackageGrant) -> Result<PackageGrant> {
        let cols = CapacityColumns::from(&grant.benefit);
        let sql = format!(
            r#"
            INSERT INTO package_grants (
                customer_id, template_id, package_name, service_id, benefit_kind,
                valid_from, valid_to, is_active,
                total_allocated, used_count, remaining_count, discount_percentage,
                balance_total, balance_used, balance_remaining,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW())
            RETURNING {}
            "#,
            GRANT_COLUMNS
        );

        let row = sqlx::query_as::<_, PackageGrantRow>(&sql)
            .bind(grant.customer_id)
            .bind(grant.template_id)
            .bind(&grant.package_name)
            .bind(grant.service_id)
            .bind(grant.benefit.kind())
            .bind(grant.valid_from)
            .bind(grant.valid_to)
            .bind(cols.total_allocated)
            .bind(cols.used_count)
            .bind(cols.remaining_count)
            .bind(cols.discount_percentage)
            .bind(cols.balance_total)
            .bind(cols.balance_used)
            .bind(cols.balance_remaining)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn deactivate_expired_grants(&self, now: DateTime<Utc>, batch_size: i64) -> Result<u64> {
        // SKIP LOCKED 避免与正在抵扣的事务互相等待
        let result = sqlx::query(
            r#"
            UPDATE package_grants
            SET is_active = FALSE, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM package_grants
                WHERE is_active = TRUE AND valid_to < $1
                ORDER BY valid_to
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(now)
        .bind(batch_size)
        .execute(&self.pool)
        .await?;

        debug!(count = result.rows_affected(), "停用过期套餐");
        Ok(result.rows_affected())
    }

    async fn get_template(&self, template_id: i64) -> Result<Option<PackageTemplate>> {
        let sql = format!(
            "SELECT {} FROM package_templates WHERE id = $1",
            TEMPLATE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PackageTemplate>(&sql)
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_templates(&self, template_ids: &[i64]) -> Result<Vec<PackageTemplate>> {
        if template_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM package_templates WHERE id = ANY($1)",
            TEMPLATE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PackageTemplate>(&sql)
            .bind(template_ids)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_usage_by_idempotency_key(&self, key: &str) -> Result<Option<PackageUsage>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_usage_by_key_on(&mut conn, key).await
    }

    async fn get_usage(&self, usage_id: i64) -> Result<Option<PackageUsage>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_usage_on(&mut conn, usage_id).await
    }

    async fn list_usage_by_invoice(&self, invoice_id: i64) -> Result<Vec<PackageUsage>> {
        let sql = format!(
            "SELECT {} FROM package_usage_history WHERE invoice_id = $1 ORDER BY id",
            USAGE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PackageUsage>(&sql)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_usage_by_customer(
        &self,
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<PackageUsage>> {
        let sql = format!(
            r#"
            SELECT {} FROM package_usage_history
            WHERE customer_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            USAGE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PackageUsage>(&sql)
            .bind(customer_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }
}

/// PostgreSQL 计费事务
pub struct PgBillingTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgBillingTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| BillingError::Internal("事务已提交".to_string()))
    }
}

#[async_trait]
impl BillingTransaction for PgBillingTransaction {
    async fn find_usage_by_idempotency_key(&mut self, key: &str) -> Result<Option<PackageUsage>> {
        PgPackageStore::find_usage_by_key_on(self.conn()?, key).await
    }

    async fn lock_grant(&mut self, grant_id: i64) -> Result<PackageGrant> {
        PgPackageStore::lock_grant_in_tx(self.conn()?, grant_id).await
    }

    async fn update_grant(&mut self, grant: &PackageGrant) -> Result<()> {
        PgPackageStore::update_grant_in_tx(self.conn()?, grant).await
    }

    async fn insert_usage(&mut self, usage: &NewPackageUsage) -> Result<PackageUsage> {
        PgPackageStore::insert_usage_in_tx(self.conn()?, usage).await
    }

    async fn get_usage(&mut self, usage_id: i64) -> Result<Option<PackageUsage>> {
        PgPackageStore::get_usage_on(self.conn()?, usage_id).await
    }

    async fn find_reversal_of(&mut self, usage_id: i64) -> Result<Option<PackageUsage>> {
        let sql = format!(
            "SELECT {} FROM package_usage_history WHERE reversal_reference_id = $1",
            USAGE_COLUMNS
        );
        Ok(sqlx::query_as::<_, PackageUsage>(&sql)
            .bind(usage_id)
            .fetch_optional(self.conn()?)
            .await?)
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| BillingError::Internal("事务已提交".to_string()))?;
        tx.commit().await?;
        Ok(())
    }
}
