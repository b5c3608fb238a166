//! 仓储 Trait 定义
//!
//! 服务层依赖抽象而非具体实现：生产环境使用 PostgreSQL，测试和单进程部署使用内存实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{NewPackageGrant, NewPackageUsage, PackageGrant, PackageTemplate, PackageUsage};

/// 计费事务
///
/// 套餐行锁的作用域与事务一致，提交或回滚时释放。未提交即 drop 视为回滚。
#[async_trait]
pub trait BillingTransaction: Send {
    async fn find_usage_by_idempotency_key(&mut self, key: &str) -> Result<Option<PackageUsage>>;

    /// 锁定套餐行并返回最新状态，套餐不存在时返回 `GrantNotFound`
    async fn lock_grant(&mut self, grant_id: i64) -> Result<PackageGrant>;

    /// 写回已锁定套餐的余量和状态
    async fn update_grant(&mut self, grant: &PackageGrant) -> Result<()>;

    /// 写入使用记录，幂等键冲突时返回 `DuplicateIdempotencyKey`
    async fn insert_usage(&mut self, usage: &NewPackageUsage) -> Result<PackageUsage>;

    async fn get_usage(&mut self, usage_id: i64) -> Result<Option<PackageUsage>>;

    /// 查找冲正了指定记录的冲正记录
    async fn find_reversal_of(&mut self, usage_id: i64) -> Result<Option<PackageUsage>>;

    async fn commit(&mut self) -> Result<()>;
}

/// 套餐存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn BillingTransaction>>;

    // 套餐
    async fn list_customer_grants(&self, customer_id: i64) -> Result<Vec<PackageGrant>>;
    async fn get_grant(&self, grant_id: i64) -> Result<Option<PackageGrant>>;
    async fn create_grant(&self, grant: &NewPackageGrant) -> Result<PackageGrant>;

    /// 停用已过期的套餐，返回本批停用数量
    async fn deactivate_expired_grants(&self, now: DateTime<Utc>, batch_size: i64) -> Result<u64>;

    // 模板
    async fn get_template(&self, template_id: i64) -> Result<Option<PackageTemplate>>;
    async fn get_templates(&self, template_ids: &[i64]) -> Result<Vec<PackageTemplate>>;

    // 使用记录
    async fn find_usage_by_idempotency_key(&self, key: &str) -> Result<Option<PackageUsage>>;
    async fn get_usage(&self, usage_id: i64) -> Result<Option<PackageUsage>>;
    async fn list_usage_by_invoice(&self, invoice_id: i64) -> Result<Vec<PackageUsage>>;
    async fn list_usage_by_customer(
        &self,
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<PackageUsage>>;
}
