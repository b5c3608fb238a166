//! 内存套餐存储
//!
//! 单进程部署和测试使用。每个套餐一把 `tokio::sync::Mutex` 作为行锁，
//! 事务内的写入先暂存，提交时在全局状态锁下一次性生效；提交时重新校验幂等键
//! 与冲正引用的唯一性，对应数据库的唯一索引。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as GrantLock, OwnedMutexGuard};

use super::traits::{BillingTransaction, PackageStore};
use crate::error::{BillingError, Result};
use crate::models::{NewPackageGrant, NewPackageUsage, PackageGrant, PackageTemplate, PackageUsage};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Default)]
struct MemoryState {
    grants: HashMap<i64, PackageGrant>,
    templates: HashMap<i64, PackageTemplate>,
    usages: BTreeMap<i64, PackageUsage>,
    usage_keys: HashMap<String, i64>,
    /// 原记录 id -> 冲正记录 id
    reversals: HashMap<i64, i64>,
}

impl MemoryState {
    fn usage_by_key(&self, key: &str) -> Option<PackageUsage> {
        self.usage_keys
            .get(key)
            .and_then(|id| self.usages.get(id))
            .cloned()
    }

    fn reversal_of(&self, usage_id: i64) -> Option<PackageUsage> {
        self.reversals
            .get(&usage_id)
            .and_then(|id| self.usages.get(id))
            .cloned()
    }
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    grant_locks: DashMap<i64, Arc<GrantLock<()>>>,
    next_grant_id: AtomicI64,
    next_usage_id: AtomicI64,
}

impl MemoryInner {
    fn grant_lock(&self, grant_id: i64) -> Arc<GrantLock<()>> {
        self.grant_locks
            .entry(grant_id)
            .or_insert_with(|| Arc::new(GrantLock::new(())))
            .clone()
    }
}

/// 内存套餐存储
#[derive(Clone)]
pub struct MemoryPackageStore {
    inner: Arc<MemoryInner>,
    lock_timeout: Duration,
}

impl Default for MemoryPackageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPackageStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                grant_locks: DashMap::new(),
                next_grant_id: AtomicI64::new(1),
                next_usage_id: AtomicI64::new(1),
            }),
            lock_timeout,
        }
    }

    /// 写入套餐模板（模板维护不在计费核心内）
    pub fn insert_template(&self, template: PackageTemplate) {
        self.inner.state.lock().templates.insert(template.id, template);
    }

    /// 直接写入套餐，用于导入已有数据
    pub fn put_grant(&self, grant: PackageGrant) {
        self.inner
            .next_grant_id
            .fetch_max(grant.id + 1, Ordering::SeqCst);
        self.inner.state.lock().grants.insert(grant.id, grant);
    }
}

#[async_trait]
impl PackageStore for MemoryPackageStore {
    async fn begin(&self) -> Result<Box<dyn BillingTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            lock_timeout: self.lock_timeout,
            leases: HashMap::new(),
            staged_grants: HashMap::new(),
            staged_usages: Vec::new(),
            committed: false,
        }))
    }

    async fn list_customer_grants(&self, customer_id: i64) -> Result<Vec<PackageGrant>> {
        let state = self.inner.state.lock();
        let mut grants: Vec<PackageGrant> = state
            .grants
            .values()
            .filter(|g| g.customer_id == customer_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| a.valid_to.cmp(&b.valid_to).then(a.id.cmp(&b.id)));
        Ok(grants)
    }

    async fn get_grant(&self, grant_id: i64) -> Result<Option<PackageGrant>> {
        Ok(self.inner.state.lock().grants.get(&grant_id).cloned())
    }

    async fn create_grant(&self, grant: &NewPackageGrant) -> Result<PackageGrant> {
        let now = Utc::now();
        let created = PackageGrant {
            id: self.inner.next_grant_id.fetch_add(1, Ordering::SeqCst),
            customer_id: grant.customer_id,
            template_id: grant.template_id,
            package_name: grant.package_name.clone(),
            service_id: grant.service_id,
            valid_from: grant.valid_from,
            valid_to: grant.valid_to,
            is_active: true,
            benefit: grant.benefit.clone(),
            created_at: now,
            updated_at: now,
        };
        self.inner
            .state
            .lock()
            .grants
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn deactivate_expired_grants(&self, now: DateTime<Utc>, batch_size: i64) -> Result<u64> {
        let limit = usize::try_from(batch_size).unwrap_or(0);
        let mut state = self.inner.state.lock();

        let mut expired: Vec<(DateTime<Utc>, i64)> = state
            .grants
            .values()
            .filter(|g| g.is_active && g.valid_to < now)
            .map(|g| (g.valid_to, g.id))
            .collect();
        expired.sort();

        let mut count = 0u64;
        for (_, id) in expired.into_iter().take(limit) {
            // 正被事务持有的套餐跳过，下一轮再处理
            let Ok(_lease) = self.inner.grant_lock(id).try_lock_owned() else {
                continue;
            };
            if let Some(grant) = state.grants.get_mut(&id) {
                grant.is_active = false;
                grant.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_template(&self, template_id: i64) -> Result<Option<PackageTemplate>> {
        Ok(self.inner.state.lock().templates.get(&template_id).cloned())
    }

    async fn get_templates(&self, template_ids: &[i64]) -> Result<Vec<PackageTemplate>> {
        let state = self.inner.state.lock();
        Ok(template_ids
            .iter()
            .filter_map(|id| state.templates.get(id).cloned())
            .collect())
    }

    async fn find_usage_by_idempotency_key(&self, key: &str) -> Result<Option<PackageUsage>> {
        Ok(self.inner.state.lock().usage_by_key(key))
    }

    async fn get_usage(&self, usage_id: i64) -> Result<Option<PackageUsage>> {
        Ok(self.inner.state.lock().usages.get(&usage_id).cloned())
    }

    async fn list_usage_by_invoice(&self, invoice_id: i64) -> Result<Vec<PackageUsage>> {
        let state = self.inner.state.lock();
        Ok(state
            .usages
            .values()
            .filter(|u| u.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn list_usage_by_customer(
        &self,
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<PackageUsage>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let state = self.inner.state.lock();
        Ok(state
            .usages
            .values()
            .rev()
            .filter(|u| u.customer_id == customer_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// 内存计费事务
pub struct MemoryTransaction {
    inner: Arc<MemoryInner>,
    lock_timeout: Duration,
    leases: HashMap<i64, OwnedMutexGuard<()>>,
    staged_grants: HashMap<i64, PackageGrant>,
    staged_usages: Vec<PackageUsage>,
    committed: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.committed {
            return Err(BillingError::Internal("事务已提交".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingTransaction for MemoryTransaction {
    async fn find_usage_by_idempotency_key(&mut self, key: &str) -> Result<Option<PackageUsage>> {
        if let Some(staged) = self.staged_usages.iter().find(|u| u.idempotency_key == key) {
            return Ok(Some(staged.clone()));
        }
        let found = self.inner.state.lock().usage_by_key(key);
        Ok(found)
    }

    async fn lock_grant(&mut self, grant_id: i64) -> Result<PackageGrant> {
        self.ensure_open()?;

        if !self.leases.contains_key(&grant_id) {
            let exists = self.inner.state.lock().grants.contains_key(&grant_id);
            if !exists {
                return Err(BillingError::GrantNotFound(grant_id));
            }

            let lock = self.inner.grant_lock(grant_id);
            let lease = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
                .await
                .map_err(|_| BillingError::LockTimeout(grant_id))?;
            self.leases.insert(grant_id, lease);
        }

        if let Some(staged) = self.staged_grants.get(&grant_id) {
            return Ok(staged.clone());
        }
        let current = self.inner.state.lock().grants.get(&grant_id).cloned();
        current.ok_or(BillingError::GrantNotFound(grant_id))
    }

    async fn update_grant(&mut self, grant: &PackageGrant) -> Result<()> {
        self.ensure_open()?;
        if !self.leases.contains_key(&grant.id) {
            return Err(BillingError::Internal(format!(
                "更新未锁定的套餐: grant_id={}",
                grant.id
            )));
        }

        let mut updated = grant.clone();
        updated.updated_at = Utc::now();
        self.staged_grants.insert(grant.id, updated);
        Ok(())
    }

    async fn insert_usage(&mut self, usage: &NewPackageUsage) -> Result<PackageUsage> {
        self.ensure_open()?;

        let staged_dup = self
            .staged_usages
            .iter()
            .any(|u| u.idempotency_key == usage.idempotency_key);
        let committed_dup = self
            .inner
            .state
            .lock()
            .usage_keys
            .contains_key(&usage.idempotency_key);
        if staged_dup || committed_dup {
            return Err(BillingError::DuplicateIdempotencyKey(
                usage.idempotency_key.clone(),
            ));
        }

        let id = self.inner.next_usage_id.fetch_add(1, Ordering::SeqCst);
        let record = usage.clone().into_usage(id, Utc::now());
        self.staged_usages.push(record.clone());
        Ok(record)
    }

    async fn get_usage(&mut self, usage_id: i64) -> Result<Option<PackageUsage>> {
        if let Some(staged) = self.staged_usages.iter().find(|u| u.id == usage_id) {
            return Ok(Some(staged.clone()));
        }
        let found = self.inner.state.lock().usages.get(&usage_id).cloned();
        Ok(found)
    }

    async fn find_reversal_of(&mut self, usage_id: i64) -> Result<Option<PackageUsage>> {
        if let Some(staged) = self
            .staged_usages
            .iter()
            .find(|u| u.reversal_reference_id == Some(usage_id))
        {
            return Ok(Some(staged.clone()));
        }
        let found = self.inner.state.lock().reversal_of(usage_id);
        Ok(found)
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;

        {
            let mut state = self.inner.state.lock();

            for usage in &self.staged_usages {
                if state.usage_keys.contains_key(&usage.idempotency_key) {
                    return Err(BillingError::DuplicateIdempotencyKey(
                        usage.idempotency_key.clone(),
                    ));
                }
                if let Some(original) = usage.reversal_reference_id {
                    if state.reversals.contains_key(&original) {
                        return Err(BillingError::DuplicateIdempotencyKey(
                            usage.idempotency_key.clone(),
                        ));
                    }
                }
            }

            for (id, grant) in self.staged_grants.drain() {
                state.grants.insert(id, grant);
            }
            for usage in self.staged_usages.drain(..) {
                state
                    .usage_keys
                    .insert(usage.idempotency_key.clone(), usage.id);
                if let Some(original) = usage.reversal_reference_id {
                    state.reversals.insert(original, usage.id);
                }
                state.usages.insert(usage.id, usage);
            }
        }

        self.leases.clear();
        self.committed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BenefitKind, GrantBenefit, TransactionType};
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn new_grant() -> NewPackageGrant {
        let now = Utc::now();
        NewPackageGrant {
            customer_id: 1,
            template_id: 1,
            package_name: "赠送 3 次".to_string(),
            service_id: Some(10),
            valid_from: now - ChronoDuration::days(1),
            valid_to: now + ChronoDuration::days(30),
            benefit: GrantBenefit::free(3),
        }
    }

    fn usage(grant_id: i64, key: &str) -> NewPackageUsage {
        NewPackageUsage {
            customer_id: 1,
            grant_id,
            invoice_id: 1,
            invoice_line_id: 1,
            service_id: 10,
            idempotency_key: key.to_string(),
            benefit_kind: BenefitKind::Free,
            transaction_type: TransactionType::Use,
            qty_deducted: 1,
            amount_deducted: dec!(100),
            discount_applied: Decimal::ZERO,
            original_price: dec!(100),
            final_price: Decimal::ZERO,
            package_name: "赠送 3 次".to_string(),
            remaining_count_after: Some(2),
            balance_remaining_after: None,
            staff_override: false,
            reversal_reference_id: None,
            applied_by: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_rolls_back() {
        let store = MemoryPackageStore::new();
        let grant = store.create_grant(&new_grant()).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let mut locked = tx.lock_grant(grant.id).await.unwrap();
            locked.is_active = false;
            tx.update_grant(&locked).await.unwrap();
            tx.insert_usage(&usage(grant.id, "1_1")).await.unwrap();
        }

        let after = store.get_grant(grant.id).await.unwrap().unwrap();
        assert!(after.is_active);
        assert!(
            store
                .find_usage_by_idempotency_key("1_1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_commit_rejects_duplicate_key() {
        let store = MemoryPackageStore::new();
        let grant = store.create_grant(&new_grant()).await.unwrap();

        let mut first = store.begin().await.unwrap();
        first.insert_usage(&usage(grant.id, "1_1")).await.unwrap();

        let mut second = store.begin().await.unwrap();
        second.insert_usage(&usage(grant.id, "1_1")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, BillingError::DuplicateIdempotencyKey(_)));
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let store = MemoryPackageStore::with_lock_timeout(std::time::Duration::from_millis(50));
        let grant = store.create_grant(&new_grant()).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.lock_grant(grant.id).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.lock_grant(grant.id).await.unwrap_err();
        assert!(matches!(err, BillingError::LockTimeout(id) if id == grant.id));

        drop(holder);
        tokio_test::assert_ok!(waiter.lock_grant(grant.id).await);
    }

    #[tokio::test]
    async fn test_lock_missing_grant() {
        let store = MemoryPackageStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.lock_grant(404).await,
            Err(BillingError::GrantNotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_deactivate_expired_skips_locked() {
        let store = MemoryPackageStore::new();
        let mut expired = new_grant();
        expired.valid_to = Utc::now() - ChronoDuration::hours(1);
        let a = store.create_grant(&expired).await.unwrap();
        let b = store.create_grant(&expired).await.unwrap();
        store.create_grant(&new_grant()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_grant(a.id).await.unwrap();

        let count = store.deactivate_expired_grants(Utc::now(), 100).await.unwrap();
        assert_eq!(count, 1);
        assert!(!store.get_grant(b.id).await.unwrap().unwrap().is_active);
        assert!(store.get_grant(a.id).await.unwrap().unwrap().is_active);
    }
}
