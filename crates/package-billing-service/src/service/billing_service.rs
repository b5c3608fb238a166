//! 套餐计费服务
//!
//! 负责发票行的套餐抵扣与冲正。对外两个入口不返回错误：
//! 所有失败都在边界处记录日志、回滚事务，并转换为 `success=false` 的结果。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use salon_shared::observability::metrics::{record_benefit_application, record_benefit_reversal};
use tracing::{debug, error, info, instrument, warn};

use super::dto::{
    ApplicationResult, ApplyBenefitRequest, AssignPackageRequest, CustomerPackageSummary,
    PackageSummaryItem, ReversalResult,
};
use crate::engine::{consume, covers_service, locate, plan_deduction, restore, select};
use crate::error::{BillingError, Result};
use crate::models::{
    GrantBenefit, NewPackageUsage, PackageGrant, PackageUsage, RemainingBalance, ReversalReason,
    TransactionType, reversal_key,
};
use crate::repository::{BillingTransaction, PackageStore};

/// 使用记录单次查询的最大条数
const MAX_HISTORY_LIMIT: i64 = 500;

/// 套餐计费服务
pub struct PackageBillingService {
    store: Arc<dyn PackageStore>,
}

impl PackageBillingService {
    pub fn new(store: Arc<dyn PackageStore>) -> Self {
        Self { store }
    }

    /// 为发票行应用套餐权益
    ///
    /// 流程：
    /// 1. 幂等检查（同一发票行只抵扣一次）
    /// 2. 查找候选套餐并按优先级选取，或校验手动指定的套餐
    /// 3. 开启事务，锁定套餐行后复查幂等键与余量
    /// 4. 计算抵扣并扣减余量
    /// 5. 写入使用记录并提交
    #[instrument(
        skip(self, request),
        fields(
            customer_id = request.customer_id,
            service_id = request.service_id,
            invoice_id = request.invoice_id,
            invoice_line_id = request.invoice_line_id
        )
    )]
    pub async fn apply_package_benefit(&self, request: ApplyBenefitRequest) -> ApplicationResult {
        let started = Instant::now();

        let result = match self.try_apply(&request).await {
            Ok(result) => result,
            Err(e) => {
                if e.is_business_error() {
                    warn!(error = %e, code = e.error_code(), "套餐抵扣被拒绝");
                } else {
                    error!(error = %e, code = e.error_code(), "套餐抵扣失败，事务已回滚");
                }
                ApplicationResult::failure(request.service_price, &e)
            }
        };

        let kind = result.benefit_kind.map(|k| k.as_str()).unwrap_or("none");
        let outcome = if !result.success {
            "failed"
        } else if result.duplicate {
            "duplicate"
        } else if result.applied {
            "applied"
        } else {
            "not_applied"
        };
        record_benefit_application(kind, outcome, started.elapsed().as_secs_f64());

        result
    }

    async fn try_apply(&self, request: &ApplyBenefitRequest) -> Result<ApplicationResult> {
        request.validate()?;

        let key = request.idempotency_key();
        let price = request.service_price;
        let as_of = request.as_of.unwrap_or_else(Utc::now);

        // 开启事务前的读取都不占用事务连接，结论在锁内复查
        // 1. 幂等检查
        if let Some(existing) = self.store.find_usage_by_idempotency_key(&key).await? {
            info!(idempotency_key = %key, usage_id = existing.id, "幂等请求，返回已存在的抵扣结果");
            return self.cached_result(&existing).await;
        }

        if price.is_zero() {
            return Ok(ApplicationResult::not_applied(price, "零价格项目不使用套餐"));
        }

        // 2. 选取套餐
        let (grant_id, staff_override) = match request.manual_grant_id {
            Some(grant_id) => {
                self.validate_manual_grant(request, grant_id, as_of).await?;
                (grant_id, true)
            }
            None => match self.select_grant(request, as_of).await? {
                Some(grant_id) => (grant_id, false),
                None => {
                    debug!("没有适用的套餐，按原价计费");
                    return Ok(ApplicationResult::not_applied(
                        price,
                        "没有适用于该服务的套餐，按原价计费",
                    ));
                }
            },
        };

        // 3. 锁内复查
        let mut tx = self.store.begin().await?;
        let mut grant = tx.lock_grant(grant_id).await?;

        if let Some(existing) = tx.find_usage_by_idempotency_key(&key).await? {
            drop(tx);
            info!(idempotency_key = %key, usage_id = existing.id, "并发请求已完成抵扣，返回已存在的结果");
            return self.cached_result(&existing).await;
        }

        if let Err(reason) = grant.check_available(as_of) {
            info!(grant_id, reason = reason.describe(), "锁内复查套餐不可用，按原价计费");
            return Ok(ApplicationResult::not_applied(
                price,
                format!("套餐 {} 不可用: {}", grant.package_name, reason.describe()),
            ));
        }

        let Some(deduction) = plan_deduction(&grant.benefit, price, request.quantity) else {
            return Ok(ApplicationResult::not_applied(
                price,
                format!("套餐 {} 余量不足", grant.package_name),
            ));
        };

        // 4. 扣减余量
        consume(&mut grant, &deduction)?;
        tx.update_grant(&grant).await?;

        // 5. 写入使用记录
        let new_usage = NewPackageUsage {
            customer_id: request.customer_id,
            grant_id: grant.id,
            invoice_id: request.invoice_id,
            invoice_line_id: request.invoice_line_id,
            service_id: request.service_id,
            idempotency_key: key.clone(),
            benefit_kind: grant.kind(),
            transaction_type: TransactionType::Use,
            qty_deducted: deduction.qty_deducted,
            amount_deducted: deduction.amount_deducted,
            discount_applied: deduction.discount_applied,
            original_price: price,
            final_price: deduction.final_price,
            package_name: grant.package_name.clone(),
            remaining_count_after: grant.benefit.remaining_count(),
            balance_remaining_after: grant.benefit.balance_remaining(),
            staff_override,
            reversal_reference_id: None,
            applied_by: request.staff_id,
            notes: request.notes.clone(),
        };

        let usage = match Self::write_usage(tx, &new_usage).await {
            Ok(usage) => usage,
            Err(BillingError::DuplicateIdempotencyKey(_)) => {
                // 并发重试抢先写入，以胜出的记录为准
                return self.reread_winner(&key).await;
            }
            Err(e) => return Err(e),
        };

        info!(
            grant_id = grant.id,
            usage_id = usage.id,
            kind = %usage.benefit_kind,
            deduction = %usage.amount_deducted,
            final_price = %usage.final_price,
            staff_override,
            "套餐抵扣成功"
        );

        Ok(ApplicationResult::from_usage(&usage, &grant, false))
    }

    async fn write_usage(
        mut tx: Box<dyn BillingTransaction>,
        usage: &NewPackageUsage,
    ) -> Result<PackageUsage> {
        let record = tx.insert_usage(usage).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn cached_result(&self, usage: &PackageUsage) -> Result<ApplicationResult> {
        let grant = self
            .store
            .get_grant(usage.grant_id)
            .await?
            .ok_or(BillingError::GrantNotFound(usage.grant_id))?;
        Ok(ApplicationResult::from_usage(usage, &grant, true))
    }

    async fn reread_winner(&self, key: &str) -> Result<ApplicationResult> {
        let existing = self
            .store
            .find_usage_by_idempotency_key(key)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("幂等键冲突但记录不存在: {}", key)))?;
        warn!(idempotency_key = %key, usage_id = existing.id, "幂等键冲突，返回胜出的抵扣记录");
        self.cached_result(&existing).await
    }

    /// 校验手动指定的套餐：归属、覆盖、可用性
    async fn validate_manual_grant(
        &self,
        request: &ApplyBenefitRequest,
        grant_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<()> {
        let grant = self
            .store
            .get_grant(grant_id)
            .await?
            .ok_or(BillingError::GrantNotFound(grant_id))?;

        if grant.customer_id != request.customer_id {
            return Err(BillingError::GrantNotOwned {
                grant_id,
                customer_id: request.customer_id,
            });
        }

        let template = self.store.get_template(grant.template_id).await?;
        if !covers_service(&grant, template.as_ref(), request.service_id) {
            return Err(BillingError::GrantNotApplicable {
                grant_id,
                service_id: request.service_id,
            });
        }

        grant
            .check_available(as_of)
            .map_err(|reason| BillingError::GrantUnavailable {
                grant_id,
                reason: reason.describe().to_string(),
            })
    }

    /// 自动选取优先级最高的可用套餐
    async fn select_grant(
        &self,
        request: &ApplyBenefitRequest,
        as_of: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let grants = self.store.list_customer_grants(request.customer_id).await?;
        if grants.is_empty() {
            return Ok(None);
        }

        let mut template_ids: Vec<i64> = grants.iter().map(|g| g.template_id).collect();
        template_ids.sort_unstable();
        template_ids.dedup();
        let templates: HashMap<i64, _> = self
            .store
            .get_templates(&template_ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let candidates = locate(
            request.customer_id,
            &grants,
            &templates,
            request.service_id,
            as_of,
        );
        debug!(candidates = candidates.len(), "候选套餐");

        Ok(select(candidates).map(|g| g.id))
    }

    /// 冲正一条使用记录
    ///
    /// 恢复套餐余量并重新启用，写入负向的冲正记录。原记录保持不变。
    #[instrument(skip(self, reason), fields(reason = reason.as_str()))]
    pub async fn reverse_package_usage(
        &self,
        usage_id: i64,
        reason: ReversalReason,
        staff_id: Option<i64>,
    ) -> ReversalResult {
        match self.try_reverse(usage_id, reason, staff_id).await {
            Ok(result) => result,
            Err(e) => {
                if e.is_business_error() {
                    warn!(error = %e, code = e.error_code(), "冲正被拒绝");
                } else {
                    error!(error = %e, code = e.error_code(), "冲正失败，事务已回滚");
                }
                ReversalResult::failure(usage_id, &e)
            }
        }
    }

    async fn try_reverse(
        &self,
        usage_id: i64,
        reason: ReversalReason,
        staff_id: Option<i64>,
    ) -> Result<ReversalResult> {
        let mut tx = self.store.begin().await?;

        let original = tx
            .get_usage(usage_id)
            .await?
            .ok_or(BillingError::UsageNotFound(usage_id))?;

        if original.transaction_type != TransactionType::Use {
            return Err(BillingError::InvalidReversalTarget {
                usage_id,
                transaction_type: original.transaction_type.to_string(),
            });
        }

        let mut grant = tx.lock_grant(original.grant_id).await?;

        if tx.find_reversal_of(usage_id).await?.is_some() {
            return Err(BillingError::AlreadyReversed(usage_id));
        }

        restore(&mut grant, original.qty_deducted, original.amount_deducted)?;
        tx.update_grant(&grant).await?;

        let reversal = NewPackageUsage {
            customer_id: original.customer_id,
            grant_id: original.grant_id,
            invoice_id: original.invoice_id,
            invoice_line_id: original.invoice_line_id,
            service_id: original.service_id,
            idempotency_key: reversal_key(&original.idempotency_key),
            benefit_kind: original.benefit_kind,
            transaction_type: reason.transaction_type(),
            qty_deducted: -original.qty_deducted,
            amount_deducted: -original.amount_deducted,
            discount_applied: -original.discount_applied,
            original_price: original.original_price,
            final_price: original.final_price,
            package_name: original.package_name.clone(),
            remaining_count_after: grant.benefit.remaining_count(),
            balance_remaining_after: grant.benefit.balance_remaining(),
            staff_override: false,
            reversal_reference_id: Some(original.id),
            applied_by: staff_id,
            notes: Some(format!("冲正使用记录 #{}", original.id)),
        };

        let record = Self::write_usage(tx, &reversal)
            .await
            .map_err(|e| match e {
                BillingError::DuplicateIdempotencyKey(_) => BillingError::AlreadyReversed(usage_id),
                other => other,
            })?;

        record_benefit_reversal(original.benefit_kind.as_str(), reason.as_str());
        info!(
            usage_id,
            reversal_id = record.id,
            grant_id = grant.id,
            "套餐使用记录已冲正"
        );

        Ok(ReversalResult::success(
            usage_id,
            record.id,
            grant.remaining_balance(),
            format!("已冲正套餐 {} 的使用记录", original.package_name),
        ))
    }

    // ==================== 查询 ====================

    /// 客户当前可用的套餐
    #[instrument(skip(self))]
    pub async fn get_customer_active_packages(
        &self,
        customer_id: i64,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<PackageGrant>> {
        let as_of = as_of.unwrap_or_else(Utc::now);
        let grants = self.store.list_customer_grants(customer_id).await?;
        Ok(grants.into_iter().filter(|g| g.is_available(as_of)).collect())
    }

    /// 客户套餐摘要
    #[instrument(skip(self))]
    pub async fn get_customer_package_summary(
        &self,
        customer_id: i64,
    ) -> Result<CustomerPackageSummary> {
        let now = Utc::now();
        let grants = self.store.list_customer_grants(customer_id).await?;

        let (active, inactive): (Vec<_>, Vec<_>) =
            grants.iter().partition(|g| g.is_available(now));

        let mut prepaid_balance_total = Decimal::ZERO;
        let mut sessions_remaining_total = 0;
        let mut has_unlimited_membership = false;
        for grant in &active {
            match grant.remaining_balance() {
                RemainingBalance::Prepaid { remaining, .. } => prepaid_balance_total += remaining,
                RemainingBalance::Sessions { remaining, .. } => {
                    sessions_remaining_total += remaining
                }
                RemainingBalance::Unlimited { .. } => has_unlimited_membership = true,
            }
        }

        Ok(CustomerPackageSummary {
            customer_id,
            active_packages: active.into_iter().map(PackageSummaryItem::from).collect(),
            inactive_count: inactive.len(),
            prepaid_balance_total,
            sessions_remaining_total,
            has_unlimited_membership,
        })
    }

    /// 客户的使用记录，按时间倒序
    #[instrument(skip(self))]
    pub async fn get_usage_history(
        &self,
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<PackageUsage>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self.store.list_usage_by_customer(customer_id, limit).await
    }

    /// 发票的全部使用记录（含冲正）
    #[instrument(skip(self))]
    pub async fn list_invoice_usage(&self, invoice_id: i64) -> Result<Vec<PackageUsage>> {
        self.store.list_usage_by_invoice(invoice_id).await
    }

    // ==================== 套餐分配 ====================

    /// 按模板为客户分配套餐
    #[instrument(skip(self, request), fields(customer_id = request.customer_id, template_id = request.template_id))]
    pub async fn assign_package(&self, request: AssignPackageRequest) -> Result<PackageGrant> {
        let template = self
            .store
            .get_template(request.template_id)
            .await?
            .ok_or(BillingError::TemplateNotFound(request.template_id))?;

        let valid_from = request.valid_from.unwrap_or_else(Utc::now);
        let new_grant = template.issue_grant(request.customer_id, valid_from, request.service_id)?;
        let grant = self.store.create_grant(&new_grant).await?;

        let capacity = match &grant.benefit {
            GrantBenefit::Unlimited => "unlimited".to_string(),
            GrantBenefit::Free {
                total_allocated, ..
            }
            | GrantBenefit::Discount {
                total_allocated, ..
            } => format!("{} sessions", total_allocated),
            GrantBenefit::Prepaid { balance_total, .. } => balance_total.to_string(),
        };
        info!(
            grant_id = grant.id,
            package_name = %grant.package_name,
            valid_to = %grant.valid_to,
            capacity = %capacity,
            staff_id = ?request.staff_id,
            "套餐已分配"
        );

        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockPackageStore;
    use chrono::Duration;
    use mockall::Sequence;
    use rust_decimal_macros::dec;

    fn grant(id: i64, benefit: GrantBenefit, active: bool) -> PackageGrant {
        let now = Utc::now();
        PackageGrant {
            id,
            customer_id: 1,
            template_id: 1,
            package_name: format!("套餐{}", id),
            service_id: None,
            valid_from: now - Duration::days(1),
            valid_to: now + Duration::days(30),
            is_active: active,
            benefit,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_apply_converts_store_failure_to_result() {
        let mut store = MockPackageStore::new();
        store
            .expect_find_usage_by_idempotency_key()
            .returning(|_| Err(BillingError::Database(sqlx::Error::PoolTimedOut)));
        store.expect_begin().never();

        let service = PackageBillingService::new(Arc::new(store));
        let result = service
            .apply_package_benefit(ApplyBenefitRequest::new(1, 2, dec!(80), 10, 1))
            .await;

        assert!(!result.success);
        assert!(!result.applied);
        assert_eq!(result.final_price, dec!(80));
        assert_eq!(result.error_code.as_deref(), Some("DATABASE_ERROR"));
    }

    #[tokio::test]
    async fn test_selection_reads_finish_before_transaction() {
        let mut store = MockPackageStore::new();
        let mut seq = Sequence::new();
        store
            .expect_find_usage_by_idempotency_key()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        store
            .expect_list_customer_grants()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![grant(1, GrantBenefit::prepaid(dec!(200)), true)]));
        store
            .expect_get_templates()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Vec::new()));
        store
            .expect_begin()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(BillingError::Database(sqlx::Error::PoolTimedOut)));

        let service = PackageBillingService::new(Arc::new(store));
        let result = service
            .apply_package_benefit(ApplyBenefitRequest::new(1, 2, dec!(80), 10, 1))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("DATABASE_ERROR"));
    }

    #[tokio::test]
    async fn test_manual_override_checked_before_transaction() {
        let mut store = MockPackageStore::new();
        store
            .expect_find_usage_by_idempotency_key()
            .returning(|_| Ok(None));
        store.expect_get_grant().returning(|id| {
            let mut other = grant(id, GrantBenefit::free(2), true);
            other.customer_id = 99;
            Ok(Some(other))
        });
        store.expect_begin().never();

        let service = PackageBillingService::new(Arc::new(store));
        let result = service
            .apply_package_benefit(ApplyBenefitRequest::new(1, 2, dec!(80), 10, 1).with_manual_grant(3))
            .await;

        assert_eq!(result.error_code.as_deref(), Some("GRANT_NOT_OWNED"));
    }

    #[tokio::test]
    async fn test_unbounded_price_rejected_as_validation() {
        let mut store = MockPackageStore::new();
        store.expect_find_usage_by_idempotency_key().never();
        store.expect_begin().never();

        let service = PackageBillingService::new(Arc::new(store));
        let result = service
            .apply_package_benefit(ApplyBenefitRequest::new(1, 5, Decimal::MAX, 10, 1))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("VALIDATION_ERROR"));
        assert_eq!(result.final_price, Decimal::MAX);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_store() {
        let mut store = MockPackageStore::new();
        store.expect_begin().never();

        let service = PackageBillingService::new(Arc::new(store));
        let result = service
            .apply_package_benefit(ApplyBenefitRequest::new(1, 2, dec!(80), 10, 1).with_quantity(0))
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn test_reverse_converts_store_failure_to_result() {
        let mut store = MockPackageStore::new();
        store
            .expect_begin()
            .returning(|| Err(BillingError::Internal("down".to_string())));

        let service = PackageBillingService::new(Arc::new(store));
        let result = service
            .reverse_package_usage(7, ReversalReason::Refund, None)
            .await;

        assert!(!result.success);
        assert_eq!(result.original_usage_id, 7);
        assert!(result.reversal_id.is_none());
    }

    #[tokio::test]
    async fn test_package_summary_totals() {
        let mut store = MockPackageStore::new();
        store.expect_list_customer_grants().returning(|_| {
            Ok(vec![
                grant(1, GrantBenefit::prepaid(dec!(200)), true),
                grant(2, GrantBenefit::free(4), true),
                grant(3, GrantBenefit::discount(2, dec!(10)), true),
                grant(4, GrantBenefit::Unlimited, true),
                grant(5, GrantBenefit::free(3), false),
            ])
        });

        let service = PackageBillingService::new(Arc::new(store));
        let summary = service.get_customer_package_summary(1).await.unwrap();

        assert_eq!(summary.active_packages.len(), 4);
        assert_eq!(summary.inactive_count, 1);
        assert_eq!(summary.prepaid_balance_total, dec!(200));
        assert_eq!(summary.sessions_remaining_total, 6);
        assert!(summary.has_unlimited_membership);
    }

    #[tokio::test]
    async fn test_usage_history_limit_is_clamped() {
        let mut store = MockPackageStore::new();
        store
            .expect_list_usage_by_customer()
            .withf(|customer_id, limit| *customer_id == 1 && *limit == MAX_HISTORY_LIMIT)
            .returning(|_, _| Ok(Vec::new()));

        let service = PackageBillingService::new(Arc::new(store));
        assert!(service.get_usage_history(1, 10_000).await.unwrap().is_empty());
    }
}
