//! 服务层数据传输对象
//!
//! 调用方（开票模块）只依赖这些结构，不接触存储层错误

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::engine::check_money;
use crate::error::BillingError;
use crate::models::{BenefitKind, PackageGrant, PackageUsage, RemainingBalance, idempotency_key};

fn default_quantity() -> i32 {
    1
}

/// 套餐抵扣请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyBenefitRequest {
    pub customer_id: i64,
    pub service_id: i64,
    /// 整行价格
    pub service_price: Decimal,
    pub invoice_id: i64,
    pub invoice_line_id: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    /// 前台手动指定的套餐
    #[serde(default)]
    pub manual_grant_id: Option<i64>,
    /// 服务日期，默认当前时间
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
    /// 操作员
    #[serde(default)]
    pub staff_id: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ApplyBenefitRequest {
    pub fn new(
        customer_id: i64,
        service_id: i64,
        service_price: Decimal,
        invoice_id: i64,
        invoice_line_id: i64,
    ) -> Self {
        Self {
            customer_id,
            service_id,
            service_price,
            invoice_id,
            invoice_line_id,
            quantity: 1,
            manual_grant_id: None,
            as_of: None,
            staff_id: None,
            notes: None,
        }
    }

    pub fn with_quantity(mut self, quantity: i32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_manual_grant(mut self, grant_id: i64) -> Self {
        self.manual_grant_id = Some(grant_id);
        self
    }

    pub fn with_as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn with_staff(mut self, staff_id: i64) -> Self {
        self.staff_id = Some(staff_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.invoice_id, self.invoice_line_id)
    }

    /// 基本参数校验
    pub fn validate(&self) -> Result<(), BillingError> {
        if self.quantity < 1 {
            return Err(BillingError::Validation(format!(
                "数量必须大于 0: {}",
                self.quantity
            )));
        }
        check_money(self.service_price, "价格")?;
        Ok(())
    }
}

/// 套餐抵扣结果
///
/// `success=false` 表示请求被拒绝（如手动指定的套餐无效）；
/// `applied=false` 且 `success=true` 表示没有可用套餐，按原价计费。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationResult {
    pub success: bool,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benefit_kind: Option<BenefitKind>,
    pub original_price: Decimal,
    pub final_price: Decimal,
    pub deduction_amount: Decimal,
    pub sessions_covered: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_balance: Option<RemainingBalance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_record_id: Option<i64>,
    pub staff_override: bool,
    /// 命中幂等键返回的历史结果
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub message: String,
}

impl ApplicationResult {
    /// 未使用套餐，按原价计费
    pub fn not_applied(original_price: Decimal, message: impl Into<String>) -> Self {
        Self {
            success: true,
            applied: false,
            benefit_kind: None,
            original_price,
            final_price: original_price,
            deduction_amount: Decimal::ZERO,
            sessions_covered: 0,
            grant_id: None,
            grant_name: None,
            remaining_balance: None,
            usage_record_id: None,
            staff_override: false,
            duplicate: false,
            error_code: None,
            message: message.into(),
        }
    }

    /// 请求失败
    pub fn failure(original_price: Decimal, error: &BillingError) -> Self {
        Self {
            success: false,
            error_code: Some(error.error_code().to_string()),
            ..Self::not_applied(original_price, error.to_string())
        }
    }

    /// 由使用记录构造结果
    pub fn from_usage(usage: &PackageUsage, grant: &PackageGrant, duplicate: bool) -> Self {
        let message = if duplicate {
            format!("该发票行已使用套餐 {}，返回原结果", usage.package_name)
        } else {
            format!("已使用套餐 {}", usage.package_name)
        };

        Self {
            success: true,
            applied: true,
            benefit_kind: Some(usage.benefit_kind),
            original_price: usage.original_price,
            final_price: usage.final_price,
            deduction_amount: usage.amount_deducted,
            sessions_covered: usage.qty_deducted,
            grant_id: Some(usage.grant_id),
            grant_name: Some(usage.package_name.clone()),
            remaining_balance: Some(snapshot_balance(usage, grant)),
            usage_record_id: Some(usage.id),
            staff_override: usage.staff_override,
            duplicate,
            error_code: None,
            message,
        }
    }
}

/// 以使用记录的余量快照为准，总量取自套餐
pub fn snapshot_balance(usage: &PackageUsage, grant: &PackageGrant) -> RemainingBalance {
    match grant.remaining_balance() {
        RemainingBalance::Sessions { remaining, total } => RemainingBalance::Sessions {
            remaining: usage.remaining_count_after.unwrap_or(remaining),
            total,
        },
        RemainingBalance::Prepaid { remaining, total } => RemainingBalance::Prepaid {
            remaining: usage.balance_remaining_after.unwrap_or(remaining),
            total,
        },
        unlimited => unlimited,
    }
}

/// 冲正结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversal_id: Option<i64>,
    pub original_usage_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_balance: Option<RemainingBalance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ReversalResult {
    pub fn success(
        original_usage_id: i64,
        reversal_id: i64,
        restored_balance: RemainingBalance,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            message: message.into(),
            reversal_id: Some(reversal_id),
            original_usage_id,
            restored_balance: Some(restored_balance),
            error_code: None,
        }
    }

    pub fn failure(original_usage_id: i64, error: &BillingError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            reversal_id: None,
            original_usage_id,
            restored_balance: None,
            error_code: Some(error.error_code().to_string()),
        }
    }
}

/// 分配套餐请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPackageRequest {
    pub customer_id: i64,
    pub template_id: i64,
    /// 绑定到单一服务
    #[serde(default)]
    pub service_id: Option<i64>,
    /// 生效时间，默认当前时间
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub staff_id: Option<i64>,
}

/// 客户套餐摘要条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSummaryItem {
    pub grant_id: i64,
    pub package_name: String,
    pub benefit_kind: BenefitKind,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub remaining_balance: RemainingBalance,
}

impl From<&PackageGrant> for PackageSummaryItem {
    fn from(grant: &PackageGrant) -> Self {
        Self {
            grant_id: grant.id,
            package_name: grant.package_name.clone(),
            benefit_kind: grant.kind(),
            valid_from: grant.valid_from,
            valid_to: grant.valid_to,
            remaining_balance: grant.remaining_balance(),
        }
    }
}

/// 客户套餐摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPackageSummary {
    pub customer_id: i64,
    /// 当前可用的套餐
    pub active_packages: Vec<PackageSummaryItem>,
    /// 已过期、已停用或已用完的套餐数
    pub inactive_count: usize,
    pub prepaid_balance_total: Decimal,
    pub sessions_remaining_total: i32,
    pub has_unlimited_membership: bool,
}
