//! 套餐使用记录
//!
//! 追加写入的流水账：每次抵扣或冲正各写一条，写入后不再修改。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{BenefitKind, TransactionType};

/// 冲正记录的幂等键后缀
const REVERSAL_KEY_SUFFIX: &str = ":reversal";

/// 由发票号和发票行号生成幂等键
pub fn idempotency_key(invoice_id: i64, invoice_line_id: i64) -> String {
    format!("{}_{}", invoice_id, invoice_line_id)
}

/// 冲正记录的幂等键
pub fn reversal_key(original_key: &str) -> String {
    format!("{}{}", original_key, REVERSAL_KEY_SUFFIX)
}

/// 套餐使用记录
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PackageUsage {
    pub id: i64,
    pub customer_id: i64,
    pub grant_id: i64,
    pub invoice_id: i64,
    pub invoice_line_id: i64,
    pub service_id: i64,
    pub idempotency_key: String,
    pub benefit_kind: BenefitKind,
    pub transaction_type: TransactionType,
    /// 扣减次数，冲正记录为负数
    pub qty_deducted: i32,
    /// 抵扣金额，冲正记录为负数
    pub amount_deducted: Decimal,
    /// 折扣类套餐的减免金额
    pub discount_applied: Decimal,
    pub original_price: Decimal,
    pub final_price: Decimal,
    pub package_name: String,
    /// 交易后剩余次数快照
    #[sqlx(default)]
    pub remaining_count_after: Option<i32>,
    /// 交易后剩余余额快照
    #[sqlx(default)]
    pub balance_remaining_after: Option<Decimal>,
    pub staff_override: bool,
    /// 冲正记录指向被冲正的原记录
    #[sqlx(default)]
    pub reversal_reference_id: Option<i64>,
    #[sqlx(default)]
    pub applied_by: Option<i64>,
    #[sqlx(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PackageUsage {
    pub fn is_reversal(&self) -> bool {
        self.transaction_type.is_reversal()
    }
}

/// 新建使用记录
#[derive(Debug, Clone)]
pub struct NewPackageUsage {
    pub customer_id: i64,
    pub grant_id: i64,
    pub invoice_id: i64,
    pub invoice_line_id: i64,
    pub service_id: i64,
    pub idempotency_key: String,
    pub benefit_kind: BenefitKind,
    pub transaction_type: TransactionType,
    pub qty_deducted: i32,
    pub amount_deducted: Decimal,
    pub discount_applied: Decimal,
    pub original_price: Decimal,
    pub final_price: Decimal,
    pub package_name: String,
    pub remaining_count_after: Option<i32>,
    pub balance_remaining_after: Option<Decimal>,
    pub staff_override: bool,
    pub reversal_reference_id: Option<i64>,
    pub applied_by: Option<i64>,
    pub notes: Option<String>,
}

impl NewPackageUsage {
    /// 补齐存储层生成的字段
    pub fn into_usage(self, id: i64, created_at: DateTime<Utc>) -> PackageUsage {
        PackageUsage {
            id,
            customer_id: self.customer_id,
            grant_id: self.grant_id,
            invoice_id: self.invoice_id,
            invoice_line_id: self.invoice_line_id,
            service_id: self.service_id,
            idempotency_key: self.idempotency_key,
            benefit_kind: self.benefit_kind,
            transaction_type: self.transaction_type,
            qty_deducted: self.qty_deducted,
            amount_deducted: self.amount_deducted,
            discount_applied: self.discount_applied,
            original_price: self.original_price,
            final_price: self.final_price,
            package_name: self.package_name,
            remaining_count_after: self.remaining_count_after,
            balance_remaining_after: self.balance_remaining_after,
            staff_override: self.staff_override,
            reversal_reference_id: self.reversal_reference_id,
            applied_by: self.applied_by,
            notes: self.notes,
            created_at,
        }
    }
}
