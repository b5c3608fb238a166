//! 发票级计费
//!
//! 逐行调用套餐抵扣，汇总发票金额；作废发票时冲正该发票全部未冲正的抵扣。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::billing_service::PackageBillingService;
use super::dto::{ApplicationResult, ApplyBenefitRequest, ReversalResult};
use crate::engine::{check_money, round_money};
use crate::error::{BillingError, Result};
use crate::models::{ReversalReason, TransactionType};

/// 发票行
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub line_id: i64,
    pub service_id: i64,
    pub unit_price: Decimal,
    pub quantity: i32,
    #[serde(default)]
    pub manual_grant_id: Option<i64>,
}

impl InvoiceLine {
    pub fn new(line_id: i64, service_id: i64, unit_price: Decimal) -> Self {
        Self {
            line_id,
            service_id,
            unit_price,
            quantity: 1,
            manual_grant_id: None,
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

    /// 行总价 = 单价 × 数量
    pub fn line_total(&self) -> Result<Decimal> {
        let total = self
            .unit_price
            .checked_mul(Decimal::from(self.quantity))
            .ok_or_else(|| {
                BillingError::Validation(format!("发票行 {} 金额溢出", self.line_id))
            })?;
        check_money(round_money(total), "行总价")
    }
}

/// 发票计费请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceBillingRequest {
    pub invoice_id: i64,
    pub customer_id: i64,
    pub lines: Vec<InvoiceLine>,
    #[serde(default)]
    pub staff_id: Option<i64>,
    #[serde(default)]
    pub service_date: Option<DateTime<Utc>>,
}

impl InvoiceBillingRequest {
    fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(BillingError::Validation("发票没有明细行".to_string()));
        }

        let mut seen = HashSet::new();
        for line in &self.lines {
            if !seen.insert(line.line_id) {
                return Err(BillingError::Validation(format!(
                    "发票行号重复: {}",
                    line.line_id
                )));
            }
            if line.quantity < 1 {
                return Err(BillingError::Validation(format!(
                    "发票行 {} 数量必须大于 0",
                    line.line_id
                )));
            }
            if line.unit_price < Decimal::ZERO {
                return Err(BillingError::Validation(format!(
                    "发票行 {} 单价不能为负数",
                    line.line_id
                )));
            }
            line.line_total()?;
        }
        Ok(())
    }
}

/// 单行计费结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BilledLine {
    pub line_id: i64,
    pub service_id: i64,
    pub quantity: i32,
    pub line_total: Decimal,
    pub final_price: Decimal,
    pub benefit: ApplicationResult,
}

/// 发票计费汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceBillingSummary {
    pub invoice_id: i64,
    pub customer_id: i64,
    pub lines: Vec<BilledLine>,
    pub subtotal: Decimal,
    pub package_deduction_total: Decimal,
    pub total_due: Decimal,
}

impl InvoiceBillingSummary {
    /// 被拒绝的行（如手动指定的套餐无效）
    pub fn rejected_lines(&self) -> impl Iterator<Item = &BilledLine> {
        self.lines.iter().filter(|l| !l.benefit.success)
    }
}

/// 发票作废汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceVoidSummary {
    pub invoice_id: i64,
    pub reversals: Vec<ReversalResult>,
    /// 之前已冲正、本次跳过的记录数
    pub skipped: usize,
}

impl InvoiceVoidSummary {
    pub fn all_succeeded(&self) -> bool {
        self.reversals.iter().all(|r| r.success)
    }
}

/// 发票计费引擎
pub struct BillingEngine {
    packages: Arc<PackageBillingService>,
}

impl BillingEngine {
    pub fn new(packages: Arc<PackageBillingService>) -> Self {
        Self { packages }
    }

    /// 为整张发票计费
    ///
    /// 各行依次处理，前一行的扣减对后一行可见。
    #[instrument(skip(self, request), fields(invoice_id = request.invoice_id, customer_id = request.customer_id))]
    pub async fn bill_invoice(&self, request: InvoiceBillingRequest) -> Result<InvoiceBillingSummary> {
        request.validate()?;

        let mut lines = Vec::with_capacity(request.lines.len());
        let mut subtotal = Decimal::ZERO;
        let mut package_deduction_total = Decimal::ZERO;

        for line in &request.lines {
            let line_total = line.line_total()?;

            let mut apply = ApplyBenefitRequest::new(
                request.customer_id,
                line.service_id,
                line_total,
                request.invoice_id,
                line.line_id,
            )
            .with_quantity(line.quantity);
            if let Some(grant_id) = line.manual_grant_id {
                apply = apply.with_manual_grant(grant_id);
            }
            if let Some(date) = request.service_date {
                apply = apply.with_as_of(date);
            }
            if let Some(staff_id) = request.staff_id {
                apply = apply.with_staff(staff_id);
            }

            let benefit = self.packages.apply_package_benefit(apply).await;
            if !benefit.success {
                warn!(line_id = line.line_id, message = %benefit.message, "发票行套餐抵扣被拒绝，按原价计费");
            }

            subtotal += line_total;
            package_deduction_total += line_total - benefit.final_price;

            lines.push(BilledLine {
                line_id: line.line_id,
                service_id: line.service_id,
                quantity: line.quantity,
                line_total,
                final_price: benefit.final_price,
                benefit,
            });
        }

        let total_due = subtotal - package_deduction_total;
        info!(
            lines = lines.len(),
            subtotal = %subtotal,
            package_deduction_total = %package_deduction_total,
            total_due = %total_due,
            "发票计费完成"
        );

        Ok(InvoiceBillingSummary {
            invoice_id: request.invoice_id,
            customer_id: request.customer_id,
            lines,
            subtotal,
            package_deduction_total,
            total_due,
        })
    }

    /// 作废发票，冲正全部未冲正的抵扣记录
    #[instrument(skip(self))]
    pub async fn void_invoice(
        &self,
        invoice_id: i64,
        reason: ReversalReason,
        staff_id: Option<i64>,
    ) -> Result<InvoiceVoidSummary> {
        let usages = self.packages.list_invoice_usage(invoice_id).await?;

        let reversed: HashSet<i64> = usages
            .iter()
            .filter_map(|u| u.reversal_reference_id)
            .collect();

        let mut reversals = Vec::new();
        let mut skipped = 0;
        for usage in usages
            .iter()
            .filter(|u| u.transaction_type == TransactionType::Use)
        {
            if reversed.contains(&usage.id) {
                skipped += 1;
                continue;
            }
            reversals.push(
                self.packages
                    .reverse_package_usage(usage.id, reason, staff_id)
                    .await,
            );
        }

        let summary = InvoiceVoidSummary {
            invoice_id,
            reversals,
            skipped,
        };
        if summary.all_succeeded() {
            info!(reversed = summary.reversals.len(), skipped, "发票已作废");
        } else {
            warn!(reversed = summary.reversals.len(), skipped, "发票作废部分冲正失败");
        }
        Ok(summary)
    }
}
