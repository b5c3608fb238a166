//! 套餐模板
//!
//! 可售卖的套餐定义。被套餐实例引用后不再修改。

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::BenefitKind;
use super::grant::{GrantBenefit, NewPackageGrant};
use crate::error::{BillingError, Result};

/// 套餐模板
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PackageTemplate {
    pub id: i64,
    pub name: String,
    pub kind: BenefitKind,
    /// 会员类模板，无限次套餐只有会员模板才按服务列表覆盖
    pub is_membership: bool,
    /// 覆盖的服务列表
    pub service_ids: Vec<i64>,
    pub validity_days: i32,
    #[sqlx(default)]
    pub session_count: Option<i32>,
    #[sqlx(default)]
    pub discount_percentage: Option<Decimal>,
    #[sqlx(default)]
    pub prepaid_amount: Option<Decimal>,
    pub price: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl PackageTemplate {
    /// 服务列表是否包含该服务
    pub fn lists_service(&self, service_id: i64) -> bool {
        self.service_ids.contains(&service_id)
    }

    /// 按模板初始化权益余量
    pub fn initial_benefit(&self) -> Result<GrantBenefit> {
        let benefit = match self.kind {
            BenefitKind::Unlimited => GrantBenefit::Unlimited,
            BenefitKind::Free => GrantBenefit::free(self.require_sessions()?),
            BenefitKind::Discount => {
                let pct = self.discount_percentage.ok_or_else(|| {
                    BillingError::Validation(format!("模板 {} 缺少折扣比例", self.id))
                })?;
                if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
                    return Err(BillingError::Validation(format!(
                        "模板 {} 折扣比例越界: {}",
                        self.id, pct
                    )));
                }
                GrantBenefit::discount(self.require_sessions()?, pct)
            }
            BenefitKind::Prepaid => {
                let amount = self
                    .prepaid_amount
                    .filter(|a| *a > Decimal::ZERO)
                    .ok_or_else(|| {
                        BillingError::Validation(format!("模板 {} 缺少有效储值金额", self.id))
                    })?;
                GrantBenefit::prepaid(amount)
            }
        };
        Ok(benefit)
    }

    /// 为客户生成套餐实例
    pub fn issue_grant(
        &self,
        customer_id: i64,
        valid_from: DateTime<Utc>,
        service_id: Option<i64>,
    ) -> Result<NewPackageGrant> {
        if !self.is_active {
            return Err(BillingError::TemplateInactive(self.id));
        }
        if self.validity_days <= 0 {
            return Err(BillingError::Validation(format!(
                "模板 {} 有效天数必须大于 0",
                self.id
            )));
        }

        Ok(NewPackageGrant {
            customer_id,
            template_id: self.id,
            package_name: self.name.clone(),
            service_id,
            valid_from,
            valid_to: valid_from + Duration::days(i64::from(self.validity_days)),
            benefit: self.initial_benefit()?,
        })
    }

    fn require_sessions(&self) -> Result<i32> {
        self.session_count.filter(|c| *c > 0).ok_or_else(|| {
            BillingError::Validation(format!("模板 {} 缺少有效次数", self.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn template(kind: BenefitKind) -> PackageTemplate {
        PackageTemplate {
            id: 1,
            name: "面部护理 10 次卡".to_string(),
            kind,
            is_membership: false,
            service_ids: vec![11, 12],
            validity_days: 90,
            session_count: Some(10),
            discount_percentage: Some(dec!(20)),
            prepaid_amount: Some(dec!(1000)),
            price: dec!(2000),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_issue_grant_window_and_capacity() {
        let from = Utc::now();
        let grant = template(BenefitKind::Free)
            .issue_grant(7, from, None)
            .unwrap();
        assert_eq!(grant.valid_to - grant.valid_from, Duration::days(90));
        assert_eq!(grant.benefit, GrantBenefit::free(10));
        assert_eq!(grant.customer_id, 7);
    }

    #[test]
    fn test_issue_grant_rejects_inactive_template() {
        let mut t = template(BenefitKind::Prepaid);
        t.is_active = false;
        assert!(matches!(
            t.issue_grant(7, Utc::now(), None),
            Err(BillingError::TemplateInactive(1))
        ));
    }

    #[test]
    fn test_discount_percentage_bounds() {
        let mut t = template(BenefitKind::Discount);
        t.discount_percentage = Some(dec!(120));
        assert!(matches!(
            t.initial_benefit(),
            Err(BillingError::Validation(_))
        ));

        t.discount_percentage = None;
        assert!(t.initial_benefit().is_err());
    }

    #[test]
    fn test_prepaid_requires_amount() {
        let mut t = template(BenefitKind::Prepaid);
        assert_eq!(t.initial_benefit().unwrap(), GrantBenefit::prepaid(dec!(1000)));
        t.prepaid_amount = Some(Decimal::ZERO);
        assert!(t.initial_benefit().is_err());
    }
}
