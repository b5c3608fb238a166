//! 抵扣计算
//!
//! 按权益类型计算价格拆分，并在持锁的套餐上扣减或恢复余量。
//! 金额统一保留两位小数，四舍五入（远离零）。

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, Result};
use crate::models::{GrantBenefit, PackageGrant};

/// 一次抵扣的计算结果
#[derive(Debug, Clone, PartialEq)]
pub struct Deduction {
    /// 扣减次数（储值为 0）
    pub qty_deducted: i32,
    /// 从价格中抵扣的金额
    pub amount_deducted: Decimal,
    /// 折扣类套餐的减免金额
    pub discount_applied: Decimal,
    pub final_price: Decimal,
}

/// 金额小数位数
pub const MONEY_SCALE: u32 = 2;

/// 单笔金额上限 9,999,999,999.99，与库表 `NUMERIC(12, 2)` 一致
pub const MAX_MONEY: Decimal = Decimal::from_parts(0xD4A5_0FFF, 0xE8, 0, false, MONEY_SCALE);

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// 校验入参金额：非负、不超过两位小数、不超过上限
///
/// 通过校验的金额与任意次数、百分比相乘都不会溢出
pub fn check_money(value: Decimal, field: &str) -> Result<Decimal> {
    if value < Decimal::ZERO {
        return Err(BillingError::Validation(format!("{}不能为负数: {}", field, value)));
    }
    if value.normalize().scale() > MONEY_SCALE {
        return Err(BillingError::Validation(format!(
            "{}最多两位小数: {}",
            field, value
        )));
    }
    if value > MAX_MONEY {
        return Err(BillingError::Validation(format!(
            "{}超过上限 {}: {}",
            field, MAX_MONEY, value
        )));
    }
    Ok(value)
}

/// 计算抵扣
///
/// `price` 为整行价格，`quantity` 为该行次数。余量为零时返回 `None`。
pub fn plan_deduction(benefit: &GrantBenefit, price: Decimal, quantity: i32) -> Option<Deduction> {
    if !benefit.has_capacity() || quantity <= 0 || price <= Decimal::ZERO {
        return None;
    }

    let deduction = match benefit {
        GrantBenefit::Unlimited => Deduction {
            qty_deducted: 1,
            amount_deducted: price,
            discount_applied: Decimal::ZERO,
            final_price: Decimal::ZERO,
        },
        GrantBenefit::Free {
            remaining_count, ..
        } => {
            let covered = quantity.min(*remaining_count);
            let covered_amount =
                round_money(price * Decimal::from(covered) / Decimal::from(quantity));
            Deduction {
                qty_deducted: covered,
                amount_deducted: covered_amount,
                discount_applied: Decimal::ZERO,
                final_price: (price - covered_amount).max(Decimal::ZERO),
            }
        }
        GrantBenefit::Discount {
            discount_percentage,
            ..
        } => {
            let discount = round_money(price * *discount_percentage / Decimal::ONE_HUNDRED);
            Deduction {
                qty_deducted: 1,
                amount_deducted: discount,
                discount_applied: discount,
                final_price: (price - discount).max(Decimal::ZERO),
            }
        }
        GrantBenefit::Prepaid {
            balance_remaining, ..
        } => {
            let amount = price.min(*balance_remaining);
            Deduction {
                qty_deducted: 0,
                amount_deducted: amount,
                discount_applied: Decimal::ZERO,
                final_price: price - amount,
            }
        }
    };

    Some(deduction)
}

/// 在套餐上扣减余量，余量归零时自动停用
pub fn consume(grant: &mut PackageGrant, deduction: &Deduction) -> Result<()> {
    let exhausted = match &mut grant.benefit {
        GrantBenefit::Unlimited => false,
        GrantBenefit::Free {
            used_count,
            remaining_count,
            ..
        }
        | GrantBenefit::Discount {
            used_count,
            remaining_count,
            ..
        } => {
            if deduction.qty_deducted > *remaining_count {
                return Err(BillingError::Internal(format!(
                    "扣减次数超过剩余次数: grant_id={}",
                    grant.id
                )));
            }
            *used_count += deduction.qty_deducted;
            *remaining_count -= deduction.qty_deducted;
            *remaining_count == 0
        }
        GrantBenefit::Prepaid {
            balance_used,
            balance_remaining,
            ..
        } => {
            if deduction.amount_deducted > *balance_remaining {
                return Err(BillingError::Internal(format!(
                    "扣减金额超过剩余余额: grant_id={}",
                    grant.id
                )));
            }
            *balance_used += deduction.amount_deducted;
            *balance_remaining -= deduction.amount_deducted;
            *balance_remaining == Decimal::ZERO
        }
    };

    if exhausted {
        grant.is_active = false;
    }
    Ok(())
}

/// 按原记录恢复余量并重新启用套餐
pub fn restore(grant: &mut PackageGrant, qty: i32, amount: Decimal) -> Result<()> {
    match &mut grant.benefit {
        GrantBenefit::Unlimited => {}
        GrantBenefit::Free {
            used_count,
            remaining_count,
            ..
        }
        | GrantBenefit::Discount {
            used_count,
            remaining_count,
            ..
        } => {
            if qty > *used_count {
                return Err(BillingError::Internal(format!(
                    "恢复次数超过已用次数: grant_id={}",
                    grant.id
                )));
            }
            *used_count -= qty;
            *remaining_count += qty;
        }
        GrantBenefit::Prepaid {
            balance_used,
            balance_remaining,
            ..
        } => {
            if amount > *balance_used {
                return Err(BillingError::Internal(format!(
                    "恢复金额超过已用金额: grant_id={}",
                    grant.id
                )));
            }
            *balance_used -= amount;
            *balance_remaining += amount;
        }
    }

    grant.is_active = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn grant(benefit: GrantBenefit) -> PackageGrant {
        let now = Utc::now();
        PackageGrant {
            id: 1,
            customer_id: 1,
            template_id: 1,
            package_name: String::new(),
            service_id: None,
            valid_from: now - Duration::days(1),
            valid_to: now + Duration::days(1),
            is_active: true,
            benefit,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_partial_free_coverage() {
        let benefit = GrantBenefit::Free {
            total_allocated: 5,
            used_count: 4,
            remaining_count: 1,
        };
        let d = plan_deduction(&benefit, dec!(300), 3).unwrap();
        assert_eq!(d.qty_deducted, 1);
        assert_eq!(d.amount_deducted, dec!(100));
        assert_eq!(d.final_price, dec!(200));
    }

    #[test]
    fn test_free_rounds_uneven_split() {
        let d = plan_deduction(&GrantBenefit::free(1), dec!(100), 3).unwrap();
        assert_eq!(d.amount_deducted, dec!(33.33));
        assert_eq!(d.final_price, dec!(66.67));
    }

    #[test]
    fn test_discount_deduction() {
        let d = plan_deduction(&GrantBenefit::discount(3, dec!(20)), dec!(500), 1).unwrap();
        assert_eq!(d.amount_deducted, dec!(100));
        assert_eq!(d.discount_applied, dec!(100));
        assert_eq!(d.final_price, dec!(400));
        assert_eq!(d.qty_deducted, 1);
    }

    #[test]
    fn test_prepaid_partial_coverage() {
        let d = plan_deduction(&GrantBenefit::prepaid(dec!(50)), dec!(80), 1).unwrap();
        assert_eq!(d.amount_deducted, dec!(50));
        assert_eq!(d.final_price, dec!(30));
        assert_eq!(d.qty_deducted, 0);
    }

    #[test]
    fn test_unlimited_covers_full_price() {
        let d = plan_deduction(&GrantBenefit::Unlimited, dec!(260), 2).unwrap();
        assert_eq!(d.final_price, Decimal::ZERO);
        assert_eq!(d.amount_deducted, dec!(260));
        assert_eq!(d.qty_deducted, 1);
    }

    #[test]
    fn test_no_deduction_without_capacity_or_price() {
        assert!(plan_deduction(&GrantBenefit::free(0), dec!(100), 1).is_none());
        assert!(plan_deduction(&GrantBenefit::free(2), Decimal::ZERO, 1).is_none());
    }

    #[test]
    fn test_check_money_bounds() {
        assert_eq!(MAX_MONEY, dec!(9999999999.99));
        assert!(check_money(dec!(80.50), "价格").is_ok());
        assert!(check_money(dec!(80.500), "价格").is_ok());
        assert!(check_money(MAX_MONEY, "价格").is_ok());

        for bad in [dec!(-0.01), dec!(80.556), MAX_MONEY + dec!(0.01), Decimal::MAX] {
            assert!(matches!(
                check_money(bad, "价格"),
                Err(BillingError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_largest_valid_price_does_not_overflow() {
        let free = plan_deduction(&GrantBenefit::free(i32::MAX), MAX_MONEY, i32::MAX).unwrap();
        assert_eq!(free.final_price, Decimal::ZERO);

        let discount = plan_deduction(&GrantBenefit::discount(1, dec!(100)), MAX_MONEY, 1).unwrap();
        assert_eq!(discount.amount_deducted, MAX_MONEY);
    }

    #[test]
    fn test_consume_deactivates_at_zero_and_restore_reactivates() {
        let mut g = grant(GrantBenefit::prepaid(dec!(50)));
        let d = plan_deduction(&g.benefit, dec!(80), 1).unwrap();
        consume(&mut g, &d).unwrap();
        assert_eq!(g.benefit.balance_remaining(), Some(Decimal::ZERO));
        assert!(!g.is_active);

        restore(&mut g, d.qty_deducted, d.amount_deducted).unwrap();
        assert_eq!(g.benefit, GrantBenefit::prepaid(dec!(50)));
        assert!(g.is_active);
    }

    #[test]
    fn test_conservation_through_consume_and_restore() {
        let mut g = grant(GrantBenefit::free(3));
        let d = plan_deduction(&g.benefit, dec!(100), 2).unwrap();
        consume(&mut g, &d).unwrap();

        let GrantBenefit::Free {
            total_allocated,
            used_count,
            remaining_count,
        } = g.benefit
        else {
            panic!("expected free benefit");
        };
        assert_eq!(used_count + remaining_count, total_allocated);
        assert_eq!(remaining_count, 1);
    }

    #[test]
    fn test_restore_rejects_over_restore() {
        let mut g = grant(GrantBenefit::free(3));
        assert!(restore(&mut g, 1, Decimal::ZERO).is_err());
    }
}
