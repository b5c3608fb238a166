//! 客户套餐实例
//!
//! 一次购买/赠送对应一条记录。按权益类型携带不同的余量字段，
//! 只在行锁保护下由抵扣与冲正流程修改，永不物理删除。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::BenefitKind;

/// 按类型区分的权益余量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum GrantBenefit {
    /// 无限次会员，只看有效期
    Unlimited,
    Free {
        total_allocated: i32,
        used_count: i32,
        remaining_count: i32,
    },
    Discount {
        total_allocated: i32,
        used_count: i32,
        remaining_count: i32,
        /// 折扣百分比，0-100
        discount_percentage: Decimal,
    },
    Prepaid {
        balance_total: Decimal,
        balance_used: Decimal,
        balance_remaining: Decimal,
    },
}

impl GrantBenefit {
    pub fn free(total: i32) -> Self {
        Self::Free {
            total_allocated: total,
            used_count: 0,
            remaining_count: total,
        }
    }

    pub fn discount(total: i32, percentage: Decimal) -> Self {
        Self::Discount {
            total_allocated: total,
            used_count: 0,
            remaining_count: total,
            discount_percentage: percentage,
        }
    }

    pub fn prepaid(amount: Decimal) -> Self {
        Self::Prepaid {
            balance_total: amount,
            balance_used: Decimal::ZERO,
            balance_remaining: amount,
        }
    }

    pub fn kind(&self) -> BenefitKind {
        match self {
            Self::Unlimited => BenefitKind::Unlimited,
            Self::Free { .. } => BenefitKind::Free,
            Self::Discount { .. } => BenefitKind::Discount,
            Self::Prepaid { .. } => BenefitKind::Prepaid,
        }
    }

    /// 是否还有可用余量
    pub fn has_capacity(&self) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Free {
                remaining_count, ..
            }
            | Self::Discount {
                remaining_count, ..
            } => *remaining_count > 0,
            Self::Prepaid {
                balance_remaining, ..
            } => *balance_remaining > Decimal::ZERO,
        }
    }

    /// 余量快照
    pub fn remaining_balance(&self, valid_to: DateTime<Utc>) -> RemainingBalance {
        match self {
            Self::Unlimited => RemainingBalance::Unlimited { valid_to },
            Self::Free {
                total_allocated,
                remaining_count,
                ..
            }
            | Self::Discount {
                total_allocated,
                remaining_count,
                ..
            } => RemainingBalance::Sessions {
                remaining: *remaining_count,
                total: *total_allocated,
            },
            Self::Prepaid {
                balance_total,
                balance_remaining,
                ..
            } => RemainingBalance::Prepaid {
                remaining: *balance_remaining,
                total: *balance_total,
            },
        }
    }

    /// 剩余次数（仅次数类套餐）
    pub fn remaining_count(&self) -> Option<i32> {
        match self {
            Self::Free {
                remaining_count, ..
            }
            | Self::Discount {
                remaining_count, ..
            } => Some(*remaining_count),
            _ => None,
        }
    }

    /// 剩余余额（仅储值套餐）
    pub fn balance_remaining(&self) -> Option<Decimal> {
        match self {
            Self::Prepaid {
                balance_remaining, ..
            } => Some(*balance_remaining),
            _ => None,
        }
    }
}

/// 返回给调用方的余量形态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemainingBalance {
    Unlimited {
        #[serde(rename = "validTo")]
        valid_to: DateTime<Utc>,
    },
    Sessions {
        remaining: i32,
        total: i32,
    },
    Prepaid {
        remaining: Decimal,
        total: Decimal,
    },
}

/// 套餐不可用的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailability {
    Inactive,
    NotYetValid,
    Expired,
    Exhausted,
}

impl Unavailability {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Inactive => "套餐已停用",
            Self::NotYetValid => "套餐尚未生效",
            Self::Expired => "套餐已过期",
            Self::Exhausted => "套餐余量已用完",
        }
    }
}

/// 客户套餐
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageGrant {
    pub id: i64,
    pub customer_id: i64,
    pub template_id: i64,
    pub package_name: String,
    /// 绑定的单一服务，为空时按模板服务列表判断覆盖
    pub service_id: Option<i64>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub is_active: bool,
    pub benefit: GrantBenefit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PackageGrant {
    pub fn kind(&self) -> BenefitKind {
        self.benefit.kind()
    }

    /// 检查在指定时间点是否可用，返回不可用原因
    pub fn check_available(&self, as_of: DateTime<Utc>) -> Result<(), Unavailability> {
        if !self.is_active {
            return Err(Unavailability::Inactive);
        }
        if as_of < self.valid_from {
            return Err(Unavailability::NotYetValid);
        }
        if as_of > self.valid_to {
            return Err(Unavailability::Expired);
        }
        if !self.benefit.has_capacity() {
            return Err(Unavailability::Exhausted);
        }
        Ok(())
    }

    pub fn is_available(&self, as_of: DateTime<Utc>) -> bool {
        self.check_available(as_of).is_ok()
    }

    pub fn remaining_balance(&self) -> RemainingBalance {
        self.benefit.remaining_balance(self.valid_to)
    }
}

/// 新建套餐
#[derive(Debug, Clone)]
pub struct NewPackageGrant {
    pub customer_id: i64,
    pub template_id: i64,
    pub package_name: String,
    pub service_id: Option<i64>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub benefit: GrantBenefit,
}
