//! 计费枚举类型定义
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 套餐权益类型
///
/// 同一服务被多个套餐覆盖时按 `priority()` 升序选取
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum BenefitKind {
    /// 无限次会员 - 有效期内不限次数
    Unlimited,
    /// 赠送次数 - 按次扣减
    Free,
    /// 折扣卡 - 每次按比例减免并扣一次
    Discount,
    /// 储值 - 按金额扣减余额
    Prepaid,
}

impl BenefitKind {
    /// 优先级，数值越小越优先
    pub fn priority(self) -> u8 {
        match self {
            Self::Unlimited => 1,
            Self::Free => 2,
            Self::Discount => 3,
            Self::Prepaid => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlimited => "unlimited",
            Self::Free => "free",
            Self::Discount => "discount",
            Self::Prepaid => "prepaid",
        }
    }
}

impl fmt::Display for BenefitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 使用记录交易类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum TransactionType {
    /// 抵扣
    Use,
    /// 退款冲正
    Refund,
    /// 作废冲正
    Void,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Use => "use",
            Self::Refund => "refund",
            Self::Void => "void",
        }
    }

    /// 是否为冲正记录
    pub fn is_reversal(self) -> bool {
        matches!(self, Self::Refund | Self::Void)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 冲正原因
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReversalReason {
    #[default]
    Refund,
    Void,
}

impl ReversalReason {
    pub fn as_str(self) -> &'static str {
        self.transaction_type().as_str()
    }

    /// 冲正记录写入时使用的交易类型
    pub fn transaction_type(self) -> TransactionType {
        match self {
            Self::Refund => TransactionType::Refund,
            Self::Void => TransactionType::Void,
        }
    }
}

impl FromStr for ReversalReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refund" => Ok(Self::Refund),
            "void" => Ok(Self::Void),
            other => Err(format!("未知的冲正原因: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benefit_kind_priority_order() {
        let mut kinds = vec![
            BenefitKind::Prepaid,
            BenefitKind::Discount,
            BenefitKind::Unlimited,
            BenefitKind::Free,
        ];
        kinds.sort_by_key(|k| k.priority());
        assert_eq!(
            kinds,
            vec![
                BenefitKind::Unlimited,
                BenefitKind::Free,
                BenefitKind::Discount,
                BenefitKind::Prepaid
            ]
        );
    }

    #[test]
    fn test_enum_serialization() {
        assert_eq!(
            serde_json::to_string(&BenefitKind::Prepaid).unwrap(),
            "\"prepaid\""
        );
        let t: TransactionType = serde_json::from_str("\"void\"").unwrap();
        assert_eq!(t, TransactionType::Void);
        assert!(t.is_reversal());
        assert!(!TransactionType::Use.is_reversal());
    }

    #[test]
    fn test_reversal_reason() {
        assert_eq!(ReversalReason::default(), ReversalReason::Refund);
        assert_eq!("void".parse::<ReversalReason>(), Ok(ReversalReason::Void));
        assert!("cancel".parse::<ReversalReason>().is_err());
        assert_eq!(
            ReversalReason::Void.transaction_type(),
            TransactionType::Void
        );
    }
}
