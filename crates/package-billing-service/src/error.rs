//! 套餐计费错误类型
//!
//! 定义计费核心的业务错误和系统错误。
//! "无可用套餐"、"锁内余量耗尽" 属于正常结果，不在此列。

use thiserror::Error;

/// 套餐计费错误类型
#[derive(Debug, Error)]
pub enum BillingError {
    // === 套餐相关错误 ===
    #[error("套餐不存在: {0}")]
    GrantNotFound(i64),

    #[error("套餐模板不存在: {0}")]
    TemplateNotFound(i64),

    #[error("套餐模板已停用: {0}")]
    TemplateInactive(i64),

    #[error("套餐不属于该客户: grant_id={grant_id}, customer_id={customer_id}")]
    GrantNotOwned { grant_id: i64, customer_id: i64 },

    #[error("套餐不适用于该服务: grant_id={grant_id}, service_id={service_id}")]
    GrantNotApplicable { grant_id: i64, service_id: i64 },

    #[error("套餐当前不可用: grant_id={grant_id}, 原因={reason}")]
    GrantUnavailable { grant_id: i64, reason: String },

    // === 使用记录相关错误 ===
    #[error("使用记录不存在: {0}")]
    UsageNotFound(i64),

    #[error("使用记录已冲正: usage_id={0}")]
    AlreadyReversed(i64),

    #[error("该记录不可冲正: usage_id={usage_id}, transaction_type={transaction_type}")]
    InvalidReversalTarget {
        usage_id: i64,
        transaction_type: String,
    },

    #[error("重复的幂等键: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("获取套餐行锁超时: grant_id={0}")]
    LockTimeout(i64),

    #[error("参数校验失败: {0}")]
    Validation(String),

    // === 系统错误 ===
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON 序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 计费 Result 类型别名
pub type Result<T> = std::result::Result<T, BillingError>;

impl BillingError {
    /// 检查是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::LockTimeout(_))
    }

    /// 检查是否为业务错误（非系统错误）
    pub fn is_business_error(&self) -> bool {
        !matches!(
            self,
            Self::Database(_) | Self::Serialization(_) | Self::Internal(_) | Self::LockTimeout(_)
        )
    }

    /// 获取错误码（用于调用方展示）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::GrantNotFound(_) => "GRANT_NOT_FOUND",
            Self::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            Self::TemplateInactive(_) => "TEMPLATE_INACTIVE",
            Self::GrantNotOwned { .. } => "GRANT_NOT_OWNED",
            Self::GrantNotApplicable { .. } => "GRANT_NOT_APPLICABLE",
            Self::GrantUnavailable { .. } => "GRANT_UNAVAILABLE",
            Self::UsageNotFound(_) => "USAGE_NOT_FOUND",
            Self::AlreadyReversed(_) => "ALREADY_REVERSED",
            Self::InvalidReversalTarget { .. } => "INVALID_REVERSAL_TARGET",
            Self::DuplicateIdempotencyKey(_) => "DUPLICATE_IDEMPOTENCY_KEY",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
