//! 统一错误类型模块
//!
//! 提供 accessgate 中所有操作的错误类型定义。
//!
//! [`RedemptionError`] 是面向终端用户的拒绝原因，其余变体面向调用方/运维。

use std::time::Duration;

use thiserror::Error;

/// accessgate 的统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

/// accessgate 的错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// 兑换被拒绝（用户可见的结果）
    #[error("Redemption rejected: {0}")]
    Redemption(#[from] RedemptionError),

    /// 验证错误
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// 配置错误
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// 存储错误
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// 加密错误
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// 邮件发送失败
    #[error("Mail delivery error: {0}")]
    Mail(String),

    /// 速率限制超出
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// 重试等待时间
        retry_after: Duration,
    },

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 创建一个内部错误
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// 创建一个验证错误
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(ValidationError::Custom(msg.into()))
    }

    /// 创建一个邮件错误
    pub fn mail(msg: impl Into<String>) -> Self {
        Error::Mail(msg.into())
    }

    /// 创建一个速率限制错误
    pub fn rate_limited(retry_after: Duration) -> Self {
        Error::RateLimitExceeded { retry_after }
    }

    /// 如果是兑换拒绝，返回拒绝原因
    pub fn redemption(&self) -> Option<&RedemptionError> {
        match self {
            Error::Redemption(e) => Some(e),
            _ => None,
        }
    }
}

/// 兑换被拒绝的原因
///
/// 所有变体都是同步返回给调用方的终态结果，核心不会自动重试。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedemptionError {
    /// 链接无效（不区分"不存在"、"格式错误"或"邮箱不匹配"，防止枚举）
    #[error("this link is invalid")]
    InvalidToken,

    /// 链接已过期
    #[error("this link has expired")]
    LinkExpired,

    /// OTP 已过期，重新打开原链接即可获取新的 OTP
    #[error("the one-time password has expired, re-open your link to get a new one")]
    OtpExpired,

    /// OTP 错误
    #[error("invalid one-time password, {remaining_attempts} attempts remaining")]
    InvalidOtp {
        /// 剩余尝试次数
        remaining_attempts: u32,
    },

    /// 尝试次数已耗尽，凭证被封锁
    #[error("too many attempts, this link has been blocked")]
    TooManyAttempts,

    /// 凭证已被使用
    #[error("this link has already been used")]
    AlreadyUsed,

    /// 尚未完成 OTP 验证
    #[error("one-time password verification required")]
    VerificationRequired,
}

impl RedemptionError {
    /// 稳定的错误种类名称（用于 API 响应）
    pub fn kind(&self) -> &'static str {
        match self {
            RedemptionError::InvalidToken => "InvalidToken",
            RedemptionError::LinkExpired => "LinkExpired",
            RedemptionError::OtpExpired => "OtpExpired",
            RedemptionError::InvalidOtp { .. } => "InvalidOtp",
            RedemptionError::TooManyAttempts => "TooManyAttempts",
            RedemptionError::AlreadyUsed => "AlreadyUsed",
            RedemptionError::VerificationRequired => "VerificationRequired",
        }
    }

    /// 终端用户是否可以自行恢复
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RedemptionError::OtpExpired
                | RedemptionError::InvalidOtp { .. }
                | RedemptionError::VerificationRequired
        )
    }
}

/// 验证相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// 无效的邮箱格式
    #[error("invalid email format: {0}")]
    InvalidEmail(String),
    /// 字段为空
    #[error("field '{0}' cannot be empty")]
    EmptyField(String),
    /// 字段过长
    #[error("field '{field}' exceeds {max_length} characters")]
    TooLong { field: String, max_length: usize },
    /// 自定义验证错误
    #[error("{0}")]
    Custom(String),
}

/// 配置相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 缺少必需的配置
    #[error("missing required configuration: {0}")]
    MissingRequired(String),
    /// 无效的配置值
    #[error("invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// 存储相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// 连接失败
    #[error("storage connection failed: {0}")]
    ConnectionFailed(String),
    /// 记录已存在
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// 记录损坏或无法解析
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// 操作失败
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

/// 加密相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 随机数生成失败
    #[error("random number generation failed: {0}")]
    RngFailed(String),
    /// 密钥无效
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
