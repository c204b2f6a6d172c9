//! 访问凭证模块
//!
//! 一条 [`AccessCredential`] 对应一次购买所签发的一次性访问链接。
//! 凭证只保存密钥摘要，状态只能单向推进：
//!
//! ```text
//! Issued ──visit──▶ OtpPending ──verify──▶ (OtpVerified) ──▶ Used
//!    │                  │
//!    └──────────────────┴──▶ Expired / Blocked
//! ```
//!
//! `Used`、`Expired`、`Blocked` 都是终态。`OtpVerified` 只在一次原子更新内部出现，
//! 不会被持久化。

pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ValidationError};

pub use store::{AttemptOutcome, CredentialStore, InMemoryCredentialStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCredentialStore;

/// 邮箱最大长度（RFC 5321）
pub const MAX_EMAIL_LENGTH: usize = 254;

/// 内容引用最大长度
pub const MAX_CONTENT_REF_LENGTH: usize = 512;

/// 记录的 User-Agent 最大长度
pub const MAX_USER_AGENT_LENGTH: usize = 256;

// ============================================================================
// 状态
// ============================================================================

/// 兑换状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionState {
    /// 已签发，链接尚未被打开
    Issued,
    /// 已发送 OTP，等待验证
    OtpPending,
    /// OTP 已通过（瞬时状态）
    OtpVerified,
    /// 已兑换
    Used,
    /// 已过期
    Expired,
    /// 尝试次数耗尽，已封锁
    Blocked,
}

impl RedemptionState {
    /// 状态名（存储与日志使用）
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionState::Issued => "issued",
            RedemptionState::OtpPending => "otp_pending",
            RedemptionState::OtpVerified => "otp_verified",
            RedemptionState::Used => "used",
            RedemptionState::Expired => "expired",
            RedemptionState::Blocked => "blocked",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RedemptionState::Used | RedemptionState::Expired | RedemptionState::Blocked
        )
    }

    /// 是否允许转移到目标状态
    pub fn can_transition_to(&self, next: RedemptionState) -> bool {
        use RedemptionState::*;
        matches!(
            (self, next),
            (Issued, OtpPending)
                | (Issued, Expired)
                | (OtpPending, OtpPending)
                | (OtpPending, OtpVerified)
                | (OtpPending, Used)
                | (OtpPending, Expired)
                | (OtpPending, Blocked)
                | (OtpVerified, Used)
                | (OtpVerified, Expired)
        )
    }
}

impl fmt::Display for RedemptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedemptionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "issued" => Ok(RedemptionState::Issued),
            "otp_pending" => Ok(RedemptionState::OtpPending),
            "otp_verified" => Ok(RedemptionState::OtpVerified),
            "used" => Ok(RedemptionState::Used),
            "expired" => Ok(RedemptionState::Expired),
            "blocked" => Ok(RedemptionState::Blocked),
            other => Err(Error::validation(format!("unknown redemption state: {}", other))),
        }
    }
}

// ============================================================================
// 数据结构
// ============================================================================

/// 当前有效的 OTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRecord {
    /// OTP 摘要
    pub otp_hash: String,

    /// OTP 过期时间
    pub otp_expires_at: DateTime<Utc>,

    /// 已尝试次数
    pub attempts: u32,

    /// 最大尝试次数
    pub max_attempts: u32,
}

impl OtpRecord {
    /// 创建一条尚未尝试过的 OTP 记录
    pub fn new(otp_hash: String, otp_expires_at: DateTime<Utc>, max_attempts: u32) -> Self {
        Self {
            otp_hash,
            otp_expires_at,
            attempts: 0,
            max_attempts,
        }
    }

    /// 在给定时间是否已过期
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.otp_expires_at
    }
}

/// 首次访问时记录的客户端信息
///
/// 仅作参考：IP 和 User-Agent 都由客户端控制，不作为授权依据。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingContext {
    /// 客户端 IP
    pub ip: Option<String>,

    /// User-Agent（截断到 [`MAX_USER_AGENT_LENGTH`]）
    pub user_agent: Option<String>,
}

impl BindingContext {
    /// 创建绑定信息
    pub fn new(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip: ip.map(|ip| ip.trim().to_string()).filter(|ip| !ip.is_empty()),
            user_agent: user_agent
                .map(|ua| ua.trim().chars().take(MAX_USER_AGENT_LENGTH).collect::<String>())
                .filter(|ua| !ua.is_empty()),
        }
    }

    /// 是否没有任何信息
    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.user_agent.is_none()
    }

    /// 与另一份绑定信息是否存在冲突
    ///
    /// 只比较双方都有值的字段。
    pub fn differs_from(&self, other: &BindingContext) -> bool {
        fn differs(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            }
        }
        differs(&self.ip, &other.ip) || differs(&self.user_agent, &other.user_agent)
    }
}

/// 访问凭证
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    /// 内部 ID，不返回给终端用户
    pub id: String,

    /// 访问密钥摘要
    pub secret_hash: String,

    /// 收件人邮箱（已规范化）
    pub email: String,

    /// 内容引用
    pub content_ref: String,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 链接过期时间
    pub expires_at: DateTime<Utc>,

    /// 当前状态
    pub state: RedemptionState,

    /// 当前 OTP
    pub otp: Option<OtpRecord>,

    /// 首次访问的客户端信息
    pub binding: Option<BindingContext>,

    /// 是否观察到与首次访问不一致的客户端
    pub binding_anomaly: bool,

    /// 兑换时间
    pub used_at: Option<DateTime<Utc>>,

    /// 内容交付时间
    pub delivered_at: Option<DateTime<Utc>>,

    /// 最后一次访问时间
    pub last_seen_at: Option<DateTime<Utc>>,

    /// 最后一次更新时间
    pub updated_at: DateTime<Utc>,
}

impl AccessCredential {
    /// 创建一条新签发的凭证
    pub fn new(
        id: impl Into<String>,
        secret_hash: impl Into<String>,
        email: impl Into<String>,
        content_ref: impl Into<String>,
        created_at: DateTime<Utc>,
        link_ttl: std::time::Duration,
    ) -> Self {
        Self {
            id: id.into(),
            secret_hash: secret_hash.into(),
            email: email.into(),
            content_ref: content_ref.into(),
            created_at,
            expires_at: created_at + to_chrono(link_ttl),
            state: RedemptionState::Issued,
            otp: None,
            binding: None,
            binding_anomaly: false,
            used_at: None,
            delivered_at: None,
            last_seen_at: None,
            updated_at: created_at,
        }
    }

    /// 链接在给定时间是否已过期
    pub fn is_link_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 获取剩余有效时间（秒）
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// 将标准库 Duration 转换为 chrono Duration
pub(crate) fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365 * 100))
}

// ============================================================================
// 邮箱处理
// ============================================================================

/// 规范化邮箱：去掉首尾空白并转为小写
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// 校验邮箱格式并返回规范化后的结果
///
/// # Example
///
/// ```rust
/// use accessgate::credential::validate_email;
///
/// assert_eq!(validate_email("  Alice@Example.COM ").unwrap(), "alice@example.com");
/// assert!(validate_email("not-an-email").is_err());
/// ```
pub fn validate_email(email: &str) -> Result<String> {
    let normalized = normalize_email(email);
    if normalized.is_empty() {
        return Err(ValidationError::EmptyField("email".to_string()).into());
    }
    if normalized.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::TooLong {
            field: "email".to_string(),
            max_length: MAX_EMAIL_LENGTH,
        }
        .into());
    }

    let invalid = || Error::from(ValidationError::InvalidEmail(normalized.clone()));

    if normalized.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = normalized.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels_ok = domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty());
    if !labels_ok {
        return Err(invalid());
    }

    Ok(normalized)
}

/// 校验内容引用
pub fn validate_content_ref(content_ref: &str) -> Result<String> {
    let trimmed = content_ref.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("contentRef".to_string()).into());
    }
    if trimmed.len() > MAX_CONTENT_REF_LENGTH {
        return Err(ValidationError::TooLong {
            field: "contentRef".to_string(),
            max_length: MAX_CONTENT_REF_LENGTH,
        }
        .into());
    }
    Ok(trimmed.to_string())
}

/// 遮蔽邮箱，用于响应展示：`alice@example.com` -> `a****@example.com`
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let mut chars = local.chars();
            match chars.next() {
                Some(first) => format!("{}{}@{}", first, "*".repeat(chars.count()), domain),
                None => format!("@{}", domain),
            }
        }
        None => "*".repeat(email.chars().count()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_state_round_trip_names() {
        for state in [
            RedemptionState::Issued,
            RedemptionState::OtpPending,
            RedemptionState::OtpVerified,
            RedemptionState::Used,
            RedemptionState::Expired,
            RedemptionState::Blocked,
        ] {
            assert_eq!(state.as_str().parse::<RedemptionState>().unwrap(), state);
        }
        assert!("redeemed".parse::<RedemptionState>().is_err());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        use RedemptionState::*;
        for terminal in [Used, Expired, Blocked] {
            assert!(terminal.is_terminal());
            for next in [Issued, OtpPending, OtpVerified, Used, Expired, Blocked] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Issued.is_terminal());
        assert!(!OtpPending.is_terminal());
    }

    #[test]
    fn test_forward_only_transitions() {
        use RedemptionState::*;
        assert!(Issued.can_transition_to(OtpPending));
        assert!(OtpPending.can_transition_to(OtpPending));
        assert!(OtpPending.can_transition_to(Used));
        assert!(OtpPending.can_transition_to(Blocked));
        assert!(!OtpPending.can_transition_to(Issued));
        assert!(!Issued.can_transition_to(Used));
        assert!(!Issued.can_transition_to(Blocked));
    }

    #[test]
    fn test_state_serde_uses_snake_case() {
        let json = serde_json::to_string(&RedemptionState::OtpPending).unwrap();
        assert_eq!(json, "\"otp_pending\"");
    }

    #[test]
    fn test_new_credential_expiry() {
        let cred = AccessCredential::new(
            "cred_1",
            "hash",
            "a@b.co",
            "guide-1",
            ts(1_000),
            std::time::Duration::from_secs(600),
        );
        assert_eq!(cred.state, RedemptionState::Issued);
        assert_eq!(cred.expires_at, ts(1_600));
        assert!(!cred.is_link_expired_at(ts(1_599)));
        assert!(cred.is_link_expired_at(ts(1_600)));
        assert_eq!(cred.remaining_seconds_at(ts(1_500)), 100);
        assert_eq!(cred.remaining_seconds_at(ts(2_000)), 0);
    }

    #[test]
    fn test_otp_record_expiry() {
        let otp = OtpRecord::new("h".into(), ts(100), 5);
        assert_eq!(otp.attempts, 0);
        assert!(!otp.is_expired_at(ts(99)));
        assert!(otp.is_expired_at(ts(100)));
    }

    #[test]
    fn test_validate_email() {
        assert_eq!(
            validate_email("  Alice@Example.COM ").unwrap(),
            "alice@example.com"
        );
        assert!(validate_email("").is_err());
        assert!(validate_email("alice").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("alice@localhost").is_err());
        assert!(validate_email("alice@@example.com").is_err());
        assert!(validate_email("al ice@example.com").is_err());
        assert!(validate_email("alice@example..com").is_err());

        let long = format!("{}@example.com", "a".repeat(250));
        assert!(matches!(
            validate_email(&long),
            Err(Error::Validation(ValidationError::TooLong { .. }))
        ));
    }

    #[test]
    fn test_validate_content_ref() {
        assert_eq!(validate_content_ref(" guide-42 ").unwrap(), "guide-42");
        assert!(matches!(
            validate_content_ref("   "),
            Err(Error::Validation(ValidationError::EmptyField(_)))
        ));
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("alice@example.com"), "a****@example.com");
        assert_eq!(mask_email("a@example.com"), "a@example.com");
    }

    #[test]
    fn test_binding_context() {
        let ua = "x".repeat(400);
        let binding = BindingContext::new(Some(" 10.0.0.1 ".into()), Some(ua));
        assert_eq!(binding.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(
            binding.user_agent.as_ref().map(|u| u.len()),
            Some(MAX_USER_AGENT_LENGTH)
        );

        let same_ip = BindingContext::new(Some("10.0.0.1".into()), None);
        assert!(!binding.differs_from(&same_ip));

        let other_ip = BindingContext::new(Some("10.0.0.2".into()), None);
        assert!(binding.differs_from(&other_ip));

        assert!(BindingContext::new(Some("".into()), None).is_empty());
    }
}
