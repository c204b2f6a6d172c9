//! 审计日志模块
//!
//! 记录凭证生命周期中的安全事件，包括：
//!
//! - **安全事件**: 签发、OTP 发送、验证失败、封锁、重放、客户端异常等
//! - **审计日志 Trait**: 定义日志记录接口
//! - **内存实现**: 用于测试和运维排查
//! - **tracing 实现**: 默认实现，把事件转发到 `tracing`
//!
//! 事件中不会出现访问密钥或 OTP 原文，收件人邮箱一律遮蔽。
//!
//! ## 使用示例
//!
//! ```rust
//! use accessgate::audit::{AuditLogger, EventType, InMemoryAuditLogger, SecurityEvent};
//!
//! let logger = InMemoryAuditLogger::new();
//!
//! logger.log(SecurityEvent::credential_issued("cred_1", "a****@example.com"));
//! logger.log(SecurityEvent::otp_failed("cred_1", 3).with_ip("10.0.0.1"));
//!
//! assert_eq!(logger.event_count(), 2);
//! assert_eq!(logger.get_events_by_credential("cred_1").len(), 2);
//! assert_eq!(logger.get_events_by_type(&EventType::OtpFailed).len(), 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// 事件严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventSeverity {
    /// 调试信息
    Debug,
    /// 一般信息
    #[default]
    Info,
    /// 警告
    Warning,
    /// 错误
    Error,
    /// 严重/危险
    Critical,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSeverity::Debug => write!(f, "DEBUG"),
            EventSeverity::Info => write!(f, "INFO"),
            EventSeverity::Warning => write!(f, "WARNING"),
            EventSeverity::Error => write!(f, "ERROR"),
            EventSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// 安全事件类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// 凭证签发
    CredentialIssued,
    /// 链接邮件发送失败
    LinkDeliveryFailed,
    /// OTP 发送
    OtpSent,
    /// OTP 邮件发送失败
    OtpDeliveryFailed,
    /// OTP 验证失败
    OtpFailed,
    /// 凭证兑换成功
    CredentialRedeemed,
    /// 凭证因尝试次数耗尽被封锁
    CredentialBlocked,
    /// 凭证过期
    CredentialExpired,
    /// 内容已交付
    ContentDelivered,
    /// 重放被拒绝
    ReplayRejected,
    /// 提交了无效链接
    InvalidTokenPresented,
    /// 客户端信息与首次访问不一致
    BindingAnomaly,
    /// 速率限制触发
    RateLimitTriggered,
    /// 清理过期凭证
    CredentialsPurged,
    /// 自定义事件
    Custom(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::CredentialIssued => write!(f, "credential_issued"),
            EventType::LinkDeliveryFailed => write!(f, "link_delivery_failed"),
            EventType::OtpSent => write!(f, "otp_sent"),
            EventType::OtpDeliveryFailed => write!(f, "otp_delivery_failed"),
            EventType::OtpFailed => write!(f, "otp_failed"),
            EventType::CredentialRedeemed => write!(f, "credential_redeemed"),
            EventType::CredentialBlocked => write!(f, "credential_blocked"),
            EventType::CredentialExpired => write!(f, "credential_expired"),
            EventType::ContentDelivered => write!(f, "content_delivered"),
            EventType::ReplayRejected => write!(f, "replay_rejected"),
            EventType::InvalidTokenPresented => write!(f, "invalid_token_presented"),
            EventType::BindingAnomaly => write!(f, "binding_anomaly"),
            EventType::RateLimitTriggered => write!(f, "rate_limit_triggered"),
            EventType::CredentialsPurged => write!(f, "credentials_purged"),
            EventType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// 安全事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// 事件 ID
    pub id: String,
    /// 事件类型
    pub event_type: EventType,
    /// 严重程度
    pub severity: EventSeverity,
    /// 凭证 ID（如果适用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    /// IP 地址（如果适用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// 用户代理（如果适用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// 事件消息/描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 额外详情
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
    /// 事件时间
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// 创建新的安全事件
    pub fn new(event_type: EventType, severity: EventSeverity) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            severity,
            credential_id: None,
            ip_address: None,
            user_agent: None,
            message: None,
            details: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// 创建自定义事件
    pub fn custom(name: impl Into<String>, severity: EventSeverity) -> Self {
        Self::new(EventType::Custom(name.into()), severity)
    }

    // ========================================================================
    // 便捷构造方法
    // ========================================================================

    /// 凭证签发
    pub fn credential_issued(credential_id: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self::new(EventType::CredentialIssued, EventSeverity::Info)
            .with_credential_id(credential_id)
            .with_detail("recipient", recipient.into())
            .with_message("Access credential issued")
    }

    /// 链接邮件发送失败
    pub fn link_delivery_failed(credential_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EventType::LinkDeliveryFailed, EventSeverity::Error)
            .with_credential_id(credential_id)
            .with_message(format!("Access link email failed: {}", reason.into()))
    }

    /// OTP 发送
    pub fn otp_sent(credential_id: impl Into<String>) -> Self {
        Self::new(EventType::OtpSent, EventSeverity::Info)
            .with_credential_id(credential_id)
            .with_message("OTP sent")
    }

    /// OTP 邮件发送失败
    pub fn otp_delivery_failed(credential_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EventType::OtpDeliveryFailed, EventSeverity::Error)
            .with_credential_id(credential_id)
            .with_message(format!("OTP email failed: {}", reason.into()))
    }

    /// OTP 验证失败
    pub fn otp_failed(credential_id: impl Into<String>, remaining_attempts: u32) -> Self {
        Self::new(EventType::OtpFailed, EventSeverity::Warning)
            .with_credential_id(credential_id)
            .with_detail("remaining_attempts", remaining_attempts.to_string())
            .with_message("OTP verification failed")
    }

    /// 凭证兑换成功
    pub fn credential_redeemed(credential_id: impl Into<String>) -> Self {
        Self::new(EventType::CredentialRedeemed, EventSeverity::Info)
            .with_credential_id(credential_id)
            .with_message("Access credential redeemed")
    }

    /// 凭证被封锁
    pub fn credential_blocked(credential_id: impl Into<String>) -> Self {
        Self::new(EventType::CredentialBlocked, EventSeverity::Critical)
            .with_credential_id(credential_id)
            .with_message("Access credential blocked after too many OTP attempts")
    }

    /// 凭证过期
    pub fn credential_expired(credential_id: impl Into<String>) -> Self {
        Self::new(EventType::CredentialExpired, EventSeverity::Info)
            .with_credential_id(credential_id)
            .with_message("Access credential expired")
    }

    /// 内容已交付
    pub fn content_delivered(credential_id: impl Into<String>, content_ref: impl Into<String>) -> Self {
        Self::new(EventType::ContentDelivered, EventSeverity::Info)
            .with_credential_id(credential_id)
            .with_detail("content_ref", content_ref.into())
            .with_message("Content released")
    }

    /// 重放被拒绝
    pub fn replay_rejected(credential_id: impl Into<String>) -> Self {
        Self::new(EventType::ReplayRejected, EventSeverity::Warning)
            .with_credential_id(credential_id)
            .with_message("Replay of a used access credential rejected")
    }

    /// 提交了无效链接
    pub fn invalid_token_presented() -> Self {
        Self::new(EventType::InvalidTokenPresented, EventSeverity::Warning)
            .with_message("Unknown or malformed access secret presented")
    }

    /// 客户端信息与首次访问不一致
    pub fn binding_anomaly(credential_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self::new(EventType::BindingAnomaly, EventSeverity::Warning)
            .with_credential_id(credential_id)
            .with_detail("step", step.into())
            .with_message("Client differs from first-seen client")
    }

    /// 速率限制触发
    pub fn rate_limit_triggered(
        identifier: impl Into<String>,
        ip: Option<impl Into<String>>,
    ) -> Self {
        let mut event = Self::new(EventType::RateLimitTriggered, EventSeverity::Warning)
            .with_detail("identifier", identifier.into());
        if let Some(ip) = ip {
            event = event.with_ip(ip);
        }
        event
    }

    /// 清理过期凭证
    pub fn credentials_purged(count: usize) -> Self {
        Self::new(EventType::CredentialsPurged, EventSeverity::Debug)
            .with_detail("count", count.to_string())
            .with_message("Expired access credentials purged")
    }

    // ========================================================================
    // Builder 方法
    // ========================================================================

    /// 设置凭证 ID
    pub fn with_credential_id(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }

    /// 设置 IP 地址
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// 同时设置可选的 IP 和 User Agent
    pub fn with_client(mut self, ip: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_string);
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    /// 设置消息
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// 添加详情
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// 设置严重程度
    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    // ========================================================================
    // 查询方法
    // ========================================================================

    /// 获取事件类型名称
    pub fn event_name(&self) -> String {
        self.event_type.to_string()
    }

    /// 检查是否是高严重程度事件
    pub fn is_high_severity(&self) -> bool {
        matches!(
            self.severity,
            EventSeverity::Error | EventSeverity::Critical
        )
    }

    /// 检查是否是兑换被拒绝类事件
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.event_type,
            EventType::OtpFailed
                | EventType::CredentialBlocked
                | EventType::ReplayRejected
                | EventType::InvalidTokenPresented
                | EventType::RateLimitTriggered
        )
    }
}

/// 生成事件 ID
fn generate_event_id() -> String {
    use crate::random::generate_random_hex;
    format!(
        "evt_{}",
        generate_random_hex(16).unwrap_or_else(|_| "unknown".to_string())
    )
}

// ============================================================================
// AuditLogger Trait
// ============================================================================

/// 审计日志记录器 trait
///
/// 记录失败不能影响主流程，因此 `log` 不返回错误。
pub trait AuditLogger: Send + Sync {
    /// 记录安全事件
    fn log(&self, event: SecurityEvent);

    /// 批量记录事件
    fn log_batch(&self, events: Vec<SecurityEvent>) {
        for event in events {
            self.log(event);
        }
    }
}

// ============================================================================
// InMemoryAuditLogger
// ============================================================================

/// 内存审计日志记录器
///
/// 用于测试和开发环境，将事件存储在内存中
#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditLogger {
    events: Arc<RwLock<Vec<SecurityEvent>>>,
    max_events: Option<usize>,
}

impl InMemoryAuditLogger {
    /// 创建新的内存日志记录器
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建带有最大事件数限制的日志记录器
    pub fn with_max_events(max: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events: Some(max),
        }
    }

    fn filtered(&self, predicate: impl Fn(&SecurityEvent) -> bool) -> Vec<SecurityEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// 获取所有事件
    pub fn get_events(&self) -> Vec<SecurityEvent> {
        self.filtered(|_| true)
    }

    /// 获取事件数量
    pub fn event_count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 按凭证 ID 获取事件
    pub fn get_events_by_credential(&self, credential_id: &str) -> Vec<SecurityEvent> {
        self.filtered(|e| e.credential_id.as_deref() == Some(credential_id))
    }

    /// 按事件类型获取事件
    pub fn get_events_by_type(&self, event_type: &EventType) -> Vec<SecurityEvent> {
        self.filtered(|e| &e.event_type == event_type)
    }

    /// 按严重程度获取事件
    pub fn get_events_by_severity(&self, severity: EventSeverity) -> Vec<SecurityEvent> {
        self.filtered(|e| e.severity == severity)
    }

    /// 获取时间范围内的事件
    pub fn get_events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<SecurityEvent> {
        self.filtered(|e| e.timestamp >= start && e.timestamp <= end)
    }

    /// 获取最近 N 个事件
    pub fn get_recent_events(&self, count: usize) -> Vec<SecurityEvent> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.iter().rev().take(count).cloned().collect()
    }

    /// 清空所有事件
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> AuditStats {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = AuditStats {
            total_events: events.len(),
            ..Default::default()
        };

        for event in events.iter() {
            match event.severity {
                EventSeverity::Debug => stats.debug_count += 1,
                EventSeverity::Info => stats.info_count += 1,
                EventSeverity::Warning => stats.warning_count += 1,
                EventSeverity::Error => stats.error_count += 1,
                EventSeverity::Critical => stats.critical_count += 1,
            }

            *stats.events_by_type.entry(event.event_name()).or_insert(0) += 1;
        }

        stats
    }
}

impl AuditLogger for InMemoryAuditLogger {
    fn log(&self, event: SecurityEvent) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);

        // 如果设置了最大事件数，删除最旧的事件
        if let Some(max) = self.max_events {
            while !events.is_empty() && events.len() >= max {
                events.remove(0);
            }
        }

        events.push(event);
    }
}

/// 审计统计信息
#[derive(Debug, Default, Clone)]
pub struct AuditStats {
    /// 总事件数
    pub total_events: usize,
    /// Debug 级别事件数
    pub debug_count: usize,
    /// Info 级别事件数
    pub info_count: usize,
    /// Warning 级别事件数
    pub warning_count: usize,
    /// Error 级别事件数
    pub error_count: usize,
    /// Critical 级别事件数
    pub critical_count: usize,
    /// 按类型统计
    pub events_by_type: HashMap<String, usize>,
}

// ============================================================================
// TracingAuditLogger
// ============================================================================

/// 将事件转发到 `tracing` 的日志记录器
///
/// 默认使用的实现。事件以 `accessgate::audit` 为 target 输出，
/// 级别由严重程度决定。
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl TracingAuditLogger {
    /// 创建新的 tracing 日志记录器
    pub fn new() -> Self {
        Self
    }
}

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: SecurityEvent) {
        let name = event.event_name();
        let credential_id = event.credential_id.as_deref().unwrap_or("-");
        let ip = event.ip_address.as_deref().unwrap_or("-");
        let message = event.message.as_deref().unwrap_or("");

        match event.severity {
            EventSeverity::Debug => tracing::debug!(
                target: "accessgate::audit",
                event = %name, credential_id, ip, details = ?event.details, "{}", message
            ),
            EventSeverity::Info => tracing::info!(
                target: "accessgate::audit",
                event = %name, credential_id, ip, details = ?event.details, "{}", message
            ),
            EventSeverity::Warning => tracing::warn!(
                target: "accessgate::audit",
                event = %name, credential_id, ip, details = ?event.details, "{}", message
            ),
            EventSeverity::Error | EventSeverity::Critical => tracing::error!(
                target: "accessgate::audit",
                event = %name, credential_id, ip, severity = %event.severity,
                details = ?event.details, "{}", message
            ),
        }
    }
}

// ============================================================================
// 测试
// ============================================================================
