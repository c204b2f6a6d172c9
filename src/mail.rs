//! 邮件模块
//!
//! [`Mailer`] 是出站邮件的唯一接口，核心流程只关心发送成功或失败。
//!
//! 内置实现：
//!
//! - [`WebhookMailer`]: 以 JSON POST 到 HTTP 邮件中继（`webhook-mailer` feature）
//! - [`RecordingMailer`]: 把邮件保存在内存中，用于测试或嵌入式使用
//! - [`DisabledMailer`]: 总是失败，用于未配置邮件时
//!
//! 邮件正文中包含访问链接或 OTP，因此邮件内容不会出现在日志中。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// 访问链接邮件标题
pub const ACCESS_LINK_SUBJECT: &str = "Your secure access link";

/// OTP 邮件标题
pub const OTP_SUBJECT: &str = "Your One-Time Password (OTP)";

// ============================================================================
// 邮件
// ============================================================================

/// 邮件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    /// 访问链接
    AccessLink,
    /// 一次性密码
    Otp,
}

/// 出站邮件
#[derive(Clone, Serialize)]
pub struct OutboundEmail {
    /// 种类
    #[serde(skip)]
    pub kind: EmailKind,
    /// 发件人
    pub from: String,
    /// 收件人
    pub to: String,
    /// 标题
    pub subject: String,
    /// HTML 正文
    pub html: String,
}

impl std::fmt::Debug for OutboundEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundEmail")
            .field("kind", &self.kind)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("subject", &self.subject)
            .field("html", &"<redacted>")
            .finish()
    }
}

impl OutboundEmail {
    /// 访问链接邮件
    pub fn access_link(
        from: impl Into<String>,
        to: impl Into<String>,
        link_url: &str,
        expires_at: DateTime<Utc>,
        ttl_minutes: u64,
    ) -> Self {
        let html = format!(
            "<p>Thanks for your purchase. Your secure access link is below. \
             It expires in {} minutes ({} UTC).</p>\n\
             <p><a href=\"{}\">Access your content</a></p>\n\
             <p>The link works once. If you did not request this, you can ignore this email.</p>",
            ttl_minutes,
            expires_at.format("%Y-%m-%d %H:%M"),
            escape_html(link_url),
        );
        Self {
            kind: EmailKind::AccessLink,
            from: from.into(),
            to: to.into(),
            subject: ACCESS_LINK_SUBJECT.to_string(),
            html,
        }
    }

    /// OTP 邮件
    pub fn otp(
        from: impl Into<String>,
        to: impl Into<String>,
        otp: &str,
        ttl_minutes: u64,
    ) -> Self {
        let html = format!(
            "<p>Your OTP is: <b>{}</b>. It expires in {} minutes.</p>\n\
             <p>Never share this code. We will never ask you for it.</p>",
            escape_html(otp),
            ttl_minutes,
        );
        Self {
            kind: EmailKind::Otp,
            from: from.into(),
            to: to.into(),
            subject: OTP_SUBJECT.to_string(),
            html,
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

// ============================================================================
// Mailer Trait
// ============================================================================

/// 出站邮件接口
#[async_trait]
pub trait Mailer: Send + Sync {
    /// 发送一封邮件
    async fn send(&self, email: &OutboundEmail) -> Result<()>;
}

// ============================================================================
// DisabledMailer
// ============================================================================

/// 未配置邮件发送时使用
///
/// 每次发送都返回 [`Error::Mail`]。签发仍会成功，链接只出现在接口响应中。
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, _email: &OutboundEmail) -> Result<()> {
        Err(Error::mail("mail transport not configured"))
    }
}

// ============================================================================
// RecordingMailer
// ============================================================================

/// 记录所有邮件的内存实现
#[derive(Debug, Default, Clone)]
pub struct RecordingMailer {
    outbox: Arc<RwLock<Vec<OutboundEmail>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingMailer {
    /// 创建新的记录器
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个总是发送失败的记录器
    pub fn failing() -> Self {
        let mailer = Self::default();
        mailer.set_failing(true);
        mailer
    }

    /// 切换是否模拟发送失败
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 所有已发送的邮件
    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.outbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 某个收件人最后一封指定种类的邮件
    pub fn last_to(&self, to: &str, kind: EmailKind) -> Option<OutboundEmail> {
        self.outbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|e| e.to == to && e.kind == kind)
            .cloned()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::mail("simulated transport failure"));
        }
        self.outbox
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(email.clone());
        Ok(())
    }
}

// ============================================================================
// WebhookMailer
// ============================================================================

/// 通过 HTTP 中继发送邮件
///
/// 请求体为 `{ "from", "to", "subject", "html" }`，
/// 配置了 token 时附带 `Authorization: Bearer <token>`。
#[cfg(feature = "webhook-mailer")]
#[derive(Debug, Clone)]
pub struct WebhookMailer {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[cfg(feature = "webhook-mailer")]
impl WebhookMailer {
    /// 创建中继客户端
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)
            .map_err(|e| crate::error::ConfigError::invalid("MAIL_WEBHOOK_URL", e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::mail(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

#[cfg(feature = "webhook-mailer")]
#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(email);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::mail(format!("mail relay request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::mail(format!(
                "mail relay returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        tracing::debug!(kind = ?email.kind, "mail relay accepted message");
        Ok(())
    }
}
