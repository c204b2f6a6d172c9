//! 凭证签发
//!
//! 付款确认后调用 [`TokenIssuer::issue`]：生成高熵访问密钥，只保存其摘要，
//! 并把嵌入原始密钥的链接发送到购买者邮箱。
//!
//! 邮件发送失败不会让签发失败，链接仍会通过返回值交给调用方。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditLogger, SecurityEvent};
use crate::config::AccessConfig;
use crate::credential::{
    AccessCredential, CredentialStore, mask_email, validate_content_ref, validate_email,
};
use crate::crypto::hash_secret;
use crate::error::Result;
use crate::mail::{Mailer, OutboundEmail};
use crate::otp::minutes;
use crate::random::{generate_access_secret, generate_credential_id};

/// 签发结果
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedLink {
    /// 嵌入原始密钥的访问链接
    pub link_url: String,

    /// 链接过期时间
    pub expires_at: DateTime<Utc>,

    /// 链接邮件是否发送成功
    pub link_delivered: bool,
}

impl std::fmt::Debug for IssuedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedLink")
            .field("link_url", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("link_delivered", &self.link_delivered)
            .finish()
    }
}

/// 凭证签发器
pub struct TokenIssuer {
    config: Arc<AccessConfig>,
    store: Arc<dyn CredentialStore>,
    mailer: Arc<dyn Mailer>,
    audit: Arc<dyn AuditLogger>,
}

impl TokenIssuer {
    /// 创建签发器
    pub fn new(
        config: Arc<AccessConfig>,
        store: Arc<dyn CredentialStore>,
        mailer: Arc<dyn Mailer>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            config,
            store,
            mailer,
            audit,
        }
    }

    /// 为 `(email, content_ref)` 签发访问凭证
    pub async fn issue(&self, email: &str, content_ref: &str) -> Result<IssuedLink> {
        self.issue_at(email, content_ref, Utc::now()).await
    }

    /// 在指定时间签发访问凭证
    pub async fn issue_at(
        &self,
        email: &str,
        content_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedLink> {
        let email = validate_email(email)?;
        let content_ref = validate_content_ref(content_ref)?;

        let secret = generate_access_secret(self.config.secret_length)?;
        let link_url = self.config.access_link(&secret)?;
        let credential = AccessCredential::new(
            generate_credential_id()?,
            hash_secret(&secret),
            email,
            content_ref,
            now,
            self.config.link_ttl,
        );
        self.store.insert(&credential).await?;

        let masked = mask_email(&credential.email);
        tracing::info!(
            credential_id = %credential.id,
            recipient = %masked,
            expires_at = %credential.expires_at,
            "access credential issued"
        );
        self.audit
            .log(SecurityEvent::credential_issued(&credential.id, &masked));

        let message = OutboundEmail::access_link(
            &self.config.mail_from,
            &credential.email,
            &link_url,
            credential.expires_at,
            minutes(self.config.link_ttl),
        );
        let link_delivered = match self.mailer.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    credential_id = %credential.id,
                    error = %e,
                    "access link email failed, returning link to caller only"
                );
                self.audit
                    .log(SecurityEvent::link_delivery_failed(&credential.id, e.to_string()));
                false
            }
        };

        Ok(IssuedLink {
            link_url,
            expires_at: credential.expires_at,
            link_delivered,
        })
    }
}
