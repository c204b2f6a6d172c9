//! 内容交付
//!
//! 凭证兑换后只能领取一次内容引用。领取时写入 `delivered_at` 并把
//! `expires_at` 提前到当前时间，之后的任何访问都会被拒绝。
//!
//! 这里只返回引用，实际内容由外部服务渲染。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditLogger, SecurityEvent};
use crate::credential::CredentialStore;
use crate::error::{ConfigError, Error, RedemptionError, Result};

/// 内容交付方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// OTP 验证成功的响应中直接返回内容引用
    #[default]
    Inline,
    /// OTP 验证成功后重定向到内容查看地址，首次查看时交付
    Redirect,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Inline => write!(f, "inline"),
            DeliveryMode::Redirect => write!(f, "redirect"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(DeliveryMode::Inline),
            "redirect" => Ok(DeliveryMode::Redirect),
            other => Err(ConfigError::invalid(
                "DELIVERY_MODE",
                format!("expected 'inline' or 'redirect', got '{}'", other),
            )
            .into()),
        }
    }
}

/// 已交付的内容引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentGrant {
    /// 内容引用
    pub content_ref: String,

    /// 交付时间
    pub delivered_at: DateTime<Utc>,
}

/// 一次性内容交付
pub struct ContentDelivery {
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditLogger>,
}

impl ContentDelivery {
    /// 创建交付组件
    pub fn new(store: Arc<dyn CredentialStore>, audit: Arc<dyn AuditLogger>) -> Self {
        Self { store, audit }
    }

    /// 领取内容引用
    ///
    /// 凭证必须处于 `Used` 且尚未交付，否则返回 [`RedemptionError::AlreadyUsed`]。
    pub async fn deliver(&self, credential_id: &str, now: DateTime<Utc>) -> Result<ContentGrant> {
        match self.store.claim_delivery(credential_id, now).await? {
            Some(credential) => {
                tracing::info!(credential_id, "content released");
                self.audit.log(SecurityEvent::content_delivered(
                    credential_id,
                    &credential.content_ref,
                ));
                Ok(ContentGrant {
                    content_ref: credential.content_ref,
                    delivered_at: now,
                })
            }
            None => {
                tracing::debug!(credential_id, "content already claimed");
                self.audit.log(SecurityEvent::replay_rejected(credential_id));
                Err(RedemptionError::AlreadyUsed.into())
            }
        }
    }
}
