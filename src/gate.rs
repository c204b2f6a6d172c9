//! 兑换关卡
//!
//! [`RedemptionGate`] 是凭证状态机的唯一入口：
//!
//! | 当前状态 | 事件 | 结果 |
//! |---|---|---|
//! | Issued / OtpPending | 打开链接（未过期） | OtpPending，签发并发送新 OTP |
//! | Issued / OtpPending | 打开链接（已过期） | Expired，`LinkExpired` |
//! | OtpPending | 提交正确 OTP | Used，释放内容引用 |
//! | OtpPending | 提交错误 OTP | `InvalidOtp` 或达到上限后 Blocked |
//! | Issued | 提交 OTP | `OtpExpired`（重新打开链接） |
//! | Used | 任意 | `AlreadyUsed` |
//! | Blocked | 任意 | `TooManyAttempts` |
//! | Expired | 任意 | `LinkExpired` |
//!
//! 未知或格式错误的密钥一律返回 `InvalidToken`，不区分原因。
//!
//! 客户端 IP/User-Agent 与首次访问不一致时只记录异常，不拒绝请求。

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{AuditLogger, SecurityEvent};
use crate::config::AccessConfig;
use crate::credential::{
    AccessCredential, AttemptOutcome, BindingContext, CredentialStore, RedemptionState,
    mask_email, normalize_email,
};
use crate::crypto::hash_secret;
use crate::delivery::{ContentDelivery, ContentGrant, DeliveryMode};
use crate::error::{Error, RedemptionError, Result};
use crate::mail::Mailer;
use crate::otp::{OtpGenerator, OtpStepUp};

/// 访问密钥的最大长度（超过即视为格式错误）
const MAX_SECRET_LENGTH: usize = 512;

// ============================================================================
// 数据结构
// ============================================================================

/// 请求来源信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// 客户端 IP
    pub ip: Option<String>,
    /// User-Agent
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// 创建请求上下文
    pub fn new(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self { ip, user_agent }
    }

    /// 没有任何来源信息的上下文
    pub fn anonymous() -> Self {
        Self::default()
    }

    fn binding(&self) -> BindingContext {
        BindingContext::new(self.ip.clone(), self.user_agent.clone())
    }
}

/// 打开链接后的 OTP 挑战
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpChallenge {
    /// 遮蔽后的收件人邮箱
    pub masked_email: String,

    /// OTP 过期时间
    pub otp_expires_at: DateTime<Utc>,

    /// OTP 邮件是否发送成功
    pub otp_delivered: bool,

    /// 链接过期时间
    pub link_expires_at: DateTime<Utc>,
}

/// 兑换成功的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    /// 内容引用
    pub content_ref: String,

    /// 兑换时间
    pub used_at: DateTime<Utc>,

    /// `Inline` 模式下已领取的内容；`Redirect` 模式下为 `None`
    pub grant: Option<ContentGrant>,

    /// 是否观察到客户端异常
    pub binding_anomaly: bool,
}

// ============================================================================
// RedemptionGate
// ============================================================================

/// 兑换关卡
pub struct RedemptionGate {
    config: Arc<AccessConfig>,
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditLogger>,
    step_up: OtpStepUp,
    delivery: ContentDelivery,
}

impl RedemptionGate {
    /// 创建兑换关卡
    pub fn new(
        config: Arc<AccessConfig>,
        store: Arc<dyn CredentialStore>,
        mailer: Arc<dyn Mailer>,
        audit: Arc<dyn AuditLogger>,
        generator: Arc<dyn OtpGenerator>,
    ) -> Result<Self> {
        let step_up = OtpStepUp::new(
            config.clone(),
            store.clone(),
            mailer,
            audit.clone(),
            generator,
        )?;
        let delivery = ContentDelivery::new(store.clone(), audit.clone());
        Ok(Self {
            config,
            store,
            audit,
            step_up,
            delivery,
        })
    }

    /// 当前配置
    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    // ========================================================================
    // 打开链接
    // ========================================================================

    /// 打开链接：签发并发送 OTP
    pub async fn visit_link(&self, secret: &str, ctx: &RequestContext) -> Result<OtpChallenge> {
        self.visit_link_at(secret, ctx, Utc::now()).await
    }

    /// 在指定时间打开链接
    pub async fn visit_link_at(
        &self,
        secret: &str,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<OtpChallenge> {
        let credential = self.lookup(secret, ctx).await?;
        self.check_binding(&credential, ctx, "visit_link", now).await?;
        self.reject_inactive(&credential, ctx, now).await?;

        let binding = ctx.binding();
        match self.step_up.issue_otp(&credential, Some(&binding), now).await? {
            Some(dispatch) => Ok(OtpChallenge {
                masked_email: mask_email(&credential.email),
                otp_expires_at: dispatch.otp_expires_at,
                otp_delivered: dispatch.delivered,
                link_expires_at: credential.expires_at,
            }),
            None => {
                // 并发请求已改变状态，按最新状态拒绝
                let current = self.reload(&credential.id).await?;
                self.reject_inactive(&current, ctx, now).await?;
                Err(Error::internal("credential changed while issuing otp"))
            }
        }
    }

    // ========================================================================
    // 提交 OTP
    // ========================================================================

    /// 提交 OTP
    ///
    /// `email` 可选；提供时必须与签发邮箱一致（规范化后比较）。
    pub async fn submit_otp(
        &self,
        secret: &str,
        otp: &str,
        email: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Redemption> {
        self.submit_otp_at(secret, otp, email, ctx, Utc::now()).await
    }

    /// 在指定时间提交 OTP
    pub async fn submit_otp_at(
        &self,
        secret: &str,
        otp: &str,
        email: Option<&str>,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Redemption> {
        let credential = self.lookup(secret, ctx).await?;

        if let Some(email) = email {
            if normalize_email(email) != credential.email {
                tracing::debug!(credential_id = %credential.id, "email mismatch on otp submit");
                self.audit.log(
                    SecurityEvent::invalid_token_presented()
                        .with_credential_id(&credential.id)
                        .with_detail("reason", "email_mismatch")
                        .with_client(ctx.ip.as_deref(), ctx.user_agent.as_deref()),
                );
                return Err(RedemptionError::InvalidToken.into());
            }
        }

        let anomaly = self.check_binding(&credential, ctx, "submit_otp", now).await?;
        self.reject_inactive(&credential, ctx, now).await?;
        if credential.state == RedemptionState::Issued {
            return Err(RedemptionError::OtpExpired.into());
        }

        let outcome = self.step_up.verify_otp(&credential.id, otp, now).await?;
        self.finish_attempt(&credential, outcome, anomaly, ctx, now)
            .await
    }

    async fn finish_attempt(
        &self,
        credential: &AccessCredential,
        outcome: AttemptOutcome,
        anomaly: bool,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Redemption> {
        let id = credential.id.as_str();
        match outcome {
            AttemptOutcome::Redeemed(redeemed) => {
                tracing::info!(credential_id = id, "access credential redeemed");
                self.audit.log(
                    SecurityEvent::credential_redeemed(id)
                        .with_client(ctx.ip.as_deref(), ctx.user_agent.as_deref()),
                );

                let grant = match self.config.delivery_mode {
                    DeliveryMode::Inline => Some(self.delivery.deliver(id, now).await?),
                    DeliveryMode::Redirect => None,
                };
                Ok(Redemption {
                    content_ref: redeemed.content_ref,
                    used_at: redeemed.used_at.unwrap_or(now),
                    grant,
                    binding_anomaly: redeemed.binding_anomaly || anomaly,
                })
            }
            AttemptOutcome::Mismatch { remaining_attempts } => {
                tracing::debug!(credential_id = id, remaining_attempts, "otp mismatch");
                self.audit.log(
                    SecurityEvent::otp_failed(id, remaining_attempts)
                        .with_client(ctx.ip.as_deref(), ctx.user_agent.as_deref()),
                );
                Err(RedemptionError::InvalidOtp { remaining_attempts }.into())
            }
            AttemptOutcome::Blocked => {
                tracing::warn!(credential_id = id, "otp attempts exhausted, credential blocked");
                self.audit.log(
                    SecurityEvent::credential_blocked(id)
                        .with_client(ctx.ip.as_deref(), ctx.user_agent.as_deref()),
                );
                Err(RedemptionError::TooManyAttempts.into())
            }
            AttemptOutcome::OtpExpired => {
                tracing::debug!(credential_id = id, "otp expired");
                Err(RedemptionError::OtpExpired.into())
            }
            AttemptOutcome::LinkExpired => {
                tracing::debug!(credential_id = id, "link expired during otp submit");
                self.audit.log(SecurityEvent::credential_expired(id));
                Err(RedemptionError::LinkExpired.into())
            }
            AttemptOutcome::NotPending(None) => Err(RedemptionError::InvalidToken.into()),
            AttemptOutcome::NotPending(Some(current)) => {
                self.reject_inactive(&current, ctx, now).await?;
                match current.state {
                    RedemptionState::Issued => Err(RedemptionError::OtpExpired.into()),
                    _ => Err(Error::internal("credential changed while verifying otp")),
                }
            }
        }
    }

    // ========================================================================
    // 查看内容
    // ========================================================================

    /// 查看内容（`Redirect` 模式下的一次性领取）
    pub async fn view_content(&self, secret: &str, ctx: &RequestContext) -> Result<ContentGrant> {
        self.view_content_at(secret, ctx, Utc::now()).await
    }

    /// 在指定时间查看内容
    pub async fn view_content_at(
        &self,
        secret: &str,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<ContentGrant> {
        let credential = self.lookup(secret, ctx).await?;
        self.check_binding(&credential, ctx, "view_content", now).await?;

        if credential.state == RedemptionState::Used {
            if credential.delivered_at.is_some() {
                return Err(self.replay(&credential, ctx));
            }
            return self.delivery.deliver(&credential.id, now).await;
        }

        self.reject_inactive(&credential, ctx, now).await?;
        Err(RedemptionError::VerificationRequired.into())
    }

    // ========================================================================
    // 内部方法
    // ========================================================================

    async fn lookup(&self, secret: &str, ctx: &RequestContext) -> Result<AccessCredential> {
        let secret = secret.trim();
        let well_formed = !secret.is_empty()
            && secret.len() <= MAX_SECRET_LENGTH
            && secret
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        let found = if well_formed {
            self.store.find_by_secret_hash(&hash_secret(secret)).await?
        } else {
            None
        };

        found.ok_or_else(|| {
            tracing::debug!(ip = ctx.ip.as_deref().unwrap_or("-"), "unknown access secret");
            self.audit.log(
                SecurityEvent::invalid_token_presented()
                    .with_client(ctx.ip.as_deref(), ctx.user_agent.as_deref()),
            );
            RedemptionError::InvalidToken.into()
        })
    }

    async fn reload(&self, id: &str) -> Result<AccessCredential> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| RedemptionError::InvalidToken.into())
    }

    /// 终态或链接已过期时返回对应的拒绝原因
    async fn reject_inactive(
        &self,
        credential: &AccessCredential,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match credential.state {
            RedemptionState::Used => Err(self.replay(credential, ctx)),
            RedemptionState::Blocked => {
                tracing::debug!(credential_id = %credential.id, "blocked credential presented");
                Err(RedemptionError::TooManyAttempts.into())
            }
            RedemptionState::Expired => Err(RedemptionError::LinkExpired.into()),
            _ if credential.is_link_expired_at(now) => {
                if self.store.mark_expired(&credential.id, now).await? {
                    tracing::debug!(credential_id = %credential.id, "access credential expired");
                    self.audit
                        .log(SecurityEvent::credential_expired(&credential.id));
                }
                Err(RedemptionError::LinkExpired.into())
            }
            _ => Ok(()),
        }
    }

    fn replay(&self, credential: &AccessCredential, ctx: &RequestContext) -> Error {
        tracing::debug!(credential_id = %credential.id, "replay of used credential");
        self.audit.log(
            SecurityEvent::replay_rejected(&credential.id)
                .with_client(ctx.ip.as_deref(), ctx.user_agent.as_deref()),
        );
        RedemptionError::AlreadyUsed.into()
    }

    /// 比较请求来源与首次访问记录，不一致时只记录
    async fn check_binding(
        &self,
        credential: &AccessCredential,
        ctx: &RequestContext,
        step: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(first_seen) = credential.binding.as_ref() else {
            return Ok(false);
        };
        if !first_seen.differs_from(&ctx.binding()) {
            return Ok(false);
        }

        tracing::warn!(
            credential_id = %credential.id,
            step,
            ip = ctx.ip.as_deref().unwrap_or("-"),
            "client differs from first-seen client"
        );
        self.audit.log(
            SecurityEvent::binding_anomaly(&credential.id, step)
                .with_client(ctx.ip.as_deref(), ctx.user_agent.as_deref()),
        );
        self.store.flag_anomaly(&credential.id, now).await?;
        Ok(true)
    }
}
