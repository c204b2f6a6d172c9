//! 服务组装
//!
//! [`AccessService`] 用同一份配置把存储、邮件、审计和 OTP 生成器
//! 接到签发器、兑换关卡和清理器上。未指定的组件使用默认实现：
//!
//! - 存储：[`InMemoryCredentialStore`]
//! - 邮件：[`DisabledMailer`]（发送失败不影响签发，链接仍通过返回值给出）
//! - 审计：[`TracingAuditLogger`]
//! - OTP：[`RandomOtpGenerator`]
//!
//! ## 示例
//!
//! ```rust
//! use accessgate::config::AccessConfig;
//! use accessgate::service::AccessService;
//!
//! let service = AccessService::builder(
//!     AccessConfig::new("https://guide.example.com").with_otp_pepper("pepper"),
//! )
//! .build()
//! .unwrap();
//!
//! assert_eq!(service.config().max_otp_attempts, 5);
//! ```

use std::sync::Arc;

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::config::AccessConfig;
use crate::credential::{CredentialStore, InMemoryCredentialStore};
use crate::error::Result;
use crate::gate::RedemptionGate;
use crate::issuer::TokenIssuer;
use crate::mail::{DisabledMailer, Mailer};
use crate::otp::{OtpGenerator, RandomOtpGenerator};
use crate::reaper::Reaper;

/// 组装完成的访问链接服务
pub struct AccessService {
    config: Arc<AccessConfig>,
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditLogger>,
    issuer: TokenIssuer,
    gate: RedemptionGate,
    reaper: Reaper,
}

impl AccessService {
    /// 创建构建器
    pub fn builder(config: AccessConfig) -> AccessServiceBuilder {
        AccessServiceBuilder::new(config)
    }

    /// 当前配置
    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    /// 凭证签发器
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// 兑换关卡
    pub fn gate(&self) -> &RedemptionGate {
        &self.gate
    }

    /// 清理器（可 clone 后交给后台任务）
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// 底层存储
    pub fn store(&self) -> Arc<dyn CredentialStore> {
        self.store.clone()
    }

    /// 审计日志
    pub fn audit(&self) -> Arc<dyn AuditLogger> {
        self.audit.clone()
    }
}

/// [`AccessService`] 构建器
pub struct AccessServiceBuilder {
    config: AccessConfig,
    store: Option<Arc<dyn CredentialStore>>,
    mailer: Option<Arc<dyn Mailer>>,
    audit: Option<Arc<dyn AuditLogger>>,
    generator: Option<Arc<dyn OtpGenerator>>,
}

impl AccessServiceBuilder {
    fn new(config: AccessConfig) -> Self {
        Self {
            config,
            store: None,
            mailer: None,
            audit: None,
            generator: None,
        }
    }

    /// 设置凭证存储
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 设置邮件发送器
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// 设置审计日志
    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 设置 OTP 生成器
    pub fn otp_generator(mut self, generator: Arc<dyn OtpGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// 校验配置并组装服务
    pub fn build(self) -> Result<AccessService> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCredentialStore::new()));
        let mailer = self.mailer.unwrap_or_else(|| Arc::new(DisabledMailer));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditLogger::new()));
        let generator = self
            .generator
            .unwrap_or_else(|| Arc::new(RandomOtpGenerator));

        let issuer = TokenIssuer::new(
            config.clone(),
            store.clone(),
            mailer.clone(),
            audit.clone(),
        );
        let gate = RedemptionGate::new(
            config.clone(),
            store.clone(),
            mailer,
            audit.clone(),
            generator,
        )?;
        let reaper = Reaper::new(store.clone(), audit.clone(), config.retention);

        tracing::debug!(
            delivery_mode = %config.delivery_mode,
            link_ttl_secs = config.link_ttl.as_secs(),
            otp_ttl_secs = config.otp_ttl.as_secs(),
            "access service assembled"
        );

        Ok(AccessService {
            config,
            store,
            audit,
            issuer,
            gate,
            reaper,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventType, InMemoryAuditLogger};
    use crate::error::Error;
    use crate::gate::RequestContext;
    use crate::mail::RecordingMailer;
    use crate::otp::ScriptedOtpGenerator;

    fn config() -> AccessConfig {
        AccessConfig::new("https://guide.example.com").with_otp_pepper("pepper")
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = AccessService::builder(config().with_max_otp_attempts(0)).build();
        assert!(matches!(result, Err(Error::Config(_))));

        // 上限为 1 时第一次提交就会封锁，正确的 OTP 也无法兑换
        let result = AccessService::builder(config().with_max_otp_attempts(1)).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_defaults_issue_without_mail() {
        let service = AccessService::builder(config()).build().unwrap();
        let issued = service
            .issuer()
            .issue("alice@example.com", "guide-1")
            .await
            .unwrap();
        assert!(!issued.link_delivered);
    }

    #[tokio::test]
    async fn test_components_share_store_and_audit() {
        let store = InMemoryCredentialStore::new();
        let audit = InMemoryAuditLogger::new();
        let generator = Arc::new(ScriptedOtpGenerator::new(["135790"]));
        let service = AccessService::builder(config())
            .store(Arc::new(store.clone()))
            .mailer(Arc::new(RecordingMailer::new()))
            .audit_logger(Arc::new(audit.clone()))
            .otp_generator(generator)
            .build()
            .unwrap();

        let issued = service
            .issuer()
            .issue("alice@example.com", "guide-1")
            .await
            .unwrap();
        let secret = issued
            .link_url
            .split("t=")
            .nth(1)
            .unwrap()
            .to_string();

        let ctx = RequestContext::anonymous();
        service.gate().visit_link(&secret, &ctx).await.unwrap();
        let redemption = service
            .gate()
            .submit_otp(&secret, "135790", None, &ctx)
            .await
            .unwrap();
        assert_eq!(redemption.content_ref, "guide-1");

        assert_eq!(store.len(), 1);
        assert_eq!(
            audit.get_events_by_type(&EventType::CredentialRedeemed).len(),
            1
        );
        assert_eq!(service.reaper().run_once().await.unwrap(), 0);
    }
}
