//! OTP 二次验证
//!
//! 打开链接时生成一个 6 位数字 OTP，摘要写入凭证后通过邮件发送；
//! 提交时由存储层在同一次原子更新中完成计数、比较与兑换。
//!
//! OTP 原文只出现在邮件正文里，不落盘，也不写日志。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::audit::{AuditLogger, SecurityEvent};
use crate::config::AccessConfig;
use crate::credential::{
    AccessCredential, AttemptOutcome, BindingContext, CredentialStore, OtpRecord, to_chrono,
};
use crate::crypto::OtpHasher;
use crate::error::Result;
use crate::mail::{Mailer, OutboundEmail};
use crate::random::generate_numeric_code;

// ============================================================================
// 生成器
// ============================================================================

/// OTP 生成器
pub trait OtpGenerator: Send + Sync {
    /// 生成指定位数的数字 OTP
    fn generate(&self, digits: usize) -> Result<String>;
}

/// 基于 CSPRNG 的默认生成器
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomOtpGenerator;

impl OtpGenerator for RandomOtpGenerator {
    fn generate(&self, digits: usize) -> Result<String> {
        generate_numeric_code(digits)
    }
}

/// 按预设顺序返回 OTP 的生成器
///
/// 预设用完后退回随机生成。用于测试和演示。
#[derive(Debug, Default)]
pub struct ScriptedOtpGenerator {
    codes: Mutex<VecDeque<String>>,
}

impl ScriptedOtpGenerator {
    /// 使用预设的 OTP 创建生成器
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: Mutex::new(codes.into_iter().map(Into::into).collect()),
        }
    }

    /// 追加一个预设 OTP
    pub fn push(&self, code: impl Into<String>) {
        self.codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(code.into());
    }
}

impl OtpGenerator for ScriptedOtpGenerator {
    fn generate(&self, digits: usize) -> Result<String> {
        let next = self
            .codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(code) => Ok(code),
            None => RandomOtpGenerator.generate(digits),
        }
    }
}

// ============================================================================
// OTP 二次验证
// ============================================================================

/// 一次 OTP 签发的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpDispatch {
    /// OTP 过期时间
    pub otp_expires_at: DateTime<Utc>,

    /// 邮件是否发送成功
    pub delivered: bool,
}

/// OTP 签发与验证
pub struct OtpStepUp {
    config: Arc<AccessConfig>,
    store: Arc<dyn CredentialStore>,
    mailer: Arc<dyn Mailer>,
    audit: Arc<dyn AuditLogger>,
    generator: Arc<dyn OtpGenerator>,
    hasher: OtpHasher,
}

impl OtpStepUp {
    /// 创建 OTP 二次验证组件
    pub fn new(
        config: Arc<AccessConfig>,
        store: Arc<dyn CredentialStore>,
        mailer: Arc<dyn Mailer>,
        audit: Arc<dyn AuditLogger>,
        generator: Arc<dyn OtpGenerator>,
    ) -> Result<Self> {
        let hasher = OtpHasher::new(&config.otp_pepper)?;
        Ok(Self {
            config,
            store,
            mailer,
            audit,
            generator,
            hasher,
        })
    }

    /// 为凭证签发新 OTP 并发送邮件
    ///
    /// 旧 OTP 被替换，尝试次数归零。凭证已不处于 `Issued`/`OtpPending`
    /// 或链接已过期时返回 `None`，由调用方重新读取状态。
    /// 邮件发送失败不回滚 OTP。
    pub async fn issue_otp(
        &self,
        credential: &AccessCredential,
        binding: Option<&BindingContext>,
        now: DateTime<Utc>,
    ) -> Result<Option<OtpDispatch>> {
        let otp = self.generator.generate(self.config.otp_length)?;
        let otp_expires_at = now + to_chrono(self.config.otp_ttl);
        let record = OtpRecord::new(
            self.hasher.hash(&otp)?,
            otp_expires_at,
            self.config.max_otp_attempts,
        );

        if !self
            .store
            .begin_otp(&credential.id, &record, binding, now)
            .await?
        {
            tracing::debug!(credential_id = %credential.id, "otp not issued, credential changed");
            return Ok(None);
        }

        let email = OutboundEmail::otp(
            &self.config.mail_from,
            &credential.email,
            &otp,
            minutes(self.config.otp_ttl),
        );
        let delivered = match self.mailer.send(&email).await {
            Ok(()) => {
                tracing::info!(credential_id = %credential.id, "otp sent");
                self.audit.log(SecurityEvent::otp_sent(&credential.id));
                true
            }
            Err(e) => {
                tracing::warn!(credential_id = %credential.id, error = %e, "otp email failed");
                self.audit
                    .log(SecurityEvent::otp_delivery_failed(&credential.id, e.to_string()));
                false
            }
        };

        Ok(Some(OtpDispatch {
            otp_expires_at,
            delivered,
        }))
    }

    /// 提交一次 OTP
    ///
    /// 每次被评估的提交都会先计数；格式错误的 OTP 同样计入尝试次数。
    pub async fn verify_otp(
        &self,
        credential_id: &str,
        supplied_otp: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let supplied_hash = self.hasher.hash(supplied_otp.trim())?;
        self.store
            .record_otp_attempt(credential_id, &supplied_hash, now)
            .await
    }
}

/// 邮件中展示的分钟数，至少为 1
pub(crate) fn minutes(duration: std::time::Duration) -> u64 {
    duration.as_secs().div_ceil(60).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventType, InMemoryAuditLogger};
    use crate::credential::{InMemoryCredentialStore, RedemptionState};
    use crate::mail::{EmailKind, RecordingMailer};
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    struct Fixture {
        step_up: OtpStepUp,
        store: InMemoryCredentialStore,
        mailer: RecordingMailer,
        audit: InMemoryAuditLogger,
        credential: AccessCredential,
    }

    async fn fixture(codes: &[&str]) -> Fixture {
        let store = InMemoryCredentialStore::new();
        let mailer = RecordingMailer::new();
        let audit = InMemoryAuditLogger::new();
        let config = Arc::new(AccessConfig::default().with_otp_pepper("test-pepper"));
        let step_up = OtpStepUp::new(
            config,
            Arc::new(store.clone()),
            Arc::new(mailer.clone()),
            Arc::new(audit.clone()),
            Arc::new(ScriptedOtpGenerator::new(codes.iter().copied())),
        )
        .unwrap();

        let credential = AccessCredential::new(
            "cred_1",
            "secret-hash",
            "alice@example.com",
            "guide-1",
            ts(1_000),
            Duration::from_secs(600),
        );
        store.insert(&credential).await.unwrap();

        Fixture {
            step_up,
            store,
            mailer,
            audit,
            credential,
        }
    }

    #[test]
    fn test_scripted_generator_falls_back_to_random() {
        let generator = ScriptedOtpGenerator::new(["123456"]);
        assert_eq!(generator.generate(6).unwrap(), "123456");
        let next = generator.generate(6).unwrap();
        assert_eq!(next.len(), 6);
    }

    #[test]
    fn test_minutes_rounds_up() {
        assert_eq!(minutes(Duration::from_secs(600)), 10);
        assert_eq!(minutes(Duration::from_secs(61)), 2);
        assert_eq!(minutes(Duration::from_secs(5)), 1);
    }

    #[tokio::test]
    async fn test_issue_otp_stores_hash_and_sends_email() {
        let f = fixture(&["482913"]).await;
        let dispatch = f
            .step_up
            .issue_otp(&f.credential, None, ts(1_010))
            .await
            .unwrap()
            .unwrap();

        assert!(dispatch.delivered);
        assert_eq!(dispatch.otp_expires_at, ts(1_010 + 600));

        let stored = f.store.find_by_id("cred_1").await.unwrap().unwrap();
        assert_eq!(stored.state, RedemptionState::OtpPending);
        let otp = stored.otp.unwrap();
        assert_ne!(otp.otp_hash, "482913");
        assert_eq!(otp.max_attempts, 5);

        let email = f
            .mailer
            .last_to("alice@example.com", EmailKind::Otp)
            .unwrap();
        assert!(email.html.contains("482913"));
        assert_eq!(f.audit.get_events_by_type(&EventType::OtpSent).len(), 1);
    }

    #[tokio::test]
    async fn test_issue_otp_mail_failure_keeps_state() {
        let f = fixture(&["482913"]).await;
        f.mailer.set_failing(true);

        let dispatch = f
            .step_up
            .issue_otp(&f.credential, None, ts(1_010))
            .await
            .unwrap()
            .unwrap();
        assert!(!dispatch.delivered);

        let stored = f.store.find_by_id("cred_1").await.unwrap().unwrap();
        assert_eq!(stored.state, RedemptionState::OtpPending);
        assert_eq!(
            f.audit
                .get_events_by_type(&EventType::OtpDeliveryFailed)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_issue_otp_after_link_expiry() {
        let f = fixture(&[]).await;
        let dispatch = f
            .step_up
            .issue_otp(&f.credential, None, ts(1_600))
            .await
            .unwrap();
        assert!(dispatch.is_none());
        assert!(f.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_verify_otp() {
        let f = fixture(&["482913"]).await;
        f.step_up
            .issue_otp(&f.credential, None, ts(1_010))
            .await
            .unwrap();

        let wrong = f
            .step_up
            .verify_otp("cred_1", "000000", ts(1_020))
            .await
            .unwrap();
        assert_eq!(
            wrong,
            AttemptOutcome::Mismatch {
                remaining_attempts: 3
            }
        );

        let right = f
            .step_up
            .verify_otp("cred_1", " 482913 ", ts(1_030))
            .await
            .unwrap();
        assert!(matches!(right, AttemptOutcome::Redeemed(_)));
    }

    #[tokio::test]
    async fn test_reissue_invalidates_previous_otp() {
        let f = fixture(&["111111", "222222"]).await;
        f.step_up
            .issue_otp(&f.credential, None, ts(1_010))
            .await
            .unwrap();
        f.step_up
            .issue_otp(&f.credential, None, ts(1_020))
            .await
            .unwrap();

        let old = f
            .step_up
            .verify_otp("cred_1", "111111", ts(1_030))
            .await
            .unwrap();
        assert!(matches!(old, AttemptOutcome::Mismatch { .. }));

        let new = f
            .step_up
            .verify_otp("cred_1", "222222", ts(1_031))
            .await
            .unwrap();
        assert!(matches!(new, AttemptOutcome::Redeemed(_)));
    }
}
