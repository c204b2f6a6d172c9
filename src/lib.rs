//! # accessgate
//!
//! 一次性、限时的访问链接服务，打开链接后需通过邮件 OTP 二次验证。
//!
//! ## 流程
//!
//! 1. 付款确认后签发凭证，把嵌入高熵密钥的链接发到购买者邮箱
//! 2. 打开链接时生成 6 位 OTP 并发送到同一邮箱
//! 3. 提交正确的 OTP 后凭证被原子地兑换（只会成功一次），释放内容引用
//! 4. 内容交付后凭证立即失效，之后的访问一律拒绝
//!
//! 存储中只保存密钥的 SHA-256 摘要和 OTP 的 HMAC，从不保存明文。
//!
//! ## Features
//!
//! - `sqlite` - SQLite 持久化存储（默认启用）
//! - `server` - 基于 axum 的 HTTP 接口与 `accessd` 二进制（默认启用）
//! - `webhook-mailer` - 通过 HTTP 中继发送邮件（默认启用）
//! - `full` - 启用所有功能
//!
//! ## 示例
//!
//! ```rust
//! use accessgate::config::AccessConfig;
//! use accessgate::gate::RequestContext;
//! use accessgate::otp::ScriptedOtpGenerator;
//! use accessgate::service::AccessService;
//! use std::sync::Arc;
//!
//! # tokio_test_block(async {
//! let service = AccessService::builder(
//!     AccessConfig::new("https://guide.example.com").with_otp_pepper("pepper"),
//! )
//! .otp_generator(Arc::new(ScriptedOtpGenerator::new(["482913"])))
//! .build()
//! .unwrap();
//!
//! // 签发
//! let issued = service.issuer().issue("alice@example.com", "guide-1").await.unwrap();
//! let secret = issued.link_url.split("t=").nth(1).unwrap().to_string();
//!
//! // 打开链接并提交 OTP
//! let ctx = RequestContext::anonymous();
//! service.gate().visit_link(&secret, &ctx).await.unwrap();
//! let redemption = service
//!     .gate()
//!     .submit_otp(&secret, "482913", None, &ctx)
//!     .await
//!     .unwrap();
//! assert_eq!(redemption.content_ref, "guide-1");
//!
//! // 重放被拒绝
//! assert!(service.gate().visit_link(&secret, &ctx).await.is_err());
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod delivery;
pub mod error;
pub mod gate;
pub mod issuer;
pub mod mail;
pub mod otp;
pub mod random;
pub mod reaper;
pub mod security;
pub mod service;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, RedemptionError, Result};

// ============================================================================
// 核心组件导出
// ============================================================================

pub use config::{AccessConfig, ServerConfig};
pub use credential::{
    AccessCredential, AttemptOutcome, CredentialStore, InMemoryCredentialStore, RedemptionState,
};
#[cfg(feature = "sqlite")]
pub use credential::SqliteCredentialStore;
pub use delivery::{ContentDelivery, ContentGrant, DeliveryMode};
pub use gate::{OtpChallenge, Redemption, RedemptionGate, RequestContext};
pub use issuer::{IssuedLink, TokenIssuer};
pub use service::{AccessService, AccessServiceBuilder};

// ============================================================================
// 基础设施导出
// ============================================================================

pub use audit::{AuditLogger, InMemoryAuditLogger, SecurityEvent, TracingAuditLogger};
pub use mail::{DisabledMailer, Mailer, OutboundEmail, RecordingMailer};
#[cfg(feature = "webhook-mailer")]
pub use mail::WebhookMailer;
pub use otp::{OtpGenerator, RandomOtpGenerator, ScriptedOtpGenerator};
pub use reaper::Reaper;
pub use security::rate_limit::{RateLimitConfig, RateLimitInfo, RateLimiter};
