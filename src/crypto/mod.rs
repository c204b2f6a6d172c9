//! 密码学工具模块
//!
//! ## 功能
//!
//! - **访问密钥摘要**: SHA-256，只存摘要不存原文
//! - **OTP 摘要**: HMAC-SHA256 + pepper
//!
//! ## 示例
//!
//! ```rust
//! use accessgate::crypto::{OtpHasher, hash_secret, verify_secret};
//!
//! let stored = hash_secret("link-secret");
//! assert!(verify_secret("link-secret", &stored));
//!
//! let hasher = OtpHasher::new("pepper").unwrap();
//! let otp_hash = hasher.hash("123456").unwrap();
//! assert!(hasher.verify("123456", &otp_hash).unwrap());
//! ```

pub mod digest;

pub use digest::{OtpHasher, hash_secret, verify_secret};
