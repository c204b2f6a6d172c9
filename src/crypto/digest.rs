//! 单向摘要
//!
//! 访问密钥和 OTP 只以摘要形式落盘：
//!
//! - 访问密钥：SHA-256（密钥本身有 ≥192 bits 熵，无需加盐）
//! - OTP：HMAC-SHA256(pepper, otp)，6 位数字的空间很小，必须加 pepper 防止彩虹表
//!
//! 比较一律使用常量时间比较。

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, Error, Result};
use crate::random::{constant_time_compare_str, hex_encode};

type HmacSha256 = Hmac<Sha256>;

/// 计算访问密钥的摘要（小写十六进制）
///
/// # Example
///
/// ```rust
/// use accessgate::crypto::hash_secret;
///
/// let hash = hash_secret("raw-secret");
/// assert_eq!(hash.len(), 64);
/// assert_ne!(hash, "raw-secret");
/// ```
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex_encode(&digest)
}

/// 常量时间比较提交的密钥与存储的摘要
pub fn verify_secret(secret: &str, expected_hash: &str) -> bool {
    constant_time_compare_str(&hash_secret(secret), expected_hash)
}

/// 带 pepper 的 OTP 摘要器
#[derive(Clone)]
pub struct OtpHasher {
    pepper: Vec<u8>,
}

impl std::fmt::Debug for OtpHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpHasher")
            .field("pepper", &"<redacted>")
            .finish()
    }
}

impl OtpHasher {
    /// 使用给定 pepper 创建摘要器
    ///
    /// pepper 不能为空。
    pub fn new(pepper: impl AsRef<[u8]>) -> Result<Self> {
        let pepper = pepper.as_ref();
        if pepper.is_empty() {
            return Err(Error::Crypto(CryptoError::InvalidKey(
                "OTP pepper cannot be empty".to_string(),
            )));
        }
        Ok(Self {
            pepper: pepper.to_vec(),
        })
    }

    /// 计算 OTP 摘要（小写十六进制）
    pub fn hash(&self, otp: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.pepper)
            .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))?;
        mac.update(otp.as_bytes());
        Ok(hex_encode(&mac.finalize().into_bytes()))
    }

    /// 常量时间比较提交的 OTP 与存储的摘要
    pub fn verify(&self, otp: &str, expected_hash: &str) -> Result<bool> {
        Ok(constant_time_compare_str(&self.hash(otp)?, expected_hash))
    }
}
