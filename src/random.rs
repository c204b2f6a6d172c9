//! 安全随机数生成模块
//!
//! 提供密码学安全的随机数生成功能，用于生成访问密钥、凭证 ID 和 OTP。

use rand::{Rng, TryRngCore, rngs::OsRng};

use crate::error::{CryptoError, Error, Result};

/// 访问密钥的最小字节数（192 bits）
pub const MIN_SECRET_BYTES: usize = 24;

/// 生成指定长度的随机字节数组
///
/// 使用操作系统提供的密码学安全随机数生成器 (CSPRNG)
///
/// # Example
///
/// ```rust
/// use accessgate::random::generate_random_bytes;
///
/// let bytes = generate_random_bytes(32).unwrap();
/// assert_eq!(bytes.len(), 32);
/// ```
pub fn generate_random_bytes(length: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Crypto(CryptoError::RngFailed(format!("{:?}", e))))?;
    Ok(bytes)
}

/// 生成指定长度的十六进制随机字符串
///
/// 最终字符串长度为字节数的两倍
pub fn generate_random_hex(byte_length: usize) -> Result<String> {
    let bytes = generate_random_bytes(byte_length)?;
    Ok(hex_encode(&bytes))
}

/// 生成指定长度的 Base64 URL 安全随机字符串（不含填充）
///
/// # Example
///
/// ```rust
/// use accessgate::random::generate_random_base64_url;
///
/// let token = generate_random_base64_url(32).unwrap();
/// assert!(!token.contains('+'));
/// assert!(!token.contains('/'));
/// ```
pub fn generate_random_base64_url(byte_length: usize) -> Result<String> {
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    let bytes = generate_random_bytes(byte_length)?;
    Ok(URL_SAFE_NO_PAD.encode(&bytes))
}

/// 生成嵌入邮件链接的访问密钥
///
/// 少于 [`MIN_SECRET_BYTES`] 字节的请求会被拒绝。
pub fn generate_access_secret(byte_length: usize) -> Result<String> {
    if byte_length < MIN_SECRET_BYTES {
        return Err(Error::Crypto(CryptoError::InvalidKey(format!(
            "access secret must be at least {} bytes, got {}",
            MIN_SECRET_BYTES, byte_length
        ))));
    }
    generate_random_base64_url(byte_length)
}

/// 生成凭证的内部 ID
///
/// 格式：`cred_` + 32 个十六进制字符
pub fn generate_credential_id() -> Result<String> {
    Ok(format!("cred_{}", generate_random_hex(16)?))
}

/// 数字验证码允许的最大位数（`10^19` 仍在 `u64` 范围内）
pub const MAX_NUMERIC_CODE_DIGITS: usize = 19;

/// 生成指定位数的数字验证码
///
/// 在 `[0, 10^digits)` 上均匀取值并左侧补零，因此 `000123` 这样的码同样可能出现。
/// 位数必须在 `1..=`[`MAX_NUMERIC_CODE_DIGITS`] 之间。
///
/// # Example
///
/// ```rust
/// use accessgate::random::generate_numeric_code;
///
/// let code = generate_numeric_code(6).unwrap();
/// assert_eq!(code.len(), 6);
/// assert!(code.chars().all(|c| c.is_ascii_digit()));
/// assert!(generate_numeric_code(20).is_err());
/// ```
pub fn generate_numeric_code(digits: usize) -> Result<String> {
    let max = u32::try_from(digits)
        .ok()
        .filter(|d| *d > 0)
        .and_then(|d| 10u64.checked_pow(d))
        .ok_or_else(|| {
            Error::validation(format!(
                "numeric code must have 1 to {} digits, got {}",
                MAX_NUMERIC_CODE_DIGITS, digits
            ))
        })?;
    let code = rand::rng().random_range(0..max);
    Ok(format!("{:0>width$}", code, width = digits))
}

/// 将字节数组编码为十六进制字符串
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 常量时间比较两个字节切片
///
/// 用于防止时序攻击
///
/// # Example
///
/// ```rust
/// use accessgate::random::constant_time_compare;
///
/// assert!(constant_time_compare(b"secret_token", b"secret_token"));
/// assert!(!constant_time_compare(b"secret_token", b"other_token!"));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// 常量时间比较两个字符串
pub fn constant_time_compare_str(a: &str, b: &str) -> bool {
    constant_time_compare(a.as_bytes(), b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_random_bytes() {
        let bytes = generate_random_bytes(32).unwrap();
        assert_eq!(bytes.len(), 32);

        // 两次生成不应相同
        let bytes2 = generate_random_bytes(32).unwrap();
        assert_ne!(bytes, bytes2);
    }

    #[test]
    fn test_generate_random_hex() {
        let hex = generate_random_hex(16).unwrap();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_random_base64_url() {
        let token = generate_random_base64_url(32).unwrap();

        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains('='));
        // 32 字节 -> 43 个字符
        assert_eq!(token.len(), 43);
    }

    #[test]
    fn test_access_secret_minimum_entropy() {
        assert!(generate_access_secret(16).is_err());
        let secret = generate_access_secret(MIN_SECRET_BYTES).unwrap();
        assert_eq!(secret.len(), 32);
    }

    #[test]
    fn test_credential_id_format() {
        let id = generate_credential_id().unwrap();
        assert!(id.starts_with("cred_"));
        assert_eq!(id.len(), 5 + 32);
    }

    #[test]
    fn test_numeric_code_shape_and_spread() {
        let codes: HashSet<String> = (0..200)
            .map(|_| generate_numeric_code(6).unwrap())
            .collect();
        for code in &codes {
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        // 200 次取样中重复极少
        assert!(codes.len() > 190);
    }

    #[test]
    fn test_numeric_code_digit_bounds() {
        assert_eq!(generate_numeric_code(1).unwrap().len(), 1);
        assert_eq!(
            generate_numeric_code(MAX_NUMERIC_CODE_DIGITS).unwrap().len(),
            MAX_NUMERIC_CODE_DIGITS
        );
        assert!(generate_numeric_code(0).is_err());
        assert!(generate_numeric_code(MAX_NUMERIC_CODE_DIGITS + 1).is_err());
        assert!(generate_numeric_code(usize::MAX).is_err());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"hello", b"hello"));
        assert!(!constant_time_compare(b"hello", b"world"));
        assert!(!constant_time_compare(b"hello", b"hell"));
    }

    #[test]
    fn test_constant_time_compare_str() {
        assert!(constant_time_compare_str("secret", "secret"));
        assert!(!constant_time_compare_str("secret", "Secret"));
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }
}
