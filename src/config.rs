//! 配置模块
//!
//! [`AccessConfig`] 描述凭证生命周期（链接 TTL、OTP TTL、尝试次数等），
//! [`ServerConfig`] 描述 HTTP 服务本身。两者都可以通过构建器或环境变量创建。
//!
//! ## 示例
//!
//! ```rust
//! use accessgate::config::AccessConfig;
//! use std::time::Duration;
//!
//! let config = AccessConfig::new("https://guide.example.com")
//!     .with_link_ttl(Duration::from_secs(600))
//!     .with_otp_ttl(Duration::from_secs(300))
//!     .with_max_otp_attempts(5);
//! assert!(config.validate().is_ok());
//! ```

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::delivery::DeliveryMode;
use crate::error::{ConfigError, Result};
use crate::random::MIN_SECRET_BYTES;

/// 未配置 `OTP_PEPPER` 时使用的开发用 pepper
pub const DEV_OTP_PEPPER: &str = "dev-only-otp-pepper-change-me";

/// 凭证生命周期配置
#[derive(Clone)]
pub struct AccessConfig {
    /// 对外可访问的站点根地址，用于生成邮件链接
    pub base_url: String,

    /// 链接有效期
    pub link_ttl: Duration,

    /// OTP 有效期
    pub otp_ttl: Duration,

    /// 每个 OTP 的最大尝试次数
    pub max_otp_attempts: u32,

    /// 访问密钥长度（字节数，Base64 编码后会更长）
    pub secret_length: usize,

    /// OTP 位数
    pub otp_length: usize,

    /// OTP 摘要使用的 pepper
    pub otp_pepper: String,

    /// 发件人
    pub mail_from: String,

    /// 终态记录的保留时间（之后由 reaper 删除）
    pub retention: Duration,

    /// 内容交付方式
    pub delivery_mode: DeliveryMode,
}

impl std::fmt::Debug for AccessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessConfig")
            .field("base_url", &self.base_url)
            .field("link_ttl", &self.link_ttl)
            .field("otp_ttl", &self.otp_ttl)
            .field("max_otp_attempts", &self.max_otp_attempts)
            .field("secret_length", &self.secret_length)
            .field("otp_length", &self.otp_length)
            .field("otp_pepper", &"<redacted>")
            .field("mail_from", &self.mail_from)
            .field("retention", &self.retention)
            .field("delivery_mode", &self.delivery_mode)
            .finish()
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            link_ttl: Duration::from_secs(10 * 60), // 10 分钟
            otp_ttl: Duration::from_secs(10 * 60),  // 10 分钟
            max_otp_attempts: 5,
            secret_length: 32, // 256 bits
            otp_length: 6,
            otp_pepper: DEV_OTP_PEPPER.to_string(),
            mail_from: "no-reply@example.com".to_string(),
            retention: Duration::from_secs(15 * 60), // 15 分钟
            delivery_mode: DeliveryMode::Inline,
        }
    }
}

impl AccessConfig {
    /// 使用给定站点地址创建默认配置
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// 设置链接有效期
    pub fn with_link_ttl(mut self, ttl: Duration) -> Self {
        self.link_ttl = ttl;
        self
    }

    /// 设置 OTP 有效期
    pub fn with_otp_ttl(mut self, ttl: Duration) -> Self {
        self.otp_ttl = ttl;
        self
    }

    /// 设置最大 OTP 尝试次数
    pub fn with_max_otp_attempts(mut self, max: u32) -> Self {
        self.max_otp_attempts = max;
        self
    }

    /// 设置访问密钥长度
    pub fn with_secret_length(mut self, length: usize) -> Self {
        self.secret_length = length;
        self
    }

    /// 设置 OTP 位数
    pub fn with_otp_length(mut self, length: usize) -> Self {
        self.otp_length = length;
        self
    }

    /// 设置 OTP pepper
    pub fn with_otp_pepper(mut self, pepper: impl Into<String>) -> Self {
        self.otp_pepper = pepper.into();
        self
    }

    /// 设置发件人
    pub fn with_mail_from(mut self, from: impl Into<String>) -> Self {
        self.mail_from = from.into();
        self
    }

    /// 设置终态记录保留时间
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// 设置内容交付方式
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// 高安全性配置
    ///
    /// - 48 字节密钥（384 bits）
    /// - 链接 5 分钟过期
    /// - OTP 5 分钟过期
    /// - 最多 3 次尝试
    pub fn high_security(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            link_ttl: Duration::from_secs(5 * 60),
            otp_ttl: Duration::from_secs(5 * 60),
            max_otp_attempts: 3,
            secret_length: 48,
            ..Self::default()
        }
    }

    /// 检查配置是否合法
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid("base_url", e.to_string()))?;
        if self.link_ttl.is_zero() {
            return Err(ConfigError::invalid("link_ttl", "must be greater than zero").into());
        }
        if self.otp_ttl.is_zero() {
            return Err(ConfigError::invalid("otp_ttl", "must be greater than zero").into());
        }
        // 计数先于比对，上限为 1 时第一次提交就会锁定
        if self.max_otp_attempts < 2 {
            return Err(ConfigError::invalid("max_otp_attempts", "must be at least 2").into());
        }
        if self.secret_length < MIN_SECRET_BYTES {
            return Err(ConfigError::invalid(
                "secret_length",
                format!("must be at least {} bytes", MIN_SECRET_BYTES),
            )
            .into());
        }
        if !(4..=10).contains(&self.otp_length) {
            return Err(ConfigError::invalid("otp_length", "must be between 4 and 10").into());
        }
        if self.otp_pepper.is_empty() {
            return Err(ConfigError::MissingRequired("otp_pepper".to_string()).into());
        }
        Ok(())
    }

    /// 生成嵌入原始密钥的访问链接：`{base_url}/tokens/access?t={secret}`
    pub fn access_link(&self, secret: &str) -> Result<String> {
        self.link_with_secret("tokens/access", secret)
    }

    /// 生成内容查看链接：`{base_url}/content/view?t={secret}`
    pub fn content_view_link(&self, secret: &str) -> Result<String> {
        self.link_with_secret("content/view", secret)
    }

    fn link_with_secret(&self, path: &str, secret: &str) -> Result<String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::invalid("base_url", e.to_string()))?;
        let joined = format!("{}/{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.query_pairs_mut().clear().append_pair("t", secret);
        Ok(url.to_string())
    }

    /// 从环境变量加载配置
    ///
    /// 会先尝试加载 `.env` 文件。未设置的变量使用默认值。
    ///
    /// | 变量 | 默认值 |
    /// |---|---|
    /// | `APP_BASE_URL` | `http://localhost:4000` |
    /// | `TOKEN_TTL_SECONDS` | `600` |
    /// | `OTP_TTL_MINUTES` | `10` |
    /// | `MAX_OTP_ATTEMPTS` | `5` |
    /// | `OTP_PEPPER` | 开发用 pepper（会输出警告） |
    /// | `MAIL_FROM` | `no-reply@example.com` |
    /// | `RETENTION_SECONDS` | `900` |
    /// | `DELIVERY_MODE` | `inline` |
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载配置
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let otp_pepper = match lookup("OTP_PEPPER").filter(|v| !v.trim().is_empty()) {
            Some(pepper) => pepper,
            None => {
                tracing::warn!("OTP_PEPPER is not set, falling back to the development pepper");
                defaults.otp_pepper.clone()
            }
        };

        let config = Self {
            base_url: lookup("APP_BASE_URL").unwrap_or(defaults.base_url),
            link_ttl: Duration::from_secs(parse_var(&lookup, "TOKEN_TTL_SECONDS", 600u64)?),
            otp_ttl: Duration::from_secs(parse_var(&lookup, "OTP_TTL_MINUTES", 10u64)? * 60),
            max_otp_attempts: parse_var(&lookup, "MAX_OTP_ATTEMPTS", defaults.max_otp_attempts)?,
            secret_length: defaults.secret_length,
            otp_length: defaults.otp_length,
            otp_pepper,
            mail_from: lookup("MAIL_FROM").unwrap_or(defaults.mail_from),
            retention: Duration::from_secs(parse_var(&lookup, "RETENTION_SECONDS", 900u64)?),
            delivery_mode: parse_var(&lookup, "DELIVERY_MODE", defaults.delivery_mode)?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// HTTP 服务配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 监听端口
    pub port: u16,

    /// SQLite 数据库文件路径；为空时使用内存存储
    pub database_path: Option<String>,

    /// 速率限制窗口
    pub rate_window: Duration,

    /// 窗口内每个客户端允许的最大请求数
    pub rate_max: u32,

    /// 邮件中继地址；为空时邮件发送被禁用
    pub mail_webhook_url: Option<String>,

    /// 邮件中继的 Bearer token
    pub mail_webhook_token: Option<String>,

    /// reaper 运行间隔
    pub reaper_interval: Duration,

    /// 受信任的反向代理地址
    ///
    /// 只有来自这些地址的连接，限流才采用 `X-Forwarded-For` / `X-Real-IP`。
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            database_path: None,
            rate_window: Duration::from_millis(60_000),
            rate_max: 100,
            mail_webhook_url: None,
            mail_webhook_token: None,
            reaper_interval: Duration::from_secs(60),
            trusted_proxies: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// 从环境变量加载服务配置
    ///
    /// 读取 `PORT`、`DATABASE_PATH`、`RATE_WINDOW_MS`、`RATE_MAX`、
    /// `MAIL_WEBHOOK_URL`、`MAIL_WEBHOOK_TOKEN`、`REAPER_INTERVAL_SECONDS`、
    /// `TRUSTED_PROXIES`（逗号分隔的 IP 列表）。
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载服务配置
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let rate_max = parse_var(&lookup, "RATE_MAX", defaults.rate_max)?;
        if rate_max == 0 {
            return Err(ConfigError::invalid("RATE_MAX", "must be at least 1").into());
        }

        let trusted_proxies = non_empty("TRUSTED_PROXIES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(|entry| {
                        entry
                            .parse::<IpAddr>()
                            .map_err(|e| ConfigError::invalid("TRUSTED_PROXIES", e.to_string()))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            port: parse_var(&lookup, "PORT", defaults.port)?,
            database_path: non_empty("DATABASE_PATH"),
            rate_window: Duration::from_millis(parse_var(&lookup, "RATE_WINDOW_MS", 60_000u64)?),
            rate_max,
            mail_webhook_url: non_empty("MAIL_WEBHOOK_URL"),
            mail_webhook_token: non_empty("MAIL_WEBHOOK_TOKEN"),
            reaper_interval: Duration::from_secs(parse_var(
                &lookup,
                "REAPER_INTERVAL_SECONDS",
                60u64,
            )?),
            trusted_proxies,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()).into()),
        _ => Ok(default),
    }
}
