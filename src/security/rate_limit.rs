//! 速率限制模块
//!
//! 基于滑动窗口的请求计数，按客户端（通常是 IP）限制 HTTP 接口的调用频率，
//! 用于减缓对链接密钥和 OTP 的暴力猜测。
//!
//! OTP 本身还有按凭证计数的尝试上限，这里的限制是额外的一层。
//!
//! ## 示例
//!
//! ```rust
//! use accessgate::security::rate_limit::{RateLimiter, RateLimitConfig, client_key};
//! use std::time::Duration;
//!
//! # tokio_test_block(async {
//! let limiter = RateLimiter::new(
//!     RateLimitConfig::new()
//!         .with_max_requests(2)
//!         .with_window(Duration::from_secs(60)),
//! );
//!
//! let key = client_key("otp_verify", Some("10.0.0.1"));
//! assert!(limiter.check(&key).await.is_ok());
//! assert!(limiter.check(&key).await.is_ok());
//! assert!(limiter.check(&key).await.is_err());
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// 速率限制配置
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// 时间窗口内允许的最大请求数
    pub max_requests: u32,
    /// 时间窗口大小
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置最大请求数
    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    /// 设置时间窗口
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// OTP 提交场景的预设配置
    ///
    /// 每个客户端每分钟最多 10 次提交
    pub fn for_otp_verify() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// 速率限制信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// 剩余请求次数
    pub remaining: u32,
    /// 总限制次数
    pub limit: u32,
    /// 窗口重置时间
    pub reset_after: Duration,
}

/// 构造按客户端区分的限流 key
///
/// 没有客户端地址时所有请求共用 `unknown`。
pub fn client_key(scope: &str, ip: Option<&str>) -> String {
    format!("{}:{}", scope, ip.unwrap_or("unknown"))
}

/// 速率限制器存储 trait
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// 检查并记录请求，超限时返回 [`Error::RateLimitExceeded`]
    async fn check_and_record(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitInfo>;

    /// 重置某个 key 的限制
    async fn reset(&self, key: &str);

    /// 清理过期记录
    async fn cleanup(&self, config: &RateLimitConfig);
}

/// 内存速率限制存储（滑动窗口）
///
/// 每个出现过的 key 占一条记录，需要定期调用 [`RateLimitStore::cleanup`] 回收。
#[derive(Debug, Clone, Default)]
pub struct InMemorySlidingWindowStore {
    /// key -> 窗口内的请求时间
    records: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
}

impl InMemorySlidingWindowStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录的 key 数量
    pub fn tracked_keys(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}

fn reset_after(timestamps: &[Instant], window: Duration) -> Duration {
    timestamps
        .first()
        .map(|ts| window.saturating_sub(ts.elapsed()))
        .unwrap_or(window)
}

#[async_trait]
impl RateLimitStore for InMemorySlidingWindowStore {
    async fn check_and_record(&self, key: &str, config: &RateLimitConfig) -> Result<RateLimitInfo> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::internal("rate limit lock poisoned"))?;

        let timestamps = records.entry(key.to_string()).or_default();

        // 清理窗口外的请求
        let now = Instant::now();
        timestamps.retain(|&ts| now.duration_since(ts) < config.window);

        let current = timestamps.len() as u32;
        if current >= config.max_requests {
            return Err(Error::rate_limited(reset_after(timestamps, config.window)));
        }

        timestamps.push(now);

        Ok(RateLimitInfo {
            remaining: config.max_requests - current - 1,
            limit: config.max_requests,
            reset_after: reset_after(timestamps, config.window),
        })
    }

    async fn reset(&self, key: &str) {
        if let Ok(mut records) = self.records.write() {
            records.remove(key);
        }
    }

    async fn cleanup(&self, config: &RateLimitConfig) {
        if let Ok(mut records) = self.records.write() {
            let now = Instant::now();
            records.retain(|_, timestamps| {
                timestamps
                    .last()
                    .is_some_and(|&last| now.duration_since(last) < config.window)
            });
        }
    }
}

/// 速率限制器
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    /// 使用内存存储创建限制器
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            store: Arc::new(InMemorySlidingWindowStore::new()),
        }
    }

    /// 使用自定义存储创建限制器
    pub fn with_store<S: RateLimitStore + 'static>(config: RateLimitConfig, store: S) -> Self {
        Self {
            config,
            store: Arc::new(store),
        }
    }

    /// 检查请求是否被允许
    ///
    /// 如果允许，记录请求并返回限制信息；
    /// 如果被限制，返回错误。
    pub async fn check(&self, key: &str) -> Result<RateLimitInfo> {
        self.store.check_and_record(key, &self.config).await
    }

    /// 重置某个 key 的限制
    pub async fn reset(&self, key: &str) {
        self.store.reset(key).await;
    }

    /// 清理过期记录
    pub async fn cleanup(&self) {
        self.store.cleanup(&self.config).await;
    }

    /// 获取配置
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// 启动后台任务，按固定间隔清理过期记录
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.cleanup().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::new().with_max_requests(3));

        let first = limiter.check("k").await.unwrap();
        assert_eq!(first.remaining, 2);
        assert_eq!(first.limit, 3);
        limiter.check("k").await.unwrap();
        let third = limiter.check("k").await.unwrap();
        assert_eq!(third.remaining, 0);

        let err = limiter.check("k").await.unwrap_err();
        match err {
            Error::RateLimitExceeded { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::new().with_max_requests(1));
        let a = client_key("tokens", Some("10.0.0.1"));
        let b = client_key("tokens", Some("10.0.0.2"));

        assert!(limiter.check(&a).await.is_ok());
        assert!(limiter.check(&b).await.is_ok());
        assert!(limiter.check(&a).await.is_err());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .with_max_requests(1)
                .with_window(Duration::from_millis(50)),
        );
        assert!(limiter.check("k").await.is_ok());
        assert!(limiter.check("k").await.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_and_cleanup() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .with_max_requests(1)
                .with_window(Duration::from_millis(20)),
        );
        limiter.check("k").await.unwrap();
        limiter.reset("k").await;
        assert!(limiter.check("k").await.is_ok());

        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.cleanup().await;
        assert!(limiter.check("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_evicts_idle_keys() {
        let store = InMemorySlidingWindowStore::new();
        let limiter = RateLimiter::with_store(
            RateLimitConfig::new()
                .with_max_requests(5)
                .with_window(Duration::from_millis(20)),
            store.clone(),
        );
        for i in 0..10 {
            limiter.check(&format!("k{}", i)).await.unwrap();
        }
        assert_eq!(store.tracked_keys(), 10);

        // 窗口内不回收
        limiter.cleanup().await;
        assert_eq!(store.tracked_keys(), 10);

        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.check("fresh").await.unwrap();
        limiter.cleanup().await;
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_spawned_cleanup_runs_periodically() {
        let store = InMemorySlidingWindowStore::new();
        let limiter = Arc::new(RateLimiter::with_store(
            RateLimitConfig::new().with_window(Duration::from_millis(10)),
            store.clone(),
        ));
        limiter.check("a").await.unwrap();
        limiter.check("b").await.unwrap();

        let task = limiter.clone().spawn_cleanup(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(store.tracked_keys(), 0);
    }

    #[test]
    fn test_client_key() {
        assert_eq!(client_key("otp", Some("1.2.3.4")), "otp:1.2.3.4");
        assert_eq!(client_key("otp", None), "otp:unknown");
        assert_eq!(RateLimitConfig::for_otp_verify().max_requests, 10);
    }
}
