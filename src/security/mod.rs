//! 安全防护模块
//!
//! - **rate_limit**: 按客户端的滑动窗口限流，减缓对链接密钥和 OTP 的暴力猜测

pub mod rate_limit;

pub use rate_limit::{
    InMemorySlidingWindowStore, RateLimitConfig, RateLimitInfo, RateLimitStore, RateLimiter,
    client_key,
};
