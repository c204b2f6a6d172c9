//! HTTP 接口
//!
//! | 路由 | 说明 |
//! |---|---|
//! | `POST /tokens` | 签发凭证（付款成功后由后端调用） |
//! | `GET /tokens/access?t=` | 打开链接，发送 OTP |
//! | `POST /otp/verify` | 提交 OTP |
//! | `GET /content/view?t=` | 领取内容（`redirect` 模式） |
//! | `GET /health` | 健康检查（不限流） |
//!
//! 中间件从外到内：`TraceLayer` → 按客户端 IP 限流。
//! 限流以连接地址为准，代理头只在连接来自受信任代理时生效。

mod error;
mod routes;

pub use error::ApiError;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::audit::SecurityEvent;
use crate::config::ServerConfig;
use crate::gate::RequestContext;
use crate::security::rate_limit::{RateLimitConfig, RateLimiter, client_key};
use crate::service::AccessService;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    /// 访问链接服务
    pub service: Arc<AccessService>,
    /// 按客户端的限流器
    pub limiter: Arc<RateLimiter>,
    /// 受信任的反向代理
    pub trusted_proxies: Arc<Vec<IpAddr>>,
}

impl AppState {
    /// 创建共享状态（不信任任何代理头）
    pub fn new(service: Arc<AccessService>, limiter: RateLimiter) -> Self {
        Self {
            service,
            limiter: Arc::new(limiter),
            trusted_proxies: Arc::new(Vec::new()),
        }
    }

    /// 设置受信任的反向代理
    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = Arc::new(proxies);
        self
    }

    /// 使用服务配置中的限流参数创建共享状态
    pub fn from_server_config(service: Arc<AccessService>, server: &ServerConfig) -> Self {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .with_max_requests(server.rate_max)
                .with_window(server.rate_window),
        );
        Self::new(service, limiter).with_trusted_proxies(server.trusted_proxies.clone())
    }
}

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tokens", post(routes::issue_token))
        .route("/tokens/access", get(routes::access_link))
        .route("/otp/verify", post(routes::verify_otp))
        .route("/content/view", get(routes::view_content))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(routes::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// 客户端信息
// ============================================================================

/// 请求来源（IP 与 User-Agent）
///
/// 仅用于审计和客户端绑定检查，不参与限流。IP 优先级：
/// 1. `X-Forwarded-For` 的第一项
/// 2. `X-Real-IP`
/// 3. 连接的 socket 地址
#[derive(Debug, Clone)]
pub struct ClientContext(pub RequestContext);

impl ClientContext {
    fn from_parts(headers: &HeaderMap, socket: Option<SocketAddr>) -> Self {
        let ip = forwarded_ip(headers)
            .or_else(|| socket.map(|addr| addr.ip()))
            .map(|ip| ip.to_string());

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        ClientContext(RequestContext::new(ip, user_agent))
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());
    forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
    })
}

/// 限流使用的客户端地址
///
/// 以 socket 地址为准；只有连接来自受信任代理时才采用代理头。
fn rate_limit_ip(
    headers: &HeaderMap,
    socket: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let peer = socket?.ip();
    if trusted_proxies.contains(&peer) {
        forwarded_ip(headers).or(Some(peer))
    } else {
        Some(peer)
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let socket = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientContext::from_parts(&parts.headers, socket))
    }
}

// ============================================================================
// 限流中间件
// ============================================================================

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let socket = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = rate_limit_ip(request.headers(), socket, &state.trusted_proxies)
        .map(|ip| ip.to_string());
    let key = client_key("http", ip.as_deref());

    match state.limiter.check(&key).await {
        Ok(_) => next.run(request).await,
        Err(e) => {
            tracing::warn!(ip = ip.as_deref().unwrap_or("-"), "rate limit exceeded");
            state.service.audit().log(SecurityEvent::rate_limit_triggered(
                request.uri().path(),
                ip.as_deref(),
            ));
            ApiError::from(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    fn socket() -> Option<SocketAddr> {
        Some("127.0.0.1:5555".parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_takes_first_entry() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
            ("user-agent", "curl/8"),
        ]);
        let ClientContext(ctx) = ClientContext::from_parts(&h, socket());
        assert_eq!(ctx.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn test_falls_back_to_real_ip_then_socket() {
        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        let ClientContext(ctx) = ClientContext::from_parts(&h, socket());
        assert_eq!(ctx.ip.as_deref(), Some("198.51.100.2"));

        let h = headers(&[("x-forwarded-for", "not-an-ip")]);
        let ClientContext(ctx) = ClientContext::from_parts(&h, socket());
        assert_eq!(ctx.ip.as_deref(), Some("127.0.0.1"));

        let ClientContext(ctx) = ClientContext::from_parts(&HeaderMap::new(), None);
        assert_eq!(ctx, RequestContext::anonymous());
    }

    #[test]
    fn test_rate_limit_ip_ignores_headers_from_untrusted_peers() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7"), ("x-real-ip", "198.51.100.2")]);
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        assert_eq!(rate_limit_ip(&h, socket(), &[]), Some(peer));
        assert_eq!(
            rate_limit_ip(&h, socket(), &["10.0.0.2".parse().unwrap()]),
            Some(peer)
        );
        assert_eq!(rate_limit_ip(&h, None, &[]), None);
    }

    #[test]
    fn test_rate_limit_ip_trusts_configured_proxy() {
        let trusted = [IpAddr::from([127, 0, 0, 1])];
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 127.0.0.1")]);
        assert_eq!(
            rate_limit_ip(&h, socket(), &trusted),
            Some("203.0.113.7".parse().unwrap())
        );

        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(
            rate_limit_ip(&h, socket(), &trusted),
            Some("198.51.100.2".parse().unwrap())
        );

        // 代理没有带头时退回代理自身地址
        assert_eq!(
            rate_limit_ip(&HeaderMap::new(), socket(), &trusted),
            Some(IpAddr::from([127, 0, 0, 1]))
        );
    }
}
