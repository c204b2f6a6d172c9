//! accessd：访问链接 HTTP 服务
//!
//! 配置全部来自环境变量（见 `AccessConfig::from_env` 与 `ServerConfig::from_env`）。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use accessgate::config::{AccessConfig, ServerConfig};
use accessgate::credential::{CredentialStore, SqliteCredentialStore};
use accessgate::mail::{DisabledMailer, Mailer, WebhookMailer};
use accessgate::server::{AppState, build_router};
use accessgate::service::AccessService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,accessgate=debug")),
        )
        .init();

    let config = AccessConfig::from_env().context("Failed to load access configuration")?;
    let server = ServerConfig::from_env().context("Failed to load server configuration")?;

    let store: Arc<dyn CredentialStore> = match &server.database_path {
        Some(path) => Arc::new(
            SqliteCredentialStore::open(path)
                .with_context(|| format!("Failed to open database at {}", path))?,
        ),
        None => {
            tracing::warn!("DATABASE_PATH not set, credentials will not survive a restart");
            Arc::new(SqliteCredentialStore::open_in_memory().context("Failed to open database")?)
        }
    };

    let mailer: Arc<dyn Mailer> = match &server.mail_webhook_url {
        Some(url) => Arc::new(
            WebhookMailer::new(url.clone(), server.mail_webhook_token.clone())
                .context("Failed to configure mail relay")?,
        ),
        None => {
            tracing::warn!("MAIL_WEBHOOK_URL not set, emails will not be sent");
            Arc::new(DisabledMailer)
        }
    };

    let service = Arc::new(
        AccessService::builder(config)
            .store(store)
            .mailer(mailer)
            .build()
            .context("Failed to assemble access service")?,
    );

    let reaper = service.reaper().clone().spawn(server.reaper_interval);

    let state = AppState::from_server_config(service, &server);
    if !state.trusted_proxies.is_empty() {
        tracing::info!(proxies = ?state.trusted_proxies, "trusting forwarded headers from proxies");
    }
    let sweeper = state.limiter.clone().spawn_cleanup(server.rate_window);

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(%addr, "accessd listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    reaper.abort();
    sweeper.abort();
    tracing::info!("accessd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
