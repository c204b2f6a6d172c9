//! 集成测试：SQLite 凭证存储
//!
//! 覆盖落盘后重新打开、静态数据不含明文以及保留期后的清理。

#![cfg(feature = "sqlite")]

use std::sync::Arc;
use std::time::Duration;

use accessgate::audit::InMemoryAuditLogger;
use accessgate::config::AccessConfig;
use accessgate::credential::{CredentialStore, RedemptionState, SqliteCredentialStore};
use accessgate::error::RedemptionError;
use accessgate::gate::RequestContext;
use accessgate::mail::RecordingMailer;
use accessgate::otp::ScriptedOtpGenerator;
use accessgate::reaper::Reaper;
use accessgate::service::AccessService;
use chrono::{DateTime, Utc};

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn service(store: SqliteCredentialStore, codes: &[&str]) -> AccessService {
    AccessService::builder(
        AccessConfig::new("https://guide.example.com")
            .with_link_ttl(Duration::from_secs(600))
            .with_otp_ttl(Duration::from_secs(300))
            .with_otp_pepper("sqlite-pepper"),
    )
    .store(Arc::new(store))
    .mailer(Arc::new(RecordingMailer::new()))
    .audit_logger(Arc::new(InMemoryAuditLogger::new()))
    .otp_generator(Arc::new(ScriptedOtpGenerator::new(codes.iter().copied())))
    .build()
    .unwrap()
}

fn secret_of(link: &str) -> String {
    url::Url::parse(link)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "t")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

/// 重新打开数据库后流程可以继续
#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.db");
    let ctx = RequestContext::new(Some("198.51.100.4".into()), None);

    let secret = {
        let svc = service(SqliteCredentialStore::open(&path).unwrap(), &["314159"]);
        let issued = svc
            .issuer()
            .issue_at("buyer@example.com", "guide-7", ts(50_000))
            .await
            .unwrap();
        let secret = secret_of(&issued.link_url);
        svc.gate()
            .visit_link_at(&secret, &ctx, ts(50_010))
            .await
            .unwrap();
        secret
    };

    let store = SqliteCredentialStore::open(&path).unwrap();
    assert_eq!(store.count().unwrap(), 1);

    let svc = service(store.clone(), &[]);
    let redemption = svc
        .gate()
        .submit_otp_at(&secret, "314159", None, &ctx, ts(50_020))
        .await
        .unwrap();
    assert_eq!(redemption.content_ref, "guide-7");

    let err = svc
        .gate()
        .submit_otp_at(&secret, "314159", None, &ctx, ts(50_021))
        .await
        .unwrap_err();
    assert_eq!(err.redemption(), Some(&RedemptionError::AlreadyUsed));

    let stored = store
        .find_by_secret_hash(&accessgate::crypto::hash_secret(&secret))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, RedemptionState::Used);
    assert_eq!(stored.binding.unwrap().ip.as_deref(), Some("198.51.100.4"));
}

/// 数据库文件中不出现密钥或 OTP 原文
#[tokio::test]
async fn test_database_file_has_no_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.db");

    let secret = {
        let svc = service(SqliteCredentialStore::open(&path).unwrap(), &["271828"]);
        let issued = svc
            .issuer()
            .issue_at("buyer@example.com", "guide-7", ts(50_000))
            .await
            .unwrap();
        let secret = secret_of(&issued.link_url);
        svc.gate()
            .visit_link_at(&secret, &RequestContext::anonymous(), ts(50_010))
            .await
            .unwrap();
        secret
    };

    let bytes = std::fs::read(&path).unwrap();
    let contains = |needle: &[u8]| bytes.windows(needle.len()).any(|w| w == needle);
    assert!(contains(b"buyer@example.com"));
    assert!(!contains(secret.as_bytes()));
    assert!(!contains(b"271828"));
}

/// 终态凭证在保留期后被清理
#[tokio::test]
async fn test_reaper_purges_after_retention() {
    let store = SqliteCredentialStore::open_in_memory().unwrap();
    let svc = service(store.clone(), &[]);

    let live = svc
        .issuer()
        .issue_at("live@example.com", "guide-1", ts(60_000))
        .await
        .unwrap();
    let stale = svc
        .issuer()
        .issue_at("stale@example.com", "guide-2", ts(59_000))
        .await
        .unwrap();

    // stale 在 59_600 过期，被访问时标记为 Expired
    let err = svc
        .gate()
        .visit_link_at(
            &secret_of(&stale.link_url),
            &RequestContext::anonymous(),
            ts(59_700),
        )
        .await
        .unwrap_err();
    assert_eq!(err.redemption(), Some(&RedemptionError::LinkExpired));

    let reaper = Reaper::new(
        Arc::new(store.clone()),
        Arc::new(InMemoryAuditLogger::new()),
        Duration::from_secs(900),
    );

    assert_eq!(reaper.run_once_at(ts(60_000)).await.unwrap(), 0);
    assert_eq!(reaper.run_once_at(ts(59_700 + 900)).await.unwrap(), 1);
    assert_eq!(store.count().unwrap(), 1);

    let remaining = store
        .find_by_secret_hash(&accessgate::crypto::hash_secret(&secret_of(&live.link_url)))
        .await
        .unwrap();
    assert!(remaining.is_some());
}
