//! 过期凭证清理
//!
//! 终态凭证在保留期（默认 15 分钟）后删除，保留期内仍可用于审计排查。
//! 清理不在请求路径上，由后台任务定期执行。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::audit::{AuditLogger, SecurityEvent};
use crate::credential::{CredentialStore, to_chrono};
use crate::error::Result;

/// 凭证清理器
#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditLogger>,
    retention: Duration,
}

impl Reaper {
    /// 创建清理器
    pub fn new(
        store: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditLogger>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            audit,
            retention,
        }
    }

    /// 执行一次清理，返回删除数量
    pub async fn run_once(&self) -> Result<usize> {
        self.run_once_at(Utc::now()).await
    }

    /// 在指定时间执行一次清理
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - to_chrono(self.retention);
        let removed = self.store.purge(cutoff).await?;
        if removed > 0 {
            tracing::debug!(removed, "purged expired access credentials");
            self.audit.log(SecurityEvent::credentials_purged(removed));
        }
        Ok(removed)
    }

    /// 启动后台清理任务
    ///
    /// 单次失败只记录日志，任务继续运行。
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "credential purge failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventType, InMemoryAuditLogger};
    use crate::credential::{AccessCredential, InMemoryCredentialStore};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_run_once_respects_retention() {
        let store = InMemoryCredentialStore::new();
        let audit = InMemoryAuditLogger::new();
        let credential = AccessCredential::new(
            "cred_1",
            "h",
            "alice@example.com",
            "guide-1",
            ts(1_000),
            Duration::from_secs(600),
        );
        store.insert(&credential).await.unwrap();
        store.mark_expired("cred_1", ts(1_100)).await.unwrap();

        let reaper = Reaper::new(
            Arc::new(store.clone()),
            Arc::new(audit.clone()),
            Duration::from_secs(900),
        );

        // 保留期内
        assert_eq!(reaper.run_once_at(ts(1_100 + 899)).await.unwrap(), 0);
        assert_eq!(store.len(), 1);

        assert_eq!(reaper.run_once_at(ts(1_100 + 900)).await.unwrap(), 1);
        assert!(store.is_empty());
        assert_eq!(
            audit
                .get_events_by_type(&EventType::CredentialsPurged)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_live_credentials_survive() {
        let store = InMemoryCredentialStore::new();
        let credential = AccessCredential::new(
            "cred_1",
            "h",
            "alice@example.com",
            "guide-1",
            ts(1_000),
            Duration::from_secs(600),
        );
        store.insert(&credential).await.unwrap();

        let reaper = Reaper::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryAuditLogger::new()),
            Duration::from_secs(900),
        );
        assert_eq!(reaper.run_once_at(ts(1_200)).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_runs_periodically() {
        let store = InMemoryCredentialStore::new();
        let reaper = Reaper::new(
            Arc::new(store.clone()),
            Arc::new(InMemoryAuditLogger::new()),
            Duration::from_secs(0),
        );
        let handle = reaper.spawn(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
