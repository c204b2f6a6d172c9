//! 凭证存储
//!
//! [`CredentialStore`] 提供的每个写操作都是一次条件更新：先检查前置状态，
//! 满足时才写入，整个过程在同一个临界区（或事务）内完成。
//! 这样即使多个请求并发提交同一个 OTP，也最多只有一个能兑换成功。
//!
//! 状态转移的判定逻辑由本模块的 `apply_*` 函数实现，各存储后端共用。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AccessCredential, BindingContext, OtpRecord, RedemptionState};
use crate::error::{Error, Result, StorageError};
use crate::random::constant_time_compare_str;

// ============================================================================
// 尝试结果
// ============================================================================

/// 一次 OTP 提交的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 验证通过，凭证已标记为 `Used`
    Redeemed(AccessCredential),

    /// OTP 不匹配
    Mismatch {
        /// 剩余可成功提交的次数
        remaining_attempts: u32,
    },

    /// 达到尝试上限，凭证已封锁
    Blocked,

    /// OTP 已过期（未计入尝试次数）
    OtpExpired,

    /// 链接已过期，凭证已标记为 `Expired`
    LinkExpired,

    /// 凭证不处于 `OtpPending`，附带当前记录（不存在时为 `None`）
    NotPending(Option<AccessCredential>),
}

// ============================================================================
// 存储接口
// ============================================================================

/// 凭证存储接口
///
/// 实现此 trait 以提供自定义的存储后端。
/// 所有条件更新必须是原子的，失败时不得留下部分写入。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// 保存新凭证，`secret_hash` 重复时返回 [`StorageError::AlreadyExists`]
    async fn insert(&self, credential: &AccessCredential) -> Result<()>;

    /// 按密钥摘要查找
    async fn find_by_secret_hash(&self, secret_hash: &str) -> Result<Option<AccessCredential>>;

    /// 按 ID 查找
    async fn find_by_id(&self, id: &str) -> Result<Option<AccessCredential>>;

    /// 签发新 OTP
    ///
    /// 仅当状态为 `Issued`/`OtpPending` 且链接未过期时写入，替换旧 OTP。
    /// 首次访问时记录 `binding`。返回是否写入成功。
    async fn begin_otp(
        &self,
        id: &str,
        otp: &OtpRecord,
        binding: Option<&BindingContext>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// 提交一次 OTP
    ///
    /// 先增加尝试次数，再比较摘要；比较成功则在同一次更新中标记为 `Used`。
    async fn record_otp_attempt(
        &self,
        id: &str,
        supplied_otp_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome>;

    /// 将未终结的凭证标记为 `Expired`，返回是否写入成功
    async fn mark_expired(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// 领取内容
    ///
    /// 仅当状态为 `Used` 且尚未交付时写入 `delivered_at = now` 并令 `expires_at = now`。
    /// 返回更新后的记录，条件不满足时返回 `None`。
    async fn claim_delivery(&self, id: &str, now: DateTime<Utc>)
    -> Result<Option<AccessCredential>>;

    /// 标记客户端信息异常
    async fn flag_anomaly(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    /// 删除终态且 `updated_at <= cutoff`，或 `expires_at <= cutoff` 的记录
    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

// ============================================================================
// 共享的状态转移逻辑
// ============================================================================

pub(crate) fn apply_begin_otp(
    credential: &mut AccessCredential,
    otp: &OtpRecord,
    binding: Option<&BindingContext>,
    now: DateTime<Utc>,
) -> bool {
    let state_ok = matches!(
        credential.state,
        RedemptionState::Issued | RedemptionState::OtpPending
    );
    if !state_ok || credential.is_link_expired_at(now) {
        return false;
    }

    move_to(credential, RedemptionState::OtpPending, now);
    credential.otp = Some(otp.clone());
    if credential.binding.is_none() {
        credential.binding = binding.filter(|b| !b.is_empty()).cloned();
    }
    credential.last_seen_at = Some(now);
    true
}

pub(crate) fn apply_otp_attempt(
    credential: &mut AccessCredential,
    supplied_otp_hash: &str,
    now: DateTime<Utc>,
) -> AttemptOutcome {
    if credential.state != RedemptionState::OtpPending {
        return AttemptOutcome::NotPending(Some(credential.clone()));
    }

    if credential.is_link_expired_at(now) {
        move_to(credential, RedemptionState::Expired, now);
        credential.otp = None;
        return AttemptOutcome::LinkExpired;
    }

    let Some(otp) = credential.otp.as_mut() else {
        return AttemptOutcome::OtpExpired;
    };
    if otp.is_expired_at(now) {
        return AttemptOutcome::OtpExpired;
    }

    // 先计数，再比较
    otp.attempts = otp.attempts.saturating_add(1);
    let blocked = otp.attempts >= otp.max_attempts;
    let matched = !blocked && constant_time_compare_str(&otp.otp_hash, supplied_otp_hash);
    let remaining_attempts = otp.max_attempts.saturating_sub(otp.attempts.saturating_add(1));
    credential.last_seen_at = Some(now);
    credential.updated_at = now;

    if blocked {
        move_to(credential, RedemptionState::Blocked, now);
        return AttemptOutcome::Blocked;
    }

    if !matched {
        return AttemptOutcome::Mismatch { remaining_attempts };
    }

    // OtpVerified 不落盘，直接进入 Used
    move_to(credential, RedemptionState::Used, now);
    credential.otp = None;
    credential.used_at = Some(now);
    AttemptOutcome::Redeemed(credential.clone())
}

pub(crate) fn apply_mark_expired(credential: &mut AccessCredential, now: DateTime<Utc>) -> bool {
    if credential.state.is_terminal() {
        return false;
    }
    move_to(credential, RedemptionState::Expired, now);
    credential.otp = None;
    true
}

pub(crate) fn apply_claim_delivery(credential: &mut AccessCredential, now: DateTime<Utc>) -> bool {
    if credential.state != RedemptionState::Used || credential.delivered_at.is_some() {
        return false;
    }
    credential.delivered_at = Some(now);
    credential.expires_at = now;
    credential.last_seen_at = Some(now);
    credential.updated_at = now;
    true
}

fn move_to(credential: &mut AccessCredential, next: RedemptionState, now: DateTime<Utc>) {
    debug_assert!(
        credential.state.can_transition_to(next),
        "illegal state transition {} -> {}",
        credential.state,
        next
    );
    credential.state = next;
    credential.updated_at = now;
}

pub(crate) fn is_purgeable(credential: &AccessCredential, cutoff: DateTime<Utc>) -> bool {
    (credential.state.is_terminal() && credential.updated_at <= cutoff)
        || credential.expires_at <= cutoff
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    StorageError::OperationFailed("credential store lock poisoned".to_string()).into()
}

// ============================================================================
// 内存存储实现
// ============================================================================

/// 内存存储实现
///
/// 适用于单实例部署或测试环境。
/// 多实例部署请使用 [`SqliteCredentialStore`](super::SqliteCredentialStore) 或自定义后端。
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    /// id -> 凭证
    credentials: Arc<RwLock<HashMap<String, AccessCredential>>>,
}

impl InMemoryCredentialStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取当前存储的凭证数量
    pub fn len(&self) -> usize {
        self.credentials.read().map(|c| c.len()).unwrap_or(0)
    }

    /// 检查存储是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 获取所有凭证的快照
    pub fn snapshot(&self) -> Result<Vec<AccessCredential>> {
        let credentials = self.credentials.read().map_err(poisoned)?;
        Ok(credentials.values().cloned().collect())
    }

    fn update<T>(
        &self,
        id: &str,
        missing: T,
        apply: impl FnOnce(&mut AccessCredential) -> T,
    ) -> Result<T> {
        let mut credentials = self.credentials.write().map_err(poisoned)?;
        Ok(match credentials.get_mut(id) {
            Some(credential) => apply(credential),
            None => missing,
        })
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert(&self, credential: &AccessCredential) -> Result<()> {
        let mut credentials = self.credentials.write().map_err(poisoned)?;
        let duplicate = credentials.contains_key(&credential.id)
            || credentials
                .values()
                .any(|c| c.secret_hash == credential.secret_hash);
        if duplicate {
            return Err(StorageError::AlreadyExists("access credential".to_string()).into());
        }
        credentials.insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn find_by_secret_hash(&self, secret_hash: &str) -> Result<Option<AccessCredential>> {
        let credentials = self.credentials.read().map_err(poisoned)?;
        Ok(credentials
            .values()
            .find(|c| constant_time_compare_str(&c.secret_hash, secret_hash))
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<AccessCredential>> {
        let credentials = self.credentials.read().map_err(poisoned)?;
        Ok(credentials.get(id).cloned())
    }

    async fn begin_otp(
        &self,
        id: &str,
        otp: &OtpRecord,
        binding: Option<&BindingContext>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update(id, false, |c| apply_begin_otp(c, otp, binding, now))
    }

    async fn record_otp_attempt(
        &self,
        id: &str,
        supplied_otp_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        self.update(id, AttemptOutcome::NotPending(None), |c| {
            apply_otp_attempt(c, supplied_otp_hash, now)
        })
    }

    async fn mark_expired(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.update(id, false, |c| apply_mark_expired(c, now))
    }

    async fn claim_delivery(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessCredential>> {
        self.update(id, None, |c| {
            apply_claim_delivery(c, now).then(|| c.clone())
        })
    }

    async fn flag_anomaly(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.update(id, (), |c| {
            c.binding_anomaly = true;
            c.updated_at = now;
        })
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut credentials = self.credentials.write().map_err(poisoned)?;
        let before = credentials.len();
        credentials.retain(|_, c| !is_purgeable(c, cutoff));
        Ok(before - credentials.len())
    }
}
