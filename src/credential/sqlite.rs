//! SQLite 凭证存储
//!
//! 所有条件更新都在 `BEGIN IMMEDIATE` 事务内完成：读取当前行，
//! 应用与内存存储相同的转移逻辑，再以快照中的 `state`/`otp_hash`/`otp_attempts`
//! 作为条件写回。受影响行数为 0 时事务回滚。
//!
//! 时间统一以 Unix 毫秒存储。

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};

use super::store::{
    AttemptOutcome, CredentialStore, apply_begin_otp, apply_claim_delivery, apply_mark_expired,
    apply_otp_attempt,
};
use super::{AccessCredential, BindingContext, OtpRecord, RedemptionState};
use crate::error::{Error, Result, StorageError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS access_credentials (
        id TEXT PRIMARY KEY,
        secret_hash TEXT NOT NULL,
        email TEXT NOT NULL,
        content_ref TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        state TEXT NOT NULL,
        otp_hash TEXT,
        otp_expires_at INTEGER,
        otp_attempts INTEGER NOT NULL DEFAULT 0,
        max_otp_attempts INTEGER NOT NULL DEFAULT 0,
        binding_ip TEXT,
        binding_user_agent TEXT,
        binding_anomaly INTEGER NOT NULL DEFAULT 0,
        used_at INTEGER,
        delivered_at INTEGER,
        last_seen_at INTEGER,
        updated_at INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_access_credentials_secret_hash
        ON access_credentials (secret_hash);

    CREATE INDEX IF NOT EXISTS idx_access_credentials_state_updated
        ON access_credentials (state, updated_at);

    CREATE INDEX IF NOT EXISTS idx_access_credentials_expires
        ON access_credentials (expires_at);
";

const SELECT_COLUMNS: &str = "SELECT id, secret_hash, email, content_ref, created_at, expires_at, \
     state, otp_hash, otp_expires_at, otp_attempts, max_otp_attempts, binding_ip, \
     binding_user_agent, binding_anomaly, used_at, delivered_at, last_seen_at, updated_at \
     FROM access_credentials";

/// SQLite 凭证存储
///
/// ```rust
/// use accessgate::credential::SqliteCredentialStore;
///
/// let store = SqliteCredentialStore::open_in_memory().unwrap();
/// ```
#[derive(Clone)]
pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCredentialStore").finish_non_exhaustive()
    }
}

impl SqliteCredentialStore {
    /// 打开（或创建）数据库文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StorageError::ConnectionFailed(format!(
                "failed to open credential store at {}: {e}",
                path.display()
            ))
        })?;
        Self::from_connection(conn)
    }

    /// 打开内存数据库（用于测试）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StorageError::ConnectionFailed(format!("failed to open in-memory credential store: {e}"))
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(storage("failed to set busy timeout"))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)
            .map_err(storage("failed to init credential schema"))?;
        Ok(())
    }

    /// 当前存储的凭证数量
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM access_credentials", [], |row| {
                row.get(0)
            })
            .map_err(storage("failed to count credentials"))?;
        Ok(count as usize)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            StorageError::OperationFailed("sqlite connection lock poisoned".to_string()).into()
        })
    }

    fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage("failed to begin transaction"))?;
        let value = f(&tx)?;
        tx.commit().map_err(storage("failed to commit transaction"))?;
        Ok(value)
    }

    /// 在事务内读取、修改并条件写回一条记录
    fn update_with<T>(
        &self,
        id: &str,
        missing: T,
        apply: impl FnOnce(&mut AccessCredential) -> T,
    ) -> Result<T> {
        self.with_transaction(|tx| {
            let Some(mut credential) = load(tx, "WHERE id = ?1", id)? else {
                return Ok(missing);
            };
            let snapshot = credential.clone();
            let value = apply(&mut credential);
            if credential != snapshot {
                write_conditional(tx, &snapshot, &credential)?;
            }
            Ok(value)
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn insert(&self, credential: &AccessCredential) -> Result<()> {
        let conn = self.lock()?;
        let (otp_hash, otp_expires_at, otp_attempts, max_otp_attempts) = otp_columns(credential);
        let (binding_ip, binding_user_agent) = binding_columns(credential);
        conn.execute(
            "INSERT INTO access_credentials (id, secret_hash, email, content_ref, created_at, \
             expires_at, state, otp_hash, otp_expires_at, otp_attempts, max_otp_attempts, \
             binding_ip, binding_user_agent, binding_anomaly, used_at, delivered_at, \
             last_seen_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                credential.id,
                credential.secret_hash,
                credential.email,
                credential.content_ref,
                millis(credential.created_at),
                millis(credential.expires_at),
                credential.state.as_str(),
                otp_hash,
                otp_expires_at,
                otp_attempts,
                max_otp_attempts,
                binding_ip,
                binding_user_agent,
                credential.binding_anomaly,
                credential.used_at.map(millis),
                credential.delivered_at.map(millis),
                credential.last_seen_at.map(millis),
                millis(credential.updated_at),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Error::from(StorageError::AlreadyExists("access credential".to_string()))
            }
            other => Error::from(StorageError::OperationFailed(format!(
                "failed to insert credential: {other}"
            ))),
        })?;
        Ok(())
    }

    async fn find_by_secret_hash(&self, secret_hash: &str) -> Result<Option<AccessCredential>> {
        let conn = self.lock()?;
        load(&conn, "WHERE secret_hash = ?1", secret_hash)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<AccessCredential>> {
        let conn = self.lock()?;
        load(&conn, "WHERE id = ?1", id)
    }

    async fn begin_otp(
        &self,
        id: &str,
        otp: &OtpRecord,
        binding: Option<&BindingContext>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.update_with(id, false, |c| apply_begin_otp(c, otp, binding, now))
    }

    async fn record_otp_attempt(
        &self,
        id: &str,
        supplied_otp_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        self.update_with(id, AttemptOutcome::NotPending(None), |c| {
            apply_otp_attempt(c, supplied_otp_hash, now)
        })
    }

    async fn mark_expired(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.update_with(id, false, |c| apply_mark_expired(c, now))
    }

    async fn claim_delivery(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessCredential>> {
        self.update_with(id, None, |c| apply_claim_delivery(c, now).then(|| c.clone()))
    }

    async fn flag_anomaly(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE access_credentials SET binding_anomaly = 1, updated_at = ?2 WHERE id = ?1",
            params![id, millis(now)],
        )
        .map_err(storage("failed to flag binding anomaly"))?;
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM access_credentials \
                 WHERE (state IN ('used', 'expired', 'blocked') AND updated_at <= ?1) \
                    OR expires_at <= ?1",
                params![millis(cutoff)],
            )
            .map_err(storage("failed to purge credentials"))?;
        Ok(removed)
    }
}

// ============================================================================
// 行映射
// ============================================================================

/// 数据库中的原始行
struct RawCredential {
    id: String,
    secret_hash: String,
    email: String,
    content_ref: String,
    created_at: i64,
    expires_at: i64,
    state: String,
    otp_hash: Option<String>,
    otp_expires_at: Option<i64>,
    otp_attempts: u32,
    max_otp_attempts: u32,
    binding_ip: Option<String>,
    binding_user_agent: Option<String>,
    binding_anomaly: bool,
    used_at: Option<i64>,
    delivered_at: Option<i64>,
    last_seen_at: Option<i64>,
    updated_at: i64,
}

impl RawCredential {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            secret_hash: row.get(1)?,
            email: row.get(2)?,
            content_ref: row.get(3)?,
            created_at: row.get(4)?,
            expires_at: row.get(5)?,
            state: row.get(6)?,
            otp_hash: row.get(7)?,
            otp_expires_at: row.get(8)?,
            otp_attempts: row.get(9)?,
            max_otp_attempts: row.get(10)?,
            binding_ip: row.get(11)?,
            binding_user_agent: row.get(12)?,
            binding_anomaly: row.get(13)?,
            used_at: row.get(14)?,
            delivered_at: row.get(15)?,
            last_seen_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_credential(self) -> Result<AccessCredential> {
        let state: RedemptionState = self.state.parse().map_err(|_| {
            StorageError::Corrupt(format!("unknown state '{}' for {}", self.state, self.id))
        })?;

        let otp = match (self.otp_hash, self.otp_expires_at) {
            (Some(otp_hash), Some(expires)) => Some(OtpRecord {
                otp_hash,
                otp_expires_at: from_millis(expires)?,
                attempts: self.otp_attempts,
                max_attempts: self.max_otp_attempts,
            }),
            _ => None,
        };

        let binding = if self.binding_ip.is_some() || self.binding_user_agent.is_some() {
            Some(BindingContext {
                ip: self.binding_ip,
                user_agent: self.binding_user_agent,
            })
        } else {
            None
        };

        Ok(AccessCredential {
            id: self.id,
            secret_hash: self.secret_hash,
            email: self.email,
            content_ref: self.content_ref,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
            state,
            otp,
            binding,
            binding_anomaly: self.binding_anomaly,
            used_at: self.used_at.map(from_millis).transpose()?,
            delivered_at: self.delivered_at.map(from_millis).transpose()?,
            last_seen_at: self.last_seen_at.map(from_millis).transpose()?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn load(conn: &Connection, filter: &str, key: &str) -> Result<Option<AccessCredential>> {
    let sql = format!("{SELECT_COLUMNS} {filter}");
    let raw = conn
        .query_row(&sql, params![key], RawCredential::from_row)
        .optional()
        .map_err(storage("failed to load credential"))?;
    raw.map(RawCredential::into_credential).transpose()
}

/// 以快照为条件写回所有可变列
fn write_conditional(
    tx: &Transaction<'_>,
    snapshot: &AccessCredential,
    updated: &AccessCredential,
) -> Result<()> {
    let (otp_hash, otp_expires_at, otp_attempts, max_otp_attempts) = otp_columns(updated);
    let (binding_ip, binding_user_agent) = binding_columns(updated);
    let (snap_otp_hash, _, snap_attempts, _) = otp_columns(snapshot);

    let rows = tx
        .execute(
            "UPDATE access_credentials SET \
                 expires_at = ?1, state = ?2, otp_hash = ?3, otp_expires_at = ?4, \
                 otp_attempts = ?5, max_otp_attempts = ?6, binding_ip = ?7, \
                 binding_user_agent = ?8, binding_anomaly = ?9, used_at = ?10, \
                 delivered_at = ?11, last_seen_at = ?12, updated_at = ?13 \
             WHERE id = ?14 AND state = ?15 AND otp_hash IS ?16 AND otp_attempts = ?17",
            params![
                millis(updated.expires_at),
                updated.state.as_str(),
                otp_hash,
                otp_expires_at,
                otp_attempts,
                max_otp_attempts,
                binding_ip,
                binding_user_agent,
                updated.binding_anomaly,
                updated.used_at.map(millis),
                updated.delivered_at.map(millis),
                updated.last_seen_at.map(millis),
                millis(updated.updated_at),
                updated.id,
                snapshot.state.as_str(),
                snap_otp_hash,
                snap_attempts,
            ],
        )
        .map_err(storage("failed to update credential"))?;

    if rows == 0 {
        return Err(StorageError::OperationFailed(format!(
            "credential {} changed concurrently",
            updated.id
        ))
        .into());
    }
    Ok(())
}

fn otp_columns(credential: &AccessCredential) -> (Option<String>, Option<i64>, u32, u32) {
    match &credential.otp {
        Some(otp) => (
            Some(otp.otp_hash.clone()),
            Some(millis(otp.otp_expires_at)),
            otp.attempts,
            otp.max_attempts,
        ),
        None => (None, None, 0, 0),
    }
}

fn binding_columns(credential: &AccessCredential) -> (Option<String>, Option<String>) {
    match &credential.binding {
        Some(b) => (b.ip.clone(), b.user_agent.clone()),
        None => (None, None),
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {ms}")).into())
}

fn storage(context: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| StorageError::OperationFailed(format!("{context}: {e}")).into()
}
