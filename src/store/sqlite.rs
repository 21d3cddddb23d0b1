use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::{
    ChannelRecord, ConsumeLog, QuotaStore, StoreError, TokenRecord, UserRecord, UserSetting,
    UserStatus, now_millis,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.blocking(|_| Ok(())).await
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY NOT NULL,
            username TEXT NOT NULL,
            user_group TEXT NOT NULL DEFAULT 'default',
            quota INTEGER NOT NULL DEFAULT 0,
            used_quota INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1,
            role INTEGER NOT NULL DEFAULT 1,
            unlimited_quota INTEGER NOT NULL DEFAULT 0,
            email TEXT,
            setting_json TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY NOT NULL,
            user_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            name TEXT NOT NULL,
            remain_quota INTEGER NOT NULL DEFAULT 0,
            used_quota INTEGER NOT NULL DEFAULT 0,
            unlimited_quota INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_user_id ON tokens(user_id);

        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            used_quota INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS consume_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            username TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            token_id INTEGER NOT NULL,
            token_name TEXT NOT NULL,
            model_name TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            quota INTEGER NOT NULL,
            content TEXT NOT NULL,
            use_time_seconds INTEGER NOT NULL,
            is_stream INTEGER NOT NULL,
            user_group TEXT NOT NULL,
            other_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_consume_logs_user_id ON consume_logs(user_id);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn i64_to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn require_row(changed: usize, entity: &'static str, id: i64) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound { entity, id });
    }
    Ok(())
}

fn load_user(conn: &rusqlite::Connection, id: i64) -> Result<UserRecord, StoreError> {
    let row = conn
        .query_row(
            "SELECT username, user_group, quota, used_quota, request_count, status, role,
                    unlimited_quota, email, setting_json
             FROM users WHERE id=?1",
            rusqlite::params![id],
            |row| {
                Ok((
                    UserRecord {
                        id,
                        username: row.get(0)?,
                        group: row.get(1)?,
                        quota: row.get(2)?,
                        used_quota: row.get(3)?,
                        request_count: row.get(4)?,
                        status: UserStatus::from_i64(row.get(5)?),
                        role: row.get(6)?,
                        unlimited_quota: row.get::<_, i64>(7)? != 0,
                        email: row.get(8)?,
                        setting: UserSetting::default(),
                    },
                    row.get::<_, String>(9)?,
                ))
            },
        )
        .optional()?;
    let Some((mut user, setting_json)) = row else {
        return Err(StoreError::NotFound { entity: "user", id });
    };
    user.setting = serde_json::from_str(&setting_json)?;
    Ok(user)
}

fn log_from_row(row: &rusqlite::Row<'_>) -> Result<(ConsumeLog, String), rusqlite::Error> {
    Ok((
        ConsumeLog {
            id: row.get(0)?,
            created_at: row.get(1)?,
            user_id: row.get(2)?,
            username: row.get(3)?,
            channel_id: row.get(4)?,
            token_id: row.get(5)?,
            token_name: row.get(6)?,
            model_name: row.get(7)?,
            prompt_tokens: i64_to_u32(row.get(8)?),
            completion_tokens: i64_to_u32(row.get(9)?),
            quota: row.get(10)?,
            content: row.get(11)?,
            use_time_seconds: row.get(12)?,
            is_stream: row.get::<_, i64>(13)? != 0,
            group: row.get(14)?,
            other: serde_json::Value::Null,
        },
        row.get(15)?,
    ))
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn get_user(&self, id: i64) -> Result<UserRecord, StoreError> {
        self.blocking(move |conn| load_user(conn, id)).await
    }

    async fn get_token(&self, id: i64) -> Result<TokenRecord, StoreError> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT user_id, key, name, remain_quota, used_quota, unlimited_quota, status
                 FROM tokens WHERE id=?1",
                rusqlite::params![id],
                |row| {
                    Ok(TokenRecord {
                        id,
                        user_id: row.get(0)?,
                        key: row.get(1)?,
                        name: row.get(2)?,
                        remain_quota: row.get(3)?,
                        used_quota: row.get(4)?,
                        unlimited_quota: row.get::<_, i64>(5)? != 0,
                        status: UserStatus::from_i64(row.get(6)?),
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "token", id })
        })
        .await
    }

    async fn get_channel(&self, id: i64) -> Result<ChannelRecord, StoreError> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT name, used_quota FROM channels WHERE id=?1",
                rusqlite::params![id],
                |row| {
                    Ok(ChannelRecord {
                        id,
                        name: row.get(0)?,
                        used_quota: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "channel",
                id,
            })
        })
        .await
    }

    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let user = user.clone();
        let setting_json = serde_json::to_string(&user.setting)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO users
                 (id, username, user_group, quota, used_quota, request_count, status, role,
                  unlimited_quota, email, setting_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    user.id,
                    user.username,
                    user.group,
                    user.quota,
                    user.used_quota,
                    user.request_count,
                    user.status.as_i64(),
                    user.role,
                    i64::from(user.unlimited_quota),
                    user.email,
                    setting_json
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        let token = token.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tokens
                 (id, user_id, key, name, remain_quota, used_quota, unlimited_quota, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    token.id,
                    token.user_id,
                    token.key,
                    token.name,
                    token.remain_quota,
                    token.used_quota,
                    i64::from(token.unlimited_quota),
                    token.status.as_i64()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_channel(&self, channel: &ChannelRecord) -> Result<(), StoreError> {
        let channel = channel.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO channels (id, name, used_quota) VALUES (?1, ?2, ?3)",
                rusqlite::params![channel.id, channel.name, channel.used_quota],
            )?;
            Ok(())
        })
        .await
    }

    async fn adjust_user_quota(&self, id: i64, delta: i64) -> Result<i64, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE users SET quota = quota + ?2 WHERE id = ?1",
                rusqlite::params![id, delta],
            )?;
            require_row(changed, "user", id)?;
            let quota: i64 = tx.query_row(
                "SELECT quota FROM users WHERE id=?1",
                rusqlite::params![id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(quota)
        })
        .await
    }

    async fn try_decrease_user_quota(
        &self,
        id: i64,
        amount: i64,
    ) -> Result<Option<i64>, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE users SET quota = quota - ?2 WHERE id = ?1 AND quota >= ?2",
                rusqlite::params![id, amount],
            )?;
            let quota: Option<i64> = tx
                .query_row(
                    "SELECT quota FROM users WHERE id=?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            tx.commit()?;
            match (quota, changed) {
                (None, _) => Err(StoreError::NotFound { entity: "user", id }),
                (Some(_), 0) => Ok(None),
                (Some(quota), _) => Ok(Some(quota)),
            }
        })
        .await
    }

    async fn adjust_token_quota(&self, id: i64, delta: i64) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens
                 SET remain_quota = remain_quota + ?2,
                     used_quota = used_quota - ?2
                 WHERE id = ?1",
                rusqlite::params![id, delta],
            )?;
            require_row(changed, "token", id)
        })
        .await
    }

    async fn try_decrease_token_quota(&self, id: i64, amount: i64) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE tokens
                 SET remain_quota = remain_quota - ?2,
                     used_quota = used_quota + ?2
                 WHERE id = ?1 AND (unlimited_quota != 0 OR remain_quota >= ?2)",
                rusqlite::params![id, amount],
            )?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tokens WHERE id=?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()?;
            tx.commit()?;
            if exists.is_none() {
                return Err(StoreError::NotFound { entity: "token", id });
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn update_user_used_quota_and_request_count(
        &self,
        id: i64,
        quota: i64,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET used_quota = used_quota + ?2,
                     request_count = request_count + 1
                 WHERE id = ?1",
                rusqlite::params![id, quota],
            )?;
            require_row(changed, "user", id)
        })
        .await
    }

    async fn update_channel_used_quota(&self, id: i64, quota: i64) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO channels (id, name, used_quota) VALUES (?1, '', 0)",
                rusqlite::params![id],
            )?;
            tx.execute(
                "UPDATE channels SET used_quota = used_quota + ?2 WHERE id = ?1",
                rusqlite::params![id, quota],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_user_group(&self, id: i64, group: &str) -> Result<(), StoreError> {
        let group = group.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET user_group = ?2 WHERE id = ?1",
                rusqlite::params![id, group],
            )?;
            require_row(changed, "user", id)
        })
        .await
    }

    async fn set_user_status(&self, id: i64, status: UserStatus) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET status = ?2 WHERE id = ?1",
                rusqlite::params![id, status.as_i64()],
            )?;
            require_row(changed, "user", id)
        })
        .await
    }

    async fn set_user_unlimited(&self, id: i64, unlimited: bool) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET unlimited_quota = ?2 WHERE id = ?1",
                rusqlite::params![id, i64::from(unlimited)],
            )?;
            require_row(changed, "user", id)
        })
        .await
    }

    async fn record_consume_log(&self, log: &ConsumeLog) -> Result<i64, StoreError> {
        let log = log.clone();
        let other_json = serde_json::to_string(&log.other)?;
        let created_at = if log.created_at == 0 {
            now_millis()
        } else {
            log.created_at
        };
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO consume_logs
                 (created_at, user_id, username, channel_id, token_id, token_name, model_name,
                  prompt_tokens, completion_tokens, quota, content, use_time_seconds, is_stream,
                  user_group, other_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                rusqlite::params![
                    created_at,
                    log.user_id,
                    log.username,
                    log.channel_id,
                    log.token_id,
                    log.token_name,
                    log.model_name,
                    i64::from(log.prompt_tokens),
                    i64::from(log.completion_tokens),
                    log.quota,
                    log.content,
                    log.use_time_seconds,
                    i64::from(log.is_stream),
                    log.group,
                    other_json
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_consume_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ConsumeLog>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, user_id, username, channel_id, token_id, token_name,
                        model_name, prompt_tokens, completion_tokens, quota, content,
                        use_time_seconds, is_stream, user_group, other_json
                 FROM consume_logs
                 WHERE (?1 IS NULL OR user_id = ?1)
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], log_from_row)?;

            let mut logs = Vec::new();
            for row in rows {
                let (mut log, other_json) = row?;
                log.other = serde_json::from_str(&other_json)?;
                logs.push(log);
            }
            Ok(logs)
        })
        .await
    }
}
