use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::domain::error::StoreError;
use crate::domain::model::{DeviceOwnershipPolicy, DeviceToken, Notification, Registration};
use crate::domain::repository::{DeviceTokenRepository, NotificationRepository};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS device_tokens (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        device_id TEXT NOT NULL UNIQUE,
        last_seen TIMESTAMPTZ NOT NULL,
        previous_user_id TEXT
    )
    "#,
    "ALTER TABLE device_tokens ADD COLUMN IF NOT EXISTS previous_user_id TEXT",
    "CREATE INDEX IF NOT EXISTS idx_device_tokens_user ON device_tokens (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_notifications_user_created ON notifications (user_id, created_at)",
];

// DO UPDATE 中的 device_tokens.user_id 是加锁后的最新行，
// 借 previous_user_id 列把冲突行原来的归属带回；(xmax = 0) 表示本次为插入
const UPSERT_REASSIGN: &str = r#"
    INSERT INTO device_tokens (id, device_id, user_id, last_seen)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (device_id) DO UPDATE
    SET previous_user_id = device_tokens.user_id,
        user_id = EXCLUDED.user_id,
        last_seen = GREATEST(device_tokens.last_seen, EXCLUDED.last_seen)
    RETURNING (xmax = 0) AS inserted, previous_user_id
"#;

// 设备属于他人时 WHERE 不成立，不返回任何行
const UPSERT_REJECT: &str = r#"
    INSERT INTO device_tokens (id, device_id, user_id, last_seen)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (device_id) DO UPDATE
    SET last_seen = GREATEST(device_tokens.last_seen, EXCLUDED.last_seen)
    WHERE device_tokens.user_id = EXCLUDED.user_id
    RETURNING (xmax = 0) AS inserted
"#;

/// SQLSTATE 22（数据异常）与 23（约束违反）重试也不会成功
fn is_data_error(sqlstate: Option<&str>) -> bool {
    sqlstate.is_some_and(|code| code.starts_with("22") || code.starts_with("23"))
}

fn store_error(err: sqlx::Error) -> StoreError {
    let rejected = matches!(
        &err,
        sqlx::Error::Database(db) if is_data_error(db.code().as_deref())
    );
    if rejected {
        StoreError::rejected(err)
    } else {
        StoreError::unavailable(err)
    }
}

/// 建立连接池
pub async fn connect(
    url: &str,
    max_connections: Option<u32>,
    min_connections: Option<u32>,
) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
        .min_connections(min_connections.unwrap_or(0))
        .connect(url)
        .await
        .context("failed to connect to postgres")?;
    info!("connected to postgres");
    Ok(pool)
}

/// 建表（幂等）
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to initialize notification schema")?;
    }
    Ok(())
}

#[derive(Debug, FromRow)]
struct DeviceTokenRow {
    id: Uuid,
    user_id: String,
    device_id: String,
    last_seen: DateTime<Utc>,
}

impl From<DeviceTokenRow> for DeviceToken {
    fn from(row: DeviceTokenRow) -> Self {
        DeviceToken {
            id: row.id,
            user_id: row.user_id,
            device_id: row.device_id,
            last_seen: row.last_seen,
        }
    }
}

#[derive(Debug, FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id,
            user_id: row.user_id,
            message: row.message,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PostgresDeviceTokenStore {
    pool: Arc<PgPool>,
}

impl PostgresDeviceTokenStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceTokenRepository for PostgresDeviceTokenStore {
    async fn upsert_device(
        &self,
        user_id: &str,
        device_id: &str,
        seen_at: DateTime<Utc>,
        policy: DeviceOwnershipPolicy,
    ) -> Result<Registration, StoreError> {
        match policy {
            DeviceOwnershipPolicy::Reassign => {
                let row = sqlx::query(UPSERT_REASSIGN)
                    .bind(Uuid::new_v4())
                    .bind(device_id)
                    .bind(user_id)
                    .bind(seen_at)
                    .fetch_one(self.pool.as_ref())
                    .await
                    .map_err(store_error)?;

                let inserted: bool = row.try_get("inserted").map_err(StoreError::unavailable)?;
                let previous: Option<String> = row
                    .try_get("previous_user_id")
                    .map_err(StoreError::unavailable)?;

                Ok(match (inserted, previous) {
                    (true, _) => Registration::Created,
                    (false, Some(previous)) if previous != user_id => Registration::Reassigned {
                        previous_user_id: previous,
                    },
                    (false, _) => Registration::Refreshed,
                })
            }
            DeviceOwnershipPolicy::Reject => {
                let row = sqlx::query(UPSERT_REJECT)
                    .bind(Uuid::new_v4())
                    .bind(device_id)
                    .bind(user_id)
                    .bind(seen_at)
                    .fetch_optional(self.pool.as_ref())
                    .await
                    .map_err(store_error)?;

                let Some(row) = row else {
                    return Err(StoreError::OwnershipConflict {
                        device_id: device_id.to_string(),
                    });
                };
                let inserted: bool = row.try_get("inserted").map_err(StoreError::unavailable)?;
                Ok(if inserted {
                    Registration::Created
                } else {
                    Registration::Refreshed
                })
            }
        }
    }

    async fn device_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT device_id FROM device_tokens WHERE user_id = $1 ORDER BY device_id",
        )
        .bind(user_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(store_error)
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceToken>, StoreError> {
        let row = sqlx::query_as::<_, DeviceTokenRow>(
            "SELECT id, user_id, device_id, last_seen FROM device_tokens WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(store_error)?;
        Ok(row.map(DeviceToken::from))
    }

    async fn remove_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM device_tokens WHERE device_id = $1 AND user_id = $2")
            .bind(device_id)
            .bind(user_id)
            .execute(self.pool.as_ref())
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PostgresNotificationStore {
    pool: Arc<PgPool>,
}

impl PostgresNotificationStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for PostgresNotificationStore {
    async fn append(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications (id, user_id, message, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(notification.id)
        .bind(&notification.user_id)
        .bind(&notification.message)
        .bind(notification.created_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT id, user_id, message, created_at FROM notifications \
             WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(store_error)?;
        Ok(rows.into_iter().map(Notification::from).collect())
    }
}
