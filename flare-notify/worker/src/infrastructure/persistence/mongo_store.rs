use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Document, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::error::StoreError;
use crate::domain::model::{DeviceOwnershipPolicy, DeviceToken, Notification, Registration};
use crate::domain::repository::{DeviceTokenRepository, NotificationRepository};

const DEVICE_COLLECTION: &str = "device_tokens";
const NOTIFICATION_COLLECTION: &str = "notifications";
const DUPLICATE_KEY: i32 = 11000;
// BadValue / DocumentValidationFailure / BSONObjectTooLarge / KeyTooLong
const REJECTED_WRITE_CODES: &[i32] = &[2, 121, 10334, 17280];

/// 连接 Mongo 并返回数据库句柄
pub async fn connect(url: &str, database: &str) -> Result<Database> {
    let options = ClientOptions::parse(url)
        .await
        .context("invalid mongodb url")?;
    let client = Client::with_options(options)?;
    info!(database, "connected to mongodb");
    Ok(client.database(database))
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY,
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn is_rejected_write(code: i32) -> bool {
    REJECTED_WRITE_CODES.contains(&code)
}

fn store_error(err: mongodb::error::Error) -> StoreError {
    let rejected = match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => is_rejected_write(write.code),
        ErrorKind::Command(command) => is_rejected_write(command.code),
        ErrorKind::BsonSerialization(_) | ErrorKind::InvalidArgument { .. } => true,
        _ => false,
    };
    if rejected {
        StoreError::rejected(err)
    } else {
        StoreError::unavailable(err)
    }
}

fn to_bson_datetime(at: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(at)
}

pub struct MongoDeviceTokenStore {
    collection: Collection<Document>,
}

impl MongoDeviceTokenStore {
    pub async fn new(database: &Database) -> Result<Self> {
        let collection = database.collection::<Document>(DEVICE_COLLECTION);
        ensure_device_indexes(&collection).await?;
        Ok(Self { collection })
    }

    /// 单次 findAndModify upsert，返回修改前的文档
    async fn upsert_once(
        &self,
        user_id: &str,
        device_id: &str,
        seen_at: DateTime<Utc>,
        policy: DeviceOwnershipPolicy,
    ) -> mongodb::error::Result<Option<Document>> {
        // Reject 策略下过滤条件包含 user_id；设备属于他人时插入会撞唯一索引
        let filter = match policy {
            DeviceOwnershipPolicy::Reassign => doc! {"device_id": device_id},
            DeviceOwnershipPolicy::Reject => doc! {"device_id": device_id, "user_id": user_id},
        };
        let update = doc! {
            "$set": {"user_id": user_id, "device_id": device_id},
            "$max": {"last_seen": to_bson_datetime(seen_at)},
            "$setOnInsert": {"_id": Uuid::new_v4().to_string()},
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::Before)
            .build();

        self.collection
            .find_one_and_update(filter, update, options)
            .await
    }
}

async fn ensure_device_indexes(collection: &Collection<Document>) -> Result<()> {
    let device_index = IndexModel::builder()
        .keys(doc! {"device_id": 1})
        .options(
            IndexOptions::builder()
                .unique(true)
                .name(Some("uid_device".to_string()))
                .build(),
        )
        .build();
    collection
        .create_index(device_index, None::<mongodb::options::CreateIndexOptions>)
        .await?;

    let user_index = IndexModel::builder()
        .keys(doc! {"user_id": 1})
        .options(
            IndexOptions::builder()
                .name(Some("idx_user".to_string()))
                .build(),
        )
        .build();
    collection
        .create_index(user_index, None::<mongodb::options::CreateIndexOptions>)
        .await?;

    Ok(())
}

fn device_from_document(document: &Document) -> Result<DeviceToken, StoreError> {
    let id = document
        .get_str("_id")
        .map_err(StoreError::unavailable)
        .and_then(|raw| Uuid::parse_str(raw).map_err(StoreError::unavailable))?;
    Ok(DeviceToken {
        id,
        user_id: document
            .get_str("user_id")
            .map_err(StoreError::unavailable)?
            .to_string(),
        device_id: document
            .get_str("device_id")
            .map_err(StoreError::unavailable)?
            .to_string(),
        last_seen: document
            .get_datetime("last_seen")
            .map_err(StoreError::unavailable)?
            .to_chrono(),
    })
}

#[async_trait]
impl DeviceTokenRepository for MongoDeviceTokenStore {
    async fn upsert_device(
        &self,
        user_id: &str,
        device_id: &str,
        seen_at: DateTime<Utc>,
        policy: DeviceOwnershipPolicy,
    ) -> Result<Registration, StoreError> {
        let before = match self.upsert_once(user_id, device_id, seen_at, policy).await {
            Ok(before) => before,
            // 并发首次插入会撞唯一索引，重试一次即命中已有文档
            Err(err) if is_duplicate_key(&err) => {
                debug!(device_id, "duplicate key on device upsert, retrying");
                match self.upsert_once(user_id, device_id, seen_at, policy).await {
                    Ok(before) => before,
                    Err(err) if is_duplicate_key(&err) => {
                        return Err(StoreError::OwnershipConflict {
                            device_id: device_id.to_string(),
                        });
                    }
                    Err(err) => return Err(store_error(err)),
                }
            }
            Err(err) => return Err(store_error(err)),
        };

        let Some(before) = before else {
            return Ok(Registration::Created);
        };
        let previous_user_id = before
            .get_str("user_id")
            .map_err(StoreError::unavailable)?;
        if previous_user_id == user_id {
            Ok(Registration::Refreshed)
        } else {
            Ok(Registration::Reassigned {
                previous_user_id: previous_user_id.to_string(),
            })
        }
    }

    async fn device_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let options = FindOptions::builder()
            .sort(doc! {"device_id": 1})
            .projection(doc! {"device_id": 1})
            .build();
        let documents: Vec<Document> = self
            .collection
            .find(doc! {"user_id": user_id}, options)
            .await
            .map_err(StoreError::unavailable)?
            .try_collect()
            .await
            .map_err(StoreError::unavailable)?;

        documents
            .iter()
            .map(|d| {
                d.get_str("device_id")
                    .map(str::to_string)
                    .map_err(StoreError::unavailable)
            })
            .collect()
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceToken>, StoreError> {
        let document = self
            .collection
            .find_one(doc! {"device_id": device_id}, None)
            .await
            .map_err(StoreError::unavailable)?;
        document.as_ref().map(device_from_document).transpose()
    }

    async fn remove_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError> {
        let result = self
            .collection
            .delete_one(doc! {"device_id": device_id, "user_id": user_id}, None)
            .await
            .map_err(StoreError::unavailable)?;
        Ok(result.deleted_count > 0)
    }
}

pub struct MongoNotificationStore {
    collection: Collection<Document>,
}

impl MongoNotificationStore {
    pub async fn new(database: &Database) -> Result<Self> {
        let collection = database.collection::<Document>(NOTIFICATION_COLLECTION);

        let user_index = IndexModel::builder()
            .keys(doc! {"user_id": 1, "created_at": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("idx_user_created".to_string()))
                    .build(),
            )
            .build();
        collection
            .create_index(user_index, None::<mongodb::options::CreateIndexOptions>)
            .await?;

        Ok(Self { collection })
    }
}

fn notification_from_document(document: &Document) -> Result<Notification, StoreError> {
    let id = document
        .get_str("_id")
        .map_err(StoreError::unavailable)
        .and_then(|raw| Uuid::parse_str(raw).map_err(StoreError::unavailable))?;
    Ok(Notification {
        id,
        user_id: document
            .get_str("user_id")
            .map_err(StoreError::unavailable)?
            .to_string(),
        message: document
            .get_str("message")
            .map_err(StoreError::unavailable)?
            .to_string(),
        created_at: document
            .get_datetime("created_at")
            .map_err(StoreError::unavailable)?
            .to_chrono(),
    })
}

#[async_trait]
impl NotificationRepository for MongoNotificationStore {
    async fn append(&self, notification: &Notification) -> Result<(), StoreError> {
        let document = doc! {
            "_id": notification.id.to_string(),
            "user_id": &notification.user_id,
            "message": &notification.message,
            "created_at": to_bson_datetime(notification.created_at),
        };
        self.collection
            .insert_one(document, None)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Notification>, StoreError> {
        let options = FindOptions::builder().sort(doc! {"created_at": 1}).build();
        let documents: Vec<Document> = self
            .collection
            .find(doc! {"user_id": user_id}, options)
            .await
            .map_err(StoreError::unavailable)?
            .try_collect()
            .await
            .map_err(StoreError::unavailable)?;

        documents.iter().map(notification_from_document).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_document_roundtrip() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let document = doc! {
            "_id": id.to_string(),
            "user_id": "u1",
            "device_id": "d1",
            "last_seen": to_bson_datetime(now),
        };

        let device = device_from_document(&document).unwrap();
        assert_eq!(device.id, id);
        assert_eq!(device.device_id, "d1");
        // bson 只保留毫秒精度
        assert_eq!(device.last_seen.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_validation_failures_are_not_retryable() {
        assert!(is_rejected_write(121));
        assert!(is_rejected_write(10334));
        // NotWritablePrimary / 网络类错误可重试
        assert!(!is_rejected_write(10107));
        assert!(!is_rejected_write(DUPLICATE_KEY));
    }

    #[test]
    fn test_malformed_document_is_store_error() {
        let document = doc! {"_id": "not-a-uuid", "user_id": "u1"};
        assert!(matches!(
            notification_from_document(&document),
            Err(StoreError::Unavailable(_))
        ));
    }
}
