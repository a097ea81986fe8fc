//! 仓储接口（Port）

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{DeliveryError, StoreError};
use super::model::{
    DeadLetter, DeviceOwnershipPolicy, DeviceToken, Notification, Registration, TokenOutcome,
};

/// 设备令牌仓储
///
/// `upsert_device` 必须是原子的：同一 `device_id` 永远只有一行，
/// `last_seen` 只增不减。
#[async_trait]
pub trait DeviceTokenRepository: Send + Sync {
    async fn upsert_device(
        &self,
        user_id: &str,
        device_id: &str,
        seen_at: DateTime<Utc>,
        policy: DeviceOwnershipPolicy,
    ) -> Result<Registration, StoreError>;

    async fn device_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceToken>, StoreError>;

    /// 仅当设备归属该用户时删除，返回是否删除
    async fn remove_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError>;
}

/// 通知仓储（只追加）
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn append(&self, notification: &Notification) -> Result<(), StoreError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Notification>, StoreError>;
}

/// 批量推送渠道能力
///
/// 单个令牌失败体现在返回的映射中；只有整个调用无法发出时才返回 Err。
#[async_trait]
pub trait PushProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_multicast(
        &self,
        message: &str,
        tokens: &[String],
    ) -> Result<HashMap<String, TokenOutcome>, DeliveryError>;
}

/// 死信队列发布器
#[async_trait]
pub trait DlqPublisher: Send + Sync {
    async fn publish_to_dlq(&self, letter: &DeadLetter) -> anyhow::Result<()>;
}
