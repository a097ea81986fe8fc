//! 内存存储，用于本地开发与测试
//!
//! 写锁覆盖整个 upsert，保证与数据库实现相同的原子语义。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::error::StoreError;
use crate::domain::model::{DeviceOwnershipPolicy, DeviceToken, Notification, Registration};
use crate::domain::repository::{DeviceTokenRepository, NotificationRepository};

#[derive(Default)]
pub struct InMemoryDeviceTokenStore {
    devices: RwLock<HashMap<String, DeviceToken>>,
    unavailable: AtomicBool,
}

impl InMemoryDeviceTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可用
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory device store offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceTokenRepository for InMemoryDeviceTokenStore {
    async fn upsert_device(
        &self,
        user_id: &str,
        device_id: &str,
        seen_at: DateTime<Utc>,
        policy: DeviceOwnershipPolicy,
    ) -> Result<Registration, StoreError> {
        self.check_available()?;
        let mut devices = self.devices.write().await;

        let Some(existing) = devices.get_mut(device_id) else {
            devices.insert(
                device_id.to_string(),
                DeviceToken {
                    id: Uuid::new_v4(),
                    user_id: user_id.to_string(),
                    device_id: device_id.to_string(),
                    last_seen: seen_at,
                },
            );
            return Ok(Registration::Created);
        };

        let registration = if existing.user_id == user_id {
            Registration::Refreshed
        } else {
            if policy == DeviceOwnershipPolicy::Reject {
                return Err(StoreError::OwnershipConflict {
                    device_id: device_id.to_string(),
                });
            }
            let previous_user_id = std::mem::replace(&mut existing.user_id, user_id.to_string());
            Registration::Reassigned { previous_user_id }
        };

        if seen_at > existing.last_seen {
            existing.last_seen = seen_at;
        }
        Ok(registration)
    }

    async fn device_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let devices = self.devices.read().await;
        let mut ids: Vec<String> = devices
            .values()
            .filter(|d| d.user_id == user_id)
            .map(|d| d.device_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceToken>, StoreError> {
        self.check_available()?;
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn remove_device(&self, user_id: &str, device_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut devices = self.devices.write().await;
        match devices.get(device_id) {
            Some(device) if device.user_id == user_id => {
                devices.remove(device_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryNotificationStore {
    notifications: RwLock<Vec<Notification>>,
    unavailable: AtomicBool,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.notifications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.notifications.read().await.is_empty()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationStore {
    async fn append(&self, notification: &Notification) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory notification store offline"));
        }
        self.notifications.write().await.push(notification.clone());
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Notification>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory notification store offline"));
        }
        let mut list: Vec<Notification> = self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|n| n.created_at);
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_upserts_keep_single_row() {
        let store = Arc::new(InMemoryDeviceTokenStore::new());
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .upsert_device("u1", "d1", now, DeviceOwnershipPolicy::Reassign)
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == Registration::Created {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_fast() {
        let store = InMemoryNotificationStore::new();
        store.set_unavailable(true);

        let err = store
            .append(&Notification::new("u1", "hi", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.is_empty().await);
    }
}
