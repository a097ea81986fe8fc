//! 设备注册表：device_id -> 所属用户与最近出现时间

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::error::StoreError;
use crate::domain::model::{DeviceOwnershipPolicy, DeviceToken, Registration};
use crate::domain::repository::DeviceTokenRepository;

pub struct DeviceRegistry {
    repository: Arc<dyn DeviceTokenRepository>,
    policy: DeviceOwnershipPolicy,
}

impl DeviceRegistry {
    pub fn new(repository: Arc<dyn DeviceTokenRepository>, policy: DeviceOwnershipPolicy) -> Self {
        Self { repository, policy }
    }

    pub fn policy(&self) -> DeviceOwnershipPolicy {
        self.policy
    }

    /// 注册或刷新设备，last_seen = now
    pub async fn register_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Registration, StoreError> {
        self.register_device_at(user_id, device_id, Utc::now()).await
    }

    pub async fn register_device_at(
        &self,
        user_id: &str,
        device_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        let registration = self
            .repository
            .upsert_device(user_id, device_id, seen_at, self.policy)
            .await?;

        match &registration {
            Registration::Reassigned { previous_user_id } => {
                warn!(
                    device_id,
                    user_id,
                    previous_user_id = %previous_user_id,
                    "device reassigned to a different user"
                );
            }
            other => {
                debug!(device_id, user_id, registration = ?other, "device registered");
            }
        }

        Ok(registration)
    }

    /// 用户的全部设备；没有设备时返回空列表
    pub async fn tokens_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.repository.device_ids_for_user(user_id).await
    }

    pub async fn find_device(&self, device_id: &str) -> Result<Option<DeviceToken>, StoreError> {
        self.repository.find_device(device_id).await
    }

    /// 显式注销：只有当前所有者可以释放设备
    pub async fn unregister_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let removed = self.repository.remove_device(user_id, device_id).await?;
        if !removed {
            debug!(device_id, user_id, "device not owned by user, nothing to unregister");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::InMemoryDeviceTokenStore;
    use chrono::Duration;

    fn registry(policy: DeviceOwnershipPolicy) -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(InMemoryDeviceTokenStore::new()), policy)
    }

    #[tokio::test]
    async fn test_repeated_registration_keeps_single_row() {
        let registry = registry(DeviceOwnershipPolicy::Reassign);
        let t0 = Utc::now();

        let mut last = t0;
        for i in 0..5 {
            last = t0 + Duration::seconds(i);
            let registration = registry.register_device_at("u1", "d1", last).await.unwrap();
            if i == 0 {
                assert_eq!(registration, Registration::Created);
            } else {
                assert_eq!(registration, Registration::Refreshed);
            }
        }

        assert_eq!(registry.tokens_for_user("u1").await.unwrap(), vec!["d1"]);
        let device = registry.find_device("d1").await.unwrap().unwrap();
        assert_eq!(device.last_seen, last);
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_backwards() {
        let registry = registry(DeviceOwnershipPolicy::Reassign);
        let now = Utc::now();

        registry.register_device_at("u1", "d1", now).await.unwrap();
        registry
            .register_device_at("u1", "d1", now - Duration::minutes(5))
            .await
            .unwrap();

        let device = registry.find_device("d1").await.unwrap().unwrap();
        assert_eq!(device.last_seen, now);
    }

    #[tokio::test]
    async fn test_reassign_policy_moves_device() {
        let registry = registry(DeviceOwnershipPolicy::Reassign);
        registry.register_device("u1", "d1").await.unwrap();

        let registration = registry.register_device("u2", "d1").await.unwrap();

        assert_eq!(
            registration,
            Registration::Reassigned {
                previous_user_id: "u1".to_string()
            }
        );
        assert!(registry.tokens_for_user("u1").await.unwrap().is_empty());
        assert_eq!(registry.tokens_for_user("u2").await.unwrap(), vec!["d1"]);
    }

    #[tokio::test]
    async fn test_reject_policy_requires_unregister() {
        let registry = registry(DeviceOwnershipPolicy::Reject);
        registry.register_device("u1", "d1").await.unwrap();

        let err = registry.register_device("u2", "d1").await.unwrap_err();
        assert_eq!(
            err,
            StoreError::OwnershipConflict {
                device_id: "d1".to_string()
            }
        );

        // 非所有者无法注销
        assert!(!registry.unregister_device("u2", "d1").await.unwrap());
        assert!(registry.unregister_device("u1", "d1").await.unwrap());

        let registration = registry.register_device("u2", "d1").await.unwrap();
        assert_eq!(registration, Registration::Created);
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_tokens() {
        let registry = registry(DeviceOwnershipPolicy::Reassign);
        assert!(registry.tokens_for_user("ghost").await.unwrap().is_empty());
    }
}
