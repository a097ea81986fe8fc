//! 通知账本：按用户追加的通知历史

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::error::StoreError;
use crate::domain::model::Notification;
use crate::domain::repository::NotificationRepository;

pub struct NotificationLedger {
    repository: Arc<dyn NotificationRepository>,
}

impl NotificationLedger {
    pub fn new(repository: Arc<dyn NotificationRepository>) -> Self {
        Self { repository }
    }

    /// 追加一条通知，每次调用恰好写入一行
    pub async fn append(
        &self,
        user_id: &str,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Notification, StoreError> {
        let notification = Notification::new(user_id, message, created_at);
        self.repository.append(&notification).await?;
        Ok(notification)
    }

    /// 用户的通知历史，顺序不作保证
    pub async fn history_for_user(&self, user_id: &str) -> Result<Vec<Notification>, StoreError> {
        self.repository.list_for_user(user_id).await
    }
}
